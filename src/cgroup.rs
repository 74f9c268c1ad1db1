//! Cgroup v2 lifecycle: create or adopt the group before the spawner is
//! cloned, configure it, hand out the event descriptors, and guarantee
//! removal on every exit path through a scope guard.

use crate::{
    error::Error,
    fd::Fd,
    request::Request,
    util::{self, Pid},
};
use nix::{
    fcntl::OFlag,
    poll::{poll, PollFd, PollFlags},
    sys::stat::Mode,
};
use std::{fs, os::unix::fs::DirBuilderExt, path::{Path, PathBuf}};

/// Descriptors the rest of the system needs while the job runs.
/// `memory.events` and `pids.events` are only opened when the request
/// configures the corresponding controller, mirroring what can actually
/// fire.
pub struct CgroupContext {
    pub procs: Fd,
    pub memory_events: Option<Fd>,
    pub pids_events: Option<Fd>,
}

/// Scope guard owning the cgroup teardown.
///
/// The spawner pid doubles as teardown state: 0 while nothing was cloned,
/// -1 once only the directory remains to clean up, a live pid in between.
pub struct CgroupGuard {
    path: PathBuf,
    owned: bool,
    armed: bool,
    events: Option<Fd>,
    spawner: Pid,
}

impl CgroupGuard {
    pub fn inactive() -> Self {
        CgroupGuard {
            path: PathBuf::new(),
            owned: false,
            armed: false,
            events: None,
            spawner: 0,
        }
    }

    fn arm(&mut self, path: PathBuf, owned: bool) {
        self.path = path;
        self.owned = owned;
        self.armed = true;
    }

    pub fn set_spawner(&mut self, pid: Pid) {
        self.spawner = pid;
    }

    /// SIGKILLs the spawner if it is still live. Killing pid 1 of the new
    /// pid namespace takes every sandboxed process down with it.
    pub fn kill_spawner(&mut self) {
        if self.spawner > 0 {
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(self.spawner),
                nix::sys::signal::SIGKILL,
            )
            .ok();
            self.spawner = -1;
        }
    }

    fn remove_dir_blocking(&self) {
        let events = match &self.events {
            Some(events) => events,
            None => {
                tracing::error!(path = %self.path.display(), "cgroup.events not open, cannot wait");
                return;
            }
        };
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    // A read resets the internal 'updates pending' edge so
                    // the subsequent POLLPRI wait observes fresh changes.
                    let mut buf = [0u8; 128];
                    if events.pread(&mut buf, 0).is_err() {
                        tracing::error!(path = %self.path.display(), "reading cgroup.events failed");
                        return;
                    }
                    let mut fds = [PollFd::new(events.as_raw(), PollFlags::POLLPRI)];
                    match poll(&mut fds, -1) {
                        Ok(_) => {}
                        Err(err) if err.as_errno() == Some(nix::errno::Errno::EINTR) => {}
                        Err(err) => {
                            tracing::error!(
                                path = %self.path.display(),
                                error = %err,
                                "waiting for cgroup to empty failed"
                            );
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %err,
                        "removing cgroup failed"
                    );
                    return;
                }
            }
        }
    }
}

impl Drop for CgroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.kill_spawner();
        if self.owned {
            self.remove_dir_blocking();
        }
    }
}

fn current_cgroup_parent() -> Result<PathBuf, Error> {
    let process = procfs::process::Process::myself()
        .map_err(|err| Error::CgroupDetection(err.to_string()))?;
    let groups = process
        .cgroups()
        .map_err(|err| Error::CgroupDetection(err.to_string()))?;
    // Only the pure v2 form is accepted: a single `0::/...` record. Mixed
    // v1/v2 configurations would need per-controller bookkeeping we do not
    // implement.
    if groups.len() != 1 || groups[0].hierarchy != 0 {
        return Err(Error::CgroupDetection(
            "/proc/self/cgroup is not a pure cgroups v2 hierarchy".into(),
        ));
    }
    let own = Path::new(&groups[0].pathname).to_path_buf();
    let parent = own.parent().unwrap_or_else(|| Path::new("/"));
    Ok(PathBuf::from(format!(
        "/sys/fs/cgroup{}",
        parent.display()
    )))
}

fn trim_trailing_slashes(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn resolve_path(request: &Request) -> Result<(PathBuf, bool), Error> {
    if let Some(path) = &request.cgroup {
        return Ok((path.clone(), false));
    }
    let parent = match &request.cgroup_root {
        Some(root) => trim_trailing_slashes(root),
        None => current_cgroup_parent()?,
    };
    let name = format!("sandals-{}", std::process::id());
    Ok((parent.join(name), true))
}

fn open_events(path: &Path, name: &str) -> Result<Fd, Error> {
    util::open_fd(
        &path.join(name),
        OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
        Mode::empty(),
    )
}

/// Creates (or adopts) the cgroup, applies the configuration, opens the
/// control and event files. The guard is armed the moment the directory
/// exists, before anything that can still fail.
pub fn setup(request: &Request, guard: &mut CgroupGuard) -> Result<CgroupContext, Error> {
    let (path, owned) = resolve_path(request)?;
    if owned {
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|source| Error::CreateDir {
                path: path.clone(),
                source,
            })?;
    }
    guard.arm(path.clone(), owned);

    let mut want_memory_events = false;
    let mut want_pids_events = false;
    for (key, value) in &request.cgroup_config {
        let key = key.trim_start_matches('/');
        let file = path.join(key);
        fs::write(&file, value).map_err(|source| Error::Write { path: file, source })?;
        if key.starts_with("memory.") {
            want_memory_events = true;
        }
        if key.starts_with("pids.") {
            want_pids_events = true;
        }
    }

    let procs = util::open_fd(
        &path.join("cgroup.procs"),
        OFlag::O_WRONLY | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
        Mode::empty(),
    )?;
    if owned {
        guard.events = Some(open_events(&path, "cgroup.events")?);
    }
    let memory_events = if want_memory_events {
        Some(open_events(&path, "memory.events")?)
    } else {
        None
    };
    let pids_events = if want_pids_events {
        Some(open_events(&path, "pids.events")?)
    } else {
        None
    };

    Ok(CgroupContext {
        procs,
        memory_events,
        pids_events,
    })
}

/// Reads a whole event file through the kept-open descriptor. The files are
/// tiny, but the read still loops so a counter split across reads cannot be
/// misparsed.
pub fn read_events_file(fd: &Fd, name: &'static str) -> Result<String, Error> {
    let mut content = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = fd
            .pread(&mut chunk, content.len() as i64)
            .map_err(|source| Error::Read {
                path: name.into(),
                source,
            })?;
        if n == 0 {
            break;
        }
        content.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&content).into_owned())
}

/// True when the event file reports a non-zero value for `key`
/// (e.g. `oom_kill 3` in memory.events, `max 1` in pids.events).
pub fn counter_nonzero(content: &str, key: &str) -> bool {
    content.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some(key)
            && fields
                .next()
                .and_then(|value| value.parse::<u64>().ok())
                .map_or(false, |value| value > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_zero() {
        let content = "low 0\nhigh 0\nmax 0\noom 0\noom_kill 0\n";
        assert!(!counter_nonzero(content, "oom_kill"));
    }

    #[test]
    fn counter_fired() {
        let content = "low 0\nhigh 2\nmax 0\noom 1\noom_kill 1\n";
        assert!(counter_nonzero(content, "oom_kill"));
    }

    #[test]
    fn counter_does_not_match_prefixes() {
        // "oom 1" must not satisfy a lookup for "oom_kill".
        let content = "oom 1\noom_kill 0\n";
        assert!(!counter_nonzero(content, "oom_kill"));
    }

    #[test]
    fn pids_events_form() {
        assert!(counter_nonzero("max 17\n", "max"));
        assert!(!counter_nonzero("max 0\n", "max"));
    }

    #[test]
    fn garbage_is_ignored(){
        assert!(!counter_nonzero("oom_kill\nmax not-a-number\n", "max"));
    }

    #[test]
    fn trailing_slashes_trimmed() {
        assert_eq!(
            trim_trailing_slashes(Path::new("/sys/fs/cgroup/x///")),
            PathBuf::from("/sys/fs/cgroup/x")
        );
        assert_eq!(trim_trailing_slashes(Path::new("///")), PathBuf::from("/"));
    }

    #[test]
    fn resolve_prefers_adopted_cgroup() {
        let mut request = Request::default();
        request.cgroup = Some(PathBuf::from("/sys/fs/cgroup/adopted"));
        request.cgroup_root = Some(PathBuf::from("/sys/fs/cgroup/parent"));
        let (path, owned) = resolve_path(&request).unwrap();
        assert_eq!(path, PathBuf::from("/sys/fs/cgroup/adopted"));
        assert!(!owned);
    }

    #[test]
    fn resolve_builds_child_under_root() {
        let mut request = Request::default();
        request.cgroup_root = Some(PathBuf::from("/sys/fs/cgroup/parent/"));
        let (path, owned) = resolve_path(&request).unwrap();
        assert!(owned);
        assert_eq!(
            path,
            PathBuf::from(format!("/sys/fs/cgroup/parent/sandals-{}", std::process::id()))
        );
    }
}
