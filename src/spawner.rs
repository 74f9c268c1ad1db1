//! The spawner: pid 1 of the fresh namespaces. It finishes the
//! inside-namespace setup, builds the output channels, forks the payload,
//! reaps it, and reports the outcome to the supervisor over the response
//! socket. Every failure in here is serialized as a JSON response on that
//! socket; the supervisor relays it verbatim.

use crate::{
    error::Error,
    fd::Fd,
    ipc::Socket,
    mounts, net, pipes,
    request::Request,
    response::Outcome,
    seccomp, usrgrp,
    usrgrp::OuterIds,
    util,
};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::stat::Mode,
    sys::wait::{waitpid, WaitStatus},
};
use std::{
    ffi::CString,
    os::unix::io::RawFd,
    ptr,
};

const PER_LINUX: libc::c_ulong = 0x0000;
const ADDR_NO_RANDOMIZE: libc::c_ulong = 0x0004_0000;

/// One-word shared-anonymous mapping the forked payload reports exec
/// failure through. Written once (volatile) before _exit, read once after
/// the wait.
struct ExecErrnoCell {
    ptr: *mut libc::c_int,
}

impl ExecErrnoCell {
    fn new() -> Result<Self, Error> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        let size = if page > 0 { page as usize } else { 4096 };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Syscall {
                op: "mmap(SHARED|ANONYMOUS)",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(ExecErrnoCell {
            ptr: ptr as *mut libc::c_int,
        })
    }

    fn get(&self) -> i32 {
        unsafe { ptr::read_volatile(self.ptr) }
    }

    fn set(&self, value: i32) {
        unsafe { ptr::write_volatile(self.ptr, value) }
    }
}

pub fn signal_name(sig: i32) -> String {
    let name = match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSTKFLT => "SIGSTKFLT",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGPWR => "SIGPWR",
        libc::SIGSYS => "SIGSYS",
        _ => return sig.to_string(),
    };
    name.to_string()
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("sandals spawner[{}] panic: {}", std::process::id(), info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        unsafe { libc::_exit(libc::EXIT_FAILURE) }
    }));
}

fn prctl_checked(op: &'static str, option: libc::c_int, arg: libc::c_ulong) -> Result<(), Error> {
    let rc = unsafe { libc::prctl(option, arg, 0, 0, 0) };
    if rc == -1 {
        return Err(Error::Syscall {
            op,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn cstring(value: &str) -> Result<CString, Error> {
    CString::new(value)
        .map_err(|_| Error::BadRequest(format!("embedded NUL in '{}'", value.escape_default())))
}

/// Runs between fork and exec; must not return. Any failure leaves errno in
/// the shared cell for the spawner to report.
fn exec_payload(
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    filter: Option<&seccomp::Filter>,
    exe: &CString,
    argv: &[CString],
    envp: &[CString],
    exec_errno: &ExecErrnoCell,
) -> ! {
    let code = (|| -> i32 {
        unsafe {
            // dup3 with flags 0 clears CLOEXEC on the payload's stdio.
            if libc::dup3(stdin_fd, libc::STDIN_FILENO, 0) == -1
                || libc::dup3(stdout_fd, libc::STDOUT_FILENO, 0) == -1
                || libc::dup3(stderr_fd, libc::STDERR_FILENO, 0) == -1
            {
                return errno::errno().0;
            }
        }
        if let Some(filter) = filter {
            if let Err(code) = filter.install() {
                return code;
            }
        }
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> =
            envp.iter().map(|var| var.as_ptr()).collect();
        envp_ptrs.push(ptr::null());
        unsafe {
            libc::execvpe(exe.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
        }
        errno::errno().0
    })();
    exec_errno.set(code);
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

fn run(
    request: &Request,
    cgroup_procs: Fd,
    outer: OuterIds,
    sock: &Socket,
) -> Result<Outcome, Error> {
    // Die with the supervisor and detach from any controlling tty.
    prctl_checked(
        "prctl(PR_SET_PDEATHSIG)",
        libc::PR_SET_PDEATHSIG,
        libc::SIGKILL as libc::c_ulong,
    )?;
    nix::unistd::setsid().map_err(|err| crate::error::syscall("setsid", err))?;

    // Join the cgroup through the supervisor-opened handle, then make the
    // new group the visible root.
    util::write_fd_all(&cgroup_procs, b"0", std::path::Path::new("cgroup.procs"))?;
    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWCGROUP)
        .map_err(|err| crate::error::syscall("unshare(CLONE_NEWCGROUP)", err))?;
    drop(cgroup_procs);

    util::close_stray_fds(&[sock.as_raw()])?;

    usrgrp::map_user_and_group(request, &outer)?;
    net::configure(&request.host_name, &request.domain_name)?;

    // /dev/null must be opened before mounts can hide the host /dev.
    let devnull = util::open_fd(
        std::path::Path::new("/dev/null"),
        OFlag::O_CLOEXEC | OFlag::O_RDWR | OFlag::O_NOCTTY,
        Mode::empty(),
    )?;

    mounts::apply(request)?;

    nix::unistd::chroot(&request.chroot).map_err(|err| Error::Chroot {
        path: request.chroot.clone(),
        source: util::cvt_error(err),
    })?;

    // We are visible to untrusted children via /proc from here on.
    prctl_checked("prctl(PR_SET_DUMPABLE)", libc::PR_SET_DUMPABLE, 0)?;

    let persona = PER_LINUX | if request.va_randomize { 0 } else { ADDR_NO_RANDOMIZE };
    if unsafe { libc::personality(persona) } == -1 {
        return Err(Error::Syscall {
            op: "personality",
            source: std::io::Error::last_os_error(),
        });
    }

    // The working directory carried across chroot is implementation
    // defined, so relative paths are anchored at the new root first.
    let workdir_err = |err: nix::Error| Error::Workdir {
        path: request.work_dir.clone(),
        source: util::cvt_error(err),
    };
    if !request.work_dir.is_absolute() {
        nix::unistd::chdir("/").map_err(workdir_err)?;
    }
    nix::unistd::chdir(&request.work_dir).map_err(workdir_err)?;

    let exec_errno = ExecErrnoCell::new()?;

    let plan = request.output_plan();
    let channels = pipes::create(&plan)?;
    if !channels.to_supervisor.is_empty() {
        sock.send_fds(&channels.raw_fds())
            .map_err(|source| Error::Syscall {
                op: "sendmsg(SCM_RIGHTS)",
                source,
            })?;
    }

    let filter = match &request.seccomp_policy {
        Some(policy) => Some(seccomp::compile(policy)?),
        None => None,
    };

    let exe = cstring(&request.cmd[0])?;
    let argv = request
        .cmd
        .iter()
        .map(|arg| cstring(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let envp = request
        .env
        .iter()
        .map(|var| cstring(var))
        .collect::<Result<Vec<_>, _>>()?;

    let child = match unsafe { nix::unistd::fork() }
        .map_err(|err| crate::error::syscall("fork", err))?
    {
        nix::unistd::ForkResult::Child => exec_payload(
            devnull.as_raw(),
            channels.child_stdout.unwrap_or_else(|| devnull.as_raw()),
            channels.child_stderr.unwrap_or_else(|| devnull.as_raw()),
            filter.as_ref(),
            &exe,
            &argv,
            &envp,
            &exec_errno,
        ),
        nix::unistd::ForkResult::Parent { child } => child,
    };

    // As pid 1 of the namespace we reap everything; only the payload's own
    // status terminates the wait.
    let status = loop {
        match waitpid(None::<nix::unistd::Pid>, None) {
            Ok(status) => {
                if status.pid() == Some(child) {
                    break status;
                }
            }
            Err(err) if err.as_errno() == Some(Errno::EINTR) => {}
            Err(err) => return Err(crate::error::syscall("wait", err)),
        }
    };

    let exec_failure = exec_errno.get();
    if exec_failure != 0 {
        return Err(Error::Exec {
            cmd: request.cmd[0].clone(),
            source: std::io::Error::from_raw_os_error(exec_failure),
        });
    }

    match status {
        WaitStatus::Exited(_, code) => Ok(Outcome::Exited { code }),
        WaitStatus::Signaled(_, signal, _) => Ok(Outcome::Killed {
            signal: signal_name(signal as i32),
        }),
        other => unreachable!("unexpected wait status: {:?}", other),
    }
}

/// Entry point of the clone child. Never returns: the outcome (or the
/// failure) is written to the response socket and the process exits.
pub fn main(request: &Request, cgroup_procs: Fd, outer: OuterIds, sock: Socket) -> ! {
    install_panic_hook();
    let outcome = match run(request, cgroup_procs, outer, &sock) {
        Ok(outcome) => outcome,
        Err(err) => {
            if err.is_internal() {
                tracing::error!(pid = std::process::id(), error = %err, "spawner failed");
            }
            err.outcome()
        }
    };
    let delivered = sock.write_all(&outcome.to_line()).is_ok();
    std::process::exit(if delivered { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_signals_have_names() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
    }

    #[test]
    fn unknown_signals_fall_back_to_numbers() {
        assert_eq!(signal_name(63), "63");
        assert_eq!(signal_name(0), "0");
    }
}
