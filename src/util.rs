use crate::{error::Error, fd::Fd};
use nix::{
    fcntl::OFlag,
    sys::stat::Mode,
};
use std::{fs, os::unix::io::RawFd, path::Path};

pub type Pid = libc::pid_t;

pub fn cvt_error(n: nix::Error) -> std::io::Error {
    match n {
        nix::Error::Sys(sys) => std::io::Error::from_raw_os_error(sys as i32),
        other => std::io::Error::new(std::io::ErrorKind::Other, other),
    }
}

/// `open(2)` returning an owned handle, with the path recorded on failure.
pub fn open_fd(path: &Path, flags: OFlag, mode: Mode) -> Result<Fd, Error> {
    nix::fcntl::open(path, flags, mode)
        .map(Fd::new)
        .map_err(|err| Error::Open {
            path: path.to_path_buf(),
            source: cvt_error(err),
        })
}

/// Full write to an already-open fd; any shortfall is an error against `path`.
pub fn write_fd_all(fd: &Fd, data: &[u8], path: &Path) -> Result<(), Error> {
    fd.write_all(data).map_err(|err| Error::Write {
        path: path.to_path_buf(),
        source: err,
    })
}

/// Closes every descriptor above stderr except the ones listed.
///
/// The /proc/self/fd listing is collected before closing anything: the
/// directory stream holds an fd of its own and must not be pulled out from
/// under the iteration.
pub fn close_stray_fds(keep: &[RawFd]) -> Result<(), Error> {
    let dir = fs::read_dir("/proc/self/fd").map_err(|err| Error::Open {
        path: "/proc/self/fd".into(),
        source: err,
    })?;
    let fds: Vec<RawFd> = dir
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse().ok())
        .collect();
    for fd in fds {
        if fd > libc::STDERR_FILENO && !keep.contains(&fd) {
            unsafe { libc::close(fd) };
        }
    }
    Ok(())
}
