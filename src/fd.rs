use crate::util::cvt_error;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::os::unix::prelude::{AsRawFd, RawFd};

/// Represents owned file descriptor
pub struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.as_raw()
    }
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fd({})", self.0)
    }
}

impl Fd {
    pub fn new(inner: RawFd) -> Self {
        Fd(inner)
    }

    pub fn as_raw(&self) -> RawFd {
        self.0
    }

    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(cvt_error)
    }

    pub fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(cvt_error)
    }

    /// Writes the whole buffer, retrying short writes and EINTR.
    pub fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn pread(&self, buf: &mut [u8], offset: i64) -> std::io::Result<usize> {
        nix::sys::uio::pread(self.0, buf, offset).map_err(cvt_error)
    }

    pub fn set_nonblocking(&self) -> nix::Result<()> {
        fcntl(self.0, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map(drop)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        nix::unistd::close(self.0).ok();
    }
}
