//! The P1/P2 response channel: a stream socketpair carrying the fd array
//! (one SCM_RIGHTS message with a single dummy byte) and, later, the
//! spawner's newline-terminated JSON response.
//! We use `nix` directly; std has no stable fd-passing API.

use crate::{fd::Fd, util::cvt_error};
use nix::sys::{
    socket::{
        recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
        MsgFlags, SockFlag, SockType,
    },
    uio::IoVec,
};
use std::os::unix::io::RawFd;

/// Upper bound on output sinks in one request, and therefore on the fds in
/// the single SCM_RIGHTS transfer (the kernel itself stops at 253).
pub const MAX_SINKS: usize = 64;

pub struct Socket {
    fd: Fd,
}

impl Socket {
    pub fn pair() -> std::io::Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(cvt_error)?;
        Ok((Socket { fd: Fd::new(a) }, Socket { fd: Fd::new(b) }))
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd.as_raw()
    }

    pub fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        self.fd.write_all(data)
    }

    /// Sends the descriptor array in one message. The one-byte payload only
    /// exists because ancillary data cannot travel alone.
    pub fn send_fds(&self, fds: &[RawFd]) -> std::io::Result<()> {
        assert!(fds.len() <= MAX_SINKS);
        let iov = [IoVec::from_slice(b"\0")];
        sendmsg(
            self.fd.as_raw(),
            &iov,
            &[ControlMessage::ScmRights(fds)],
            MsgFlags::empty(),
            None,
        )
        .map_err(cvt_error)?;
        Ok(())
    }

    /// One non-blocking receive step: data bytes land in `buf`, any
    /// SCM_RIGHTS descriptors are unpacked into owned handles.
    pub fn recv_with_fds(&self, buf: &mut [u8]) -> std::io::Result<(usize, Vec<Fd>)> {
        let iov = [IoVec::from_mut_slice(buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_SINKS]);
        let msg = recvmsg(
            self.fd.as_raw(),
            &iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(cvt_error)?;
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received.into_iter().map(Fd::new));
            }
        }
        Ok((msg.bytes, fds))
    }
}
