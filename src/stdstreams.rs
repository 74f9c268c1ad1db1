//! The multiplexed stdout/stderr transport.
//!
//! Three UNIX datagram sockets live on well-known abstract addresses inside
//! the sandbox's network namespace: the supervisor-facing socket plus one
//! connected socket per stream, which become the payload's stdout and
//! stderr. One datagram per write; the sender's address tells the
//! supervisor which stream a chunk belongs to, and the destination file
//! receives each chunk behind a 4-byte big-endian length whose high bit
//! marks stderr.
//!
//! The LD_PRELOAD helper (sandals-stdstreams) keeps large writes lossless
//! by retrying with smaller chunks on EMSGSIZE; these addresses are part of
//! its contract and must not change.

use crate::{error::Error, fd::Fd};
use std::{io, mem};

pub const SUPERVISOR_ADDR: &[u8] = b"\0sandals/stdStreams";
pub const STDOUT_ADDR: &[u8] = b"\0sandals/stdout";
pub const STDERR_ADDR: &[u8] = b"\0sandals/stderr";

pub const FRAME_HEADER_LEN: usize = 4;
const STDERR_BIT: u32 = 0x8000_0000;

/// Length prefix for one framed chunk.
pub fn frame_header(len: usize, is_stderr: bool) -> [u8; FRAME_HEADER_LEN] {
    let mut word = len as u32;
    if is_stderr {
        word |= STDERR_BIT;
    }
    word.to_be_bytes()
}

fn sockaddr_for(addr: &[u8]) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (slot, byte) in sun.sun_path.iter_mut().zip(addr.iter()) {
        *slot = *byte as libc::c_char;
    }
    let len = sun_path_offset() + addr.len();
    (sun, len as libc::socklen_t)
}

pub(crate) fn sun_path_offset() -> usize {
    // sun_family precedes sun_path; there is no padding between them.
    mem::size_of::<libc::sa_family_t>()
}

/// Creates a datagram socket bound to one of the well-known addresses.
pub fn bound_dgram_socket(addr: &[u8]) -> Result<Fd, Error> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        return Err(Error::Syscall {
            op: "socket(AF_UNIX, SOCK_DGRAM)",
            source: io::Error::last_os_error(),
        });
    }
    let fd = Fd::new(fd);
    let (sun, len) = sockaddr_for(addr);
    let rc = unsafe {
        libc::bind(
            fd.as_raw(),
            &sun as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc == -1 {
        return Err(Error::Syscall {
            op: "binding stdstreams socket",
            source: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

pub fn connect_to(fd: &Fd, addr: &[u8]) -> Result<(), Error> {
    let (sun, len) = sockaddr_for(addr);
    let rc = unsafe {
        libc::connect(
            fd.as_raw(),
            &sun as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if rc == -1 {
        return Err(Error::Syscall {
            op: "connecting stdstreams socket",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// One received datagram together with its attribution.
pub enum Peer {
    Stdout,
    Stderr,
    Unknown,
}

/// Non-blocking receive preserving the sender's address.
/// Returns None on EAGAIN.
pub fn recv_dgram(fd: &Fd, buf: &mut [u8]) -> io::Result<Option<(usize, Peer)>> {
    let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    let mut sun_len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            fd.as_raw(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut sun as *mut libc::sockaddr_un as *mut libc::sockaddr,
            &mut sun_len,
        )
    };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    let path_len = (sun_len as usize).saturating_sub(sun_path_offset());
    let path = &sun.sun_path[..path_len.min(sun.sun_path.len())];
    let peer = if addr_eq(path, STDOUT_ADDR) {
        Peer::Stdout
    } else if addr_eq(path, STDERR_ADDR) {
        Peer::Stderr
    } else {
        Peer::Unknown
    };
    Ok(Some((rc as usize, peer)))
}

fn addr_eq(sun_path: &[libc::c_char], addr: &[u8]) -> bool {
    sun_path.len() == addr.len()
        && sun_path
            .iter()
            .zip(addr.iter())
            .all(|(a, b)| *a as u8 == *b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_header_is_plain_length() {
        assert_eq!(frame_header(5, false), [0, 0, 0, 5]);
        assert_eq!(frame_header(0x0102, false), [0, 0, 1, 2]);
    }

    #[test]
    fn stderr_header_sets_high_bit() {
        assert_eq!(frame_header(5, true), [0x80, 0, 0, 5]);
    }

    #[test]
    fn datagrams_carry_peer_identity() {
        // The abstract namespace is per network namespace, so tests pick
        // unique names to avoid clashing with concurrent runs.
        let tag = std::process::id();
        let sup_addr = format!("\0sandals-test/sup-{}", tag).into_bytes();
        let out_addr = format!("\0sandals-test/out-{}", tag).into_bytes();
        let sup = bound_dgram_socket(&sup_addr).unwrap();
        let out = bound_dgram_socket(&out_addr).unwrap();
        connect_to(&out, &sup_addr).unwrap();
        out.write_all(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let (n, peer) = recv_dgram(&sup, &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        // The peer address is the test's, not the production stdout
        // address, so it must classify as unknown.
        assert!(matches!(peer, Peer::Unknown));
        assert!(matches!(recv_dgram(&sup, &mut buf).unwrap(), None));
    }
}
