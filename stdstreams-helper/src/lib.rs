//! LD_PRELOAD helper for the multiplexed stdstreams transport.
//!
//! The payload's stdout and stderr are UNIX datagram sockets; a write
//! larger than the socket buffer fails with EMSGSIZE instead of being
//! split. This library interposes `write` and `writev`, resolves the real
//! implementations through the dynamic loader, and retries oversized
//! writes in chunks of half the receiver's buffer. Each chunk travels as
//! its own datagram, so a boundary-crossing write arrives as two framed
//! records without losing a byte.
//!
//! Only descriptors whose peer is the supervisor's well-known abstract
//! address get this treatment; everything else sees the unmodified libc
//! behavior, including the original errno.

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

// Must match the supervisor's address table.
const SUPERVISOR_ADDR: &[u8] = b"\0sandals/stdStreams";

type WriteFn =
    unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t) -> libc::ssize_t;
type WritevFn =
    unsafe extern "C" fn(libc::c_int, *const libc::iovec, libc::c_int) -> libc::ssize_t;

static REAL_WRITE: AtomicUsize = AtomicUsize::new(0);
static REAL_WRITEV: AtomicUsize = AtomicUsize::new(0);

unsafe fn resolve(cache: &AtomicUsize, name: &[u8]) -> usize {
    let cached = cache.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let found = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char) as usize;
    // Benign race: every thread resolves to the same address.
    cache.store(found, Ordering::Relaxed);
    found
}

unsafe fn real_write(fd: libc::c_int, buf: *const libc::c_void, count: libc::size_t) -> libc::ssize_t {
    let ptr = resolve(&REAL_WRITE, b"write\0");
    if ptr == 0 {
        return libc::syscall(libc::SYS_write, fd, buf, count) as libc::ssize_t;
    }
    let func: WriteFn = mem::transmute(ptr);
    func(fd, buf, count)
}

unsafe fn real_writev(fd: libc::c_int, iov: *const libc::iovec, iovcnt: libc::c_int) -> libc::ssize_t {
    let ptr = resolve(&REAL_WRITEV, b"writev\0");
    if ptr == 0 {
        return libc::syscall(libc::SYS_writev, fd, iov, iovcnt) as libc::ssize_t;
    }
    let func: WritevFn = mem::transmute(ptr);
    func(fd, iov, iovcnt)
}

fn set_errno(value: libc::c_int) {
    unsafe { *libc::__errno_location() = value }
}

fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

/// True when `fd` is connected to the stdstreams supervisor socket; fills
/// in the chunk size to retry with. Restores EMSGSIZE on every failure
/// path so the caller's error reporting stays truthful.
fn check_socket(fd: libc::c_int, chunk: &mut libc::size_t) -> bool {
    unsafe {
        let mut peer: libc::sockaddr_un = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        if libc::getpeername(
            fd,
            &mut peer as *mut libc::sockaddr_un as *mut libc::sockaddr,
            &mut len,
        ) == -1
        {
            set_errno(libc::EMSGSIZE);
            return false;
        }
        let path_offset = mem::size_of::<libc::sa_family_t>();
        let path_len = (len as usize).saturating_sub(path_offset);
        if path_len != SUPERVISOR_ADDR.len()
            || !peer.sun_path[..path_len]
                .iter()
                .zip(SUPERVISOR_ADDR.iter())
                .all(|(a, b)| *a as u8 == *b)
        {
            set_errno(libc::EMSGSIZE);
            return false;
        }
        let mut bufsize: libc::c_int = 0;
        let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &mut bufsize as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        ) == -1
            || bufsize <= 1
        {
            set_errno(libc::EMSGSIZE);
            return false;
        }
        *chunk = bufsize as libc::size_t / 2;
        true
    }
}

/// Interposed `write`: on EMSGSIZE against the stdstreams socket, replay
/// the buffer in receiver-sized chunks.
#[no_mangle]
pub unsafe extern "C" fn write(
    fd: libc::c_int,
    buf: *const libc::c_void,
    count: libc::size_t,
) -> libc::ssize_t {
    let rc = real_write(fd, buf, count);
    let mut chunk: libc::size_t = 0;
    if rc == -1 && errno() == libc::EMSGSIZE && check_socket(fd, &mut chunk) {
        let mut offset: libc::size_t = 0;
        let mut rc: libc::ssize_t = 0;
        while offset < count {
            let step = chunk.min(count - offset);
            rc = real_write(fd, (buf as *const u8).add(offset) as *const libc::c_void, step);
            if rc <= 0 {
                break;
            }
            offset += rc as libc::size_t;
        }
        return if offset == 0 { rc } else { offset as libc::ssize_t };
    }
    rc
}

const IOV_BATCH: usize = 32;

/// Copies up to `size` bytes worth of iovec entries starting `offset` bytes
/// into `iov`, for one bounded retry.
unsafe fn iov_window(
    copy: &mut [libc::iovec; IOV_BATCH],
    iov: *const libc::iovec,
    iovcnt: libc::c_int,
    mut offset: libc::size_t,
    size: libc::size_t,
) -> libc::c_int {
    let mut index = 0usize;
    // Skip whole entries the previous rounds already sent.
    while index < iovcnt as usize && offset >= (*iov.add(index)).iov_len {
        offset -= (*iov.add(index)).iov_len;
        index += 1;
    }
    let mut remaining = size;
    let mut out = 0usize;
    while out < IOV_BATCH && index < iovcnt as usize && remaining > 0 {
        let entry = *iov.add(index);
        let skip = if out == 0 { offset } else { 0 };
        let avail = entry.iov_len - skip;
        let take = avail.min(remaining);
        copy[out] = libc::iovec {
            iov_base: (entry.iov_base as *mut u8).add(skip) as *mut libc::c_void,
            iov_len: take,
        };
        remaining -= take;
        index += 1;
        out += 1;
    }
    out as libc::c_int
}

/// Interposed `writev`: same contract as `write`, preserving the vector's
/// byte order across the chunked retries.
#[no_mangle]
pub unsafe extern "C" fn writev(
    fd: libc::c_int,
    iov: *const libc::iovec,
    iovcnt: libc::c_int,
) -> libc::ssize_t {
    let rc = real_writev(fd, iov, iovcnt);
    let mut chunk: libc::size_t = 0;
    if rc == -1 && iovcnt > 0 && errno() == libc::EMSGSIZE && check_socket(fd, &mut chunk) {
        let total: libc::size_t = (0..iovcnt as usize).map(|i| (*iov.add(i)).iov_len).sum();
        let mut offset: libc::size_t = 0;
        let mut rc: libc::ssize_t = 0;
        let mut copy: [libc::iovec; IOV_BATCH] = mem::zeroed();
        while offset < total {
            let n = iov_window(&mut copy, iov, iovcnt, offset, chunk);
            if n == 0 {
                break;
            }
            rc = real_writev(fd, copy.as_ptr(), n);
            if rc <= 0 {
                break;
            }
            offset += rc as libc::size_t;
        }
        return if offset == 0 { rc } else { offset as libc::ssize_t };
    }
    rc
}
