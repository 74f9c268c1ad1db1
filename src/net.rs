use crate::error::Error;
use std::io;

const IFNAMSIZ: usize = 16;

// Minimal ifreq with just the flags arm of the union; the full layout is
// padded to the union's size.
#[repr(C)]
struct IfReqFlags {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

fn ifup_loopback() -> Result<(), Error> {
    let err = |source: io::Error| Error::Syscall {
        op: "enabling loopback network interface",
        source,
    };
    unsafe {
        let sock = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if sock == -1 {
            return Err(Error::Syscall {
                op: "socket(AF_INET, SOCK_STREAM)",
                source: io::Error::last_os_error(),
            });
        }
        let sock = crate::fd::Fd::new(sock);
        let mut ifr = IfReqFlags {
            name: [0; IFNAMSIZ],
            flags: 0,
            _pad: [0; 22],
        };
        ifr.name[..2].copy_from_slice(b"lo");
        if libc::ioctl(sock.as_raw(), libc::SIOCGIFFLAGS, &mut ifr) == -1 {
            return Err(err(io::Error::last_os_error()));
        }
        ifr.flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        if libc::ioctl(sock.as_raw(), libc::SIOCSIFFLAGS, &ifr) == -1 {
            return Err(err(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Brings `lo` up inside the fresh net namespace and installs the sandbox
/// host and domain names in the uts namespace.
pub fn configure(host_name: &str, domain_name: &str) -> Result<(), Error> {
    ifup_loopback()?;
    nix::unistd::sethostname(host_name).map_err(|err| crate::error::syscall("sethostname", err))?;
    let rc = unsafe {
        libc::setdomainname(
            domain_name.as_ptr() as *const libc::c_char,
            domain_name.len(),
        )
    };
    if rc == -1 {
        return Err(Error::Syscall {
            op: "setdomainname",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
