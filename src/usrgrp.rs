use crate::{error::Error, request::Request};
use std::{fs, path::Path};

/// Credentials captured in the supervisor before the user namespace is
/// entered. Reading getuid() after the clone would only ever produce the
/// overflow uid, so the values ride into the spawner through the copied
/// address space.
#[derive(Debug, Clone, Copy)]
pub struct OuterIds {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl OuterIds {
    pub fn capture() -> Self {
        OuterIds {
            uid: nix::unistd::Uid::effective().as_raw(),
            gid: nix::unistd::Gid::effective().as_raw(),
        }
    }
}

fn write_proc(path: &str, data: &str) -> Result<(), Error> {
    fs::write(path, data).map_err(|source| Error::Write {
        path: Path::new(path).to_path_buf(),
        source,
    })
}

/// Installs the single-row uid/gid mappings. setgroups must be denied
/// before gid_map is writable from an unprivileged user namespace.
pub fn map_user_and_group(request: &Request, outer: &OuterIds) -> Result<(), Error> {
    write_proc("/proc/self/setgroups", "deny")?;
    write_proc(
        "/proc/self/uid_map",
        &format!("{} {} 1", request.uid, outer.uid),
    )?;
    write_proc(
        "/proc/self/gid_map",
        &format!("{} {} 1", request.gid, outer.gid),
    )?;
    Ok(())
}
