//! Builds the private filesystem view: every mount is reinterpreted under
//! the chroot, missing destination nodes are created on demand, and
//! read-only bind mounts get their remount pass.

use crate::{error::Error, request::{Mount, Request}};
use nix::mount::MsFlags;
use std::{
    fs,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

/// Joins a mount destination onto the chroot: trailing slashes of the
/// chroot and leading slashes of the destination are trimmed so the result
/// has exactly one separator at the seam. `..` components were rejected at
/// validation.
pub(crate) fn chrooted_dest(chroot: &Path, dest: &str) -> PathBuf {
    let chroot = chroot.to_string_lossy();
    let chroot = chroot.trim_end_matches('/');
    let dest = dest.trim_start_matches('/');
    PathBuf::from(format!("{}/{}", chroot, dest))
}

/// Creates the missing mount target: parent directories with mode 0700 and
/// a leaf matching what lands on it, a directory for directory binds and
/// filesystem types, an empty file for file binds.
fn create_node(bind_src: Option<&str>, dest: &Path) -> Result<(), Error> {
    let dir_leaf = match bind_src {
        Some(src) => fs::metadata(src)
            .map_err(|source| Error::Stat {
                path: PathBuf::from(src),
                source,
            })?
            .is_dir(),
        None => true,
    };
    if let Some(parent) = dest.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|source| Error::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    if dir_leaf {
        fs::DirBuilder::new()
            .mode(0o700)
            .create(dest)
            .map_err(|source| Error::CreateDir {
                path: dest.to_path_buf(),
                source,
            })?;
    } else {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(dest)
            .map_err(|source| Error::Open {
                path: dest.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

fn mount_once(mount: &Mount, src: &str, target: &Path, flags: MsFlags) -> nix::Result<()> {
    let data = if mount.options.is_empty() {
        None
    } else {
        Some(mount.options.as_str())
    };
    nix::mount::mount(
        Some(src),
        target,
        Some(mount.fstype.as_str()),
        flags,
        data,
    )
}

fn mount_error(mount: &Mount, src: &str, target: &Path, err: nix::Error) -> Error {
    Error::Mount {
        src: src.to_string(),
        dest: target.to_path_buf(),
        fstype: mount.fstype.clone(),
        source: crate::util::cvt_error(err),
    }
}

/// Applies the mount plan in request order.
pub fn apply(request: &Request) -> Result<(), Error> {
    for mount in &request.mounts {
        let bind = mount.fstype == "bind";
        let src = mount.src.as_deref().unwrap_or(mount.fstype.as_str());
        let flags = if bind {
            MsFlags::MS_BIND | MsFlags::MS_REC
        } else {
            MsFlags::empty()
        };
        let target = chrooted_dest(&request.chroot, &mount.dest);

        if let Err(err) = mount_once(mount, src, &target, flags) {
            // Create the missing target and retry exactly once.
            if err.as_errno() != Some(nix::errno::Errno::ENOENT) {
                return Err(mount_error(mount, src, &target, err));
            }
            create_node(if bind { Some(src) } else { None }, &target)?;
            mount_once(mount, src, &target, flags)
                .map_err(|err| mount_error(mount, src, &target, err))?;
        }

        if mount.ro {
            mount_once(
                mount,
                src,
                &target,
                flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )
            .map_err(|err| mount_error(mount, src, &target, err))?;
        }
    }
    Ok(())
}
