use crate::response::Outcome;
use std::path::PathBuf;

/// Every failure in the system collapses into one of these variants; each
/// maps onto exactly one response status. Resource-limit conditions and
/// sandboxed-program outcomes are not errors and never travel this way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),
    #[error("seccomp policy: {0}")]
    SeccompPolicy(String),
    #[error("reading request: {source}")]
    ReadRequest { source: std::io::Error },
    #[error("opening '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("reading '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("stat('{}'): {source}", path.display())]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("creating '{}': {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("creating fifo '{}': {source}", path.display())]
    CreateFifo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("mount('{src}', '{}', '{fstype}'): {source}", dest.display())]
    Mount {
        src: String,
        dest: PathBuf,
        fstype: String,
        source: std::io::Error,
    },
    #[error("chroot('{}'): {source}", path.display())]
    Chroot {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("setting work dir to '{}': {source}", path.display())]
    Workdir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("splicing '{src}' and '{}': {source}", dest.display())]
    Splice {
        src: String,
        dest: PathBuf,
        source: std::io::Error,
    },
    #[error("exec '{cmd}': {source}")]
    Exec {
        cmd: String,
        source: std::io::Error,
    },
    #[error("{op}: {source}")]
    Syscall {
        op: &'static str,
        source: std::io::Error,
    },
    #[error("cgroup detection: {0}")]
    CgroupDetection(String),
    #[error("{0} is not supported on this system")]
    Unsupported(&'static str),
    #[error("empty response from spawner")]
    EmptySpawnerResponse,
    #[error("response too big")]
    ResponseTooBig,
}

impl Error {
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::BadRequest(_) | Error::SeccompPolicy(_) => Outcome::RequestInvalid {
                description: Some(self.to_string()),
            },
            Error::ResponseTooBig => Outcome::ResponseTooBig,
            _ => Outcome::InternalError {
                description: self.to_string(),
            },
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.outcome(), Outcome::InternalError { .. })
    }
}

pub(crate) fn syscall(op: &'static str, err: nix::Error) -> Error {
    Error::Syscall {
        op,
        source: crate::util::cvt_error(err),
    }
}
