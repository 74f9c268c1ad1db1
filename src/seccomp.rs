//! The seccomp policy compiler is a black box: policy text in, BPF program
//! out. The text is a seccompiler JSON policy document defining exactly one
//! filter; whatever name it carries, that filter is the one installed in
//! the payload right before exec.

use crate::error::Error;
use seccompiler::{apply_filter, compile_from_json, BpfProgram, TargetArch};
use std::convert::TryFrom;
use std::io::Cursor;

pub struct Filter(BpfProgram);

pub fn compile(policy: &str) -> Result<Filter, Error> {
    let arch = TargetArch::try_from(std::env::consts::ARCH)
        .map_err(|_| Error::Unsupported("seccomp target architecture"))?;
    let filters = compile_from_json(Cursor::new(policy.as_bytes()), arch)
        .map_err(|err| Error::SeccompPolicy(err.to_string()))?;
    if filters.len() != 1 {
        return Err(Error::SeccompPolicy(
            "policy must define exactly one filter".into(),
        ));
    }
    let program = filters.into_iter().next().map(|(_, prog)| prog);
    Ok(Filter(program.expect("one filter present")))
}

impl Filter {
    /// Installs the filter in the calling process. Only called between fork
    /// and exec; on failure the caller records errno in the exec_errno cell.
    pub fn install(&self) -> Result<(), i32> {
        apply_filter(&self.0).map_err(|_| {
            let code = errno::errno().0;
            if code == 0 {
                libc::EINVAL
            } else {
                code
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DENY_PTRACE: &str = r#"{
        "main": {
            "default_action": "allow",
            "filter_action": "kill_process",
            "filter": [
                { "syscall": "ptrace" }
            ]
        }
    }"#;

    #[test]
    fn compiles_a_single_filter_policy() {
        assert!(compile(DENY_PTRACE).is_ok());
    }

    #[test]
    fn rejects_malformed_policy() {
        match compile("not json at all") {
            Err(Error::SeccompPolicy(_)) => {}
            other => panic!("expected SeccompPolicy error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_multi_filter_policy() {
        let policy = r#"{
            "a": {
                "default_action": "allow",
                "filter_action": "trap",
                "filter": [ { "syscall": "ptrace" } ]
            },
            "b": {
                "default_action": "allow",
                "filter_action": "trap",
                "filter": [ { "syscall": "ptrace" } ]
            }
        }"#;
        match compile(policy) {
            Err(Error::SeccompPolicy(msg)) => {
                assert!(msg.contains("exactly one"));
            }
            other => panic!("expected SeccompPolicy error, got {:?}", other.map(|_| ())),
        }
    }
}
