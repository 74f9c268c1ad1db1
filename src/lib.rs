/*!
 * sandals: a one-shot Linux process sandbox.
 *
 * One JSON request arrives on stdin; the described command runs inside
 * fresh user/pid/net/uts/ipc/mount namespaces, a cgroup v2 scope, an
 * optional seccomp filter, and a private filesystem view, with its output
 * fanned into byte-limited sinks. Exactly one JSON response leaves on
 * stdout, then the process exits.
 *
 * Three processes cooperate: the supervisor (this process) owns the
 * response channel, the cgroup and the deadline; the spawner is cloned
 * into the new namespaces and becomes their pid 1; the payload execs the
 * user command.
 */

mod cgroup;
mod error;
mod fd;
mod ipc;
mod mounts;
mod net;
mod pipes;
mod request;
mod response;
mod seccomp;
mod spawner;
mod stdstreams;
mod supervisor;
mod usrgrp;
mod util;

pub use error::Error;
pub use request::Request;
pub use response::Outcome;

use crate::{cgroup::CgroupGuard, response::ResponseChannel, util::Pid};
use std::io::Read;

fn clone_spawner() -> Result<Pid, Error> {
    // The libc clone() wrapper wants a separate stack; the raw syscall also
    // accepts fork-style COW semantics, which is what the spawner needs.
    // Sound here only because the process is single-threaded.
    let flags = libc::CLONE_NEWUSER
        | libc::CLONE_NEWPID
        | libc::CLONE_NEWNET
        | libc::CLONE_NEWUTS
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWIPC
        | libc::SIGCHLD;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags as libc::c_ulong,
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };
    if rc == -1 {
        return Err(Error::Syscall {
            op: "clone",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(rc as Pid)
}

fn run_inner(guard: &mut CgroupGuard) -> Result<Vec<u8>, Error> {
    let mut input = Vec::new();
    std::io::stdin()
        .lock()
        .read_to_end(&mut input)
        .map_err(|source| Error::ReadRequest { source })?;
    let request = Request::parse_slice(&input)?;

    // The spawner writes its response into this socket; the same socket
    // carries the one-time descriptor transfer.
    let (supervisor_sock, spawner_sock) =
        ipc::Socket::pair().map_err(|source| Error::Syscall {
            op: "socketpair(AF_UNIX, SOCK_STREAM)",
            source,
        })?;

    let ctx = cgroup::setup(&request, guard)?;
    let outer = usrgrp::OuterIds::capture();

    match clone_spawner()? {
        0 => {
            drop(supervisor_sock);
            spawner::main(&request, ctx.procs, outer, spawner_sock)
        }
        pid => {
            guard.set_spawner(pid);
            drop(spawner_sock);
            drop(ctx.procs);
            // Destination files may be pipes whose readers vanish.
            unsafe {
                nix::sys::signal::signal(
                    nix::sys::signal::Signal::SIGPIPE,
                    nix::sys::signal::SigHandler::SigIgn,
                )
            }
            .map_err(|err| error::syscall("signal(SIGPIPE, SIG_IGN)", err))?;

            supervisor::run(
                &request,
                ctx.memory_events,
                ctx.pids_events,
                supervisor_sock,
                guard,
            )
        }
    }
}

/// Full lifecycle of one invocation. Returns the process exit code: 0
/// whenever a response was delivered (whatever its status), non-zero only
/// when even that failed.
pub fn run() -> i32 {
    let mut channel = ResponseChannel::stdout();
    let mut guard = CgroupGuard::inactive();
    let line = match run_inner(&mut guard) {
        Ok(line) => line,
        Err(err) => {
            if err.is_internal() {
                tracing::error!(pid = std::process::id(), error = %err, "run failed");
            }
            err.outcome().to_line()
        }
    };
    let code = match channel.send(&line) {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "sending response failed");
            1
        }
    };
    // The guard drops here, after the client got its response: removal can
    // block until the cgroup empties.
    drop(guard);
    code
}
