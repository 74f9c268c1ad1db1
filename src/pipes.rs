//! Spawner-side construction of the output plan: one descriptor per
//! PipeSpec, materialized in plan order and shipped to the supervisor in a
//! single SCM_RIGHTS message.

use crate::{
    error::Error,
    fd::Fd,
    request::{PipeSpec, SinkKind},
    stdstreams, util,
};
use nix::{fcntl::OFlag, sys::stat::Mode};
use std::os::unix::io::RawFd;

/// Everything the spawner keeps after building the plan. Write ends stay
/// open in the spawner for the payload's lifetime; they close when the
/// spawner exits, which is what finally produces EOF on the supervisor
/// side.
pub struct OutputChannels {
    /// Parallel to the plan; transferred to the supervisor.
    pub to_supervisor: Vec<Fd>,
    /// Write ends and child-facing sockets; never read again, but they must
    /// stay open until the spawner exits so EOF arrives at the right time.
    _keep_alive: Vec<Fd>,
    pub child_stdout: Option<RawFd>,
    pub child_stderr: Option<RawFd>,
}

impl OutputChannels {
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.to_supervisor.iter().map(Fd::as_raw).collect()
    }
}

fn make_fifo_channel(
    spec: &PipeSpec,
    channels: &mut OutputChannels,
) -> Result<Fd, Error> {
    let src = spec.src.as_ref().expect("regular pipe with src");
    nix::unistd::mkfifo(src.as_path(), Mode::from_bits_truncate(0o600)).map_err(|err| {
        Error::CreateFifo {
            path: src.clone(),
            source: util::cvt_error(err),
        }
    })?;
    // Read end first; a blocking O_WRONLY open would hang without it.
    let read_end = util::open_fd(
        src,
        OFlag::O_RDONLY | OFlag::O_NOCTTY | OFlag::O_CLOEXEC | OFlag::O_NONBLOCK,
        Mode::empty(),
    )?;
    if spec.as_stdout || spec.as_stderr {
        let write_end = util::open_fd(
            src,
            OFlag::O_WRONLY | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        if spec.as_stdout {
            channels.child_stdout = Some(write_end.as_raw());
        }
        if spec.as_stderr {
            channels.child_stderr = Some(write_end.as_raw());
        }
        channels._keep_alive.push(write_end);
    }
    Ok(read_end)
}

fn make_anon_pipe_channel(
    spec: &PipeSpec,
    channels: &mut OutputChannels,
) -> Result<Fd, Error> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map(|(r, w)| (Fd::new(r), Fd::new(w)))
        .map_err(|err| crate::error::syscall("pipe2", err))?;
    read_end
        .set_nonblocking()
        .map_err(|err| crate::error::syscall("fcntl(F_SETFL, O_NONBLOCK)", err))?;
    if spec.as_stdout {
        channels.child_stdout = Some(write_end.as_raw());
    }
    if spec.as_stderr {
        channels.child_stderr = Some(write_end.as_raw());
    }
    channels._keep_alive.push(write_end);
    Ok(read_end)
}

fn make_copy_file_channel(spec: &PipeSpec) -> Result<Fd, Error> {
    let src = spec.src.as_ref().expect("copy file with src");
    // The payload usually creates this file later; opening with O_CREAT
    // pins the inode now so the drain at exit reads whatever was written
    // through the path.
    util::open_fd(
        src,
        OFlag::O_RDONLY | OFlag::O_CREAT | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
        Mode::from_bits_truncate(0o600),
    )
}

fn make_stdstreams_channel(channels: &mut OutputChannels) -> Result<Fd, Error> {
    let supervisor = stdstreams::bound_dgram_socket(stdstreams::SUPERVISOR_ADDR)?;
    let stdout = stdstreams::bound_dgram_socket(stdstreams::STDOUT_ADDR)?;
    stdstreams::connect_to(&stdout, stdstreams::SUPERVISOR_ADDR)?;
    let stderr = stdstreams::bound_dgram_socket(stdstreams::STDERR_ADDR)?;
    stdstreams::connect_to(&stderr, stdstreams::SUPERVISOR_ADDR)?;
    // stdStreams is last in the plan, so it overrides any pipe that also
    // claimed a stdio role.
    channels.child_stdout = Some(stdout.as_raw());
    channels.child_stderr = Some(stderr.as_raw());
    channels._keep_alive.push(stdout);
    channels._keep_alive.push(stderr);
    Ok(supervisor)
}

/// Builds every channel of the plan, in order.
pub fn create(plan: &[PipeSpec]) -> Result<OutputChannels, Error> {
    let mut channels = OutputChannels {
        to_supervisor: Vec::with_capacity(plan.len()),
        _keep_alive: Vec::new(),
        child_stdout: None,
        child_stderr: None,
    };
    for spec in plan {
        let fd = match spec.kind {
            SinkKind::Regular if spec.src.is_some() => make_fifo_channel(spec, &mut channels)?,
            SinkKind::Regular => make_anon_pipe_channel(spec, &mut channels)?,
            SinkKind::CopyFile => make_copy_file_channel(spec)?,
            SinkKind::StdStreams => make_stdstreams_channel(&mut channels)?,
        };
        channels.to_supervisor.push(fd);
    }
    Ok(channels)
}
