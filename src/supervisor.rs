//! The supervisor multiplexer: one poll loop over the cgroup event files,
//! the wall-clock timer, the spawner's response socket, and every output
//! pipe. The first terminal event stages the response; teardown then kills
//! the spawner and drains whatever the pipes still hold, bounded by each
//! sink's byte budget.

use crate::{
    cgroup::{self, CgroupGuard},
    error::{syscall, Error},
    fd::Fd,
    ipc::Socket,
    request::{PipeSpec, Request, SinkKind},
    response::{self, Outcome},
    stdstreams::{self, Peer, FRAME_HEADER_LEN},
    util,
};
use nix::{
    errno::Errno,
    fcntl::{OFlag, SpliceFFlags},
    poll::{poll, PollFd, PollFlags},
    sys::stat::Mode,
};
use std::{io, mem, os::unix::io::RawFd, path::PathBuf, time::Duration};

const MEMORY_EVENTS_INDEX: usize = 0;
const PIDS_EVENTS_INDEX: usize = 1;
const TIMER_INDEX: usize = 2;
const SPAWNER_INDEX: usize = 3;
const PIPE0_INDEX: usize = 4;

/// How one sink moves bytes. Every regular sink starts with splice and is
/// downgraded to read+write the first time the kernel refuses the fd pair.
/// The stdstreams sink sizes its receive buffer on first wakeup.
enum Handler {
    Splice,
    Copy,
    StdStreamsProbe,
    StdStreams { recvbuf: Vec<u8> },
}

struct Slot {
    spec: PipeSpec,
    dest: Fd,
    limit: u64,
    handler: Handler,
    pipe: Option<Fd>,
}

/// Result of one handler invocation. `Moved` reports bytes consumed from
/// the pipe, which may exceed the remaining limit; only the allowed prefix
/// was written out in that case.
enum Service {
    Moved(u64),
    WouldBlock,
    Eof,
}

struct Supervisor {
    slots: Vec<Slot>,
    memory_events: Option<Fd>,
    pids_events: Option<Fd>,
    timer: Fd,
    spawner: Socket,
    exiting: bool,
    fds_received: bool,
    staged: Option<Vec<u8>>,
    spawner_buf: Vec<u8>,
}

fn make_timer(limit: Option<Duration>) -> Result<Fd, Error> {
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
    if fd == -1 {
        return Err(Error::Syscall {
            op: "timerfd_create",
            source: io::Error::last_os_error(),
        });
    }
    let fd = Fd::new(fd);
    let (sec, mut nsec) = match limit {
        Some(limit) => (limit.as_secs() as libc::time_t, limit.subsec_nanos() as libc::c_long),
        None => (libc::time_t::max_value(), 0),
    };
    if sec == 0 && nsec == 0 {
        // An all-zero it_value disarms a timerfd; one nanosecond keeps the
        // "fire immediately" meaning of timeLimit 0.
        nsec = 1;
    }
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        },
    };
    if unsafe { libc::timerfd_settime(fd.as_raw(), 0, &spec, std::ptr::null_mut()) } == -1 {
        return Err(Error::Syscall {
            op: "timerfd_settime",
            source: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

fn raw_or_closed(fd: &Option<Fd>) -> RawFd {
    fd.as_ref().map_or(-1, Fd::as_raw)
}

impl Supervisor {
    fn poll_once(&mut self) -> Result<Vec<bool>, Error> {
        let mut pollfds = Vec::with_capacity(PIPE0_INDEX + self.slots.len());
        pollfds.push(PollFd::new(
            raw_or_closed(&self.memory_events),
            PollFlags::POLLPRI,
        ));
        pollfds.push(PollFd::new(
            raw_or_closed(&self.pids_events),
            PollFlags::POLLPRI,
        ));
        pollfds.push(PollFd::new(self.timer.as_raw(), PollFlags::POLLIN));
        pollfds.push(PollFd::new(self.spawner.as_raw(), PollFlags::POLLIN));
        for slot in &self.slots {
            // Copy-file channels are regular files and would report
            // readable forever; they are only drained during teardown.
            let fd = match &slot.pipe {
                Some(fd) if slot.spec.kind != SinkKind::CopyFile => fd.as_raw(),
                _ => -1,
            };
            pollfds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        loop {
            match poll(&mut pollfds, -1) {
                Ok(_) => break,
                Err(err) if err.as_errno() == Some(Errno::EINTR) => continue,
                Err(err) => return Err(syscall("poll", err)),
            }
        }
        Ok(pollfds
            .iter()
            .map(|fd| fd.revents().map_or(false, |flags| !flags.is_empty()))
            .collect())
    }

    fn memory_limit_hit(&self) -> Result<bool, Error> {
        match &self.memory_events {
            Some(fd) => Ok(cgroup::counter_nonzero(
                &cgroup::read_events_file(fd, "memory.events")?,
                "oom_kill",
            )),
            None => Ok(false),
        }
    }

    fn pids_limit_hit(&self) -> Result<bool, Error> {
        match &self.pids_events {
            Some(fd) => Ok(cgroup::counter_nonzero(
                &cgroup::read_events_file(fd, "pids.events")?,
                "max",
            )),
            None => Ok(false),
        }
    }

    /// One receive step on the spawner socket. Returns true when the final
    /// response is complete. The one-time fd transfer arrives here as an
    /// SCM_RIGHTS message whose descriptor count must match the plan
    /// exactly; anything else is treated as response payload.
    fn service_spawner(&mut self) -> Result<bool, Error> {
        if self.spawner_buf.len() > response::MAX_RESPONSE_SIZE {
            return Err(Error::ResponseTooBig);
        }
        let space = response::MAX_RESPONSE_SIZE + 1 - self.spawner_buf.len();
        let mut chunk = vec![0u8; space];
        let (received, fds) = match self.spawner.recv_with_fds(&mut chunk) {
            Ok(result) => result,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => {
                return Err(Error::Syscall {
                    op: "receiving response",
                    source: err,
                })
            }
        };
        if !fds.is_empty() {
            if fds.len() == self.slots.len() {
                for (slot, fd) in self.slots.iter_mut().zip(fds) {
                    slot.pipe = Some(fd);
                }
                self.fds_received = true;
                return Ok(false);
            }
            // Wrong count: drop the descriptors, keep the bytes.
        }
        if received == 0 {
            if self.spawner_buf.is_empty() {
                return Err(Error::EmptySpawnerResponse);
            }
            return Ok(true);
        }
        self.spawner_buf.extend_from_slice(&chunk[..received]);
        Ok(self.spawner_buf.ends_with(b"\n"))
    }

    fn service_slot(&mut self, index: usize) -> Result<Service, Error> {
        let exiting = self.exiting;
        let slot = &mut self.slots[index];
        let pipe = slot.pipe.as_ref().expect("serviced slot has a pipe");
        loop {
            match &mut slot.handler {
                Handler::Splice => {
                    if slot.limit == 0 {
                        // Splice cannot express "read but discard"; the
                        // copy handler writes the (empty) allowed prefix
                        // and reports the excess.
                        slot.handler = Handler::Copy;
                        continue;
                    }
                    let len = slot.limit.min(usize::max_value() as u64) as usize;
                    match nix::fcntl::splice(
                        pipe.as_raw(),
                        None,
                        slot.dest.as_raw(),
                        None,
                        len,
                        SpliceFFlags::SPLICE_F_NONBLOCK,
                    ) {
                        Ok(0) => return Ok(Service::Eof),
                        Ok(moved) => return Ok(Service::Moved(moved as u64)),
                        Err(err) => match err.as_errno() {
                            Some(Errno::EAGAIN) => return Ok(Service::WouldBlock),
                            Some(Errno::EINVAL) => {
                                // Unsupported fd pair; fall back for good.
                                slot.handler = Handler::Copy;
                                continue;
                            }
                            _ => {
                                return Err(Error::Splice {
                                    src: slot.spec.src_label(),
                                    dest: slot.spec.dest.clone(),
                                    source: util::cvt_error(err),
                                })
                            }
                        },
                    }
                }
                Handler::Copy => {
                    let mut buf = [0u8; libc::PIPE_BUF];
                    match pipe.read(&mut buf) {
                        Ok(0) => return Ok(Service::Eof),
                        Ok(count) => {
                            let allowed = slot.limit.min(count as u64) as usize;
                            slot.dest.write_all(&buf[..allowed]).map_err(|source| {
                                Error::Write {
                                    path: slot.spec.dest.clone(),
                                    source,
                                }
                            })?;
                            return Ok(Service::Moved(count as u64));
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(Service::WouldBlock)
                        }
                        Err(source) => {
                            return Err(Error::Read {
                                path: PathBuf::from(slot.spec.src_label()),
                                source,
                            })
                        }
                    }
                }
                Handler::StdStreamsProbe => {
                    match nix::sys::socket::getsockopt(
                        pipe.as_raw(),
                        nix::sys::socket::sockopt::RcvBuf,
                    ) {
                        Ok(size) => {
                            slot.handler = Handler::StdStreams {
                                recvbuf: vec![0u8; FRAME_HEADER_LEN + size],
                            };
                            continue;
                        }
                        Err(err) if err.as_errno() == Some(Errno::ENOTSOCK) => {
                            // The spawner handed us a pipe, not a socket:
                            // framing happens elsewhere, treat as regular.
                            slot.handler = Handler::Splice;
                            continue;
                        }
                        Err(err) => return Err(syscall("getsockopt(SO_RCVBUF)", err)),
                    }
                }
                Handler::StdStreams { recvbuf } => loop {
                    let received =
                        stdstreams::recv_dgram(pipe, &mut recvbuf[FRAME_HEADER_LEN..]).map_err(
                            |source| Error::Syscall {
                                op: "receiving stdstreams packet",
                                source,
                            },
                        )?;
                    let (count, peer) = match received {
                        Some(result) => result,
                        None => return Ok(Service::WouldBlock),
                    };
                    if count == 0 {
                        return Ok(Service::Eof);
                    }
                    let is_stderr = match peer {
                        Peer::Stdout => false,
                        Peer::Stderr => true,
                        Peer::Unknown => {
                            if exiting {
                                continue;
                            }
                            // Rejected packet: retrying within this wakeup
                            // would let a flood of forged datagrams outrun
                            // the time limit.
                            return Ok(Service::WouldBlock);
                        }
                    };
                    let header = stdstreams::frame_header(count, is_stderr);
                    recvbuf[..FRAME_HEADER_LEN].copy_from_slice(&header);
                    let total = count as u64 + FRAME_HEADER_LEN as u64;
                    let allowed = slot.limit.min(total) as usize;
                    slot.dest
                        .write_all(&recvbuf[..allowed])
                        .map_err(|source| Error::Write {
                            path: slot.spec.dest.clone(),
                            source,
                        })?;
                    return Ok(Service::Moved(total));
                },
            }
        }
    }

    /// Services the pipe slots back-to-front so that when several sinks
    /// overrun at once, the earliest-declared one decides the status.
    /// Returns true when an output limit was exceeded.
    fn do_pipes(&mut self, ready: Option<&[bool]>) -> Result<bool, Error> {
        let mut limited = false;
        for index in (0..self.slots.len()).rev() {
            if self.slots[index].pipe.is_none() {
                continue;
            }
            if !self.exiting && !ready.map_or(true, |flags| flags[index]) {
                continue;
            }
            loop {
                match self.service_slot(index)? {
                    Service::WouldBlock => break,
                    Service::Eof => {
                        self.slots[index].pipe = None;
                        break;
                    }
                    Service::Moved(moved) => {
                        let slot = &mut self.slots[index];
                        if moved <= slot.limit {
                            slot.limit -= moved;
                            if self.exiting {
                                // Keep draining this pipe until it runs dry
                                // or overruns.
                                continue;
                            }
                            break;
                        }
                        slot.limit = 0;
                        slot.pipe = None;
                        if self.staged.is_none() {
                            self.staged = Some(Outcome::OutputLimit.to_line());
                        }
                        limited = true;
                        break;
                    }
                }
            }
        }
        Ok(limited)
    }

    fn main_loop(&mut self) -> Result<(), Error> {
        loop {
            let ready = self.poll_once()?;
            if ready[MEMORY_EVENTS_INDEX] && self.memory_limit_hit()? {
                self.staged = Some(Outcome::MemoryLimit.to_line());
                return Ok(());
            }
            if ready[PIDS_EVENTS_INDEX] && self.pids_limit_hit()? {
                self.staged = Some(Outcome::PidsLimit.to_line());
                return Ok(());
            }
            if ready[TIMER_INDEX] {
                self.staged = Some(Outcome::TimeLimit.to_line());
                return Ok(());
            }
            if ready[SPAWNER_INDEX] && self.service_spawner()? {
                // Cgroup event delivery is asynchronous but the counters
                // update synchronously: a payload the OOM killer took down
                // must be reported as memoryLimit, not killed:SIGKILL.
                if self.memory_limit_hit()? {
                    self.staged = Some(Outcome::MemoryLimit.to_line());
                } else if self.pids_limit_hit()? {
                    self.staged = Some(Outcome::PidsLimit.to_line());
                } else {
                    self.staged =
                        Some(response::clamp_line(mem::take(&mut self.spawner_buf)));
                }
                return Ok(());
            }
            if self.do_pipes(Some(&ready[PIPE0_INDEX..]))? {
                return Ok(());
            }
        }
    }
}

/// Runs the multiplexer to its single terminal response.
pub fn run(
    request: &Request,
    memory_events: Option<Fd>,
    pids_events: Option<Fd>,
    spawner: Socket,
    guard: &mut CgroupGuard,
) -> Result<Vec<u8>, Error> {
    let mut slots = Vec::new();
    for spec in request.output_plan() {
        // Destination writes are deliberately blocking: a slow file slows
        // us down instead of dropping sandbox output. A fifo or /proc/self/fd
        // trick cannot change that because the mode is fixed at open time.
        let dest = util::open_fd(
            &spec.dest,
            OFlag::O_CLOEXEC
                | OFlag::O_WRONLY
                | OFlag::O_TRUNC
                | OFlag::O_CREAT
                | OFlag::O_NOCTTY,
            Mode::from_bits_truncate(0o600),
        )?;
        let handler = match spec.kind {
            SinkKind::StdStreams => Handler::StdStreamsProbe,
            _ => Handler::Splice,
        };
        slots.push(Slot {
            limit: spec.limit,
            spec,
            dest,
            handler,
            pipe: None,
        });
    }
    let timer = make_timer(request.time_limit)?;
    let mut supervisor = Supervisor {
        slots,
        memory_events,
        pids_events,
        timer,
        spawner,
        exiting: false,
        fds_received: false,
        staged: None,
        spawner_buf: Vec::new(),
    };
    supervisor.main_loop()?;

    guard.kill_spawner();
    supervisor.exiting = true;
    if supervisor.fds_received {
        supervisor.do_pipes(None)?;
    }
    Ok(supervisor
        .staged
        .take()
        .expect("terminal event always stages a response"))
}
