//! The response contract: exactly one newline-terminated JSON object on the
//! response channel, never larger than one atomic pipe write.

use crate::fd::Fd;
use serde::{Deserialize, Serialize};

/// A response must fit into a single atomic write to a pipe, so a client
/// reading our stdout never observes a torn object.
pub const MAX_RESPONSE_SIZE: usize = libc::PIPE_BUF;

/// The terminal status of one invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Exited {
        code: i32,
    },
    Killed {
        signal: String,
    },
    MemoryLimit,
    PidsLimit,
    TimeLimit,
    OutputLimit,
    RequestInvalid {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    InternalError {
        description: String,
    },
    ResponseTooBig,
}

impl Outcome {
    /// Serializes into the single-line wire form. An oversized response
    /// collapses into `responseTooBig`, which is always small enough.
    pub fn to_line(&self) -> Vec<u8> {
        let mut buf =
            serde_json::to_vec(self).expect("response serialization is infallible");
        buf.push(b'\n');
        if buf.len() > MAX_RESPONSE_SIZE {
            return Outcome::ResponseTooBig.to_line();
        }
        buf
    }
}

/// Caps an already-encoded line at the response size budget.
pub fn clamp_line(line: Vec<u8>) -> Vec<u8> {
    if line.len() > MAX_RESPONSE_SIZE {
        Outcome::ResponseTooBig.to_line()
    } else {
        line
    }
}

/// Write-once handle to the fd the client reads the response from.
///
/// The first `send` delivers the line and closes the descriptor; later calls
/// are ignored, so teardown paths can always attempt a send without tracking
/// whether one already happened.
pub struct ResponseChannel {
    fd: Option<Fd>,
}

impl ResponseChannel {
    pub fn stdout() -> Self {
        ResponseChannel {
            fd: Some(Fd::new(libc::STDOUT_FILENO)),
        }
    }

    pub fn send(&mut self, line: &[u8]) -> std::io::Result<()> {
        let fd = match self.fd.take() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        fd.write_all(line)
        // fd dropped here: the channel closes right after the response.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_str(outcome: &Outcome) -> String {
        String::from_utf8(outcome.to_line()).unwrap()
    }

    #[test]
    fn exited_wire_form() {
        assert_eq!(
            line_str(&Outcome::Exited { code: 7 }),
            "{\"status\":\"exited\",\"code\":7}\n"
        );
    }

    #[test]
    fn killed_wire_form() {
        assert_eq!(
            line_str(&Outcome::Killed {
                signal: "SIGSEGV".into()
            }),
            "{\"status\":\"killed\",\"signal\":\"SIGSEGV\"}\n"
        );
    }

    #[test]
    fn unit_statuses_have_no_extra_fields() {
        assert_eq!(line_str(&Outcome::MemoryLimit), "{\"status\":\"memoryLimit\"}\n");
        assert_eq!(line_str(&Outcome::PidsLimit), "{\"status\":\"pidsLimit\"}\n");
        assert_eq!(line_str(&Outcome::TimeLimit), "{\"status\":\"timeLimit\"}\n");
        assert_eq!(line_str(&Outcome::OutputLimit), "{\"status\":\"outputLimit\"}\n");
    }

    #[test]
    fn request_invalid_without_description() {
        assert_eq!(
            line_str(&Outcome::RequestInvalid { description: None }),
            "{\"status\":\"requestInvalid\"}\n"
        );
    }

    #[test]
    fn control_bytes_are_escaped() {
        let line = line_str(&Outcome::InternalError {
            description: "a\x01b\\c\"d\ne".into(),
        });
        assert!(line.contains("\\u0001"));
        assert!(line.contains("\\\\c"));
        assert!(line.contains("\\\"d"));
        assert!(line.contains("\\ne"));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn oversized_response_collapses() {
        let line = Outcome::InternalError {
            description: "x".repeat(2 * MAX_RESPONSE_SIZE),
        }
        .to_line();
        assert_eq!(line, Outcome::ResponseTooBig.to_line());
        assert!(line.len() <= MAX_RESPONSE_SIZE);
    }

    #[test]
    fn round_trips_through_serde() {
        for outcome in &[
            Outcome::Exited { code: 0 },
            Outcome::Killed {
                signal: "9".into(),
            },
            Outcome::TimeLimit,
            Outcome::RequestInvalid {
                description: Some("$.cmd: missing".into()),
            },
        ] {
            let line = outcome.to_line();
            let back: Outcome = serde_json::from_slice(&line).unwrap();
            assert_eq!(&back, outcome);
        }
    }
}
