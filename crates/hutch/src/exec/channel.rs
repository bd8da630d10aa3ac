#![allow(unsafe_code)]
//! The init protocol.
//!
//! Newline-delimited JSON over a socketpair. The engine keeps one end; the
//! helper finds the other on fd [`INIT_PIPE_FD`], announced in
//! [`INIT_PIPE_ENV`].

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use hutch_common::{HutchError, HutchResult};
use hutch_config::{ContainerConfig, Namespace};
use serde::{Deserialize, Serialize};

use super::process::ProcessSpec;

/// Environment variable naming the helper's protocol fd.
pub const INIT_PIPE_ENV: &str = "_HUTCH_INITPIPE";
/// Environment variable naming the helper's log file.
pub const INIT_LOG_ENV: &str = "_HUTCH_INIT_LOG";
/// Fd the helper's end of the channel is placed on.
pub const INIT_PIPE_FD: RawFd = 3;
/// Largest message accepted, newline included.
pub const MAX_MESSAGE: usize = 1024 * 1024;

/// Setup for a new container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    /// The container configuration.
    pub config: ContainerConfig,
    /// Start barrier the init blocks on.
    pub fifo: PathBuf,
}

/// Setup for a process joining a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Namespaces to join, each with a path.
    pub namespaces: Vec<Namespace>,
    /// The process to exec once joined.
    pub process: ProcessSpec,
}

/// What went wrong in the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// The request cannot be carried out as described.
    InvalidConfig,
    /// Creating or joining a namespace failed.
    Namespace,
    /// The user namespace ID maps could not be set up.
    IdMapping,
    /// Building the mount tree failed.
    Mount,
    /// Setting the hostname failed.
    Hostname,
    /// Preparing or executing the process failed.
    Process,
    /// Unexpected or malformed message.
    Protocol,
}

impl ErrorCause {
    /// The engine-side error for a reported failure.
    #[must_use]
    pub fn into_error(self, message: String) -> HutchError {
        match self {
            Self::InvalidConfig => HutchError::InvalidConfig { message },
            Self::Namespace => HutchError::resource("namespaces", message),
            Self::IdMapping | Self::Mount | Self::Hostname | Self::Process | Self::Protocol => {
                HutchError::bootstrap(format!("{self:?}: {message}"))
            }
        }
    }
}

/// Messages exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitMessage {
    /// Engine → helper: set up a new container.
    Bootstrap(BootstrapRequest),
    /// Engine → helper: join a container and exec a process.
    Join(JoinRequest),
    /// Helper → engine: user namespace created, write the ID maps.
    IdMapRequest,
    /// Engine → helper: ID maps written.
    IdMapApplied,
    /// Helper → engine: setup finished, user code blocked.
    Ready {
        /// Host pid of the process that will exec user code.
        pid: u32,
    },
    /// Engine → helper: cgroup joined and limited, go ahead.
    Proceed,
    /// Helper → engine: setup failed.
    Error {
        /// Failure category.
        cause: ErrorCause,
        /// Details.
        message: String,
    },
}

impl InitMessage {
    /// Short name for logs and protocol errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bootstrap(_) => "bootstrap",
            Self::Join(_) => "join",
            Self::IdMapRequest => "id_map_request",
            Self::IdMapApplied => "id_map_applied",
            Self::Ready { .. } => "ready",
            Self::Proceed => "proceed",
            Self::Error { .. } => "error",
        }
    }
}

/// One end of the init channel.
#[derive(Debug)]
pub struct InitChannel {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    deadline: Option<Instant>,
}

impl InitChannel {
    /// Wrap a connected socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be duplicated.
    pub fn new(stream: UnixStream) -> HutchResult<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            deadline: None,
        })
    }

    /// The helper's end, taken from the fd named in [`INIT_PIPE_ENV`] and
    /// marked close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::BootstrapFailed`] if the variable is missing or
    /// malformed.
    pub fn from_env() -> HutchResult<Self> {
        let fd: RawFd = std::env::var(INIT_PIPE_ENV)
            .map_err(|_| HutchError::bootstrap(format!("{INIT_PIPE_ENV} is not set")))?
            .parse()
            .map_err(|e| HutchError::bootstrap(format!("{INIT_PIPE_ENV}: {e}")))?;

        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(HutchError::bootstrap(format!(
                "init pipe fd {fd}: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: the fd was handed to us by the engine and is owned by
        // nothing else in this process.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Self::new(stream)
    }

    /// Every later receive must complete within `timeout` of this call.
    /// `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket option cannot be cleared.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> HutchResult<()> {
        self.deadline = timeout.map(|timeout| Instant::now() + timeout);
        if self.deadline.is_none() {
            self.reader.get_ref().set_read_timeout(None)?;
        }
        Ok(())
    }

    /// Limit the next read to what is left until the deadline.
    fn arm_deadline(&self) -> HutchResult<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        self.reader.get_ref().set_read_timeout(Some(remaining))?;
        Ok(())
    }

    /// Send a message.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::BootstrapFailed`] if the peer is gone.
    pub fn send(&mut self, message: &InitMessage) -> HutchResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| HutchError::bootstrap(format!("sending {}: {e}", message.name())))?;
        tracing::trace!(message = message.name(), "Sent init message");
        Ok(())
    }

    /// Receive the next message, `None` once the peer closed its end.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::BootstrapFailed`] on timeout, read failure, a
    /// message over [`MAX_MESSAGE`] or a malformed message.
    pub fn recv(&mut self) -> HutchResult<Option<InitMessage>> {
        let mut line = Vec::new();
        loop {
            self.arm_deadline()?;
            let available = match self.reader.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(timed_out());
                }
                Err(e) => {
                    return Err(HutchError::bootstrap(format!("reading init message: {e}")));
                }
            };

            if available.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(HutchError::bootstrap("init channel closed mid-message"));
            }

            let (taken, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), false),
            };
            if line.len() + taken > MAX_MESSAGE {
                return Err(HutchError::bootstrap(format!(
                    "init message larger than {MAX_MESSAGE} bytes"
                )));
            }
            line.extend_from_slice(&available[..taken]);
            self.reader.consume(taken);
            if complete {
                break;
            }
        }

        let message: InitMessage = serde_json::from_slice(line.trim_ascii_end())
            .map_err(|e| HutchError::bootstrap(format!("malformed init message: {e}")))?;
        tracing::trace!(message = message.name(), "Received init message");
        Ok(Some(message))
    }
}

fn timed_out() -> HutchError {
    HutchError::bootstrap("timed out waiting for init message")
}
