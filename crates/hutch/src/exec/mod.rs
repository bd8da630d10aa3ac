//! Process execution.
//!
//! - [`channel`]: the init protocol between engine and helper
//! - [`init`]: the helper itself (`hutch init`)
//! - [`barrier`]: the start barrier FIFO
//! - [`process`]: process requests, handles and exit statuses

pub mod barrier;
pub mod channel;
pub mod init;
pub mod process;

pub use channel::{ErrorCause, InitChannel, InitMessage};
pub use init::init_main;
pub use process::{ExitStatus, Process, ProcessHandle, ProcessSpec, StdioTarget, User};
