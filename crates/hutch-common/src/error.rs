//! Common error types for the hutch runtime.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`HutchError`].
pub type HutchResult<T> = Result<T, HutchError>;

/// Errors reported by the hutch runtime.
#[derive(Error, Diagnostic, Debug)]
pub enum HutchError {
    /// Structurally invalid input. No OS side effects happened.
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(hutch::config::invalid))]
    InvalidConfig {
        /// What is wrong with the configuration.
        message: String,
    },

    /// A container with this ID already exists.
    #[error("Container already exists: {id}")]
    #[diagnostic(
        code(hutch::container::already_exists),
        help("Destroy the existing container or pick another ID")
    )]
    AlreadyExists {
        /// The conflicting container ID.
        id: String,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(hutch::container::not_found))]
    NotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// Operation is not legal in the current lifecycle state.
    #[error("Container {id} is {status}, expected {expected}")]
    #[diagnostic(code(hutch::container::invalid_state))]
    InvalidState {
        /// The container ID.
        id: String,
        /// The status the container is in.
        status: String,
        /// The status (or statuses) the operation requires.
        expected: String,
    },

    /// Namespace or cgroup allocation failed at the OS level.
    #[error("Resource setup failed ({resource}): {message}")]
    #[diagnostic(
        code(hutch::resource),
        help("Namespace and cgroup setup usually requires root privileges")
    )]
    Resource {
        /// The resource being set up (e.g. "cgroup", "namespaces").
        resource: String,
        /// Details.
        message: String,
    },

    /// Init protocol violation or child-reported setup failure.
    #[error("Bootstrap failed: {message}")]
    #[diagnostic(code(hutch::bootstrap))]
    BootstrapFailed {
        /// Details.
        message: String,
    },

    /// The checkpoint service reported failure.
    #[error("Checkpoint failed: {diagnostic}")]
    #[diagnostic(code(hutch::checkpoint))]
    CheckpointFailed {
        /// Diagnostic text from the checkpoint service.
        diagnostic: String,
    },

    /// The restore service reported failure or the host is incompatible.
    #[error("Restore failed: {diagnostic}")]
    #[diagnostic(code(hutch::restore))]
    RestoreFailed {
        /// Diagnostic text from the restore service.
        diagnostic: String,
    },

    /// Target process vanished between lookup and signal delivery.
    #[error("Signal {signal} could not be delivered to pid {pid}: {message}")]
    #[diagnostic(
        code(hutch::signal),
        help("The process may have exited; query the container status and retry")
    )]
    Signal {
        /// The signal number.
        signal: i32,
        /// The target pid.
        pid: u32,
        /// Details.
        message: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(hutch::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(hutch::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(hutch::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(hutch::internal))]
    Internal {
        /// The error message.
        message: String,
    },

    /// A lifecycle operation on a container failed.
    #[error("{operation} {id}: {source}")]
    #[diagnostic(code(hutch::operation))]
    Operation {
        /// The container ID.
        id: String,
        /// The attempted operation.
        operation: Operation,
        /// The underlying failure.
        #[source]
        source: Box<HutchError>,
    },
}

/// Lifecycle operations, used to annotate failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Creating a container.
    Create,
    /// Loading an existing container.
    Load,
    /// Running a process.
    Run,
    /// Delivering a signal.
    Signal,
    /// Freezing a container.
    Pause,
    /// Thawing a container.
    Resume,
    /// Updating resource limits.
    Set,
    /// Querying status or state.
    Status,
    /// Listing processes.
    Processes,
    /// Collecting statistics.
    Stats,
    /// Destroying a container.
    Destroy,
    /// Checkpointing a container.
    Checkpoint,
    /// Pre-dumping a container.
    PreDump,
    /// Restoring a container.
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Load => "load",
            Self::Run => "run",
            Self::Signal => "signal",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Set => "set",
            Self::Status => "status",
            Self::Processes => "processes",
            Self::Stats => "stats",
            Self::Destroy => "destroy",
            Self::Checkpoint => "checkpoint",
            Self::PreDump => "pre-dump",
            Self::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Error kinds, independent of the detail carried by each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`HutchError::InvalidConfig`].
    InvalidConfig,
    /// See [`HutchError::AlreadyExists`].
    AlreadyExists,
    /// See [`HutchError::NotFound`].
    NotFound,
    /// See [`HutchError::InvalidState`].
    InvalidState,
    /// See [`HutchError::Resource`].
    Resource,
    /// See [`HutchError::BootstrapFailed`].
    BootstrapFailed,
    /// See [`HutchError::CheckpointFailed`].
    CheckpointFailed,
    /// See [`HutchError::RestoreFailed`].
    RestoreFailed,
    /// See [`HutchError::Signal`].
    Signal,
    /// I/O, serialization and internal failures.
    System,
}

impl HutchError {
    /// Shorthand for [`HutchError::InvalidConfig`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`HutchError::Resource`].
    pub fn resource(resource: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Resource {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for [`HutchError::BootstrapFailed`].
    pub fn bootstrap(message: impl fmt::Display) -> Self {
        Self::BootstrapFailed {
            message: message.to_string(),
        }
    }

    /// Shorthand for [`HutchError::Internal`].
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }

    /// Attach the container ID and the attempted operation.
    ///
    /// Errors that already carry an operation are returned unchanged.
    #[must_use]
    pub fn in_operation(self, id: impl Into<String>, operation: Operation) -> Self {
        match self {
            Self::Operation { .. } => self,
            other => Self::Operation {
                id: id.into(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// The kind of the innermost failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } | Self::InvalidContainerId { .. } => {
                ErrorKind::InvalidConfig
            }
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::BootstrapFailed { .. } => ErrorKind::BootstrapFailed,
            Self::CheckpointFailed { .. } => ErrorKind::CheckpointFailed,
            Self::RestoreFailed { .. } => ErrorKind::RestoreFailed,
            Self::Signal { .. } => ErrorKind::Signal,
            Self::Io(_) | Self::Serialization(_) | Self::Internal { .. } => ErrorKind::System,
            Self::Operation { source, .. } => source.kind(),
        }
    }

    /// The operation this failure was reported by, if any.
    #[must_use]
    pub const fn operation(&self) -> Option<Operation> {
        match self {
            Self::Operation { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HutchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Extension for annotating results with the failing operation.
pub trait OperationContext<T> {
    /// Wrap the error, if any, with the container ID and operation.
    fn in_operation(self, id: &str, operation: Operation) -> HutchResult<T>;
}

impl<T> OperationContext<T> for HutchResult<T> {
    fn in_operation(self, id: &str, operation: Operation) -> HutchResult<T> {
        self.map_err(|e| e.in_operation(id, operation))
    }
}
