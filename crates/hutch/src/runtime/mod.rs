//! Container runtime core.
//!
//! [`Container`] drives the lifecycle; everything it knows about a container
//! lives in the [`state`] directory and is reconciled with the OS on access.

mod config;
mod container;
pub mod events;
pub mod procfs;
pub mod state;
pub mod stats;

pub use config::{DEFAULT_INIT_BINARY, RuntimeConfig};
pub use container::Container;
pub use events::{EventBus, RuntimeEvent};
pub use state::{ContainerLock, LockMode, StateStore};
pub use stats::{InterfaceStats, Stats};
