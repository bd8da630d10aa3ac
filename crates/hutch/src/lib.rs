//! # Hutch Container Engine
//!
//! Hutch creates, runs, freezes, checkpoints and restores Linux containers.
//!
//! ## Features
//!
//! - **Namespace isolation**: user, pid, net, mount, uts, ipc and cgroup namespaces, created or joined
//! - **Cgroups**: v1 and v2 resource limits, freezing and accounting
//! - **Security**: capabilities, rlimits and `no_new_privs` applied before exec
//! - **Checkpoint/restore**: dump, pre-dump and restore through CRIU
//!
//! ## Usage
//!
//! ```no_run
//! use hutch::exec::Process;
//! use hutch::runtime::{Container, RuntimeConfig};
//! use hutch_config::ContainerConfig;
//!
//! # async fn example() -> hutch_common::HutchResult<()> {
//! let runtime = RuntimeConfig::default();
//!
//! // Create container; its init waits at the start barrier
//! let container = Container::create("my-container", ContainerConfig::default(), runtime).await?;
//!
//! // Release the init
//! let init = container.run(Process::init(["/bin/sh"])).await?;
//!
//! // Wait for exit
//! let status = init.wait().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod checkpoint;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod runtime;
pub mod security;

pub use runtime::Container;
