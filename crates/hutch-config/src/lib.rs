//! # hutch-config
//!
//! Declarative container configuration and persisted state for hutch.
//!
//! This crate provides Rust types for:
//! - Container configuration (namespaces, mounts, ID mappings, cgroup resources)
//! - Structural validation of that configuration
//! - The container state persisted in each container directory

#![warn(missing_docs)]

pub mod config;
pub mod state;

pub use config::{
    BlockIoResources, Capabilities, CgroupConfig, ContainerConfig, CpuResources, IdMapping,
    MemoryResources, Mount, Namespace, NamespaceType, PidsResources, Resources, Rlimit,
    ThrottleDevice, RLIMIT_NAMES,
};
pub use state::{ContainerState, ContainerStatus};
