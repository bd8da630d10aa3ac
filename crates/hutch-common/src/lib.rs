//! # hutch-common
//!
//! Shared utilities and types for the hutch container runtime.
//!
//! This crate provides:
//! - The error taxonomy reported by every lifecycle operation
//! - Container ID validation
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ErrorKind, HutchError, HutchResult, Operation, OperationContext};
pub use id::ContainerId;
pub use paths::HutchPaths;
