//! Filesystem operations for containers.
//!
//! This module handles:
//! - Mount option parsing and mount syscalls
//! - Root filesystem construction
//! - pivot_root

mod mounts;
mod pivot;
mod rootfs;

pub use mounts::{
    MountOptions, bind_mount, mount, remount, remount_readonly, set_propagation, unmount_detach,
};
pub use pivot::pivot_root;
pub use rootfs::{resolve_in_rootfs, setup_rootfs};
