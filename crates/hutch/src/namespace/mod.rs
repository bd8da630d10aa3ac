#![allow(unsafe_code)]
//! Linux namespace management.
//!
//! This module provides:
//! - `CLONE_*` flags and unshare flags for [`NamespaceType`]
//! - Joining a namespace by path (`setns`)
//! - Writing user namespace ID maps
//! - The engine side of the init handshake

pub(crate) mod bootstrap;
mod idmap;

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use hutch_common::{HutchError, HutchResult};
use hutch_config::NamespaceType;
use rustix::thread::UnshareFlags;

pub use idmap::write_id_maps;

/// `CLONE_*` flag of a namespace type.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn clone_flag(ns_type: NamespaceType) -> u32 {
    let flag = match ns_type {
        NamespaceType::Pid => libc::CLONE_NEWPID,
        NamespaceType::Network => libc::CLONE_NEWNET,
        NamespaceType::Mount => libc::CLONE_NEWNS,
        NamespaceType::Ipc => libc::CLONE_NEWIPC,
        NamespaceType::Uts => libc::CLONE_NEWUTS,
        NamespaceType::User => libc::CLONE_NEWUSER,
        NamespaceType::Cgroup => libc::CLONE_NEWCGROUP,
    };
    flag as u32
}

/// Convert namespace types to rustix unshare flags.
pub fn unshare_flags(types: impl IntoIterator<Item = NamespaceType>) -> UnshareFlags {
    types
        .into_iter()
        .fold(UnshareFlags::empty(), |flags, ns_type| {
            flags
                | match ns_type {
                    NamespaceType::Pid => UnshareFlags::NEWPID,
                    NamespaceType::Network => UnshareFlags::NEWNET,
                    NamespaceType::Mount => UnshareFlags::NEWNS,
                    NamespaceType::Ipc => UnshareFlags::NEWIPC,
                    NamespaceType::Uts => UnshareFlags::NEWUTS,
                    NamespaceType::User => UnshareFlags::NEWUSER,
                    NamespaceType::Cgroup => UnshareFlags::NEWCGROUP,
                }
        })
}

/// Path of a process's namespace under `/proc`.
#[must_use]
pub fn proc_path(pid: u32, ns_type: NamespaceType) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/{}", ns_type.proc_name()))
}

/// Create new namespaces for the calling process.
///
/// # Errors
///
/// Returns [`HutchError::Resource`] if the kernel refuses.
pub fn unshare(flags: UnshareFlags) -> HutchResult<()> {
    if flags.is_empty() {
        return Ok(());
    }

    // SAFETY: called from the single-threaded bootstrap helper before any
    // user code runs.
    unsafe {
        rustix::thread::unshare_unsafe(flags)
            .map_err(|e| HutchError::resource("namespaces", format!("unshare {flags:?}: {e}")))?;
    }

    tracing::debug!(?flags, "Unshared namespaces");
    Ok(())
}

/// Join the namespace at `path`.
///
/// # Errors
///
/// Returns [`HutchError::Resource`] if the path cannot be opened or `setns`
/// fails.
pub fn join(ns_type: NamespaceType, path: &Path) -> HutchResult<()> {
    let file = File::open(path).map_err(|e| {
        HutchError::resource("namespaces", format!("opening {}: {e}", path.display()))
    })?;

    #[allow(clippy::cast_possible_wrap)]
    let flag = clone_flag(ns_type) as libc::c_int;
    if unsafe { libc::setns(file.as_raw_fd(), flag) } != 0 {
        return Err(HutchError::resource(
            "namespaces",
            format!(
                "setns {ns_type} {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            ),
        ));
    }

    tracing::debug!(%ns_type, path = %path.display(), "Joined namespace");
    Ok(())
}

/// Check if a namespace type is available on this host.
#[must_use]
pub fn is_supported(ns_type: NamespaceType) -> bool {
    Path::new("/proc/self/ns").join(ns_type.proc_name()).exists()
}
