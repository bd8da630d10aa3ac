#![allow(unsafe_code)]
//! Process hardening applied by the bootstrap helper right before exec.
//!
//! Ordering matters: rlimits and the bounding set are handled while the
//! helper still has full privileges, capability sets after the credential
//! switch, `no_new_privs` last.

mod capabilities;
mod rlimits;

pub use capabilities::{apply_capabilities, drop_bounding, parse_capabilities};
pub use rlimits::{apply_rlimits, parse_resource};

use hutch_common::{HutchError, HutchResult};

/// Set the no_new_privs flag.
///
/// # Errors
///
/// Returns an error if `prctl` fails.
pub fn set_no_new_privs() -> HutchResult<()> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };

    if result != 0 {
        return Err(HutchError::internal(format!(
            "prctl(PR_SET_NO_NEW_PRIVS) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    tracing::debug!("no_new_privs flag set");
    Ok(())
}

/// Keep permitted capabilities across the switch to a non-root uid.
///
/// # Errors
///
/// Returns an error if `prctl` fails.
pub fn set_keep_caps() -> HutchResult<()> {
    let result = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };

    if result != 0 {
        return Err(HutchError::internal(format!(
            "prctl(PR_SET_KEEPCAPS) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
