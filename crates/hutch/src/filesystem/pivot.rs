#![allow(unsafe_code)]
//! pivot_root implementation.

use std::path::Path;

use hutch_common::{HutchError, HutchResult};
use rustix::mount::MountPropagationFlags;

use super::mounts::{set_propagation, unmount_detach};

/// Make `new_root` the root of the mount namespace and detach the old root.
///
/// Uses `pivot_root(".", ".")`: the old root ends up stacked on top of the
/// new one and is lazily unmounted, so no `put_old` directory is needed.
///
/// # Errors
///
/// Returns an error if any of the steps fail.
pub fn pivot_root(new_root: &Path) -> HutchResult<()> {
    tracing::debug!(new_root = %new_root.display(), "Executing pivot_root");

    std::env::set_current_dir(new_root)?;

    let dot = c".";
    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) };
    if ret != 0 {
        return Err(HutchError::internal(format!(
            "pivot_root {}: {}",
            new_root.display(),
            std::io::Error::last_os_error()
        )));
    }

    // Unmount events of the old root must not reach the host.
    set_propagation(
        Path::new("."),
        MountPropagationFlags::DOWNSTREAM | MountPropagationFlags::REC,
    )?;
    unmount_detach(Path::new("."))?;
    std::env::set_current_dir("/")?;

    tracing::debug!("pivot_root successful");
    Ok(())
}
