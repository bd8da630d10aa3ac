//! User namespace ID maps, written by the engine for the helper.

use std::fs;
use std::io;
use std::path::Path;

use hutch_common::{HutchError, HutchResult};
use hutch_config::IdMapping;

/// Deny `setgroups` and write the uid and gid maps of `pid`.
///
/// # Errors
///
/// Returns [`HutchError::BootstrapFailed`] if a map cannot be written.
pub fn write_id_maps(pid: u32, uid_mappings: &[IdMapping], gid_mappings: &[IdMapping]) -> HutchResult<()> {
    write_id_maps_at(&Path::new("/proc").join(pid.to_string()), uid_mappings, gid_mappings)?;
    tracing::debug!(pid, "ID mappings applied");
    Ok(())
}

fn write_id_maps_at(
    proc_dir: &Path,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> HutchResult<()> {
    // Kernels without /proc/<pid>/setgroups have no setgroups restriction.
    match fs::write(proc_dir.join("setgroups"), "deny") {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(map_error("setgroups", &e)),
    }

    fs::write(proc_dir.join("uid_map"), IdMapping::to_map_file(uid_mappings))
        .map_err(|e| map_error("uid_map", &e))?;
    fs::write(proc_dir.join("gid_map"), IdMapping::to_map_file(gid_mappings))
        .map_err(|e| map_error("gid_map", &e))
}

fn map_error(file: &str, err: &io::Error) -> HutchError {
    HutchError::bootstrap(format!("writing {file}: {err}"))
}
