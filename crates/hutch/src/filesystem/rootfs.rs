//! Mount tree construction inside a fresh mount namespace.

use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};

use hutch_common::HutchResult;
use hutch_config::{ContainerConfig, Mount};
use rustix::mount::{MountFlags, MountPropagationFlags};

use super::mounts::{
    MountOptions, bind_mount, mount, remount, remount_readonly, set_propagation,
};
use super::pivot::pivot_root;

/// Resolve a container path below `rootfs`.
#[must_use]
pub fn resolve_in_rootfs(rootfs: &Path, path: &Path) -> PathBuf {
    let mut resolved = rootfs.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            resolved.push(part);
        }
    }
    resolved
}

/// Build the container's mount tree and pivot into it.
///
/// Runs in the bootstrap helper after the mount namespace was unshared.
///
/// # Errors
///
/// Returns an error naming the mount that failed.
pub fn setup_rootfs(config: &ContainerConfig, rootfs: &Path) -> HutchResult<()> {
    tracing::debug!(rootfs = %rootfs.display(), "Setting up root filesystem");

    // Nothing below may propagate back to the host.
    set_propagation(
        Path::new("/"),
        MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
    )?;
    bind_mount(rootfs, rootfs, true, MountFlags::empty())?;

    for entry in &config.mounts {
        mount_entry(rootfs, entry)?;
    }

    pivot_root(rootfs)?;

    for path in &config.readonly_paths {
        readonly_path(path)?;
    }
    for path in &config.masked_paths {
        mask_path(path)?;
    }

    if config.readonly_rootfs {
        remount_readonly(Path::new("/"))?;
    }

    Ok(())
}

fn mount_entry(rootfs: &Path, entry: &Mount) -> HutchResult<()> {
    let target = resolve_in_rootfs(rootfs, &entry.destination);
    let options = MountOptions::parse(&entry.options);
    let bind = options.is_bind() || entry.mount_type.as_deref() == Some("bind");

    match (&entry.source, bind) {
        _ if options.remount => {
            remount(&target, options.flags, &options.data)?;
        }
        (Some(source), true) => {
            create_mount_point(&target, source.is_dir())?;
            bind_mount(
                source,
                &target,
                options.is_recursive(),
                options.remount_flags(),
            )?;
        }
        _ => {
            create_mount_point(&target, true)?;
            let fstype = entry.mount_type.as_deref().unwrap_or("none");
            let source = entry
                .source
                .clone()
                .unwrap_or_else(|| PathBuf::from(fstype));
            mount(&source, &target, fstype, options.flags, &options.data)?;
        }
    }

    if !options.propagation.is_empty() {
        set_propagation(&target, options.propagation)?;
    }

    tracing::debug!(
        destination = %entry.destination.display(),
        mount_type = ?entry.mount_type,
        "Mounted"
    );
    Ok(())
}

fn create_mount_point(target: &Path, directory: bool) -> HutchResult<()> {
    if directory {
        fs::create_dir_all(target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(target)?;
    }
    Ok(())
}

/// Bind a path onto itself read-only. Missing paths are skipped.
fn readonly_path(path: &Path) -> HutchResult<()> {
    if !path.exists() {
        return Ok(());
    }
    remount_readonly(path)
}

/// Hide a path: directories get an empty read-only tmpfs, files `/dev/null`.
/// Missing paths are skipped.
fn mask_path(path: &Path) -> HutchResult<()> {
    let Ok(metadata) = fs::metadata(path) else {
        return Ok(());
    };

    if metadata.is_dir() {
        mount(Path::new("tmpfs"), path, "tmpfs", MountFlags::RDONLY, "")
    } else {
        bind_mount(Path::new("/dev/null"), path, false, MountFlags::empty())
    }
}
