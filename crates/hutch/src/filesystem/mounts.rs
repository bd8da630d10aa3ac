//! Mount operations.

use std::ffi::CString;
use std::path::Path;

use hutch_common::{HutchError, HutchResult};
use rustix::mount::{MountFlags, MountPropagationFlags, UnmountFlags};

/// Mount flags and filesystem data parsed from option strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Flags for the initial mount.
    pub flags: MountFlags,
    /// Propagation flags applied with a second `mount` call.
    pub propagation: MountPropagationFlags,
    /// `remount` was requested.
    pub remount: bool,
    /// Filesystem-specific options (`size=64m,mode=755`).
    pub data: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            flags: MountFlags::empty(),
            propagation: MountPropagationFlags::empty(),
            remount: false,
            data: String::new(),
        }
    }
}

impl MountOptions {
    /// Parse option strings (`ro`, `nosuid`, `rbind`, `size=64m`, ...).
    ///
    /// Unknown options are passed to the filesystem as data.
    #[must_use]
    pub fn parse(options: &[String]) -> Self {
        let mut parsed = Self::default();
        let mut data = Vec::new();

        for option in options {
            if option == "remount" {
                parsed.remount = true;
            } else if let Some((clear, flag)) = flag_option(option) {
                parsed.flags.set(flag, !clear);
            } else if let Some(flag) = propagation_option(option) {
                parsed.propagation |= flag;
            } else {
                data.push(option.as_str());
            }
        }

        parsed.data = data.join(",");
        parsed
    }

    /// Whether the mount is a bind mount.
    #[must_use]
    pub const fn is_bind(&self) -> bool {
        self.flags.contains(MountFlags::BIND)
    }

    /// Whether a bind mount includes submounts.
    #[must_use]
    pub const fn is_recursive(&self) -> bool {
        self.flags.contains(MountFlags::REC)
    }

    /// Flags that a bind mount only honours on a remount.
    #[must_use]
    pub fn remount_flags(&self) -> MountFlags {
        self.flags - (MountFlags::BIND | MountFlags::REC)
    }
}

/// `(clears, flag)` for a flag option.
fn flag_option(option: &str) -> Option<(bool, MountFlags)> {
    Some(match option {
        "defaults" => (false, MountFlags::empty()),
        "ro" => (false, MountFlags::RDONLY),
        "rw" => (true, MountFlags::RDONLY),
        "suid" => (true, MountFlags::NOSUID),
        "nosuid" => (false, MountFlags::NOSUID),
        "dev" => (true, MountFlags::NODEV),
        "nodev" => (false, MountFlags::NODEV),
        "exec" => (true, MountFlags::NOEXEC),
        "noexec" => (false, MountFlags::NOEXEC),
        "sync" => (false, MountFlags::SYNCHRONOUS),
        "async" => (true, MountFlags::SYNCHRONOUS),
        "dirsync" => (false, MountFlags::DIRSYNC),
        "mand" => (false, MountFlags::PERMIT_MANDATORY_FILE_LOCKING),
        "nomand" => (true, MountFlags::PERMIT_MANDATORY_FILE_LOCKING),
        "atime" => (true, MountFlags::NOATIME),
        "noatime" => (false, MountFlags::NOATIME),
        "diratime" => (true, MountFlags::NODIRATIME),
        "nodiratime" => (false, MountFlags::NODIRATIME),
        "relatime" => (false, MountFlags::RELATIME),
        "norelatime" => (true, MountFlags::RELATIME),
        "strictatime" => (false, MountFlags::STRICTATIME),
        "bind" => (false, MountFlags::BIND),
        "rbind" => (false, MountFlags::BIND | MountFlags::REC),
        _ => return None,
    })
}

fn propagation_option(option: &str) -> Option<MountPropagationFlags> {
    use MountPropagationFlags as P;

    Some(match option {
        "private" => P::PRIVATE,
        "rprivate" => P::PRIVATE | P::REC,
        "shared" => P::SHARED,
        "rshared" => P::SHARED | P::REC,
        "slave" => P::DOWNSTREAM,
        "rslave" => P::DOWNSTREAM | P::REC,
        "unbindable" => P::UNBINDABLE,
        "runbindable" => P::UNBINDABLE | P::REC,
        _ => return None,
    })
}

fn mount_error(target: &Path, err: rustix::io::Errno) -> HutchError {
    HutchError::internal(format!("mount {}: {err}", target.display()))
}

/// Mount a filesystem.
///
/// # Errors
///
/// Returns an error naming the target if the kernel refuses the mount.
pub fn mount(
    source: &Path,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> HutchResult<()> {
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        fstype,
        flags = ?flags,
        data,
        "Mounting filesystem"
    );

    let data = if data.is_empty() {
        None
    } else {
        Some(CString::new(data).map_err(|_| {
            HutchError::internal(format!("mount data contains NUL: {data}"))
        })?)
    };

    rustix::mount::mount(source, target, fstype, flags, data.as_deref())
        .map_err(|e| mount_error(target, e))
}

/// Remount `target` in place with new flags and data.
///
/// # Errors
///
/// Returns an error if the kernel refuses the remount.
pub fn remount(target: &Path, flags: MountFlags, data: &str) -> HutchResult<()> {
    rustix::mount::mount_remount(target, flags, data).map_err(|e| mount_error(target, e))
}

/// Change the propagation type of a mount.
///
/// # Errors
///
/// Returns an error if the kernel refuses the change.
pub fn set_propagation(target: &Path, propagation: MountPropagationFlags) -> HutchResult<()> {
    rustix::mount::mount_change(target, propagation).map_err(|e| mount_error(target, e))
}

/// Bind mount `source` onto `target`, applying `flags` with a remount.
///
/// # Errors
///
/// Returns an error if either mount call fails.
pub fn bind_mount(
    source: &Path,
    target: &Path,
    recursive: bool,
    flags: MountFlags,
) -> HutchResult<()> {
    if recursive {
        rustix::mount::mount_bind_recursive(source, target)
    } else {
        rustix::mount::mount_bind(source, target)
    }
    .map_err(|e| mount_error(target, e))?;

    if !flags.is_empty() {
        remount(target, MountFlags::BIND | flags, "")?;
    }
    Ok(())
}

/// Remount a path read-only in place.
///
/// # Errors
///
/// Returns an error if either mount call fails.
pub fn remount_readonly(target: &Path) -> HutchResult<()> {
    tracing::debug!(target = %target.display(), "Remounting read-only");
    bind_mount(target, target, true, MountFlags::RDONLY)
}

/// Detach a mount.
///
/// # Errors
///
/// Returns an error if `umount2` fails.
pub fn unmount_detach(target: &Path) -> HutchResult<()> {
    rustix::mount::unmount(target, UnmountFlags::DETACH)
        .map_err(|e| HutchError::internal(format!("umount {}: {e}", target.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parse_flags_and_data() {
        let parsed = MountOptions::parse(&options(&["nosuid", "noexec", "size=64m", "mode=755"]));
        assert_eq!(parsed.flags, MountFlags::NOSUID | MountFlags::NOEXEC);
        assert!(parsed.propagation.is_empty());
        assert_eq!(parsed.data, "size=64m,mode=755");
    }

    #[test]
    fn later_options_override_earlier() {
        let parsed = MountOptions::parse(&options(&["ro", "rw", "nodev", "dev"]));
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn rbind_with_readonly_remount() {
        let parsed = MountOptions::parse(&options(&["rbind", "ro", "rprivate"]));
        assert!(parsed.is_bind());
        assert!(parsed.is_recursive());
        assert_eq!(parsed.remount_flags(), MountFlags::RDONLY);
        assert_eq!(
            parsed.propagation,
            MountPropagationFlags::PRIVATE | MountPropagationFlags::REC
        );
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn remount_is_not_filesystem_data() {
        let parsed = MountOptions::parse(&options(&["remount", "ro"]));
        assert!(parsed.remount);
        assert_eq!(parsed.flags, MountFlags::RDONLY);
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn mount_without_privileges_fails_with_target() {
        if rustix::process::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let err = mount(
            Path::new("tmpfs"),
            dir.path(),
            "tmpfs",
            MountFlags::empty(),
            "",
        )
        .unwrap_err();
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }
}
