//! Cgroup management.
//!
//! [`CgroupManager`] is the narrow interface the engine drives; `fs2` backs it
//! with the unified v2 hierarchy and `fs1` with the legacy per-controller
//! hierarchies. Backends are chosen through a [`CgroupFactory`] carried by
//! the runtime configuration.

pub mod fs1;
pub mod fs2;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hutch_common::{HutchError, HutchResult};
use hutch_config::{CgroupConfig, Resources};
use serde::Serialize;

pub use fs1::Fs1Manager;
pub use fs2::Fs2Manager;

/// Default cgroup mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Attempts and interval used when waiting on the freezer or on removal.
const RETRIES: u32 = 100;
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Operations the engine needs from a container cgroup.
pub trait CgroupManager: Send + Sync + fmt::Debug {
    /// Path persisted in the container state; [`CgroupFactory::load`] reopens
    /// the cgroup from it.
    fn path(&self) -> &Path;

    /// Move a process into the cgroup.
    fn apply(&self, pid: u32) -> HutchResult<()>;

    /// Write resource limits.
    fn set(&self, resources: &Resources) -> HutchResult<()>;

    /// Suspend every member, returning once the kernel reports frozen.
    fn freeze(&self) -> HutchResult<()>;

    /// Resume every member.
    fn thaw(&self) -> HutchResult<()>;

    /// Current freezer state.
    fn freezer_state(&self) -> HutchResult<FreezerState>;

    /// Pids of every member.
    fn pids(&self) -> HutchResult<Vec<u32>>;

    /// Accounting snapshot.
    fn stats(&self) -> HutchResult<CgroupStats>;

    /// Kill remaining members and remove the cgroup. Removing an absent
    /// cgroup succeeds.
    fn destroy(&self) -> HutchResult<()>;
}

/// Creates and reopens container cgroups.
pub trait CgroupFactory: Send + Sync + fmt::Debug {
    /// Create the cgroup for container `id`.
    fn create(&self, id: &str, config: &CgroupConfig) -> HutchResult<Arc<dyn CgroupManager>>;

    /// Reopen a cgroup from its persisted path.
    fn load(&self, path: &Path) -> HutchResult<Arc<dyn CgroupManager>>;
}

/// Freezer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    /// Members are schedulable.
    Thawed,
    /// Members are suspended.
    Frozen,
}

/// Cgroup version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// Cgroups v1 (legacy).
    V1,
    /// Cgroups v2 (unified).
    V2,
    /// Hybrid mode (v1 controllers plus an unused v2 mount).
    Hybrid,
}

impl CgroupVersion {
    /// Detect the cgroup version mounted at `root`.
    #[must_use]
    pub fn detect_at(root: &Path) -> Self {
        let unified = root.join("cgroup.controllers").exists();
        let legacy = root.join("cpu").exists() || root.join("freezer").exists();

        match (unified, legacy) {
            (true, false) => Self::V2,
            (true, true) => Self::Hybrid,
            _ => Self::V1,
        }
    }

    /// Detect the cgroup version of this host.
    #[must_use]
    pub fn detect() -> Self {
        Self::detect_at(Path::new(CGROUP_ROOT))
    }
}

/// Built-in cgroup backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CgroupDriver {
    /// Pick v2 on a unified host, v1 otherwise.
    #[default]
    Auto,
    /// Legacy per-controller hierarchies.
    V1,
    /// Unified hierarchy.
    V2,
}

impl CgroupDriver {
    fn resolve(self) -> Self {
        match self {
            Self::Auto => match CgroupVersion::detect() {
                CgroupVersion::V2 => Self::V2,
                CgroupVersion::V1 | CgroupVersion::Hybrid => Self::V1,
            },
            other => other,
        }
    }
}

impl CgroupFactory for CgroupDriver {
    fn create(&self, id: &str, config: &CgroupConfig) -> HutchResult<Arc<dyn CgroupManager>> {
        let relative = config.relative_path(id);
        let root = Path::new(CGROUP_ROOT);

        let manager: Arc<dyn CgroupManager> = match self.resolve() {
            Self::V1 => Arc::new(Fs1Manager::create(root, &relative)?),
            _ => Arc::new(Fs2Manager::create(root, &relative)?),
        };

        tracing::debug!(
            container_id = %id,
            path = %manager.path().display(),
            "Created cgroup"
        );

        Ok(manager)
    }

    fn load(&self, path: &Path) -> HutchResult<Arc<dyn CgroupManager>> {
        let root = Path::new(CGROUP_ROOT);

        Ok(match self.resolve() {
            Self::V1 => Arc::new(Fs1Manager::load(root, path)?),
            _ => Arc::new(Fs2Manager::load(path)),
        })
    }
}

/// Accounting snapshot of a cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CgroupStats {
    /// CPU usage.
    pub cpu: CpuStats,
    /// Memory usage.
    pub memory: MemoryStats,
    /// Process count.
    pub pids: PidsStats,
    /// Block I/O per device.
    pub io: Vec<IoDeviceStats>,
}

/// CPU statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    /// Total CPU usage in microseconds.
    pub usage_usec: u64,
    /// User CPU time in microseconds.
    pub user_usec: u64,
    /// System CPU time in microseconds.
    pub system_usec: u64,
    /// Enforcement periods elapsed.
    pub nr_periods: u64,
    /// Periods in which the group was throttled.
    pub nr_throttled: u64,
    /// Total throttled time in microseconds.
    pub throttled_usec: u64,
}

/// Memory statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Current usage in bytes.
    pub usage: u64,
    /// Hard limit in bytes (None if unlimited).
    pub limit: Option<u64>,
    /// Current swap usage in bytes.
    pub swap_usage: u64,
}

/// Process count statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PidsStats {
    /// Current number of tasks.
    pub current: u64,
    /// Task limit (None if unlimited).
    pub limit: Option<u64>,
}

/// Block I/O counters of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoDeviceStats {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Bytes read.
    pub read_bytes: u64,
    /// Bytes written.
    pub write_bytes: u64,
    /// Read operations.
    pub read_ios: u64,
    /// Write operations.
    pub write_ios: u64,
}

/// Write a cgroup control file.
pub(crate) fn write_file(dir: &Path, file: &str, value: impl AsRef<[u8]>) -> HutchResult<()> {
    let path = dir.join(file);
    std::fs::write(&path, value).map_err(|e| {
        HutchError::resource("cgroup", format!("writing {}: {e}", path.display()))
    })
}

/// Read a cgroup control file, trimmed.
pub(crate) fn read_file(dir: &Path, file: &str) -> HutchResult<String> {
    let path = dir.join(file);
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| HutchError::resource("cgroup", format!("reading {}: {e}", path.display())))
}

/// Read a single integer; absent files read as zero.
pub(crate) fn read_u64(dir: &Path, file: &str) -> u64 {
    std::fs::read_to_string(dir.join(file))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Parse a limit file where `max` means unlimited.
pub(crate) fn parse_limit(content: &str) -> Option<u64> {
    match content.trim() {
        "max" | "" => None,
        value => value.parse().ok(),
    }
}

/// Parse `cgroup.procs` content.
pub(crate) fn parse_pids(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Parse a flat keyed file (`key value` per line), e.g. `cpu.stat`.
pub(crate) fn parse_flat_keyed(content: &str) -> Vec<(&str, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key, value))
        })
        .collect()
}

/// Create a directory, accepting one that already exists.
pub(crate) fn create_dir(path: &Path) -> HutchResult<()> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(HutchError::resource(
            "cgroup",
            format!("creating {}: {e}", path.display()),
        )),
    }
}

/// Remove a cgroup directory, retrying while members finish exiting.
pub(crate) fn remove_dir(path: &Path) -> HutchResult<()> {
    let mut attempt = 0;
    loop {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < RETRIES => {
                tracing::trace!(path = %path.display(), error = %e, "Cgroup busy, retrying removal");
                attempt += 1;
                std::thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(HutchError::resource(
                    "cgroup",
                    format!("removing {}: {e}", path.display()),
                ));
            }
        }
    }
}

/// Poll `check` until it holds.
pub(crate) fn wait_until(
    what: &str,
    mut check: impl FnMut() -> HutchResult<bool>,
) -> HutchResult<()> {
    for _ in 0..RETRIES {
        if check()? {
            return Ok(());
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
    Err(HutchError::resource(
        "cgroup",
        format!("timed out waiting for {what}"),
    ))
}

/// Relative path of `path` below `root`, rejecting paths outside it.
pub(crate) fn strip_root(root: &Path, path: &Path) -> HutchResult<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| {
            HutchError::resource(
                "cgroup",
                format!("{} is not below {}", path.display(), root.display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detect_unified_hierarchy() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory").unwrap();
        assert_eq!(CgroupVersion::detect_at(root.path()), CgroupVersion::V2);

        std::fs::create_dir(root.path().join("freezer")).unwrap();
        assert_eq!(CgroupVersion::detect_at(root.path()), CgroupVersion::Hybrid);
    }

    #[test]
    fn detect_legacy_hierarchy() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("cpu")).unwrap();
        assert_eq!(CgroupVersion::detect_at(root.path()), CgroupVersion::V1);
    }

    #[test]
    fn limit_parsing() {
        assert_eq!(parse_limit("max\n"), None);
        assert_eq!(parse_limit("1048576\n"), Some(1_048_576));
    }

    #[test]
    fn flat_keyed_parsing() {
        let content = "usage_usec 100\nuser_usec 60\nsystem_usec 40\nbogus\n";
        assert_eq!(
            parse_flat_keyed(content),
            vec![("usage_usec", 100), ("user_usec", 60), ("system_usec", 40)]
        );
    }

    #[test]
    fn procs_parsing() {
        assert_eq!(parse_pids("12\n34\n\n"), vec![12, 34]);
    }

    #[test]
    fn remove_missing_dir_is_ok() {
        let root = tempdir().unwrap();
        remove_dir(&root.path().join("gone")).unwrap();
    }

    #[test]
    fn strip_root_rejects_foreign_path() {
        let err = strip_root(Path::new("/sys/fs/cgroup"), Path::new("/tmp/x")).unwrap_err();
        assert_eq!(err.kind(), hutch_common::ErrorKind::Resource);
        assert_eq!(
            strip_root(Path::new("/sys/fs/cgroup"), Path::new("/sys/fs/cgroup/hutch/c1"))
                .unwrap(),
            PathBuf::from("hutch/c1")
        );
    }
}
