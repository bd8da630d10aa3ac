//! Checkpoint/restore through CRIU.
//!
//! [`CriuOptions`] is the per-call value object; [`CriuRequest`] adds what the
//! engine derives from the container (pid, rootfs, bind mounts, cgroup).
//! [`CriuService`] runs a request; [`CriuBinary`] drives the `criu` command.

mod criu;

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use hutch_common::{HutchError, HutchResult};
use hutch_config::NamespaceType;
use serde::{Deserialize, Serialize};

pub use criu::CriuBinary;

/// Options of one checkpoint or restore call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CriuOptions {
    /// Where images are written to or read from.
    pub images_directory: PathBuf,
    /// Logs and temporary files (default: the images directory).
    pub work_directory: Option<PathBuf>,
    /// Images of a previous pre-dump, relative to the images directory or
    /// absolute.
    pub parent_image: Option<PathBuf>,
    /// Keep the container running after the dump.
    pub leave_running: bool,
    /// Checkpoint established TCP connections.
    pub tcp_established: bool,
    /// Skip in-flight TCP connections.
    pub tcp_skip_in_flight: bool,
    /// Handle linked-but-deleted files.
    pub link_remap: bool,
    /// Allow external unix socket connections.
    pub external_unix_connections: bool,
    /// The container is attached to a shell job.
    pub shell_job: bool,
    /// Checkpoint file locks.
    pub file_locks: bool,
    /// Run `pre-dump` instead of `dump`.
    pub pre_dump: bool,
    /// Stream pages to a remote page server.
    pub page_server: Option<PageServer>,
    /// Veth pairs to reconnect on restore.
    pub veth_pairs: Vec<VethPair>,
    /// Namespaces (`CLONE_*` bits) CRIU should leave empty.
    pub empty_ns: u32,
    /// Deduplicate pages against the parent image.
    pub auto_dedup: bool,
    /// Restore memory on demand.
    pub lazy_pages: bool,
    /// Descriptor CRIU reports lazy-pages readiness on.
    pub status_fd: Option<RawFd>,
    /// LSM profile applied to restored tasks.
    pub lsm_profile: Option<String>,
    /// LSM mount context for restored mounts.
    pub lsm_mount_context: Option<String>,
    /// How CRIU treats cgroups.
    pub manage_cgroups_mode: ManageCgroupsMode,
}

impl CriuOptions {
    /// Options writing to or reading from `images_directory`.
    #[must_use]
    pub fn new(images_directory: impl Into<PathBuf>) -> Self {
        Self {
            images_directory: images_directory.into(),
            ..Self::default()
        }
    }

    /// Directory holding CRIU's log files.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        self.work_directory
            .as_deref()
            .unwrap_or(&self.images_directory)
    }

    /// Structural validation.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidConfig`] for an empty images directory, a
    /// half-specified page server, or a status descriptor without lazy pages.
    pub fn validate(&self) -> HutchResult<()> {
        if self.images_directory.as_os_str().is_empty() {
            return Err(HutchError::invalid_config("images directory is required"));
        }
        if let Some(server) = &self.page_server {
            if server.address.is_empty() || server.port == 0 {
                return Err(HutchError::invalid_config(
                    "page server needs both an address and a port",
                ));
            }
        }
        let unknown = self.empty_ns & !known_namespace_bits();
        if unknown != 0 {
            return Err(HutchError::invalid_config(format!(
                "empty namespace mask has unknown bits {unknown:#x}"
            )));
        }
        if self.status_fd.is_some() && !self.lazy_pages {
            return Err(HutchError::invalid_config(
                "status fd is only meaningful with lazy pages",
            ));
        }
        Ok(())
    }
}

/// Remote page server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageServer {
    /// Host or address.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

/// A veth pair reconnected on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VethPair {
    /// Interface name inside the container.
    pub container_interface: String,
    /// Interface name on the host.
    pub host_interface: String,
}

/// CRIU cgroup handling, forwarded verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManageCgroupsMode {
    /// CRIU's own default; no flag emitted.
    #[default]
    Default,
    /// `--manage-cgroups-mode soft`.
    Soft,
    /// `--manage-cgroups-mode full`.
    Full,
    /// `--manage-cgroups-mode strict`.
    Strict,
    /// `--manage-cgroups-mode ignore`.
    Ignore,
}

impl ManageCgroupsMode {
    /// Flag value, `None` for [`ManageCgroupsMode::Default`].
    #[must_use]
    pub const fn as_flag(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Soft => Some("soft"),
            Self::Full => Some("full"),
            Self::Strict => Some("strict"),
            Self::Ignore => Some("ignore"),
        }
    }
}

/// CRIU action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriuAction {
    /// Final dump.
    Dump,
    /// Iterative memory pre-dump.
    PreDump,
    /// Restore from images.
    Restore,
}

impl CriuAction {
    /// CRIU subcommand name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dump => "dump",
            Self::PreDump => "pre-dump",
            Self::Restore => "restore",
        }
    }

    /// The error reported when this action fails.
    #[must_use]
    pub fn failure(&self, diagnostic: impl Into<String>) -> HutchError {
        let diagnostic = diagnostic.into();
        match self {
            Self::Dump | Self::PreDump => HutchError::CheckpointFailed { diagnostic },
            Self::Restore => HutchError::RestoreFailed { diagnostic },
        }
    }
}

impl fmt::Display for CriuAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved CRIU invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriuRequest {
    /// What to do.
    pub action: CriuAction,
    /// Root of the process tree to dump.
    pub pid: Option<u32>,
    /// Container root filesystem.
    pub rootfs: Option<PathBuf>,
    /// Cgroup the restored tree is placed in, relative to the hierarchy root.
    pub cgroup_root: Option<String>,
    /// Bind mounts as (container destination, host source).
    pub external_mounts: Vec<(PathBuf, PathBuf)>,
    /// File CRIU writes the restored init pid to.
    pub pidfile: Option<PathBuf>,
    /// Caller options.
    pub options: CriuOptions,
}

impl CriuRequest {
    /// Dump or pre-dump of the tree rooted at `pid`.
    #[must_use]
    pub fn checkpoint(pid: u32, options: CriuOptions) -> Self {
        Self {
            action: if options.pre_dump {
                CriuAction::PreDump
            } else {
                CriuAction::Dump
            },
            pid: Some(pid),
            rootfs: None,
            cgroup_root: None,
            external_mounts: Vec::new(),
            pidfile: None,
            options,
        }
    }

    /// Restore writing the new init pid to `pidfile`.
    #[must_use]
    pub fn restore(pidfile: impl Into<PathBuf>, options: CriuOptions) -> Self {
        Self {
            action: CriuAction::Restore,
            pid: None,
            rootfs: None,
            cgroup_root: None,
            external_mounts: Vec::new(),
            pidfile: Some(pidfile.into()),
            options,
        }
    }
}

/// Result of a successful CRIU run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriuOutcome {
    /// Host pid of the restored init (restore only).
    pub pid: Option<u32>,
}

/// Runs checkpoint/restore requests. Calls block for CRIU's duration.
pub trait CriuService: Send + Sync + fmt::Debug {
    /// Final dump. Fails with [`HutchError::CheckpointFailed`].
    fn dump(&self, request: &CriuRequest) -> HutchResult<CriuOutcome>;

    /// Iterative pre-dump. Fails with [`HutchError::CheckpointFailed`].
    fn pre_dump(&self, request: &CriuRequest) -> HutchResult<CriuOutcome>;

    /// Restore; the outcome carries the new init pid. Fails with
    /// [`HutchError::RestoreFailed`].
    fn restore(&self, request: &CriuRequest) -> HutchResult<CriuOutcome>;
}

/// Dispatch a request to the matching service method.
pub(crate) fn run(service: &dyn CriuService, request: &CriuRequest) -> HutchResult<CriuOutcome> {
    match request.action {
        CriuAction::Dump => service.dump(request),
        CriuAction::PreDump => service.pre_dump(request),
        CriuAction::Restore => service.restore(request),
    }
}

/// Check this host can restore into `namespaces` from `images`.
///
/// # Errors
///
/// Returns [`HutchError::RestoreFailed`] naming the first missing piece.
pub fn check_host_compatibility(
    namespaces: impl IntoIterator<Item = NamespaceType>,
    images: &Path,
) -> HutchResult<()> {
    check_host_compatibility_at(Path::new("/proc/self/ns"), namespaces, images)
}

fn check_host_compatibility_at(
    ns_dir: &Path,
    namespaces: impl IntoIterator<Item = NamespaceType>,
    images: &Path,
) -> HutchResult<()> {
    for ns_type in namespaces {
        if !ns_dir.join(ns_type.proc_name()).exists() {
            return Err(HutchError::RestoreFailed {
                diagnostic: format!("host kernel does not support {ns_type} namespaces"),
            });
        }
    }

    if !images.is_dir() {
        return Err(HutchError::RestoreFailed {
            diagnostic: format!("images directory {} does not exist", images.display()),
        });
    }

    Ok(())
}

fn known_namespace_bits() -> u32 {
    NamespaceType::ALL
        .into_iter()
        .fold(0, |mask, ns| mask | crate::namespace::clone_flag(ns))
}

/// CRIU `--empty-ns` names of the set `CLONE_*` bits.
#[must_use]
pub fn empty_ns_names(mask: u32) -> Vec<&'static str> {
    NamespaceType::ALL
        .into_iter()
        .filter(|ns| mask & crate::namespace::clone_flag(*ns) != 0)
        .map(|ns| ns.proc_name())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hutch_common::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn work_dir_defaults_to_images() {
        let mut options = CriuOptions::new("/images");
        assert_eq!(options.work_dir(), Path::new("/images"));
        options.work_directory = Some(PathBuf::from("/work"));
        assert_eq!(options.work_dir(), Path::new("/work"));
    }

    #[test]
    fn page_server_needs_address_and_port() {
        let mut options = CriuOptions::new("/images");
        options.page_server = Some(PageServer {
            address: "10.0.0.2".to_string(),
            port: 0,
        });
        assert_eq!(options.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        options.page_server = Some(PageServer {
            address: String::new(),
            port: 27,
        });
        assert_eq!(options.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        options.page_server = Some(PageServer {
            address: "10.0.0.2".to_string(),
            port: 27,
        });
        options.validate().unwrap();
    }

    #[test]
    fn status_fd_requires_lazy_pages() {
        let mut options = CriuOptions::new("/images");
        options.status_fd = Some(5);
        assert_eq!(options.validate().unwrap_err().kind(), ErrorKind::InvalidConfig);

        options.lazy_pages = true;
        options.validate().unwrap();
    }

    #[test]
    fn empty_images_directory_is_rejected() {
        assert!(CriuOptions::default().validate().is_err());
    }

    #[test]
    fn failures_map_by_action() {
        assert_eq!(CriuAction::Dump.failure("x").kind(), ErrorKind::CheckpointFailed);
        assert_eq!(CriuAction::PreDump.failure("x").kind(), ErrorKind::CheckpointFailed);
        assert_eq!(CriuAction::Restore.failure("x").kind(), ErrorKind::RestoreFailed);
    }

    #[test]
    fn pre_dump_option_selects_action() {
        let mut options = CriuOptions::new("/images");
        assert_eq!(CriuRequest::checkpoint(1, options.clone()).action, CriuAction::Dump);
        options.pre_dump = true;
        assert_eq!(CriuRequest::checkpoint(1, options).action, CriuAction::PreDump);
    }

    #[test]
    fn manage_cgroups_mode_flags() {
        assert_eq!(ManageCgroupsMode::Default.as_flag(), None);
        assert_eq!(ManageCgroupsMode::Strict.as_flag(), Some("strict"));
    }

    #[test]
    fn empty_ns_bits() {
        let mask = u32::try_from(libc::CLONE_NEWNET | libc::CLONE_NEWIPC).unwrap();
        assert_eq!(empty_ns_names(mask), vec!["ipc", "net"]);
    }

    #[test]
    fn unknown_empty_ns_bits_are_rejected() {
        let mut options = CriuOptions::new("/images");
        options.empty_ns = u32::try_from(libc::CLONE_NEWNET).unwrap();
        options.validate().unwrap();

        options.empty_ns |= u32::try_from(libc::CLONE_VM).unwrap();
        let err = options.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("unknown bits"));
    }

    #[test]
    fn compatibility_requires_namespaces_and_images() {
        let ns_dir = tempdir().unwrap();
        std::fs::write(ns_dir.path().join("net"), "").unwrap();
        let images = tempdir().unwrap();

        check_host_compatibility_at(ns_dir.path(), [NamespaceType::Network], images.path())
            .unwrap();

        let err = check_host_compatibility_at(ns_dir.path(), [NamespaceType::Pid], images.path())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestoreFailed);

        let err = check_host_compatibility_at(
            ns_dir.path(),
            [],
            &images.path().join("missing"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestoreFailed);
    }
}
