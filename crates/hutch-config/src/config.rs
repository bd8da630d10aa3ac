//! Container configuration.
//!
//! A [`ContainerConfig`] is an immutable snapshot handed to `create`. Only the
//! cgroup resource subset may change afterwards, through `set`.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use hutch_common::{HutchError, HutchResult};
use serde::{Deserialize, Serialize};

/// Resource limit names accepted in [`Rlimit::limit_type`].
pub const RLIMIT_NAMES: &[&str] = &[
    "RLIMIT_AS",
    "RLIMIT_CORE",
    "RLIMIT_CPU",
    "RLIMIT_DATA",
    "RLIMIT_FSIZE",
    "RLIMIT_LOCKS",
    "RLIMIT_MEMLOCK",
    "RLIMIT_MSGQUEUE",
    "RLIMIT_NICE",
    "RLIMIT_NOFILE",
    "RLIMIT_NPROC",
    "RLIMIT_RSS",
    "RLIMIT_RTPRIO",
    "RLIMIT_RTTIME",
    "RLIMIT_SIGPENDING",
    "RLIMIT_STACK",
];

/// Declarative description of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Root filesystem. Only used when a mount namespace is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,

    /// Remount the root filesystem read-only after pivot_root.
    #[serde(default)]
    pub readonly_rootfs: bool,

    /// Hostname. Requires a UTS namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Namespaces to create or join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,

    /// UID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,

    /// GID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,

    /// Additional mounts, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Paths hidden from the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<PathBuf>,

    /// Paths remounted read-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<PathBuf>,

    /// Capability sets for processes started in the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,

    /// Resource limits (rlimits).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,

    /// Set `PR_SET_NO_NEW_PRIVS` before exec.
    #[serde(default)]
    pub no_new_privileges: bool,

    /// Cgroup placement and limits.
    #[serde(default)]
    pub cgroup: CgroupConfig,
}

impl ContainerConfig {
    /// Look up a namespace entry by type.
    #[must_use]
    pub fn namespace(&self, ns_type: NamespaceType) -> Option<&Namespace> {
        self.namespaces.iter().find(|ns| ns.ns_type == ns_type)
    }

    /// Whether the namespace type is requested (created or joined).
    #[must_use]
    pub fn has_namespace(&self, ns_type: NamespaceType) -> bool {
        self.namespace(ns_type).is_some()
    }

    /// Whether a fresh namespace of this type is created.
    #[must_use]
    pub fn creates_namespace(&self, ns_type: NamespaceType) -> bool {
        self.namespace(ns_type).is_some_and(|ns| ns.path.is_none())
    }

    /// Check the configuration for structural errors.
    ///
    /// No OS state is consulted; paths are not required to exist.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> HutchResult<()> {
        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            if !seen.insert(ns.ns_type) {
                return Err(HutchError::invalid_config(format!(
                    "namespace {} listed more than once",
                    ns.ns_type
                )));
            }
            if let Some(path) = &ns.path {
                require_absolute("namespace path", path)?;
            }
        }

        if let Some(rootfs) = &self.rootfs {
            require_absolute("rootfs", rootfs)?;
        }

        if let Some(hostname) = &self.hostname {
            if !self.has_namespace(NamespaceType::Uts) {
                return Err(HutchError::invalid_config(
                    "hostname requires a UTS namespace",
                ));
            }
            if hostname.is_empty() || hostname.len() > 64 {
                return Err(HutchError::invalid_config(
                    "hostname must be 1-64 characters",
                ));
            }
        }

        self.validate_user_namespace()?;
        self.validate_mounts()?;

        for rlimit in &self.rlimits {
            if !RLIMIT_NAMES.contains(&rlimit.limit_type.as_str()) {
                return Err(HutchError::invalid_config(format!(
                    "unknown rlimit {}",
                    rlimit.limit_type
                )));
            }
            if rlimit.soft > rlimit.hard {
                return Err(HutchError::invalid_config(format!(
                    "{} soft limit exceeds hard limit",
                    rlimit.limit_type
                )));
            }
        }

        if let Some(caps) = &self.capabilities {
            caps.validate()?;
        }

        self.cgroup.validate()
    }

    fn validate_user_namespace(&self) -> HutchResult<()> {
        let has_mappings = !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty();
        if has_mappings && !self.has_namespace(NamespaceType::User) {
            return Err(HutchError::invalid_config(
                "ID mappings require a user namespace",
            ));
        }
        if self.creates_namespace(NamespaceType::User)
            && (self.uid_mappings.is_empty() || self.gid_mappings.is_empty())
        {
            return Err(HutchError::invalid_config(
                "a new user namespace needs both uid and gid mappings",
            ));
        }
        if self
            .uid_mappings
            .iter()
            .chain(&self.gid_mappings)
            .any(|m| m.size == 0)
        {
            return Err(HutchError::invalid_config("ID mapping with zero size"));
        }
        Ok(())
    }

    fn validate_mounts(&self) -> HutchResult<()> {
        let needs_mount_ns = !self.mounts.is_empty()
            || !self.masked_paths.is_empty()
            || !self.readonly_paths.is_empty()
            || self.readonly_rootfs;
        if needs_mount_ns && !self.creates_namespace(NamespaceType::Mount) {
            return Err(HutchError::invalid_config(
                "mounts and path masking require a new mount namespace",
            ));
        }
        if needs_mount_ns && self.rootfs.is_none() {
            return Err(HutchError::invalid_config(
                "mounts and path masking require a rootfs",
            ));
        }

        for mount in &self.mounts {
            require_absolute("mount destination", &mount.destination)?;
            if mount.is_bind() && mount.source.is_none() {
                return Err(HutchError::invalid_config(format!(
                    "bind mount {} has no source",
                    mount.destination.display()
                )));
            }
        }
        for path in self.masked_paths.iter().chain(&self.readonly_paths) {
            require_absolute("masked/readonly path", path)?;
        }
        Ok(())
    }

    /// Check that `other` differs from `self` only in `cgroup.resources`.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidConfig`] if anything else changed.
    pub fn ensure_only_resources_differ(&self, other: &Self) -> HutchResult<()> {
        let mut lhs = self.clone();
        let mut rhs = other.clone();
        lhs.cgroup.resources = Resources::default();
        rhs.cgroup.resources = Resources::default();
        if lhs == rhs {
            Ok(())
        } else {
            Err(HutchError::invalid_config(
                "only cgroup resources can be changed on an existing container",
            ))
        }
    }
}

fn require_absolute(what: &str, path: &Path) -> HutchResult<()> {
    if !path.is_absolute() {
        return Err(HutchError::invalid_config(format!(
            "{what} must be absolute: {}",
            path.display()
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(HutchError::invalid_config(format!(
            "{what} must not contain '..': {}",
            path.display()
        )));
    }
    Ok(())
}

/// Namespace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to existing namespace (to join instead of create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// A namespace that will be created.
    #[must_use]
    pub const fn new(ns_type: NamespaceType) -> Self {
        Self {
            ns_type,
            path: None,
        }
    }

    /// A namespace that will be joined.
    #[must_use]
    pub fn join(ns_type: NamespaceType, path: impl Into<PathBuf>) -> Self {
        Self {
            ns_type,
            path: Some(path.into()),
        }
    }
}

/// Namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

impl NamespaceType {
    /// All namespace types, in join order (user first).
    pub const ALL: [Self; 7] = [
        Self::User,
        Self::Ipc,
        Self::Uts,
        Self::Network,
        Self::Pid,
        Self::Mount,
        Self::Cgroup,
    ];

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(&self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Mount => "mnt",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

impl std::fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// ID mapping for user/group namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    /// Container ID (start of range).
    pub container_id: u32,
    /// Host ID (start of range).
    pub host_id: u32,
    /// Size of the range.
    pub size: u32,
}

impl IdMapping {
    /// Render a list of mappings in `/proc/<pid>/uid_map` format.
    #[must_use]
    pub fn to_map_file(mappings: &[Self]) -> String {
        mappings
            .iter()
            .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
            .collect()
    }
}

/// Mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination path (inside container).
    pub destination: PathBuf,
    /// Mount type (e.g., "bind", "tmpfs", "proc").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Mount source path (outside container).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Mount options (e.g., "ro", "nosuid", "rbind", "size=64m").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// Whether this is a bind mount.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.mount_type.as_deref() == Some("bind")
            || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }
}

/// Linux capabilities, by name (`CAP_NET_ADMIN`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bounding capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding: Vec<String>,
    /// Effective capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective: Vec<String>,
    /// Inheritable capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    /// Permitted capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permitted: Vec<String>,
    /// Ambient capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambient: Vec<String>,
}

impl Capabilities {
    fn validate(&self) -> HutchResult<()> {
        let all = self
            .bounding
            .iter()
            .chain(&self.effective)
            .chain(&self.inheritable)
            .chain(&self.permitted)
            .chain(&self.ambient);
        for name in all {
            let valid = name
                .strip_prefix("CAP_")
                .is_some_and(|rest| {
                    !rest.is_empty()
                        && rest.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit())
                });
            if !valid {
                return Err(HutchError::invalid_config(format!(
                    "malformed capability name: {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Resource limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit type (e.g., RLIMIT_NOFILE).
    #[serde(rename = "type")]
    pub limit_type: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// Cgroup placement and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Parent directory relative to the cgroup mount (default: `hutch`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Leaf name (default: the container ID).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource limits, the only part `set` may change.
    #[serde(default)]
    pub resources: Resources,
}

impl CgroupConfig {
    /// Default parent directory under the cgroup mount.
    pub const DEFAULT_PARENT: &'static str = "hutch";

    /// Relative cgroup path for a container.
    #[must_use]
    pub fn relative_path(&self, id: &str) -> PathBuf {
        let parent = self.parent.as_deref().unwrap_or(Self::DEFAULT_PARENT);
        Path::new(parent).join(self.name.as_deref().unwrap_or(id))
    }

    fn validate(&self) -> HutchResult<()> {
        if let Some(parent) = &self.parent {
            let path = Path::new(parent);
            if path.is_absolute() || path.components().any(|c| !matches!(c, Component::Normal(_))) {
                return Err(HutchError::invalid_config(format!(
                    "cgroup parent must be a relative path without '..': {parent}"
                )));
            }
        }
        if let Some(name) = &self.name {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(HutchError::invalid_config(format!(
                    "cgroup name must be a single path component: {name}"
                )));
            }
        }
        self.resources.validate()
    }
}

/// Resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// CPU resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Memory resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    /// PIDs limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsResources>,
    /// Block I/O resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_io: Option<BlockIoResources>,
}

impl Resources {
    fn validate(&self) -> HutchResult<()> {
        if let Some(cpu) = &self.cpu {
            if cpu.quota.is_some_and(|q| q == 0 || q < -1) {
                return Err(HutchError::invalid_config(
                    "cpu quota must be positive or -1",
                ));
            }
            if cpu.period == Some(0) {
                return Err(HutchError::invalid_config("cpu period must be positive"));
            }
        }
        if let Some(memory) = &self.memory {
            for (name, value) in [
                ("limit", memory.limit),
                ("reservation", memory.reservation),
                ("swap", memory.swap),
            ] {
                if value.is_some_and(|v| v == 0 || v < -1) {
                    return Err(HutchError::invalid_config(format!(
                        "memory {name} must be positive or -1"
                    )));
                }
            }
        }
        if let Some(pids) = &self.pids {
            if pids.limit == 0 || pids.limit < -1 {
                return Err(HutchError::invalid_config(
                    "pids limit must be positive or -1",
                ));
            }
        }
        if let Some(weight) = self.block_io.as_ref().and_then(|b| b.weight) {
            if !(10..=1000).contains(&weight) {
                return Err(HutchError::invalid_config(
                    "block I/O weight must be within 10-1000",
                ));
            }
        }
        Ok(())
    }
}

/// CPU resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuResources {
    /// CPU shares (relative weight).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// CPU quota (in microseconds, -1 for unlimited).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// CPU period (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// CPUs to use (e.g., "0-2,4").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    /// Memory nodes to use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mems: Option<String>,
}

/// Memory resource limits, in bytes (-1 for unlimited).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryResources {
    /// Hard memory limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Memory reservation (soft limit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    /// Memory + swap limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
}

/// PIDs resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsResources {
    /// Maximum number of PIDs (-1 for unlimited).
    pub limit: i64,
}

/// Block I/O resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockIoResources {
    /// Block I/O weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u16>,
    /// Throttle read BPS.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throttle_read_bps_device: Vec<ThrottleDevice>,
    /// Throttle write BPS.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throttle_write_bps_device: Vec<ThrottleDevice>,
    /// Throttle read IOPS.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throttle_read_iops_device: Vec<ThrottleDevice>,
    /// Throttle write IOPS.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throttle_write_iops_device: Vec<ThrottleDevice>,
}

/// Block I/O throttle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleDevice {
    /// Major device number.
    pub major: i64,
    /// Minor device number.
    pub minor: i64,
    /// Rate limit.
    pub rate: u64,
}
