//! Runtime configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hutch_common::HutchPaths;

use super::events::EventBus;
use crate::cgroup::{CgroupDriver, CgroupFactory};
use crate::checkpoint::{CriuBinary, CriuService};

/// Binary re-executed as the bootstrap helper.
pub const DEFAULT_INIT_BINARY: &str = "/proc/self/exe";

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: HutchPaths,
    /// Whether to use rootless mode.
    pub rootless: bool,
    /// Bound on the init handshake and on the start barrier.
    pub timeout: Duration,
    /// Bound on acquiring a container lock.
    pub lock_timeout: Duration,
    /// Executable started as `<init_binary> init`.
    pub init_binary: PathBuf,
    /// Cgroup backend.
    pub cgroups: Arc<dyn CgroupFactory>,
    /// Checkpoint/restore service.
    pub criu: Arc<dyn CriuService>,
    /// Lifecycle event stream.
    pub events: EventBus,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: HutchPaths::new(),
            rootless: false,
            timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(10),
            init_binary: PathBuf::from(DEFAULT_INIT_BINARY),
            cgroups: Arc::new(CgroupDriver::Auto),
            criu: Arc::new(CriuBinary::default()),
            events: EventBus::new(),
        }
    }
}

impl RuntimeConfig {
    /// Create a rootless configuration.
    #[must_use]
    pub fn rootless() -> Self {
        Self {
            paths: HutchPaths::rootless(),
            rootless: true,
            ..Self::default()
        }
    }

    /// Set the state root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = HutchPaths::with_root(root);
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the lock acquisition timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the executable used as the bootstrap helper.
    #[must_use]
    pub fn with_init_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.init_binary = binary.into();
        self
    }

    /// Use the `criu` binary at `path`.
    #[must_use]
    pub fn with_criu_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.criu = Arc::new(CriuBinary::new(path));
        self
    }

    /// Use a custom checkpoint/restore service.
    #[must_use]
    pub fn with_criu(mut self, criu: Arc<dyn CriuService>) -> Self {
        self.criu = criu;
        self
    }

    /// Use a custom cgroup backend.
    #[must_use]
    pub fn with_cgroups(mut self, cgroups: Arc<dyn CgroupFactory>) -> Self {
        self.cgroups = cgroups;
        self
    }

    /// Use an existing event bus.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert!(!config.rootless);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.init_binary, PathBuf::from("/proc/self/exe"));
    }

    #[test]
    fn rootless_config() {
        let config = RuntimeConfig::rootless();
        assert!(config.rootless);
        assert!(config.paths.root.ends_with("hutch"));
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_timeout(Duration::from_secs(5))
            .with_lock_timeout(Duration::from_millis(200))
            .with_init_binary("/usr/local/bin/hutch")
            .with_criu_path("/opt/criu/sbin/criu");

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.lock_timeout, Duration::from_millis(200));
        assert_eq!(config.init_binary, PathBuf::from("/usr/local/bin/hutch"));
        assert!(format!("{:?}", config.criu).contains("/opt/criu/sbin/criu"));
    }
}
