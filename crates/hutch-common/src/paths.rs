//! Standard filesystem paths for hutch.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default state root for container directories.
pub static HUTCH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HUTCH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/hutch"))
});

/// Name of the persisted state file inside a container directory.
pub const STATE_FILE: &str = "state.json";
/// Name of the per-container lock file.
pub const LOCK_FILE: &str = "lock";
/// Name of the start barrier FIFO.
pub const EXEC_FIFO: &str = "exec.fifo";
/// Name of the bootstrap helper log.
pub const INIT_LOG: &str = "init.log";

/// Standard paths used by the hutch runtime.
///
/// Each container owns `<root>/<id>`; nothing else lives directly under the
/// root, so listing the root lists the containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HutchPaths {
    /// State root (default: /run/hutch).
    pub root: PathBuf,
}

impl HutchPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths for an unprivileged user.
    ///
    /// Uses `$XDG_RUNTIME_DIR/hutch`, falling back to the user's local data
    /// directory when no runtime directory is set.
    #[must_use]
    pub fn rootless() -> Self {
        let base = dirs::runtime_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir);
        Self::with_root(base.join("hutch"))
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Container state file.
    #[must_use]
    pub fn container_state(&self, id: &str) -> PathBuf {
        self.container(id).join(STATE_FILE)
    }

    /// Container lock file.
    #[must_use]
    pub fn container_lock(&self, id: &str) -> PathBuf {
        self.container(id).join(LOCK_FILE)
    }

    /// Start barrier for a container's init process.
    #[must_use]
    pub fn exec_fifo(&self, id: &str) -> PathBuf {
        self.container(id).join(EXEC_FIFO)
    }

    /// Bootstrap helper log for a container.
    #[must_use]
    pub fn init_log(&self, id: &str) -> PathBuf {
        self.container(id).join(INIT_LOG)
    }

    /// Captured stdout of the init process.
    #[must_use]
    pub fn stdout_log(&self, id: &str) -> PathBuf {
        self.container(id).join("stdout.log")
    }

    /// Captured stderr of the init process.
    #[must_use]
    pub fn stderr_log(&self, id: &str) -> PathBuf {
        self.container(id).join("stderr.log")
    }

    /// Whether `path` looks like a container directory (has a state file).
    #[must_use]
    pub fn is_container_dir(path: &Path) -> bool {
        path.join(STATE_FILE).is_file()
    }

    /// Create the state root.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

impl Default for HutchPaths {
    fn default() -> Self {
        Self {
            root: HUTCH_ROOT.clone(),
        }
    }
}
