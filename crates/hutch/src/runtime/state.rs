//! Container state persistence.
//!
//! Every container owns `<root>/<id>` with `state.json` and a `lock` file.
//! The lock is a machine-wide `flock`: exclusive for mutations, shared for
//! reads. `state.json` is replaced atomically (temp file + rename).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use hutch_common::{ContainerId, HutchError, HutchPaths, HutchResult};
use hutch_config::ContainerState;
use rustix::fs::FlockOperation;
use rustix::io::Errno;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers.
    Shared,
    /// Writers.
    Exclusive,
}

/// A held container lock, released on drop.
#[derive(Debug)]
pub struct ContainerLock {
    file: File,
    mode: LockMode,
}

impl ContainerLock {
    /// Current lock mode.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Convert a shared lock into an exclusive one.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::Resource`] if the lock cannot be upgraded in time.
    pub async fn upgrade(&mut self, timeout: Duration) -> HutchResult<()> {
        if self.mode == LockMode::Exclusive {
            return Ok(());
        }
        poll_flock(&self.file, LockMode::Exclusive, timeout).await?;
        self.mode = LockMode::Exclusive;
        Ok(())
    }
}

async fn poll_flock(file: &File, mode: LockMode, timeout: Duration) -> HutchResult<()> {
    let operation = match mode {
        LockMode::Shared => FlockOperation::NonBlockingLockShared,
        LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    };
    let deadline = Instant::now() + timeout;

    loop {
        match rustix::fs::flock(file, operation) {
            Ok(()) => return Ok(()),
            Err(e) if e == Errno::WOULDBLOCK || e == Errno::INTR => {
                if Instant::now() >= deadline {
                    return Err(HutchError::resource(
                        "lock",
                        format!("container lock not acquired within {timeout:?}"),
                    ));
                }
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            }
            Err(e) => return Err(HutchError::Io(e.into())),
        }
    }
}

/// Persists container state under a state root.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: HutchPaths,
}

impl StateStore {
    /// Create a store over the given paths.
    #[must_use]
    pub const fn new(paths: HutchPaths) -> Self {
        Self { paths }
    }

    /// Directory of a container.
    #[must_use]
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.paths.container(id)
    }

    /// The paths this store works under.
    #[must_use]
    pub const fn paths(&self) -> &HutchPaths {
        &self.paths
    }

    /// Create the container directory and take its exclusive lock.
    ///
    /// Directory creation is the atomic claim on the ID: of two concurrent
    /// callers exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::AlreadyExists`] if the directory exists.
    pub fn allocate(&self, id: &ContainerId) -> HutchResult<ContainerLock> {
        self.paths.create_dirs()?;
        let dir = self.container_dir(id.as_str());

        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(HutchError::AlreadyExists { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.paths.container_lock(id.as_str()))?;
        rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive)
            .map_err(|e| HutchError::Io(e.into()))?;

        tracing::debug!(container_id = %id, path = %dir.display(), "Allocated container directory");

        Ok(ContainerLock {
            file,
            mode: LockMode::Exclusive,
        })
    }

    /// Take the container lock, polling up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::NotFound`] if the container does not exist.
    pub async fn lock(
        &self,
        id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> HutchResult<ContainerLock> {
        let file = match OpenOptions::new()
            .read(true)
            .open(self.paths.container_lock(id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HutchError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        };

        poll_flock(&file, mode, timeout).await?;
        tracing::trace!(container_id = %id, ?mode, "Acquired container lock");
        Ok(ContainerLock { file, mode })
    }

    /// Atomically write container state.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the filesystem write fails.
    pub fn save(&self, state: &ContainerState) -> HutchResult<()> {
        let dir = self.container_dir(state.id.as_str());
        let path = self.paths.container_state(state.id.as_str());

        let json = serde_json::to_vec_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| HutchError::Io(e.error))?;

        tracing::debug!(
            container_id = %state.id,
            status = %state.status,
            path = %path.display(),
            "Saved container state"
        );

        Ok(())
    }

    /// Load container state.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::NotFound`] if no state was ever committed.
    pub fn load(&self, id: &str) -> HutchResult<ContainerState> {
        let path = self.paths.container_state(id);

        let json = match std::fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HutchError::NotFound { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        };
        let state: ContainerState = serde_json::from_slice(&json)?;

        tracing::trace!(container_id = %id, path = %path.display(), "Loaded container state");

        Ok(state)
    }

    /// Delete the container directory and everything below it.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails for a reason other than absence.
    pub fn remove(&self, id: &str) -> HutchResult<()> {
        let dir = self.container_dir(id);

        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(container_id = %id, path = %dir.display(), "Removed container directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List IDs of containers with committed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state root cannot be read.
    pub fn list(&self) -> HutchResult<Vec<String>> {
        let mut containers = Vec::new();

        let entries = match std::fs::read_dir(&self.paths.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(containers),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if HutchPaths::is_container_dir(&entry.path()) {
                if let Some(name) = entry.file_name().to_str() {
                    containers.push(name.to_string());
                }
            }
        }

        containers.sort();
        Ok(containers)
    }

    /// Check if a container exists.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.paths.container_state(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hutch_common::ErrorKind;
    use hutch_config::ContainerConfig;
    use tempfile::tempdir;

    fn state(id: &str) -> ContainerState {
        ContainerState::created(
            ContainerId::new(id).unwrap(),
            ContainerConfig::default(),
            "/sys/fs/cgroup/hutch",
            1,
            1,
        )
    }

    #[test]
    fn save_and_load_state() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));

        let id = ContainerId::new("test-container").unwrap();
        let _lock = store.allocate(&id).unwrap();
        store.save(&state("test-container")).unwrap();

        let loaded = store.load("test-container").unwrap();
        assert_eq!(loaded.id.as_str(), "test-container");
        assert!(store.exists("test-container"));
    }

    #[test]
    fn allocate_twice_fails() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));
        let id = ContainerId::new("c1").unwrap();

        let _lock = store.allocate(&id).unwrap();
        let err = store.allocate(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn load_missing_is_not_found() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));
        assert_eq!(store.load("nope").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn list_containers() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));

        for id in ["container-2", "container-1"] {
            let _lock = store.allocate(&ContainerId::new(id).unwrap()).unwrap();
            store.save(&state(id)).unwrap();
        }
        // Allocated but never committed.
        let _lock = store.allocate(&ContainerId::new("half").unwrap()).unwrap();

        assert_eq!(store.list().unwrap(), vec!["container-1", "container-2"]);
    }

    #[test]
    fn remove_state() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));

        let _lock = store.allocate(&ContainerId::new("c1").unwrap()).unwrap();
        store.save(&state("c1")).unwrap();
        store.remove("c1").unwrap();
        assert!(!store.container_dir("c1").exists());
        store.remove("c1").unwrap();
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_second_locker() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));

        let held = store.allocate(&ContainerId::new("c1").unwrap()).unwrap();
        let err = store
            .lock("c1", LockMode::Shared, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        drop(held);
        let lock = store
            .lock("c1", LockMode::Shared, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
    }

    #[tokio::test]
    async fn shared_locks_coexist_and_upgrade() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));
        drop(store.allocate(&ContainerId::new("c1").unwrap()).unwrap());

        let timeout = Duration::from_millis(100);
        let mut first = store.lock("c1", LockMode::Shared, timeout).await.unwrap();
        let second = store.lock("c1", LockMode::Shared, timeout).await.unwrap();

        assert!(first.upgrade(timeout).await.is_err());
        drop(second);
        first.upgrade(timeout).await.unwrap();
        assert_eq!(first.mode(), LockMode::Exclusive);
    }

    #[tokio::test]
    async fn lock_missing_container_is_not_found() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(HutchPaths::with_root(temp.path()));
        let err = store
            .lock("ghost", LockMode::Exclusive, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
