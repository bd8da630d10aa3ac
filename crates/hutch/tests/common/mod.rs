//! Test doubles and helpers shared by the integration tests.
//!
//! The engine runs unprivileged here: containers have no namespaces, cgroups
//! are simulated with SIGSTOP/SIGCONT and CRIU with a respawn.

#![allow(dead_code, unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use hutch::cgroup::{CgroupFactory, CgroupManager, CgroupStats, FreezerState};
use hutch::checkpoint::{CriuOutcome, CriuRequest, CriuService};
use hutch::runtime::procfs::ProcStat;
use hutch::runtime::{Container, RuntimeConfig};
use hutch_common::{HutchError, HutchResult};
use hutch_config::{CgroupConfig, ContainerConfig, ContainerStatus, Resources};
use parking_lot::Mutex;
use tempfile::TempDir;

/// A cgroup kept in memory. Freezing stops every member with SIGSTOP.
#[derive(Debug)]
pub struct FakeCgroup {
    path: PathBuf,
    members: Mutex<Vec<u32>>,
    frozen: Mutex<bool>,
    destroyed: Mutex<bool>,
    resources: Mutex<Vec<Resources>>,
    refuse_members: bool,
}

impl FakeCgroup {
    fn new(path: PathBuf, refuse_members: bool) -> Self {
        Self {
            path,
            members: Mutex::new(Vec::new()),
            frozen: Mutex::new(false),
            destroyed: Mutex::new(false),
            resources: Mutex::new(Vec::new()),
            refuse_members,
        }
    }

    /// Every resource set written, oldest first.
    pub fn applied_resources(&self) -> Vec<Resources> {
        self.resources.lock().clone()
    }

    fn signal_members(&self, signal: i32) {
        for pid in self.live_members() {
            send_signal(pid, signal);
        }
    }

    fn live_members(&self) -> Vec<u32> {
        self.members
            .lock()
            .iter()
            .copied()
            .filter(|pid| ProcStat::read(*pid).is_some_and(|stat| stat.is_alive()))
            .collect()
    }
}

impl CgroupManager for FakeCgroup {
    fn path(&self) -> &Path {
        &self.path
    }

    fn apply(&self, pid: u32) -> HutchResult<()> {
        if self.refuse_members {
            return Err(HutchError::resource("cgroup", "EACCES"));
        }
        self.members.lock().push(pid);
        Ok(())
    }

    fn set(&self, resources: &Resources) -> HutchResult<()> {
        self.resources.lock().push(resources.clone());
        Ok(())
    }

    fn freeze(&self) -> HutchResult<()> {
        self.signal_members(libc::SIGSTOP);
        *self.frozen.lock() = true;
        Ok(())
    }

    fn thaw(&self) -> HutchResult<()> {
        self.signal_members(libc::SIGCONT);
        *self.frozen.lock() = false;
        Ok(())
    }

    fn freezer_state(&self) -> HutchResult<FreezerState> {
        Ok(if *self.frozen.lock() {
            FreezerState::Frozen
        } else {
            FreezerState::Thawed
        })
    }

    fn pids(&self) -> HutchResult<Vec<u32>> {
        Ok(self.live_members())
    }

    fn stats(&self) -> HutchResult<CgroupStats> {
        let mut stats = CgroupStats::default();
        stats.pids.current = self.live_members().len() as u64;
        Ok(stats)
    }

    fn destroy(&self) -> HutchResult<()> {
        self.signal_members(libc::SIGKILL);
        self.members.lock().clear();
        *self.destroyed.lock() = true;
        Ok(())
    }
}

/// Hands out [`FakeCgroup`]s and finds them again by path.
#[derive(Debug, Default)]
pub struct FakeCgroups {
    cgroups: Mutex<HashMap<PathBuf, Arc<FakeCgroup>>>,
    refuse_members: Mutex<bool>,
}

impl FakeCgroups {
    /// Cgroups created from now on fail to take members.
    pub fn refuse_members(&self) {
        *self.refuse_members.lock() = true;
    }

    /// The cgroup created for `id`, if it still exists.
    pub fn get(&self, id: &str) -> Option<Arc<FakeCgroup>> {
        self.cgroups
            .lock()
            .get(&PathBuf::from("/fake").join(id))
            .cloned()
    }

    /// Whether the cgroup of `id` was removed.
    pub fn was_destroyed(&self, id: &str) -> bool {
        self.get(id).is_some_and(|cgroup| *cgroup.destroyed.lock())
    }
}

impl CgroupFactory for FakeCgroups {
    fn create(&self, id: &str, _config: &CgroupConfig) -> HutchResult<Arc<dyn CgroupManager>> {
        let path = PathBuf::from("/fake").join(id);
        let cgroup = Arc::new(FakeCgroup::new(path.clone(), *self.refuse_members.lock()));
        self.cgroups.lock().insert(path, Arc::clone(&cgroup));
        Ok(cgroup)
    }

    fn load(&self, path: &Path) -> HutchResult<Arc<dyn CgroupManager>> {
        let cgroup = self
            .cgroups
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| HutchError::resource("cgroup", format!("{} is gone", path.display())))?;
        Ok(cgroup)
    }
}

/// Checkpoints by saving the command line and killing the tree; restores by
/// running the command line again.
#[derive(Debug, Default)]
pub struct FakeCriu {
    requests: Mutex<Vec<CriuRequest>>,
    restored: Mutex<Vec<u32>>,
    failing_dumps: Mutex<bool>,
}

impl FakeCriu {
    /// Every request seen, oldest first.
    pub fn requests(&self) -> Vec<CriuRequest> {
        self.requests.lock().clone()
    }

    /// Pids of every process brought back by a restore.
    pub fn restored(&self) -> Vec<u32> {
        self.restored.lock().clone()
    }

    /// Dumps from now on write a partial image, then fail.
    pub fn fail_dumps(&self) {
        *self.failing_dumps.lock() = true;
    }

    fn record(&self, request: &CriuRequest) -> HutchResult<PathBuf> {
        self.requests.lock().push(request.clone());
        let images = request.options.images_directory.clone();
        std::fs::create_dir_all(&images)?;
        Ok(images)
    }

    fn save(&self, request: &CriuRequest) -> HutchResult<PathBuf> {
        let images = self.record(request)?;
        let pid = request.pid.ok_or_else(|| HutchError::CheckpointFailed {
            diagnostic: "no pid".to_string(),
        })?;
        let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).map_err(|e| {
            HutchError::CheckpointFailed {
                diagnostic: format!("reading cmdline of {pid}: {e}"),
            }
        })?;
        std::fs::write(images.join("cmdline"), cmdline)?;
        Ok(images)
    }
}

impl CriuService for FakeCriu {
    fn dump(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        let images = self.save(request)?;
        if *self.failing_dumps.lock() {
            std::fs::write(images.join("pages-1.img"), b"partial")?;
            return Err(HutchError::CheckpointFailed {
                diagnostic: "Error (criu/cr-dump.c:2093): Dumping FAILED.".to_string(),
            });
        }
        if !request.options.leave_running {
            if let Some(pid) = request.pid {
                send_signal(pid, libc::SIGKILL);
            }
        }
        Ok(CriuOutcome::default())
    }

    fn pre_dump(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        self.save(request)?;
        Ok(CriuOutcome::default())
    }

    fn restore(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        let images = self.record(request)?;
        let cmdline = std::fs::read(images.join("cmdline")).map_err(|e| {
            HutchError::RestoreFailed {
                diagnostic: format!("no image: {e}"),
            }
        })?;
        let args: Vec<String> = cmdline
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        let Some((program, rest)) = args.split_first() else {
            return Err(HutchError::RestoreFailed {
                diagnostic: "empty cmdline".to_string(),
            });
        };
        let child = Command::new(program)
            .args(rest)
            .spawn()
            .map_err(|e| HutchError::RestoreFailed {
                diagnostic: format!("respawning {program}: {e}"),
            })?;
        self.restored.lock().push(child.id());
        Ok(CriuOutcome {
            pid: Some(child.id()),
        })
    }
}

/// A runtime rooted in a temporary directory with fake cgroups and CRIU.
pub struct Harness {
    pub dir: TempDir,
    pub runtime: RuntimeConfig,
    pub cgroups: Arc<FakeCgroups>,
    pub criu: Arc<FakeCriu>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cgroups = Arc::new(FakeCgroups::default());
        let criu = Arc::new(FakeCriu::default());
        let runtime = RuntimeConfig::default()
            .with_root(dir.path().join("state"))
            .with_init_binary(env!("CARGO_BIN_EXE_hutch"))
            .with_timeout(Duration::from_secs(10))
            .with_lock_timeout(Duration::from_secs(5))
            .with_cgroups(Arc::clone(&cgroups) as Arc<dyn CgroupFactory>)
            .with_criu(Arc::clone(&criu) as Arc<dyn CriuService>);
        Self {
            dir,
            runtime,
            cgroups,
            criu,
        }
    }

    pub fn runtime(&self) -> RuntimeConfig {
        self.runtime.clone()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn create(&self, id: &str) -> Container {
        Container::create(id, ContainerConfig::default(), self.runtime())
            .await
            .unwrap()
    }
}

/// Poll until the container reaches `status`.
pub async fn wait_for_status(container: &Container, status: ContainerStatus) {
    for _ in 0..200 {
        if container.status().await.unwrap() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "container {} never became {status}, is {}",
        container.id(),
        container.status().await.unwrap()
    );
}

/// Poll until `path` contains `needle`.
pub async fn wait_for_content(path: &Path, needle: &str) -> String {
    for _ in 0..200 {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if content.contains(needle) {
            return content;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never contained {needle:?}", path.display());
}

/// Kill whatever the container still runs.
pub async fn kill_all(container: &Container) {
    if let Ok(state) = container.state().await {
        if let Some(pid) = state.init_pid {
            send_signal(pid, libc::SIGKILL);
        }
    }
}

pub fn send_signal(pid: u32, signal: i32) {
    let pid = libc::pid_t::try_from(pid).unwrap();
    unsafe {
        libc::kill(pid, signal);
    }
}
