#![allow(unsafe_code)]
//! Cgroup v1 (legacy hierarchies) backend.
//!
//! Each controller is mounted separately under `<mount>/<controller>` and
//! the container gets the same relative path in every one of them.

use std::path::{Path, PathBuf};

use hutch_common::{HutchError, HutchResult};
use hutch_config::{BlockIoResources, CpuResources, MemoryResources, PidsResources, Resources};

use super::{
    CgroupManager, CgroupStats, CpuStats, FreezerState, IoDeviceStats, MemoryStats, PidsStats,
    create_dir, parse_flat_keyed, parse_limit, parse_pids, read_file, read_u64, remove_dir,
    strip_root, wait_until, write_file,
};

/// Controllers the engine uses, in the order their directories are created.
const CONTROLLERS: &[&str] = &["freezer", "cpu", "cpuacct", "cpuset", "memory", "pids", "blkio"];

/// v1 reports "unlimited" memory as a page-aligned `i64::MAX`.
const UNLIMITED_MEMORY: u64 = 0x7FFF_FFFF_FFFF_F000;

/// Manages one cgroup across the v1 controller hierarchies.
#[derive(Debug, Clone)]
pub struct Fs1Manager {
    mount: PathBuf,
    relative: PathBuf,
    controllers: Vec<&'static str>,
    path: PathBuf,
}

impl Fs1Manager {
    fn open(mount: &Path, relative: &Path) -> HutchResult<Self> {
        let controllers: Vec<&'static str> = CONTROLLERS
            .iter()
            .copied()
            .filter(|c| mount.join(c).is_dir())
            .collect();

        let Some(primary) = controllers.first() else {
            return Err(HutchError::resource(
                "cgroup",
                format!("no cgroup v1 controllers mounted under {}", mount.display()),
            ));
        };
        let path = mount.join(primary).join(relative);

        Ok(Self {
            mount: mount.to_path_buf(),
            relative: relative.to_path_buf(),
            controllers,
            path,
        })
    }

    /// Create the container directory in every mounted controller.
    ///
    /// # Errors
    ///
    /// Returns a resource error if no controller is mounted or a directory
    /// cannot be created.
    pub fn create(mount: &Path, relative: &Path) -> HutchResult<Self> {
        let manager = Self::open(mount, relative)?;

        for controller in &manager.controllers {
            let mut current = mount.join(controller);
            for component in relative.components() {
                let parent = current.clone();
                current.push(component);
                create_dir(&current)?;
                if *controller == "cpuset" {
                    inherit_cpuset(&parent, &current)?;
                }
            }
        }

        tracing::debug!(
            relative = %relative.display(),
            controllers = ?manager.controllers,
            "Created v1 cgroups"
        );

        Ok(manager)
    }

    /// Reopen a cgroup from the path returned by [`CgroupManager::path`].
    ///
    /// # Errors
    ///
    /// Returns a resource error if `path` is not inside a controller mount.
    pub fn load(mount: &Path, path: &Path) -> HutchResult<Self> {
        let below_mount = strip_root(mount, path)?;
        let mut components = below_mount.components();
        components.next();
        Self::open(mount, components.as_path())
    }

    fn controller_path(&self, controller: &str) -> Option<PathBuf> {
        self.controllers
            .iter()
            .any(|c| *c == controller)
            .then(|| self.mount.join(controller).join(&self.relative))
    }

    fn set_cpu(&self, cpu: &CpuResources) -> HutchResult<()> {
        if let Some(dir) = self.controller_path("cpu") {
            if let Some(shares) = cpu.shares {
                write_file(&dir, "cpu.shares", shares.to_string())?;
                tracing::debug!(shares, "Set cpu.shares");
            }
            // The period must be written first: the kernel validates the
            // quota against it.
            if let Some(period) = cpu.period {
                write_file(&dir, "cpu.cfs_period_us", period.to_string())?;
                tracing::debug!(period, "Set cpu.cfs_period_us");
            }
            if let Some(quota) = cpu.quota {
                write_file(&dir, "cpu.cfs_quota_us", quota.to_string())?;
                tracing::debug!(quota, "Set cpu.cfs_quota_us");
            }
        }

        if let Some(dir) = self.controller_path("cpuset") {
            if let Some(cpus) = &cpu.cpus {
                write_file(&dir, "cpuset.cpus", cpus)?;
            }
            if let Some(mems) = &cpu.mems {
                write_file(&dir, "cpuset.mems", mems)?;
            }
        }

        Ok(())
    }

    fn set_memory(&self, memory: &MemoryResources) -> HutchResult<()> {
        let Some(dir) = self.controller_path("memory") else {
            return Ok(());
        };

        if let Some(limit) = memory.limit {
            write_file(&dir, "memory.limit_in_bytes", limit.to_string())?;
            tracing::debug!(limit, "Set memory.limit_in_bytes");
        }

        if let Some(reservation) = memory.reservation {
            write_file(&dir, "memory.soft_limit_in_bytes", reservation.to_string())?;
            tracing::debug!(reservation, "Set memory.soft_limit_in_bytes");
        }

        // Swap accounting may be disabled on the host.
        if let Some(swap) = memory.swap {
            if dir.join("memory.memsw.limit_in_bytes").exists() {
                write_file(&dir, "memory.memsw.limit_in_bytes", swap.to_string())?;
                tracing::debug!(swap, "Set memory.memsw.limit_in_bytes");
            } else {
                tracing::warn!(swap, "Swap accounting unavailable, swap limit ignored");
            }
        }

        Ok(())
    }

    fn set_pids(&self, pids: &PidsResources) -> HutchResult<()> {
        if let Some(dir) = self.controller_path("pids") {
            let value = if pids.limit < 0 {
                "max".to_string()
            } else {
                pids.limit.to_string()
            };
            write_file(&dir, "pids.max", value)?;
            tracing::debug!(limit = pids.limit, "Set pids.max");
        }
        Ok(())
    }

    fn set_blkio(&self, io: &BlockIoResources) -> HutchResult<()> {
        let Some(dir) = self.controller_path("blkio") else {
            return Ok(());
        };

        if let Some(weight) = io.weight {
            write_file(&dir, "blkio.weight", weight.to_string())?;
            tracing::debug!(weight, "Set blkio.weight");
        }

        for (file, devices) in [
            ("blkio.throttle.read_bps_device", &io.throttle_read_bps_device),
            ("blkio.throttle.write_bps_device", &io.throttle_write_bps_device),
            ("blkio.throttle.read_iops_device", &io.throttle_read_iops_device),
            ("blkio.throttle.write_iops_device", &io.throttle_write_iops_device),
        ] {
            for device in devices {
                let value = format!("{}:{} {}", device.major, device.minor, device.rate);
                write_file(&dir, file, &value)?;
                tracing::debug!(file, value, "Set block I/O throttle");
            }
        }

        Ok(())
    }

    fn freezer_dir(&self) -> HutchResult<PathBuf> {
        self.controller_path("freezer")
            .ok_or_else(|| HutchError::resource("cgroup", "freezer controller is not mounted"))
    }

    fn read_freezer(&self) -> HutchResult<String> {
        read_file(&self.freezer_dir()?, "freezer.state")
    }
}

impl CgroupManager for Fs1Manager {
    fn path(&self) -> &Path {
        &self.path
    }

    fn apply(&self, pid: u32) -> HutchResult<()> {
        for controller in &self.controllers {
            let dir = self.mount.join(controller).join(&self.relative);
            write_file(&dir, "cgroup.procs", pid.to_string())?;
        }
        tracing::debug!(pid, "Process added to v1 cgroups");
        Ok(())
    }

    fn set(&self, resources: &Resources) -> HutchResult<()> {
        if let Some(cpu) = &resources.cpu {
            self.set_cpu(cpu)?;
        }
        if let Some(memory) = &resources.memory {
            self.set_memory(memory)?;
        }
        if let Some(pids) = &resources.pids {
            self.set_pids(pids)?;
        }
        if let Some(io) = &resources.block_io {
            self.set_blkio(io)?;
        }
        Ok(())
    }

    fn freeze(&self) -> HutchResult<()> {
        write_file(&self.freezer_dir()?, "freezer.state", "FROZEN")?;
        wait_until("cgroup freeze", || {
            self.read_freezer().map(|state| state == "FROZEN")
        })?;
        tracing::debug!(path = %self.path.display(), "Froze cgroup");
        Ok(())
    }

    fn thaw(&self) -> HutchResult<()> {
        write_file(&self.freezer_dir()?, "freezer.state", "THAWED")?;
        wait_until("cgroup thaw", || {
            self.read_freezer().map(|state| state == "THAWED")
        })?;
        tracing::debug!(path = %self.path.display(), "Thawed cgroup");
        Ok(())
    }

    fn freezer_state(&self) -> HutchResult<FreezerState> {
        if self.controller_path("freezer").is_none() {
            return Ok(FreezerState::Thawed);
        }
        Ok(match self.read_freezer()?.as_str() {
            "FROZEN" => FreezerState::Frozen,
            _ => FreezerState::Thawed,
        })
    }

    fn pids(&self) -> HutchResult<Vec<u32>> {
        Ok(parse_pids(&read_file(&self.path, "cgroup.procs")?))
    }

    fn stats(&self) -> HutchResult<CgroupStats> {
        let mut stats = CgroupStats::default();

        if let Some(dir) = self.controller_path("cpuacct") {
            stats.cpu.usage_usec = read_u64(&dir, "cpuacct.usage") / 1000;
            stats.cpu.user_usec = read_u64(&dir, "cpuacct.usage_user") / 1000;
            stats.cpu.system_usec = read_u64(&dir, "cpuacct.usage_sys") / 1000;
        }
        if let Some(dir) = self.controller_path("cpu") {
            let content = std::fs::read_to_string(dir.join("cpu.stat")).unwrap_or_default();
            merge_throttling(&mut stats.cpu, &content);
        }
        if let Some(dir) = self.controller_path("memory") {
            let limit = read_u64(&dir, "memory.limit_in_bytes");
            stats.memory = MemoryStats {
                usage: read_u64(&dir, "memory.usage_in_bytes"),
                limit: (limit != 0 && limit < UNLIMITED_MEMORY).then_some(limit),
                swap_usage: read_u64(&dir, "memory.memsw.usage_in_bytes")
                    .saturating_sub(read_u64(&dir, "memory.usage_in_bytes")),
            };
        }
        if let Some(dir) = self.controller_path("pids") {
            stats.pids = PidsStats {
                current: read_u64(&dir, "pids.current"),
                limit: std::fs::read_to_string(dir.join("pids.max"))
                    .ok()
                    .and_then(|s| parse_limit(&s)),
            };
        }
        if let Some(dir) = self.controller_path("blkio") {
            let bytes = std::fs::read_to_string(dir.join("blkio.throttle.io_service_bytes"))
                .unwrap_or_default();
            let ios = std::fs::read_to_string(dir.join("blkio.throttle.io_serviced"))
                .unwrap_or_default();
            stats.io = parse_blkio(&bytes, &ios);
        }

        Ok(stats)
    }

    fn destroy(&self) -> HutchResult<()> {
        // v1 has no cgroup.kill.
        if let Ok(pids) = self.pids() {
            for pid in pids {
                if let Ok(pid) = libc::pid_t::try_from(pid) {
                    unsafe { libc::kill(pid, libc::SIGKILL) };
                }
            }
        }

        for controller in &self.controllers {
            remove_dir(&self.mount.join(controller).join(&self.relative))?;
        }

        tracing::debug!(relative = %self.relative.display(), "Deleted v1 cgroups");
        Ok(())
    }
}

/// A new cpuset starts empty and refuses tasks; copy the parent's sets.
fn inherit_cpuset(parent: &Path, child: &Path) -> HutchResult<()> {
    for file in ["cpuset.cpus", "cpuset.mems"] {
        let current = std::fs::read_to_string(child.join(file)).unwrap_or_default();
        if current.trim().is_empty() {
            let inherited = std::fs::read_to_string(parent.join(file)).unwrap_or_default();
            if !inherited.trim().is_empty() {
                write_file(child, file, inherited.trim())?;
            }
        }
    }
    Ok(())
}

fn merge_throttling(cpu: &mut CpuStats, content: &str) {
    for (key, value) in parse_flat_keyed(content) {
        match key {
            "nr_periods" => cpu.nr_periods = value,
            "nr_throttled" => cpu.nr_throttled = value,
            "throttled_time" => cpu.throttled_usec = value / 1000,
            _ => {}
        }
    }
}

/// Merge `blkio.throttle.io_service_bytes` and `io_serviced` into per-device
/// counters. Lines look like `8:0 Read 4096`.
fn parse_blkio(bytes: &str, ios: &str) -> Vec<IoDeviceStats> {
    let mut devices: Vec<IoDeviceStats> = Vec::new();

    for (content, is_bytes) in [(bytes, true), (ios, false)] {
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(device), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Some((major, minor)) = device.split_once(':') else {
                continue;
            };
            let (Ok(major), Ok(minor), Ok(value)) =
                (major.parse::<u64>(), minor.parse::<u64>(), value.parse::<u64>())
            else {
                continue;
            };

            let index = if let Some(i) = devices
                .iter()
                .position(|d| d.major == major && d.minor == minor)
            {
                i
            } else {
                devices.push(IoDeviceStats {
                    major,
                    minor,
                    ..IoDeviceStats::default()
                });
                devices.len() - 1
            };
            let entry = &mut devices[index];

            match (op, is_bytes) {
                ("Read", true) => entry.read_bytes = value,
                ("Write", true) => entry.write_bytes = value,
                ("Read", false) => entry.read_ios = value,
                ("Write", false) => entry.write_ios = value,
                _ => {}
            }
        }
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mount() -> tempfile::TempDir {
        let mount = tempdir().unwrap();
        for controller in ["freezer", "cpu", "cpuset", "memory", "pids"] {
            std::fs::create_dir(mount.path().join(controller)).unwrap();
        }
        std::fs::write(mount.path().join("cpuset/cpuset.cpus"), "0-3\n").unwrap();
        std::fs::write(mount.path().join("cpuset/cpuset.mems"), "0\n").unwrap();
        mount
    }

    #[test]
    fn create_in_every_controller() {
        let mount = mount();
        let manager = Fs1Manager::create(mount.path(), Path::new("hutch/c1")).unwrap();

        assert_eq!(manager.path(), mount.path().join("freezer/hutch/c1"));
        for controller in ["freezer", "cpu", "cpuset", "memory", "pids"] {
            assert!(mount.path().join(controller).join("hutch/c1").is_dir());
        }
        assert!(!mount.path().join("blkio").exists());
        assert_eq!(
            std::fs::read_to_string(mount.path().join("cpuset/hutch/c1/cpuset.cpus")).unwrap(),
            "0-3"
        );
    }

    #[test]
    fn load_from_freezer_path() {
        let mount = mount();
        let created = Fs1Manager::create(mount.path(), Path::new("hutch/c1")).unwrap();
        let loaded = Fs1Manager::load(mount.path(), created.path()).unwrap();
        assert_eq!(loaded.relative, PathBuf::from("hutch/c1"));
        assert_eq!(loaded.path(), created.path());
    }

    #[test]
    fn no_controllers_is_an_error() {
        let mount = tempdir().unwrap();
        let err = Fs1Manager::create(mount.path(), Path::new("hutch/c1")).unwrap_err();
        assert_eq!(err.kind(), hutch_common::ErrorKind::Resource);
    }

    #[test]
    fn set_writes_limits() {
        let mount = mount();
        let manager = Fs1Manager::create(mount.path(), Path::new("hutch/c1")).unwrap();
        manager
            .set(&Resources {
                cpu: Some(CpuResources {
                    shares: Some(512),
                    quota: Some(-1),
                    period: Some(100_000),
                    ..CpuResources::default()
                }),
                memory: Some(MemoryResources {
                    limit: Some(4096),
                    ..MemoryResources::default()
                }),
                pids: Some(PidsResources { limit: 32 }),
                block_io: None,
            })
            .unwrap();

        let read = |rel: &str| std::fs::read_to_string(mount.path().join(rel)).unwrap();
        assert_eq!(read("cpu/hutch/c1/cpu.shares"), "512");
        assert_eq!(read("cpu/hutch/c1/cpu.cfs_quota_us"), "-1");
        assert_eq!(read("memory/hutch/c1/memory.limit_in_bytes"), "4096");
        assert_eq!(read("pids/hutch/c1/pids.max"), "32");
    }

    #[test]
    fn freezer_round_trip() {
        let mount = mount();
        let manager = Fs1Manager::create(mount.path(), Path::new("hutch/c1")).unwrap();

        manager.freeze().unwrap();
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Frozen);
        manager.thaw().unwrap();
        assert_eq!(manager.freezer_state().unwrap(), FreezerState::Thawed);
    }

    #[test]
    fn blkio_parsing() {
        let bytes = "8:0 Read 4096\n8:0 Write 8192\n8:0 Total 12288\nTotal 12288\n";
        let ios = "8:0 Read 1\n8:0 Write 2\n";
        assert_eq!(
            parse_blkio(bytes, ios),
            vec![IoDeviceStats {
                major: 8,
                minor: 0,
                read_bytes: 4096,
                write_bytes: 8192,
                read_ios: 1,
                write_ios: 2,
            }]
        );
    }

    #[test]
    fn unlimited_memory_reads_as_none() {
        let mount = mount();
        let manager = Fs1Manager::create(mount.path(), Path::new("hutch/c1")).unwrap();
        let dir = mount.path().join("memory/hutch/c1");
        std::fs::write(dir.join("memory.limit_in_bytes"), "9223372036854771712\n").unwrap();
        std::fs::write(dir.join("memory.usage_in_bytes"), "1024\n").unwrap();

        let stats = manager.stats().unwrap();
        assert_eq!(stats.memory.usage, 1024);
        assert_eq!(stats.memory.limit, None);
    }
}
