//! Cgroup v2 (unified hierarchy) backend.

use std::path::{Path, PathBuf};

use hutch_common::HutchResult;
use hutch_config::{BlockIoResources, CpuResources, MemoryResources, PidsResources, Resources};

use super::{
    CgroupManager, CgroupStats, CpuStats, FreezerState, IoDeviceStats, MemoryStats, PidsStats,
    create_dir, parse_flat_keyed, parse_limit, parse_pids, read_file, read_u64, remove_dir,
    wait_until, write_file,
};

/// Default CFS period in microseconds.
const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// Manages one cgroup in the unified hierarchy.
#[derive(Debug, Clone)]
pub struct Fs2Manager {
    path: PathBuf,
}

impl Fs2Manager {
    /// Create `<mount>/<relative>`, enabling every available controller in
    /// the ancestors so the leaf can use them.
    ///
    /// # Errors
    ///
    /// Returns a resource error if a directory cannot be created.
    pub fn create(mount: &Path, relative: &Path) -> HutchResult<Self> {
        let mut current = mount.to_path_buf();

        for component in relative.components() {
            enable_controllers(&current);
            current.push(component);
            create_dir(&current)?;
        }

        Ok(Self { path: current })
    }

    /// Reopen an existing cgroup.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn set_cpu(&self, cpu: &CpuResources) -> HutchResult<()> {
        if let Some(shares) = cpu.shares {
            let weight = shares_to_weight(shares);
            write_file(&self.path, "cpu.weight", weight.to_string())?;
            tracing::debug!(shares, weight, "Set cpu.weight");
        }

        if cpu.quota.is_some() || cpu.period.is_some() {
            let value = cpu_max(cpu.quota, cpu.period);
            write_file(&self.path, "cpu.max", &value)?;
            tracing::debug!(value, "Set cpu.max");
        }

        if let Some(cpus) = &cpu.cpus {
            write_file(&self.path, "cpuset.cpus", cpus)?;
            tracing::debug!(cpus, "Set cpuset.cpus");
        }

        if let Some(mems) = &cpu.mems {
            write_file(&self.path, "cpuset.mems", mems)?;
            tracing::debug!(mems, "Set cpuset.mems");
        }

        Ok(())
    }

    fn set_memory(&self, memory: &MemoryResources) -> HutchResult<()> {
        if let Some(limit) = memory.limit {
            write_file(&self.path, "memory.max", limit_value(limit))?;
            tracing::debug!(limit, "Set memory.max");
        }

        if let Some(reservation) = memory.reservation {
            write_file(&self.path, "memory.low", limit_value(reservation))?;
            tracing::debug!(reservation, "Set memory.low");
        }

        if let Some(swap) = memory.swap {
            let value = swap_max(swap, memory.limit);
            write_file(&self.path, "memory.swap.max", &value)?;
            tracing::debug!(value, "Set memory.swap.max");
        }

        Ok(())
    }

    fn set_pids(&self, pids: &PidsResources) -> HutchResult<()> {
        write_file(&self.path, "pids.max", limit_value(pids.limit))?;
        tracing::debug!(limit = pids.limit, "Set pids.max");
        Ok(())
    }

    fn set_io(&self, io: &BlockIoResources) -> HutchResult<()> {
        if let Some(weight) = io.weight {
            let weight = blkio_weight_to_io_weight(weight);
            write_file(&self.path, "io.weight", format!("default {weight}"))?;
            tracing::debug!(weight, "Set io.weight");
        }

        // io.max format: "MAJOR:MINOR rbps=LIMIT"
        for (key, devices) in [
            ("rbps", &io.throttle_read_bps_device),
            ("wbps", &io.throttle_write_bps_device),
            ("riops", &io.throttle_read_iops_device),
            ("wiops", &io.throttle_write_iops_device),
        ] {
            for device in devices {
                let value = format!("{}:{} {key}={}", device.major, device.minor, device.rate);
                write_file(&self.path, "io.max", &value)?;
                tracing::debug!(value, "Set io.max");
            }
        }

        Ok(())
    }

    fn is_frozen(&self) -> HutchResult<bool> {
        let events = read_file(&self.path, "cgroup.events")?;
        Ok(events
            .lines()
            .any(|line| line.split_whitespace().eq(["frozen", "1"])))
    }
}

impl CgroupManager for Fs2Manager {
    fn path(&self) -> &Path {
        &self.path
    }

    fn apply(&self, pid: u32) -> HutchResult<()> {
        write_file(&self.path, "cgroup.procs", pid.to_string())?;
        tracing::debug!(pid, path = %self.path.display(), "Added process to cgroup");
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
            self.set_io(io)?;
        }
        Ok(())
    }

    fn freeze(&self) -> HutchResult<()> {
        write_file(&self.path, "cgroup.freeze", "1")?;
        wait_until("cgroup freeze", || self.is_frozen())?;
        tracing::debug!(path = %self.path.display(), "Froze cgroup");
        Ok(())
    }

    fn thaw(&self) -> HutchResult<()> {
        write_file(&self.path, "cgroup.freeze", "0")?;
        wait_until("cgroup thaw", || self.is_frozen().map(|frozen| !frozen))?;
        tracing::debug!(path = %self.path.display(), "Thawed cgroup");
        Ok(())
    }

    fn freezer_state(&self) -> HutchResult<FreezerState> {
        // The root cgroup has no freeze file and is never frozen.
        match std::fs::read_to_string(self.path.join("cgroup.freeze")) {
            Ok(content) if content.trim() == "1" => Ok(FreezerState::Frozen),
            Ok(_) => Ok(FreezerState::Thawed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FreezerState::Thawed),
            Err(e) => Err(e.into()),
        }
    }

    fn pids(&self) -> HutchResult<Vec<u32>> {
        Ok(parse_pids(&read_file(&self.path, "cgroup.procs")?))
    }

    fn stats(&self) -> HutchResult<CgroupStats> {
        let cpu_stat = std::fs::read_to_string(self.path.join("cpu.stat")).unwrap_or_default();
        let io_stat = std::fs::read_to_string(self.path.join("io.stat")).unwrap_or_default();
        let read_limit = |file: &str| {
            std::fs::read_to_string(self.path.join(file))
                .ok()
                .and_then(|s| parse_limit(&s))
        };

        Ok(CgroupStats {
            cpu: parse_cpu_stat(&cpu_stat),
            memory: MemoryStats {
                usage: read_u64(&self.path, "memory.current"),
                limit: read_limit("memory.max"),
                swap_usage: read_u64(&self.path, "memory.swap.current"),
            },
            pids: PidsStats {
                current: read_u64(&self.path, "pids.current"),
                limit: read_limit("pids.max"),
            },
            io: parse_io_stat(&io_stat),
        })
    }

    fn destroy(&self) -> HutchResult<()> {
        if !self.path.exists() {
            return Ok(());
        }

        // cgroup.kill exists since Linux 5.14.
        if self.path.join("cgroup.kill").exists() {
            if let Err(e) = write_file(&self.path, "cgroup.kill", "1") {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to kill cgroup members");
            }
        }

        remove_dir(&self.path)?;
        tracing::debug!(path = %self.path.display(), "Deleted cgroup");
        Ok(())
    }
}

/// Enable every controller available in `dir` for its children.
fn enable_controllers(dir: &Path) {
    let Ok(available) = std::fs::read_to_string(dir.join("cgroup.controllers")) else {
        return;
    };

    for controller in available.split_whitespace() {
        if let Err(e) = std::fs::write(dir.join("cgroup.subtree_control"), format!("+{controller}"))
        {
            tracing::debug!(
                path = %dir.display(),
                controller,
                error = %e,
                "Controller not enabled"
            );
        }
    }
}

/// Convert v1 CPU shares (2-262144) to a v2 weight (1-10000).
pub(crate) const fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 100;
    }
    let shares = if shares < 2 { 2 } else { shares };
    let shares = if shares > 262_144 { 262_144 } else { shares };
    1 + ((shares - 2) * 9999) / 262_142
}

/// Convert a v1 block I/O weight (10-1000) to a v2 weight (1-10000).
pub(crate) const fn blkio_weight_to_io_weight(weight: u16) -> u64 {
    let weight = if weight < 10 { 10 } else { weight as u64 };
    1 + ((weight - 10) * 9999) / 990
}

/// Value of `cpu.max` for a quota and period.
fn cpu_max(quota: Option<i64>, period: Option<u64>) -> String {
    let period = period.unwrap_or(DEFAULT_CPU_PERIOD);
    match quota {
        Some(quota) if quota > 0 => format!("{quota} {period}"),
        _ => format!("max {period}"),
    }
}

/// Render a byte or count limit where -1 means unlimited.
fn limit_value(limit: i64) -> String {
    if limit < 0 {
        "max".to_string()
    } else {
        limit.to_string()
    }
}

/// The configured swap limit covers memory plus swap; v2 limits swap alone.
fn swap_max(swap: i64, limit: Option<i64>) -> String {
    match limit {
        _ if swap < 0 => "max".to_string(),
        Some(limit) if limit > 0 => (swap - limit).max(0).to_string(),
        _ => swap.to_string(),
    }
}

fn parse_cpu_stat(content: &str) -> CpuStats {
    let mut stats = CpuStats::default();
    for (key, value) in parse_flat_keyed(content) {
        match key {
            "usage_usec" => stats.usage_usec = value,
            "user_usec" => stats.user_usec = value,
            "system_usec" => stats.system_usec = value,
            "nr_periods" => stats.nr_periods = value,
            "nr_throttled" => stats.nr_throttled = value,
            "throttled_usec" => stats.throttled_usec = value,
            _ => {}
        }
    }
    stats
}

/// Parse `io.stat`: `MAJ:MIN rbytes=N wbytes=N rios=N wios=N ...` per line.
fn parse_io_stat(content: &str) -> Vec<IoDeviceStats> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let (major, minor) = parts.next()?.split_once(':')?;
            let mut device = IoDeviceStats {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
                ..IoDeviceStats::default()
            };
            for part in parts {
                let Some((key, value)) = part.split_once('=') else {
                    continue;
                };
                let value = value.parse().unwrap_or(0);
                match key {
                    "rbytes" => device.read_bytes = value,
                    "wbytes" => device.write_bytes = value,
                    "rios" => device.read_ios = value,
                    "wios" => device.write_ios = value,
                    _ => {}
                }
            }
            Some(device)
        })
        .collect()
}
