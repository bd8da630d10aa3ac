//! Persisted container state.
//!
//! Written to `<root>/<id>/state.json` after every committed transition.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hutch_common::ContainerId;
use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;

/// Container runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Container ID.
    pub id: ContainerId,
    /// Container status.
    pub status: ContainerStatus,
    /// Host pid of the container init process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_pid: Option<u32>,
    /// Start time of the init process, in clock ticks since boot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_start_time: Option<u64>,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
    /// Absolute path of the container's cgroup.
    pub cgroup_path: PathBuf,
    /// Configuration snapshot.
    pub config: ContainerConfig,
}

/// Container status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container has been created; init is blocked at the start barrier.
    Created,
    /// Container is running.
    Running,
    /// Container is frozen.
    Paused,
    /// Init process has exited.
    Stopped,
}

impl ContainerStatus {
    /// Returns true if a process can be run. The init process needs a
    /// `Created` container, any other process a `Running` one.
    #[must_use]
    pub const fn can_run(&self, init: bool) -> bool {
        if init {
            matches!(self, Self::Created)
        } else {
            matches!(self, Self::Running)
        }
    }

    /// Returns true if the container can be signalled.
    #[must_use]
    pub const fn can_signal(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Returns true if the container can be paused.
    #[must_use]
    pub const fn can_pause(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container can be resumed.
    #[must_use]
    pub const fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Returns true if the container can be destroyed.
    #[must_use]
    pub const fn can_destroy(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Returns true if the container can be checkpointed.
    #[must_use]
    pub const fn can_checkpoint(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Returns true if the container is in a running state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container has exited.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl ContainerState {
    /// State for a container whose init is blocked at the barrier.
    #[must_use]
    pub fn created(
        id: ContainerId,
        config: ContainerConfig,
        cgroup_path: impl Into<PathBuf>,
        init_pid: u32,
        init_start_time: u64,
    ) -> Self {
        Self {
            id,
            status: ContainerStatus::Created,
            init_pid: Some(init_pid),
            init_start_time: Some(init_start_time),
            created_at: Utc::now(),
            cgroup_path: cgroup_path.into(),
            config,
        }
    }

    /// Transition to the "running" status.
    pub fn set_running(&mut self) {
        self.status = ContainerStatus::Running;
    }

    /// Transition to the "running" status with a new init process.
    pub fn set_restored(&mut self, init_pid: u32, init_start_time: u64) {
        self.status = ContainerStatus::Running;
        self.init_pid = Some(init_pid);
        self.init_start_time = Some(init_start_time);
    }

    /// Transition to the "paused" status.
    pub fn set_paused(&mut self) {
        self.status = ContainerStatus::Paused;
    }

    /// Transition to the "stopped" status.
    pub fn set_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.init_pid = None;
        self.init_start_time = None;
    }
}
