//! Container type and operations.
//!
//! A [`Container`] is a handle on `<root>/<id>`: it carries no cached state.
//! Every operation takes the container lock, re-reads `state.json`,
//! reconciles it with the OS, acts and persists the result.

use std::path::PathBuf;
use std::sync::Arc;

use hutch_common::{ContainerId, HutchError, HutchResult, Operation, OperationContext};
use hutch_config::{ContainerConfig, ContainerState, ContainerStatus, Namespace, NamespaceType};

use super::config::RuntimeConfig;
use super::events::{RuntimeEvent, now};
use super::procfs::{self, ProcStat};
use super::state::{ContainerLock, LockMode, StateStore};
use super::stats::{Stats, network_stats};
use crate::cgroup::{CgroupManager, FreezerState};
use crate::checkpoint::{self, CriuOptions, CriuRequest, check_host_compatibility};
use crate::exec::barrier;
use crate::exec::channel::{BootstrapRequest, InitMessage, JoinRequest};
use crate::exec::process::{kill, kill_and_reap};
use crate::exec::{Process, ProcessHandle, ProcessSpec, StdioTarget};
use crate::namespace::{self, bootstrap::Handshake, bootstrap::HelperStdio};

/// File CRIU writes the restored init pid to.
const RESTORE_PIDFILE: &str = "restore.pid";

/// A container instance.
#[derive(Debug, Clone)]
pub struct Container {
    id: ContainerId,
    runtime: RuntimeConfig,
    store: StateStore,
}

impl Container {
    fn new(id: ContainerId, runtime: RuntimeConfig) -> Self {
        let store = StateStore::new(runtime.paths.clone());
        Self { id, runtime, store }
    }

    /// Create a container: namespaces are set up and the init blocks at the
    /// start barrier until [`Container::run`] releases it.
    ///
    /// # Errors
    ///
    /// - [`HutchError::AlreadyExists`] if the ID is taken
    /// - [`HutchError::InvalidConfig`] for a structurally invalid config
    /// - [`HutchError::Resource`] if namespace or cgroup setup fails
    /// - [`HutchError::BootstrapFailed`] on an init protocol failure
    ///
    /// Everything allocated is released before an error is returned.
    pub async fn create(
        id: &str,
        config: ContainerConfig,
        runtime: RuntimeConfig,
    ) -> HutchResult<Self> {
        Self::create_inner(id, config, runtime)
            .await
            .in_operation(id, Operation::Create)
    }

    async fn create_inner(
        id: &str,
        config: ContainerConfig,
        runtime: RuntimeConfig,
    ) -> HutchResult<Self> {
        let id = ContainerId::new(id)?;
        config.validate()?;

        tracing::info!(container_id = %id, "Creating container");

        let container = Self::new(id, runtime);
        let lock = container.store.allocate(&container.id)?;

        let cgroup = match container
            .runtime
            .cgroups
            .create(container.id.as_str(), &config.cgroup)
        {
            Ok(cgroup) => cgroup,
            Err(e) => {
                container.discard(None);
                return Err(e);
            }
        };

        match container.bootstrap(config, &cgroup).await {
            Ok(state) => {
                drop(lock);
                tracing::info!(
                    container_id = %container.id,
                    pid = ?state.init_pid,
                    "Container created"
                );
                if let Some(pid) = state.init_pid {
                    container.publish(RuntimeEvent::ContainerCreated {
                        id: container.id.to_string(),
                        pid,
                        timestamp: now(),
                    });
                }
                Ok(container)
            }
            Err(e) => {
                container.discard(Some(cgroup.as_ref()));
                Err(e)
            }
        }
    }

    async fn bootstrap(
        &self,
        config: ContainerConfig,
        cgroup: &Arc<dyn CgroupManager>,
    ) -> HutchResult<ContainerState> {
        let paths = &self.runtime.paths;
        let id = self.id.as_str();
        let fifo = paths.exec_fifo(id);
        barrier::create(&fifo)?;

        let stdio = HelperStdio {
            stdin: StdioTarget::Null,
            stdout: StdioTarget::File(paths.stdout_log(id)),
            stderr: StdioTarget::File(paths.stderr_log(id)),
        };
        let request = InitMessage::Bootstrap(BootstrapRequest {
            config: config.clone(),
            fifo,
        });

        let pid = self.handshake(request, stdio, &config, cgroup).await?;
        let start_time = procfs::start_time(pid)
            .ok_or_else(|| HutchError::bootstrap(format!("init {pid} exited during setup")))?;

        let state = ContainerState::created(self.id.clone(), config, cgroup.path(), pid, start_time);
        self.store.save(&state)?;
        Ok(state)
    }

    /// Run the init protocol on a blocking thread.
    async fn handshake(
        &self,
        request: InitMessage,
        stdio: HelperStdio,
        config: &ContainerConfig,
        cgroup: &Arc<dyn CgroupManager>,
    ) -> HutchResult<u32> {
        let container_id = self.id.to_string();
        let init_binary = self.runtime.init_binary.clone();
        let init_log = self.runtime.paths.init_log(self.id.as_str());
        let uid_mappings = config.uid_mappings.clone();
        let gid_mappings = config.gid_mappings.clone();
        let resources = config.cgroup.resources.clone();
        let timeout = self.runtime.timeout;
        let cgroup = Arc::clone(cgroup);

        tokio::task::spawn_blocking(move || {
            Handshake {
                container_id: &container_id,
                init_binary,
                init_log,
                stdio,
                request,
                uid_mappings: &uid_mappings,
                gid_mappings: &gid_mappings,
                resources: &resources,
                timeout,
            }
            .run(cgroup.as_ref())
        })
        .await
        .map_err(|e| HutchError::internal(format!("bootstrap task failed: {e}")))?
    }

    /// Release what a failed create or restore allocated.
    fn discard(&self, cgroup: Option<&dyn CgroupManager>) {
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.destroy() {
                tracing::warn!(container_id = %self.id, error = %e, "Failed to remove cgroup");
            }
        }
        if let Err(e) = self.store.remove(self.id.as_str()) {
            tracing::warn!(container_id = %self.id, error = %e, "Failed to remove state directory");
        }
    }

    /// Open an existing container.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::NotFound`] if there is no such container.
    pub async fn load(id: &str, runtime: RuntimeConfig) -> HutchResult<Self> {
        async {
            let container = Self::new(ContainerId::new(id)?, runtime);
            let _lock = container.lock(LockMode::Shared).await?;
            container.store.load(id)?;
            Ok::<_, HutchError>(container)
        }
        .await
        .in_operation(id, Operation::Load)
    }

    /// IDs of all containers under the runtime's state root.
    ///
    /// # Errors
    ///
    /// Returns an error if the state root cannot be read.
    pub fn list(runtime: &RuntimeConfig) -> HutchResult<Vec<String>> {
        StateStore::new(runtime.paths.clone()).list()
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Private state directory.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.store.container_dir(self.id.as_str())
    }

    async fn lock(&self, mode: LockMode) -> HutchResult<ContainerLock> {
        self.store
            .lock(self.id.as_str(), mode, self.runtime.lock_timeout)
            .await
    }

    fn cgroup(&self, state: &ContainerState) -> HutchResult<Arc<dyn CgroupManager>> {
        self.runtime.cgroups.load(&state.cgroup_path)
    }

    fn publish(&self, event: RuntimeEvent) {
        self.runtime.events.publish(event);
    }

    fn invalid_state(&self, status: ContainerStatus, expected: &str) -> HutchError {
        HutchError::InvalidState {
            id: self.id.to_string(),
            status: status.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Persisted state cross-checked against the OS. A changed status is
    /// written back, upgrading a shared lock first.
    async fn reconciled_state(&self, lock: &mut ContainerLock) -> HutchResult<ContainerState> {
        let mut state = self.store.load(self.id.as_str())?;
        let before = state.status;
        self.reconcile(&mut state)?;
        if state.status == before {
            return Ok(state);
        }

        if lock.mode() == LockMode::Shared {
            lock.upgrade(self.runtime.lock_timeout).await?;
            // Someone may have written while the lock was converted.
            state = self.store.load(self.id.as_str())?;
            self.reconcile(&mut state)?;
        }

        tracing::info!(
            container_id = %self.id,
            from = %before,
            to = %state.status,
            "Container status changed"
        );
        self.store.save(&state)?;
        if state.status.is_stopped() {
            self.publish(RuntimeEvent::ContainerStopped {
                id: self.id.to_string(),
                timestamp: now(),
            });
        }
        Ok(state)
    }

    fn reconcile(&self, state: &mut ContainerState) -> HutchResult<()> {
        if state.status.is_stopped() {
            return Ok(());
        }

        if live_init(state).is_none() {
            state.set_stopped();
        } else if state.status == ContainerStatus::Created {
            // The barrier is removed once the init was released.
            if !self.runtime.paths.exec_fifo(self.id.as_str()).exists() {
                state.set_running();
            }
        } else {
            match self.cgroup(state)?.freezer_state()? {
                FreezerState::Frozen => state.set_paused(),
                FreezerState::Thawed => state.set_running(),
            }
        }
        Ok(())
    }

    /// Run a process in the container.
    ///
    /// For the init process (`process.init`) this releases the start barrier
    /// of a `Created` container. Any other process joins a `Running`
    /// container's namespaces and cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidState`] if the status does not allow the
    /// request, [`HutchError::BootstrapFailed`] if the process could not be
    /// started.
    pub async fn run(&self, process: Process) -> HutchResult<ProcessHandle> {
        self.run_inner(process)
            .await
            .in_operation(self.id.as_str(), Operation::Run)
    }

    async fn run_inner(&self, process: Process) -> HutchResult<ProcessHandle> {
        process.validate()?;

        let mut lock = self.lock(LockMode::Exclusive).await?;
        let mut state = self.reconciled_state(&mut lock).await?;

        if !state.status.can_run(process.init) {
            let expected = if process.init { "created" } else { "running" };
            return Err(self.invalid_state(state.status, expected));
        }

        if process.init {
            self.start_init(&mut state, process).await
        } else {
            self.join(&state, process).await
        }
    }

    async fn start_init(
        &self,
        state: &mut ContainerState,
        process: Process,
    ) -> HutchResult<ProcessHandle> {
        let (Some(pid), Some(start_time)) = (state.init_pid, state.init_start_time) else {
            return Err(HutchError::internal("created container without init pid"));
        };

        tracing::info!(container_id = %self.id, pid, args = ?process.args, "Starting init");

        let spec = ProcessSpec::new(process, &state.config);
        barrier::release(
            &self.runtime.paths.exec_fifo(self.id.as_str()),
            &spec,
            self.runtime.timeout,
        )
        .await?;

        state.set_running();
        self.store.save(state)?;
        self.publish(RuntimeEvent::ContainerStarted {
            id: self.id.to_string(),
            pid,
            timestamp: now(),
        });

        Ok(ProcessHandle::new(pid, Some(start_time)))
    }

    async fn join(&self, state: &ContainerState, mut process: Process) -> HutchResult<ProcessHandle> {
        let init_pid = state
            .init_pid
            .ok_or_else(|| HutchError::internal("running container without init pid"))?;

        // Join every namespace the container has, through the init.
        let namespaces = state
            .config
            .namespaces
            .iter()
            .map(|ns| Namespace::join(ns.ns_type, namespace::proc_path(init_pid, ns.ns_type)))
            .collect();

        // Streams are bound on the host, before any namespace is entered.
        let stdio = HelperStdio {
            stdin: std::mem::take(&mut process.stdin),
            stdout: std::mem::take(&mut process.stdout),
            stderr: std::mem::take(&mut process.stderr),
        };

        tracing::info!(container_id = %self.id, args = ?process.args, "Running process");

        let request = InitMessage::Join(JoinRequest {
            namespaces,
            process: ProcessSpec::new(process, &state.config),
        });

        let cgroup = self.cgroup(state)?;
        // Users and groups are mapped already; nothing new is created.
        let mut config = state.config.clone();
        config.uid_mappings.clear();
        config.gid_mappings.clear();

        let pid = self.handshake(request, stdio, &config, &cgroup).await?;
        self.publish(RuntimeEvent::ProcessStarted {
            id: self.id.to_string(),
            pid,
            timestamp: now(),
        });

        Ok(ProcessHandle::new(pid, procfs::start_time(pid)))
    }

    /// Send a signal to the init process, or to every process in the
    /// container's cgroup when `all` is set.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidState`] unless the container is running
    /// or paused, [`HutchError::Signal`] if the init vanished.
    pub async fn signal(&self, signal: i32, all: bool) -> HutchResult<()> {
        self.signal_inner(signal, all)
            .await
            .in_operation(self.id.as_str(), Operation::Signal)
    }

    async fn signal_inner(&self, signal: i32, all: bool) -> HutchResult<()> {
        if !(1..=libc::SIGRTMAX()).contains(&signal) {
            return Err(HutchError::invalid_config(format!("invalid signal {signal}")));
        }

        let mut lock = self.lock(LockMode::Exclusive).await?;
        let state = self.reconciled_state(&mut lock).await?;
        if !state.status.can_signal() {
            return Err(self.invalid_state(state.status, "running or paused"));
        }

        if all {
            let pids = self.cgroup(&state)?.pids()?;
            tracing::info!(container_id = %self.id, signal, count = pids.len(), "Signalling all processes");
            for pid in pids {
                match kill(pid, signal) {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                    Err(e) => {
                        return Err(HutchError::Signal {
                            signal,
                            pid,
                            message: e.to_string(),
                        });
                    }
                }
            }
            return Ok(());
        }

        let pid = state
            .init_pid
            .ok_or_else(|| HutchError::internal("running container without init pid"))?;
        tracing::info!(container_id = %self.id, signal, pid, "Signalling init");
        kill(pid, signal).map_err(|e| HutchError::Signal {
            signal,
            pid,
            message: e.to_string(),
        })
    }

    /// Freeze every process of a running container.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidState`] unless the container is running.
    pub async fn pause(&self) -> HutchResult<()> {
        async {
            let mut lock = self.lock(LockMode::Exclusive).await?;
            let mut state = self.reconciled_state(&mut lock).await?;
            if !state.status.can_pause() {
                return Err(self.invalid_state(state.status, "running"));
            }

            self.cgroup(&state)?.freeze()?;
            state.set_paused();
            self.store.save(&state)?;

            tracing::info!(container_id = %self.id, "Container paused");
            self.publish(RuntimeEvent::ContainerPaused {
                id: self.id.to_string(),
                timestamp: now(),
            });
            Ok::<_, HutchError>(())
        }
        .await
        .in_operation(self.id.as_str(), Operation::Pause)
    }

    /// Thaw a paused container.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidState`] unless the container is paused.
    pub async fn resume(&self) -> HutchResult<()> {
        async {
            let mut lock = self.lock(LockMode::Exclusive).await?;
            let mut state = self.reconciled_state(&mut lock).await?;
            if !state.status.can_resume() {
                return Err(self.invalid_state(state.status, "paused"));
            }

            self.cgroup(&state)?.thaw()?;
            state.set_running();
            self.store.save(&state)?;

            tracing::info!(container_id = %self.id, "Container resumed");
            self.publish(RuntimeEvent::ContainerResumed {
                id: self.id.to_string(),
                timestamp: now(),
            });
            Ok::<_, HutchError>(())
        }
        .await
        .in_operation(self.id.as_str(), Operation::Resume)
    }

    /// Apply new resource limits. Status and init pid are unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidConfig`] if anything outside
    /// `cgroup.resources` differs, [`HutchError::InvalidState`] for a stopped
    /// container.
    pub async fn set(&self, config: ContainerConfig) -> HutchResult<()> {
        async {
            config.validate()?;

            let mut lock = self.lock(LockMode::Exclusive).await?;
            let mut state = self.reconciled_state(&mut lock).await?;
            if state.status.is_stopped() {
                return Err(self.invalid_state(state.status, "created, running or paused"));
            }
            state.config.ensure_only_resources_differ(&config)?;

            self.cgroup(&state)?.set(&config.cgroup.resources)?;
            state.config.cgroup.resources = config.cgroup.resources;
            self.store.save(&state)?;

            tracing::info!(container_id = %self.id, "Resources updated");
            self.publish(RuntimeEvent::ContainerUpdated {
                id: self.id.to_string(),
                timestamp: now(),
            });
            Ok::<_, HutchError>(())
        }
        .await
        .in_operation(self.id.as_str(), Operation::Set)
    }

    /// Current status, reconciled with the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or the lock not taken.
    pub async fn status(&self) -> HutchResult<ContainerStatus> {
        Ok(self.state_with(Operation::Status).await?.status)
    }

    /// Full state snapshot, reconciled with the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or the lock not taken.
    pub async fn state(&self) -> HutchResult<ContainerState> {
        self.state_with(Operation::Status).await
    }

    async fn state_with(&self, operation: Operation) -> HutchResult<ContainerState> {
        async {
            let mut lock = self.lock(LockMode::Shared).await?;
            let state = self.reconciled_state(&mut lock).await?;
            Ok::<_, HutchError>(state)
        }
        .await
        .in_operation(self.id.as_str(), operation)
    }

    /// Pids of every process in the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be read.
    pub async fn processes(&self) -> HutchResult<Vec<u32>> {
        async {
            let _lock = self.lock(LockMode::Shared).await?;
            let state = self.store.load(self.id.as_str())?;
            let pids = self.cgroup(&state)?.pids()?;
            Ok::<_, HutchError>(pids)
        }
        .await
        .in_operation(self.id.as_str(), Operation::Processes)
    }

    /// Resource usage snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be read.
    pub async fn stats(&self) -> HutchResult<Stats> {
        async {
            let _lock = self.lock(LockMode::Shared).await?;
            let state = self.store.load(self.id.as_str())?;
            let cgroup = self.cgroup(&state)?.stats()?;
            let network = live_init(&state).map(network_stats).unwrap_or_default();
            Ok::<_, HutchError>(Stats { cgroup, network })
        }
        .await
        .in_operation(self.id.as_str(), Operation::Stats)
    }

    /// Remove the cgroup and the state directory of a stopped container.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidState`] unless the container is stopped.
    pub async fn destroy(&self) -> HutchResult<()> {
        async {
            let mut lock = self.lock(LockMode::Exclusive).await?;
            let state = self.reconciled_state(&mut lock).await?;
            if !state.status.can_destroy() {
                return Err(self.invalid_state(state.status, "stopped"));
            }

            self.cgroup(&state)?.destroy()?;
            self.store.remove(self.id.as_str())?;
            drop(lock);

            tracing::info!(container_id = %self.id, "Container destroyed");
            self.publish(RuntimeEvent::ContainerDestroyed {
                id: self.id.to_string(),
                timestamp: now(),
            });
            Ok::<_, HutchError>(())
        }
        .await
        .in_operation(self.id.as_str(), Operation::Destroy)
    }

    /// Checkpoint the container into `options.images_directory`.
    ///
    /// Without `leave_running` the container is stopped afterwards. With
    /// `pre_dump` set this is [`Container::pre_dump`].
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidState`] unless running or paused,
    /// [`HutchError::CheckpointFailed`] with CRIU's diagnostic otherwise.
    pub async fn checkpoint(&self, options: &CriuOptions) -> HutchResult<()> {
        let operation = if options.pre_dump {
            Operation::PreDump
        } else {
            Operation::Checkpoint
        };
        self.checkpoint_inner(options.clone())
            .await
            .in_operation(self.id.as_str(), operation)
    }

    /// Iterative pre-dump; the container keeps running and its status is
    /// never changed.
    ///
    /// # Errors
    ///
    /// As [`Container::checkpoint`].
    pub async fn pre_dump(&self, options: &CriuOptions) -> HutchResult<()> {
        let options = CriuOptions {
            pre_dump: true,
            ..options.clone()
        };
        self.checkpoint_inner(options)
            .await
            .in_operation(self.id.as_str(), Operation::PreDump)
    }

    async fn checkpoint_inner(&self, options: CriuOptions) -> HutchResult<()> {
        options.validate()?;

        let mut lock = self.lock(LockMode::Exclusive).await?;
        let mut state = self.reconciled_state(&mut lock).await?;
        if !state.status.can_checkpoint() {
            return Err(self.invalid_state(state.status, "running or paused"));
        }
        let pid = state
            .init_pid
            .ok_or_else(|| HutchError::internal("running container without init pid"))?;

        let pre_dump = options.pre_dump;
        let stops = !pre_dump && !options.leave_running;
        let mut request = CriuRequest::checkpoint(pid, options);
        describe_container(&mut request, &state.config);

        tracing::info!(
            container_id = %self.id,
            pid,
            action = %request.action,
            images = %request.options.images_directory.display(),
            "Checkpointing container"
        );
        self.run_criu(request).await?;

        if stops {
            state.set_stopped();
            self.store.save(&state)?;
        }

        tracing::info!(container_id = %self.id, pre_dump, "Checkpoint written");
        self.publish(RuntimeEvent::ContainerCheckpointed {
            id: self.id.to_string(),
            pre_dump,
            timestamp: now(),
        });
        if stops {
            self.publish(RuntimeEvent::ContainerStopped {
                id: self.id.to_string(),
                timestamp: now(),
            });
        }
        Ok(())
    }

    async fn run_criu(&self, request: CriuRequest) -> HutchResult<checkpoint::CriuOutcome> {
        let criu = Arc::clone(&self.runtime.criu);
        let action = request.action;
        tokio::task::spawn_blocking(move || checkpoint::run(criu.as_ref(), &request))
            .await
            .map_err(|e| action.failure(format!("criu task failed: {e}")))?
    }

    /// Restore a checkpointed container as `id`, running.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::AlreadyExists`] if the ID is taken,
    /// [`HutchError::InvalidConfig`] for invalid input and
    /// [`HutchError::RestoreFailed`] for everything that goes wrong after
    /// that. Everything allocated is released before an error is returned.
    pub async fn restore(
        id: &str,
        config: ContainerConfig,
        options: &CriuOptions,
        runtime: RuntimeConfig,
    ) -> HutchResult<Self> {
        Self::restore_inner(id, config, options, runtime)
            .await
            .in_operation(id, Operation::Restore)
    }

    async fn restore_inner(
        id: &str,
        config: ContainerConfig,
        options: &CriuOptions,
        runtime: RuntimeConfig,
    ) -> HutchResult<Self> {
        let id = ContainerId::new(id)?;
        config.validate()?;
        options.validate()?;

        tracing::info!(
            container_id = %id,
            images = %options.images_directory.display(),
            "Restoring container"
        );

        let container = Self::new(id, runtime);
        let lock = container.store.allocate(&container.id)?;

        let cgroup = match container
            .runtime
            .cgroups
            .create(container.id.as_str(), &config.cgroup)
        {
            Ok(cgroup) => cgroup,
            Err(e) => {
                container.discard(None);
                return Err(restore_failure(e));
            }
        };

        match container.restore_into(config, options, &cgroup).await {
            Ok(pid) => {
                drop(lock);
                tracing::info!(container_id = %container.id, pid, "Container restored");
                container.publish(RuntimeEvent::ContainerRestored {
                    id: container.id.to_string(),
                    pid,
                    timestamp: now(),
                });
                Ok(container)
            }
            Err(e) => {
                container.discard(Some(cgroup.as_ref()));
                Err(restore_failure(e))
            }
        }
    }

    async fn restore_into(
        &self,
        config: ContainerConfig,
        options: &CriuOptions,
        cgroup: &Arc<dyn CgroupManager>,
    ) -> HutchResult<u32> {
        check_host_compatibility(
            config.namespaces.iter().map(|ns| ns.ns_type),
            &options.images_directory,
        )?;

        let mut request = CriuRequest::restore(self.root().join(RESTORE_PIDFILE), options.clone());
        request.cgroup_root = Some(format!(
            "/{}",
            config.cgroup.relative_path(self.id.as_str()).display()
        ));
        describe_container(&mut request, &config);

        let outcome = self.run_criu(request).await?;
        let pid = outcome.pid.ok_or_else(|| HutchError::RestoreFailed {
            diagnostic: "restore reported no init pid".to_string(),
        })?;

        if let Err(e) = self.adopt_restored(config, cgroup.as_ref(), pid) {
            tracing::warn!(container_id = %self.id, pid, error = %e, "Killing restored process");
            let _ = tokio::task::spawn_blocking(move || kill_and_reap(pid)).await;
            return Err(e);
        }
        Ok(pid)
    }

    /// Put the restored init in its cgroup and persist it as running.
    fn adopt_restored(
        &self,
        config: ContainerConfig,
        cgroup: &dyn CgroupManager,
        pid: u32,
    ) -> HutchResult<()> {
        cgroup.apply(pid)?;
        cgroup.set(&config.cgroup.resources)?;
        let start_time = procfs::start_time(pid).ok_or_else(|| HutchError::RestoreFailed {
            diagnostic: format!("restored init {pid} exited"),
        })?;

        let mut state =
            ContainerState::created(self.id.clone(), config, cgroup.path(), pid, start_time);
        state.set_restored(pid, start_time);
        self.store.save(&state)
    }
}

/// The init pid, if that process still runs and was not recycled.
fn live_init(state: &ContainerState) -> Option<u32> {
    let pid = state.init_pid?;
    let start_time = state.init_start_time?;
    ProcStat::read(pid)
        .filter(|stat| stat.is_alive() && stat.start_time == start_time)
        .map(|_| pid)
}

/// Rootfs and bind mounts of the container, as CRIU needs them.
fn describe_container(request: &mut CriuRequest, config: &ContainerConfig) {
    if config.creates_namespace(NamespaceType::Mount) {
        request.rootfs.clone_from(&config.rootfs);
    }
    request.external_mounts = config
        .mounts
        .iter()
        .filter(|mount| mount.is_bind())
        .filter_map(|mount| Some((mount.destination.clone(), mount.source.clone()?)))
        .collect();
}

fn restore_failure(err: HutchError) -> HutchError {
    match err {
        HutchError::RestoreFailed { .. } => err,
        other => HutchError::RestoreFailed {
            diagnostic: other.to_string(),
        },
    }
}
