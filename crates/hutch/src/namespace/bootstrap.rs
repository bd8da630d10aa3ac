#![allow(unsafe_code)]
//! Engine side of the init handshake.
//!
//! Spawns `<init_binary> init` with its end of a socketpair on fd 3, drives
//! the exchange and, on any failure, kills every process it started.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use hutch_common::{HutchError, HutchResult};
use hutch_config::{IdMapping, Resources};
use once_cell::sync::Lazy;

use super::write_id_maps;
use crate::cgroup::CgroupManager;
use crate::exec::StdioTarget;
use crate::exec::process::kill_and_reap;
use crate::exec::channel::{INIT_LOG_ENV, INIT_PIPE_ENV, INIT_PIPE_FD, InitChannel, InitMessage};

/// Become a child subreaper once per engine process, so an init whose
/// intermediate parent exited is reparented to us and stays reapable.
static SUBREAPER: Lazy<bool> = Lazy::new(|| {
    let ok = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } == 0;
    if !ok {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "Could not become child subreaper"
        );
    }
    ok
});

/// Standard streams of the helper.
#[derive(Debug, Clone, Default)]
pub struct HelperStdio {
    /// stdin.
    pub stdin: StdioTarget,
    /// stdout.
    pub stdout: StdioTarget,
    /// stderr.
    pub stderr: StdioTarget,
}

/// One bootstrap or join exchange.
#[derive(Debug)]
pub struct Handshake<'a> {
    /// Container the helper works for, for logs.
    pub container_id: &'a str,
    /// Executable run as `<init_binary> init`.
    pub init_binary: PathBuf,
    /// Helper log file.
    pub init_log: PathBuf,
    /// Helper stdio.
    pub stdio: HelperStdio,
    /// First message: `Bootstrap` or `Join`.
    pub request: InitMessage,
    /// Written on `IdMapRequest`.
    pub uid_mappings: &'a [IdMapping],
    /// Written on `IdMapRequest`.
    pub gid_mappings: &'a [IdMapping],
    /// Applied before `Proceed`.
    pub resources: &'a Resources,
    /// Bound on the whole exchange.
    pub timeout: Duration,
}

impl Handshake<'_> {
    /// Run the exchange. Returns the host pid of the process that execs
    /// user code.
    ///
    /// # Errors
    ///
    /// Any failure after the helper was spawned kills it (and the init it
    /// reported) before returning.
    pub fn run(&self, cgroup: &dyn CgroupManager) -> HutchResult<u32> {
        Lazy::force(&SUBREAPER);

        let (engine_end, helper_end) = UnixStream::pair()?;
        let mut helper = self.spawn(helper_end)?;
        let helper_pid = helper.id();
        tracing::debug!(container_id = self.container_id, helper_pid, "Spawned bootstrap helper");

        let mut init_pid = None;
        let result = self.exchange(engine_end, helper_pid, cgroup, &mut init_pid);

        match result {
            Ok(pid) => {
                if pid != helper_pid {
                    // Intermediate of a PID namespace fork.
                    let _ = helper.wait();
                }
                Ok(pid)
            }
            Err(e) => {
                tracing::warn!(container_id = self.container_id, error = %e, "Bootstrap failed, killing helper");
                let _ = helper.kill();
                let _ = helper.wait();
                if let Some(pid) = init_pid.filter(|pid| *pid != helper_pid) {
                    kill_and_reap(pid);
                }
                Err(e)
            }
        }
    }

    fn spawn(&self, helper_end: UnixStream) -> HutchResult<Child> {
        let mut command = Command::new(&self.init_binary);
        command
            .arg("init")
            .env(INIT_PIPE_ENV, INIT_PIPE_FD.to_string())
            .env(INIT_LOG_ENV, &self.init_log)
            .stdin(self.open(&self.stdio.stdin, false)?)
            .stdout(self.open(&self.stdio.stdout, true)?)
            .stderr(self.open(&self.stdio.stderr, true)?);

        let fd = helper_end.as_raw_fd();
        // SAFETY: dup2 and fcntl are async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                if fd == INIT_PIPE_FD {
                    // dup2 onto itself keeps FD_CLOEXEC.
                    if libc::fcntl(fd, libc::F_SETFD, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, INIT_PIPE_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            HutchError::bootstrap(format!(
                "spawning {} init: {e}",
                self.init_binary.display()
            ))
        })?;
        // Only the helper may hold this end, or end-of-stream never arrives.
        drop(helper_end);
        Ok(child)
    }

    fn open(&self, target: &StdioTarget, output: bool) -> HutchResult<Stdio> {
        target.open(output).map_err(|e| {
            HutchError::bootstrap(format!("opening helper stdio {target:?}: {e}"))
        })
    }

    fn exchange(
        &self,
        engine_end: UnixStream,
        helper_pid: u32,
        cgroup: &dyn CgroupManager,
        init_pid: &mut Option<u32>,
    ) -> HutchResult<u32> {
        let mut channel = InitChannel::new(engine_end)?;
        channel.set_timeout(Some(self.timeout))?;

        cgroup.apply(helper_pid)?;
        channel.send(&self.request)?;

        let mut proceeded = false;
        loop {
            match channel.recv()? {
                None if proceeded => break,
                None => {
                    return Err(HutchError::bootstrap(
                        "helper exited before the handshake completed",
                    ));
                }
                Some(InitMessage::IdMapRequest) if init_pid.is_none() => {
                    write_id_maps(helper_pid, self.uid_mappings, self.gid_mappings)?;
                    channel.send(&InitMessage::IdMapApplied)?;
                }
                Some(InitMessage::Ready { pid }) if init_pid.is_none() => {
                    *init_pid = Some(pid);
                    tracing::debug!(container_id = self.container_id, pid, "Helper ready");
                    cgroup.set(self.resources)?;
                    channel.send(&InitMessage::Proceed)?;
                    proceeded = true;
                }
                Some(InitMessage::Error { cause, message }) => {
                    return Err(cause.into_error(message));
                }
                Some(other) => {
                    return Err(HutchError::bootstrap(format!(
                        "unexpected {} message from helper",
                        other.name()
                    )));
                }
            }
        }

        init_pid.ok_or_else(|| HutchError::bootstrap("helper never reported ready"))
    }
}
