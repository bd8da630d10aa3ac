#![allow(unsafe_code)]
//! The bootstrap helper, run as `hutch init`.
//!
//! Single-threaded and synchronous: no tokio runtime is ever started here.
//! The helper receives a request on the init channel, builds the namespaces
//! and the mount tree, reports readiness and then either blocks at the start
//! barrier (new container) or execs the requested process (join).

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Mutex;

use hutch_common::{HutchError, HutchResult};
use hutch_config::{Namespace, NamespaceType};
use tracing_subscriber::EnvFilter;

use super::barrier;
use super::channel::{
    BootstrapRequest, ErrorCause, INIT_LOG_ENV, InitChannel, InitMessage, JoinRequest,
};
use super::process::{ProcessSpec, User};
use crate::filesystem::setup_rootfs;
use crate::namespace;
use crate::security;

/// Exit code of the init when its program cannot be executed.
pub const EXEC_FAILED: i32 = 127;

#[derive(Debug)]
struct InitFailure {
    cause: ErrorCause,
    message: String,
}

impl InitFailure {
    fn protocol(message: impl Into<String>) -> Self {
        Self {
            cause: ErrorCause::Protocol,
            message: message.into(),
        }
    }
}

impl fmt::Display for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.cause, self.message)
    }
}

/// Tag a failure with the step it happened in.
trait Cause<T> {
    fn cause(self, cause: ErrorCause) -> Result<T, InitFailure>;
}

impl<T> Cause<T> for HutchResult<T> {
    fn cause(self, cause: ErrorCause) -> Result<T, InitFailure> {
        self.map_err(|e| {
            let message = match e {
                HutchError::Resource { message, .. }
                | HutchError::InvalidConfig { message }
                | HutchError::BootstrapFailed { message }
                | HutchError::Internal { message } => message,
                other => other.to_string(),
            };
            InitFailure { cause, message }
        })
    }
}

impl<T> Cause<T> for std::io::Result<T> {
    fn cause(self, cause: ErrorCause) -> Result<T, InitFailure> {
        self.map_err(|e| InitFailure {
            cause,
            message: e.to_string(),
        })
    }
}

/// Entry point of `hutch init`. Returns the exit code; on success it does
/// not return at all.
#[must_use]
pub fn init_main() -> i32 {
    init_logging();

    let mut channel = match InitChannel::from_env() {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "No init channel");
            eprintln!("hutch init: {e}");
            return 1;
        }
    };

    let failure = match channel.recv() {
        Ok(Some(InitMessage::Bootstrap(request))) => match prepare_container(&mut channel, &request)
        {
            Ok(fifo) => {
                // End-of-stream tells the engine setup succeeded.
                drop(channel);
                return start_init(fifo);
            }
            Err(failure) => failure,
        },
        Ok(Some(InitMessage::Join(request))) => match join_container(&mut channel, &request) {
            Ok(()) => exec_process(&request.process),
            Err(failure) => failure,
        },
        Ok(Some(other)) => InitFailure::protocol(format!("unexpected {} message", other.name())),
        Ok(None) => {
            tracing::warn!("Engine closed the init channel");
            return 1;
        }
        Err(e) => InitFailure::protocol(e.to_string()),
    };

    tracing::error!(%failure, "Bootstrap failed");
    if let Err(e) = channel.send(&InitMessage::Error {
        cause: failure.cause,
        message: failure.message,
    }) {
        tracing::error!(error = %e, "Could not report failure");
    }
    1
}

fn init_logging() {
    let Some(path) = std::env::var_os(INIT_LOG_ENV) else {
        return;
    };
    let Ok(file) = OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hutch=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init();
}

fn prepare_container(
    channel: &mut InitChannel,
    request: &BootstrapRequest,
) -> Result<File, InitFailure> {
    let config = &request.config;
    tracing::info!(pid = std::process::id(), "Bootstrapping container");

    // Opened now: after pivot_root the host path is gone.
    let fifo = barrier::open_reader(&request.fifo).cause(ErrorCause::Process)?;

    enter_namespaces(channel, &config.namespaces)?;
    let pid = fork_into_pid_namespace(&config.namespaces)?;

    if config.creates_namespace(NamespaceType::Mount) {
        if let Some(rootfs) = &config.rootfs {
            setup_rootfs(config, rootfs).cause(ErrorCause::Mount)?;
        }
    }

    if config.creates_namespace(NamespaceType::Uts) {
        if let Some(hostname) = &config.hostname {
            set_hostname(hostname).cause(ErrorCause::Hostname)?;
        }
    }

    report_ready(channel, pid)?;
    Ok(fifo)
}

fn join_container(channel: &mut InitChannel, request: &JoinRequest) -> Result<(), InitFailure> {
    tracing::info!(pid = std::process::id(), "Joining container");

    if let Some(ns) = request.namespaces.iter().find(|ns| ns.path.is_none()) {
        return Err(InitFailure {
            cause: ErrorCause::InvalidConfig,
            message: format!("{} namespace to join has no path", ns.ns_type),
        });
    }

    enter_namespaces(channel, &request.namespaces)?;
    let pid = fork_into_pid_namespace(&request.namespaces)?;
    report_ready(channel, pid)
}

/// User namespace first, then joins by path, then everything else unshared.
fn enter_namespaces(channel: &mut InitChannel, namespaces: &[Namespace]) -> Result<(), InitFailure> {
    let find = |ns_type: NamespaceType| namespaces.iter().find(|ns| ns.ns_type == ns_type);

    if let Some(user) = find(NamespaceType::User) {
        match &user.path {
            Some(path) => namespace::join(NamespaceType::User, path).cause(ErrorCause::Namespace)?,
            None => {
                namespace::unshare(namespace::unshare_flags([NamespaceType::User]))
                    .cause(ErrorCause::Namespace)?;
                channel
                    .send(&InitMessage::IdMapRequest)
                    .cause(ErrorCause::Protocol)?;
                expect(channel, &InitMessage::IdMapApplied)?;
            }
        }
        become_root().cause(ErrorCause::IdMapping)?;
    }

    for ns_type in NamespaceType::ALL {
        if ns_type == NamespaceType::User {
            continue;
        }
        if let Some(Namespace {
            path: Some(path), ..
        }) = find(ns_type)
        {
            namespace::join(ns_type, path).cause(ErrorCause::Namespace)?;
        }
    }

    let fresh = namespaces
        .iter()
        .filter(|ns| ns.path.is_none() && ns.ns_type != NamespaceType::User)
        .map(|ns| ns.ns_type);
    namespace::unshare(namespace::unshare_flags(fresh)).cause(ErrorCause::Namespace)
}

/// Fork when a PID namespace is involved: only children enter it. The
/// parent hands the child its host pid and exits; the child carries on.
/// Returns the host pid of the process that continues.
fn fork_into_pid_namespace(namespaces: &[Namespace]) -> Result<u32, InitFailure> {
    if !namespaces.iter().any(|ns| ns.ns_type == NamespaceType::Pid) {
        return Ok(std::process::id());
    }

    let (mut parent_end, mut child_end) = UnixStream::pair().cause(ErrorCause::Namespace)?;

    match unsafe { libc::fork() } {
        -1 => Err(InitFailure {
            cause: ErrorCause::Namespace,
            message: format!("fork: {}", std::io::Error::last_os_error()),
        }),
        0 => {
            drop(parent_end);
            let mut pid = [0u8; 4];
            child_end
                .read_exact(&mut pid)
                .cause(ErrorCause::Namespace)?;
            Ok(u32::from_le_bytes(pid))
        }
        child => {
            drop(child_end);
            let code = i32::from(parent_end.write_all(&child.unsigned_abs().to_le_bytes()).is_err());
            unsafe { libc::_exit(code) }
        }
    }
}

fn report_ready(channel: &mut InitChannel, pid: u32) -> Result<(), InitFailure> {
    channel
        .send(&InitMessage::Ready { pid })
        .cause(ErrorCause::Protocol)?;
    expect(channel, &InitMessage::Proceed)?;
    tracing::debug!(pid, "Proceeding");
    Ok(())
}

fn expect(channel: &mut InitChannel, wanted: &InitMessage) -> Result<(), InitFailure> {
    match channel.recv() {
        Ok(Some(message)) if message == *wanted => Ok(()),
        Ok(Some(message)) => Err(InitFailure::protocol(format!(
            "expected {}, got {}",
            wanted.name(),
            message.name()
        ))),
        Ok(None) => Err(InitFailure::protocol(format!(
            "channel closed while waiting for {}",
            wanted.name()
        ))),
        Err(e) => Err(InitFailure::protocol(e.to_string())),
    }
}

fn start_init(fifo: File) -> i32 {
    let spec = match barrier::wait(fifo) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!(error = %e, "Start barrier failed");
            return 1;
        }
    };

    let failure = exec_process(&spec);
    tracing::error!(%failure, "Init exec failed");
    eprintln!("hutch init: {}", failure.message);
    EXEC_FAILED
}

/// Exec the process. Only returns on failure.
fn exec_process(spec: &ProcessSpec) -> InitFailure {
    match prepare_exec(spec) {
        Ok(mut command) => {
            tracing::info!(args = ?spec.process.args, "Executing process");
            let err = command.exec();
            InitFailure {
                cause: ErrorCause::Process,
                message: format!("exec {:?}: {err}", spec.process.args),
            }
        }
        Err(failure) => failure,
    }
}

fn prepare_exec(spec: &ProcessSpec) -> Result<Command, InitFailure> {
    let process = &spec.process;
    let Some((program, args)) = process.args.split_first() else {
        return Err(InitFailure {
            cause: ErrorCause::InvalidConfig,
            message: "process args must not be empty".to_string(),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(process.env_pairs())
        .current_dir(&process.cwd)
        .stdin(process.stdin.open(false).cause(ErrorCause::Process)?)
        .stdout(process.stdout.open(true).cause(ErrorCause::Process)?)
        .stderr(process.stderr.open(true).cause(ErrorCause::Process)?);

    security::apply_rlimits(&spec.rlimits).cause(ErrorCause::Process)?;

    if let Some(capabilities) = &spec.capabilities {
        security::drop_bounding(capabilities).cause(ErrorCause::Process)?;
    }
    if let Some(user) = &process.user {
        if spec.capabilities.is_some() {
            security::set_keep_caps().cause(ErrorCause::Process)?;
        }
        set_user(user).cause(ErrorCause::Process)?;
    }
    if let Some(capabilities) = &spec.capabilities {
        security::apply_capabilities(capabilities).cause(ErrorCause::Process)?;
    }
    if spec.no_new_privileges {
        security::set_no_new_privs().cause(ErrorCause::Process)?;
    }

    Ok(command)
}

fn check(ret: libc::c_int, what: &str) -> std::io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        Err(std::io::Error::new(err.kind(), format!("{what}: {err}")))
    }
}

fn become_root() -> std::io::Result<()> {
    check(unsafe { libc::setresgid(0, 0, 0) }, "setresgid")?;
    check(unsafe { libc::setresuid(0, 0, 0) }, "setresuid")
}

fn set_user(user: &User) -> std::io::Result<()> {
    let denied = std::fs::read_to_string("/proc/self/setgroups").is_ok_and(|s| s.trim() == "deny");
    if !denied {
        let groups: &[libc::gid_t] = &user.additional_gids;
        let ret = unsafe { libc::setgroups(groups.len(), groups.as_ptr()) };
        // Without supplementary groups a refused setgroups changes nothing.
        if ret != 0 && !groups.is_empty() {
            check(ret, "setgroups")?;
        }
    }

    check(
        unsafe { libc::setresgid(user.gid, user.gid, user.gid) },
        "setresgid",
    )?;
    check(
        unsafe { libc::setresuid(user.uid, user.uid, user.uid) },
        "setresuid",
    )
}

fn set_hostname(hostname: &str) -> std::io::Result<()> {
    check(
        unsafe { libc::sethostname(hostname.as_ptr().cast(), hostname.len()) },
        "sethostname",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{Process, StdioTarget};
    use hutch_config::ContainerConfig;

    fn channel() -> (InitChannel, InitChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        (InitChannel::new(a).unwrap(), InitChannel::new(b).unwrap())
    }

    #[test]
    fn no_namespaces_is_a_noop() {
        let (mut helper, _engine) = channel();
        enter_namespaces(&mut helper, &[]).unwrap();
        assert_eq!(fork_into_pid_namespace(&[]).unwrap(), std::process::id());
    }

    #[test]
    fn join_requires_paths() {
        let (mut helper, _engine) = channel();
        let request = JoinRequest {
            namespaces: vec![Namespace::new(NamespaceType::Ipc)],
            process: ProcessSpec::new(Process::new(["/bin/true"]), &ContainerConfig::default()),
        };
        let failure = join_container(&mut helper, &request).unwrap_err();
        assert_eq!(failure.cause, ErrorCause::InvalidConfig);
    }

    #[test]
    fn ready_waits_for_proceed() {
        let (mut helper, mut engine) = channel();
        engine.send(&InitMessage::Proceed).unwrap();
        report_ready(&mut helper, 99).unwrap();
        assert_eq!(engine.recv().unwrap(), Some(InitMessage::Ready { pid: 99 }));
    }

    #[test]
    fn out_of_order_message_is_protocol_failure() {
        let (mut helper, mut engine) = channel();
        engine.send(&InitMessage::IdMapApplied).unwrap();
        let failure = report_ready(&mut helper, 1).unwrap_err();
        assert_eq!(failure.cause, ErrorCause::Protocol);
        assert!(failure.message.contains("expected proceed"));
    }

    #[test]
    fn missing_stdin_file_fails_preparation() {
        let process = Process::new(["/bin/true"])
            .with_stdin(StdioTarget::File("/definitely/not/here".into()));
        let spec = ProcessSpec::new(process, &ContainerConfig::default());
        let failure = prepare_exec(&spec).unwrap_err();
        assert_eq!(failure.cause, ErrorCause::Process);
    }

    #[test]
    fn resource_errors_keep_their_detail() {
        let result: HutchResult<()> = Err(HutchError::resource("namespaces", "setns uts: EPERM"));
        let failure = result.cause(ErrorCause::Namespace).unwrap_err();
        assert_eq!(failure.message, "setns uts: EPERM");
    }
}
