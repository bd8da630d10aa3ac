#![allow(unsafe_code)]
//! Processes run inside a container.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use hutch_common::{HutchError, HutchResult};
use hutch_config::{Capabilities, ContainerConfig, Rlimit};
use serde::{Deserialize, Serialize};

use crate::runtime::procfs::ProcStat;

/// How often a process that is not our child is polled for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a standard stream of a process goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioTarget {
    /// Keep the stream of the process that starts it.
    #[default]
    Inherit,
    /// `/dev/null`.
    Null,
    /// A file, created if missing and appended to for output streams.
    File(PathBuf),
}

impl StdioTarget {
    /// Open the target for use as stdin (`output == false`) or an output
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(&self, output: bool) -> std::io::Result<Stdio> {
        Ok(match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::File(path) => Stdio::from(open_file(path, output)?),
        })
    }
}

fn open_file(path: &PathBuf, output: bool) -> std::io::Result<File> {
    if output {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::open(path)
    }
}

/// Identity a process runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
    /// Supplementary group IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// A request to run code inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Program and arguments. The program is looked up in `PATH` from `env`.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Identity to switch to before exec; unchanged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Standard input.
    #[serde(default)]
    pub stdin: StdioTarget,
    /// Standard output.
    #[serde(default)]
    pub stdout: StdioTarget,
    /// Standard error.
    #[serde(default)]
    pub stderr: StdioTarget,
    /// Whether this is the container's init process.
    #[serde(default)]
    pub init: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

impl Process {
    /// A non-init process.
    #[must_use]
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
            cwd: default_cwd(),
            user: None,
            stdin: StdioTarget::Inherit,
            stdout: StdioTarget::Inherit,
            stderr: StdioTarget::Inherit,
            init: false,
        }
    }

    /// The container's init process.
    #[must_use]
    pub fn init<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            init: true,
            ..Self::new(args)
        }
    }

    /// Add or replace an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        let prefix = format!("{key}=");
        self.env.retain(|entry| !entry.starts_with(&prefix));
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Run as the given user.
    #[must_use]
    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    /// Set standard input.
    #[must_use]
    pub fn with_stdin(mut self, target: StdioTarget) -> Self {
        self.stdin = target;
        self
    }

    /// Set standard output.
    #[must_use]
    pub fn with_stdout(mut self, target: StdioTarget) -> Self {
        self.stdout = target;
        self
    }

    /// Set standard error.
    #[must_use]
    pub fn with_stderr(mut self, target: StdioTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Environment entries split into key and value. Entries without `=`
    /// are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }

    /// Check the request is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`HutchError::InvalidConfig`] for empty args, a relative
    /// working directory or malformed environment entries.
    pub fn validate(&self) -> HutchResult<()> {
        if self.args.first().is_none_or(String::is_empty) {
            return Err(HutchError::invalid_config("process args must not be empty"));
        }
        if !self.cwd.is_absolute() {
            return Err(HutchError::invalid_config(format!(
                "process cwd must be absolute: {}",
                self.cwd.display()
            )));
        }
        if let Some(entry) = self
            .env
            .iter()
            .find(|entry| entry.split_once('=').is_none_or(|(key, _)| key.is_empty()))
        {
            return Err(HutchError::invalid_config(format!(
                "malformed environment entry: {entry}"
            )));
        }
        Ok(())
    }
}

/// Everything the helper needs to exec a process: the request plus the
/// container's security settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// The process to exec.
    pub process: Process,
    /// Capability sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Resource limits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
    /// Set `PR_SET_NO_NEW_PRIVS`.
    #[serde(default)]
    pub no_new_privileges: bool,
}

impl ProcessSpec {
    /// Combine a process with a container's security settings.
    #[must_use]
    pub fn new(process: Process, config: &ContainerConfig) -> Self {
        Self {
            process,
            capabilities: config.capabilities.clone(),
            rlimits: config.rlimits.clone(),
            no_new_privileges: config.no_new_privileges,
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// Gone, but not our child, so the status was not observable.
    Unknown,
}

impl ExitStatus {
    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            Self::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Unknown
        }
    }

    /// Shell-style exit code (`128 + signal` for signals).
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signal) => Some(128 + *signal),
            Self::Unknown => None,
        }
    }

    /// Exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => f.write_str("exited"),
        }
    }
}

/// A process started in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
    start_time: Option<u64>,
}

impl ProcessHandle {
    pub(crate) const fn new(pid: u32, start_time: Option<u64>) -> Self {
        Self { pid, start_time }
    }

    /// Host pid.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the process to exit.
    ///
    /// Processes started by this engine instance are reaped and report their
    /// status. Others are polled until they disappear and report
    /// [`ExitStatus::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails for a reason other than the process
    /// not being our child.
    pub async fn wait(&self) -> HutchResult<ExitStatus> {
        let handle = *self;
        tokio::task::spawn_blocking(move || handle.wait_blocking())
            .await
            .map_err(|e| HutchError::internal(format!("wait task failed: {e}")))?
    }

    fn wait_blocking(self) -> HutchResult<ExitStatus> {
        let pid = libc::pid_t::try_from(self.pid)
            .map_err(|_| HutchError::internal(format!("pid out of range: {}", self.pid)))?;

        loop {
            let mut status: libc::c_int = 0;
            if unsafe { libc::waitpid(pid, &raw mut status, 0) } == pid {
                let exit = ExitStatus::from_wait_status(status);
                tracing::debug!(pid = self.pid, %exit, "Process exited");
                return Ok(exit);
            }

            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::ECHILD) => return Ok(self.poll_exit()),
                _ => return Err(err.into()),
            }
        }
    }

    fn poll_exit(self) -> ExitStatus {
        while ProcStat::read(self.pid)
            .is_some_and(|stat| stat.is_alive() && self.start_time.is_none_or(|t| t == stat.start_time))
        {
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
        ExitStatus::Unknown
    }
}

/// Send `signal` to `pid`.
pub(crate) fn kill(pid: u32, signal: i32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// SIGKILL `pid` and reap it if it is our child.
pub(crate) fn kill_and_reap(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, std::ptr::null_mut(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_replaces_env() {
        let process = Process::new(["/bin/sh", "-c", "true"])
            .with_env("PATH", "/bin")
            .with_env("TERM", "xterm")
            .with_cwd("/tmp");

        assert_eq!(process.env, vec!["PATH=/bin", "TERM=xterm"]);
        assert_eq!(process.cwd, PathBuf::from("/tmp"));
        assert!(!process.init);
        assert!(Process::init(["/bin/true"]).init);
    }

    #[test]
    fn validation() {
        assert!(Process::new(["/bin/true"]).validate().is_ok());
        assert!(Process::new(Vec::<String>::new()).validate().is_err());
        assert!(Process::new(["/bin/true"]).with_cwd("tmp").validate().is_err());

        let mut process = Process::new(["/bin/true"]);
        process.env.push("NOEQUALS".to_string());
        assert!(process.validate().is_err());
    }

    #[test]
    fn process_defaults_from_json() {
        let process: Process = serde_json::from_str(r#"{"args":["/bin/true"]}"#).unwrap();
        assert_eq!(process.cwd, PathBuf::from("/"));
        assert_eq!(process.stdout, StdioTarget::Inherit);
        assert!(process.env.is_empty());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        assert_eq!(ExitStatus::Signaled(9).code(), Some(137));
        assert_eq!(ExitStatus::Unknown.code(), None);
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Signaled(15).success());
    }

    #[tokio::test]
    async fn wait_reaps_own_child() {
        let child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let handle = ProcessHandle::new(child.id(), None);
        assert_eq!(handle.wait().await.unwrap(), ExitStatus::Exited(7));
    }

    #[tokio::test]
    async fn wait_on_foreign_exited_pid_is_unknown() {
        // pid_max is well below this, so the pid never exists.
        let handle = ProcessHandle::new(4_194_305, None);
        assert_eq!(handle.wait().await.unwrap(), ExitStatus::Unknown);
    }
}
