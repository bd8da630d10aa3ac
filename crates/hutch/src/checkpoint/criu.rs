#![allow(unsafe_code)]
//! The `criu` command-line driver.

use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hutch_common::HutchResult;

use super::{CriuAction, CriuOutcome, CriuRequest, CriuService, empty_ns_names};

/// Lines of the CRIU log reported on failure.
const LOG_TAIL_LINES: usize = 20;

/// Runs the `criu` executable.
#[derive(Debug, Clone)]
pub struct CriuBinary {
    path: PathBuf,
}

impl Default for CriuBinary {
    fn default() -> Self {
        Self::new("criu")
    }
}

impl CriuBinary {
    /// Use the executable at `path` (looked up in `PATH` if relative).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The executable.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn execute(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        let action = request.action;
        let options = &request.options;
        let work_dir = options.work_dir();

        for dir in [options.images_directory.as_path(), work_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| action.failure(format!("creating {}: {e}", dir.display())))?;
        }

        let args = to_args(request);
        tracing::debug!(criu = %self.path.display(), ?args, "Running criu");

        let mut command = Command::new(&self.path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(fd) = options.status_fd {
            // SAFETY: fcntl is async-signal-safe.
            unsafe {
                command.pre_exec(move || clear_cloexec(fd));
            }
        }

        let output = command
            .output()
            .map_err(|e| action.failure(format!("executing {}: {e}", self.path.display())))?;

        if !output.status.success() {
            let log = work_dir.join(log_file(action));
            let mut diagnostic = log_tail(&log);
            if diagnostic.is_empty() {
                diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }
            if diagnostic.is_empty() {
                diagnostic = format!("criu {action} exited with {}", output.status);
            }
            tracing::warn!(%action, status = %output.status, log = %log.display(), "criu failed");
            return Err(action.failure(diagnostic));
        }

        let pid = match &request.pidfile {
            Some(pidfile) if action == CriuAction::Restore => Some(read_pidfile(pidfile).map_err(
                |e| action.failure(format!("reading pidfile {}: {e}", pidfile.display())),
            )?),
            _ => None,
        };

        tracing::info!(%action, ?pid, "criu finished");
        Ok(CriuOutcome { pid })
    }
}

impl CriuService for CriuBinary {
    fn dump(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        self.execute(request)
    }

    fn pre_dump(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        self.execute(request)
    }

    fn restore(&self, request: &CriuRequest) -> HutchResult<CriuOutcome> {
        self.execute(request)
    }
}

fn log_file(action: CriuAction) -> String {
    format!("{action}.log")
}

/// Command-line arguments for a request.
#[must_use]
pub fn to_args(request: &CriuRequest) -> Vec<String> {
    let action = request.action;
    let options = &request.options;
    let dumping = matches!(action, CriuAction::Dump | CriuAction::PreDump);

    let mut args: Vec<String> = vec![action.as_str().to_string()];
    let mut flag = |name: &str, value: Option<String>| {
        args.push(name.to_string());
        if let Some(value) = value {
            args.push(value);
        }
    };

    flag(
        "--images-dir",
        Some(options.images_directory.display().to_string()),
    );
    flag("--work-dir", Some(options.work_dir().display().to_string()));
    flag("--log-file", Some(log_file(action)));
    flag("-v4", None);

    if dumping {
        if let Some(pid) = request.pid {
            flag("--tree", Some(pid.to_string()));
        }
    }
    if let Some(rootfs) = &request.rootfs {
        flag("--root", Some(rootfs.display().to_string()));
    }
    for (destination, source) in &request.external_mounts {
        let value = if dumping {
            format!("{}:{}", destination.display(), destination.display())
        } else {
            format!("{}:{}", destination.display(), source.display())
        };
        flag("--ext-mount-map", Some(value));
    }

    match action {
        CriuAction::Dump => {
            if options.leave_running {
                flag("--leave-running", None);
            }
            if let Some(parent) = &options.parent_image {
                flag("--prev-images-dir", Some(parent.display().to_string()));
                flag("--track-mem", None);
            }
        }
        CriuAction::PreDump => {
            flag("--track-mem", None);
            if let Some(parent) = &options.parent_image {
                flag("--prev-images-dir", Some(parent.display().to_string()));
            }
        }
        CriuAction::Restore => {
            flag("--restore-detached", None);
            if let Some(pidfile) = &request.pidfile {
                flag("--pidfile", Some(pidfile.display().to_string()));
            }
            if let Some(cgroup_root) = &request.cgroup_root {
                flag("--cgroup-root", Some(cgroup_root.clone()));
            }
            for pair in &options.veth_pairs {
                flag(
                    "--veth-pair",
                    Some(format!("{}={}", pair.container_interface, pair.host_interface)),
                );
            }
            if let Some(profile) = &options.lsm_profile {
                flag("--lsm-profile", Some(profile.clone()));
            }
            if let Some(context) = &options.lsm_mount_context {
                flag("--lsm-mount-context", Some(context.clone()));
            }
        }
    }

    for (enabled, name) in [
        (options.tcp_established, "--tcp-established"),
        (options.tcp_skip_in_flight && dumping, "--skip-in-flight"),
        (options.link_remap, "--link-remap"),
        (options.external_unix_connections, "--ext-unix-sk"),
        (options.shell_job, "--shell-job"),
        (options.file_locks, "--file-locks"),
        (options.auto_dedup, "--auto-dedup"),
        (options.lazy_pages, "--lazy-pages"),
    ] {
        if enabled {
            flag(name, None);
        }
    }

    if dumping {
        if let Some(server) = &options.page_server {
            flag("--page-server", None);
            flag("--address", Some(server.address.clone()));
            flag("--port", Some(server.port.to_string()));
        }
    }
    for name in empty_ns_names(options.empty_ns) {
        flag("--empty-ns", Some(name.to_string()));
    }
    if let Some(fd) = options.status_fd {
        flag("--status-fd", Some(fd.to_string()));
    }
    if let Some(mode) = options.manage_cgroups_mode.as_flag() {
        flag("--manage-cgroups-mode", Some(mode.to_string()));
    }

    args
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Last lines of a CRIU log, empty if unreadable.
fn log_tail(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].join("\n")
}

fn read_pidfile(path: &Path) -> std::io::Result<u32> {
    std::fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CriuOptions, ManageCgroupsMode, PageServer, VethPair};
    use hutch_common::ErrorKind;
    use tempfile::tempdir;

    fn options() -> CriuOptions {
        CriuOptions {
            work_directory: Some(PathBuf::from("/work")),
            tcp_established: true,
            shell_job: true,
            ..CriuOptions::new("/images")
        }
    }

    #[test]
    fn dump_args() {
        let mut request = CriuRequest::checkpoint(
            4242,
            CriuOptions {
                leave_running: true,
                page_server: Some(PageServer {
                    address: "10.0.0.2".to_string(),
                    port: 27,
                }),
                empty_ns: u32::try_from(libc::CLONE_NEWNET).unwrap(),
                ..options()
            },
        );
        request.rootfs = Some(PathBuf::from("/containers/c1/rootfs"));
        request.external_mounts = vec![(PathBuf::from("/data"), PathBuf::from("/srv/data"))];

        insta::assert_snapshot!(
            to_args(&request).join(" "),
            @"dump --images-dir /images --work-dir /work --log-file dump.log -v4 --tree 4242 --root /containers/c1/rootfs --ext-mount-map /data:/data --leave-running --tcp-established --shell-job --page-server --address 10.0.0.2 --port 27 --empty-ns net"
        );
    }

    #[test]
    fn pre_dump_args() {
        let request = CriuRequest::checkpoint(
            7,
            CriuOptions {
                pre_dump: true,
                parent_image: Some(PathBuf::from("../pre1")),
                leave_running: true,
                ..CriuOptions::new("/images/pre2")
            },
        );

        insta::assert_snapshot!(
            to_args(&request).join(" "),
            @"pre-dump --images-dir /images/pre2 --work-dir /images/pre2 --log-file pre-dump.log -v4 --tree 7 --track-mem --prev-images-dir ../pre1"
        );
    }

    #[test]
    fn restore_args() {
        let mut request = CriuRequest::restore(
            "/run/hutch/c1/restore.pid",
            CriuOptions {
                veth_pairs: vec![VethPair {
                    container_interface: "eth0".to_string(),
                    host_interface: "veth0".to_string(),
                }],
                manage_cgroups_mode: ManageCgroupsMode::Soft,
                tcp_skip_in_flight: true,
                ..options()
            },
        );
        request.cgroup_root = Some("/hutch/c1".to_string());
        request.external_mounts = vec![(PathBuf::from("/data"), PathBuf::from("/srv/data"))];

        insta::assert_snapshot!(
            to_args(&request).join(" "),
            @"restore --images-dir /images --work-dir /work --log-file restore.log -v4 --ext-mount-map /data:/srv/data --restore-detached --pidfile /run/hutch/c1/restore.pid --cgroup-root /hutch/c1 --veth-pair eth0=veth0 --tcp-established --shell-job --manage-cgroups-mode soft"
        );
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("dump.log");
        let content: String = (0..30).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&log, content).unwrap();

        let tail = log_tail(&log);
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
        assert_eq!(log_tail(&dir.path().join("missing.log")), "");
    }

    #[test]
    fn missing_binary_is_checkpoint_failure() {
        let dir = tempdir().unwrap();
        let criu = CriuBinary::new(dir.path().join("no-such-criu"));
        let request = CriuRequest::checkpoint(1, CriuOptions::new(dir.path().join("images")));

        let err = criu.dump(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CheckpointFailed);
        assert!(dir.path().join("images").is_dir());
    }

    #[test]
    fn failing_binary_reports_stderr() {
        let dir = tempdir().unwrap();
        let criu = CriuBinary::new("/bin/false");
        let request = CriuRequest::restore(
            dir.path().join("pid"),
            CriuOptions::new(dir.path().join("images")),
        );

        let err = criu.restore(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestoreFailed);
        assert!(err.to_string().contains("exited with"));
    }
}
