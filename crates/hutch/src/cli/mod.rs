//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use hutch_config::{ContainerConfig, Resources};

use crate::checkpoint::{CriuOptions, ManageCgroupsMode, PageServer};
use crate::exec::{Process, User};
use crate::runtime::{Container, RuntimeConfig};

/// How long `delete --force` waits for the init to exit.
const FORCE_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hutch - Container lifecycle engine with checkpoint/restore
#[derive(Parser)]
#[command(name = "hutch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// State root for container directories
    #[arg(long, global = true, env = "HUTCH_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a container; its init waits until `start`
    Create {
        /// Container ID
        container_id: String,

        /// Path to the container configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Start the init process of a created container
    Start {
        /// Container ID
        container_id: String,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Working directory inside the container
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Execute a command in a running container
    Exec {
        /// Container ID
        container_id: String,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Working directory inside the container
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// User to run as (uid:gid)
        #[arg(short, long)]
        user: Option<String>,

        /// Do not wait for the process to exit
        #[arg(short, long)]
        detach: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Query container state
    State {
        /// Container ID
        container_id: String,
    },

    /// List containers
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,

        /// Only display container IDs
        #[arg(short, long)]
        quiet: bool,
    },

    /// List the processes of a container
    Ps {
        /// Container ID
        container_id: String,
    },

    /// Display container resource usage statistics
    Stats {
        /// Container ID
        container_id: String,
    },

    /// Pause a running container
    Pause {
        /// Container ID
        container_id: String,
    },

    /// Resume a paused container
    Resume {
        /// Container ID
        container_id: String,
    },

    /// Send a signal to a container
    Kill {
        /// Container ID
        container_id: String,

        /// Signal name or number
        #[arg(default_value = "SIGTERM")]
        signal: String,

        /// Send signal to all processes
        #[arg(short, long)]
        all: bool,
    },

    /// Update container resource limits
    Update {
        /// Container ID
        container_id: String,

        /// Path to resources JSON file
        #[arg(short, long)]
        resources: PathBuf,
    },

    /// Delete a stopped container
    Delete {
        /// Container ID
        container_id: String,

        /// Kill the container first if it is still alive
        #[arg(short, long)]
        force: bool,
    },

    /// Checkpoint a running container (CRIU)
    Checkpoint {
        /// Container ID
        container_id: String,

        #[command(flatten)]
        criu: CriuArgs,

        /// Leave container running after checkpoint
        #[arg(long)]
        leave_running: bool,

        /// Only dump memory, for a later incremental checkpoint
        #[arg(long)]
        pre_dump: bool,

        /// Images of a previous pre-dump
        #[arg(long)]
        parent_path: Option<PathBuf>,

        /// Stream pages to a page server (address:port)
        #[arg(long)]
        page_server: Option<String>,

        /// Deduplicate pages against the parent image
        #[arg(long)]
        auto_dedup: bool,
    },

    /// Restore a container from checkpoint
    Restore {
        /// Container ID
        container_id: String,

        /// Path to the container configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        #[command(flatten)]
        criu: CriuArgs,
    },

    /// Container bootstrap helper
    #[command(hide = true)]
    Init,
}

/// `list` output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    /// Aligned columns.
    Table,
    /// JSON array of states.
    Json,
}

/// Options shared by `checkpoint` and `restore`.
#[derive(Debug, clap::Args)]
pub struct CriuArgs {
    /// Path to checkpoint image directory
    #[arg(long)]
    image_path: PathBuf,

    /// Directory for CRIU logs (default: image path)
    #[arg(long)]
    work_path: Option<PathBuf>,

    /// Handle established TCP connections
    #[arg(long)]
    tcp_established: bool,

    /// Allow external unix socket connections
    #[arg(long)]
    ext_unix_sk: bool,

    /// The container is attached to a shell job
    #[arg(long)]
    shell_job: bool,

    /// Handle file locks
    #[arg(long)]
    file_locks: bool,

    /// How CRIU handles cgroups
    #[arg(long, value_parser = parse_manage_cgroups_mode, default_value = "default")]
    manage_cgroups_mode: ManageCgroupsMode,
}

impl CriuArgs {
    fn options(self) -> CriuOptions {
        CriuOptions {
            work_directory: self.work_path,
            tcp_established: self.tcp_established,
            external_unix_connections: self.ext_unix_sk,
            shell_job: self.shell_job,
            file_locks: self.file_locks,
            manage_cgroups_mode: self.manage_cgroups_mode,
            ..CriuOptions::new(self.image_path)
        }
    }
}

impl Cli {
    /// Runtime settings for this invocation.
    #[must_use]
    pub fn runtime(&self) -> RuntimeConfig {
        let runtime = if rustix::process::geteuid().is_root() {
            RuntimeConfig::default()
        } else {
            RuntimeConfig::rootless()
        };
        match &self.root {
            Some(root) => runtime.with_root(root),
            None => runtime,
        }
    }

    /// Execute the CLI command. Returns the process exit code.
    pub async fn execute(self) -> Result<i32> {
        let runtime = self.runtime();

        match self.command {
            Commands::Create {
                container_id,
                config,
            } => {
                let config = read_json::<ContainerConfig>(&config)?;
                Container::create(&container_id, config, runtime).await?;
                println!("Container {container_id} created");
            }

            Commands::Start {
                container_id,
                env,
                cwd,
                command,
            } => {
                let container = Container::load(&container_id, runtime).await?;
                let process = build_process(Process::init(command), env, cwd, None)?;
                let handle = container.run(process).await?;
                println!("Container {container_id} started (pid {})", handle.pid());
            }

            Commands::Exec {
                container_id,
                env,
                cwd,
                user,
                detach,
                command,
            } => {
                let container = Container::load(&container_id, runtime).await?;
                let user = user.as_deref().map(parse_user).transpose()?;
                let process = build_process(Process::new(command), env, cwd, user)?;
                let handle = container.run(process).await?;
                if detach {
                    println!("{}", handle.pid());
                } else {
                    let status = handle.wait().await?;
                    return Ok(status.code().unwrap_or(1));
                }
            }

            Commands::State { container_id } => {
                let container = Container::load(&container_id, runtime).await?;
                let state = container.state().await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            }

            Commands::List { format, quiet } => {
                let ids = Container::list(&runtime)?;
                if quiet {
                    for id in ids {
                        println!("{id}");
                    }
                    return Ok(0);
                }

                let mut states = Vec::new();
                for id in ids {
                    let container = Container::load(&id, runtime.clone()).await?;
                    match container.state().await {
                        Ok(state) => states.push(state),
                        Err(e) => tracing::warn!(container_id = %id, error = %e, "Skipping container"),
                    }
                }

                match format {
                    ListFormat::Json => println!("{}", serde_json::to_string_pretty(&states)?),
                    ListFormat::Table => {
                        println!("{:<24} {:<10} {:<8} CREATED", "ID", "STATUS", "PID");
                        for state in states {
                            let pid = state.init_pid.map_or_else(|| "-".to_string(), |p| p.to_string());
                            println!(
                                "{:<24} {:<10} {:<8} {}",
                                state.id,
                                state.status,
                                pid,
                                state.created_at.to_rfc3339()
                            );
                        }
                    }
                }
            }

            Commands::Ps { container_id } => {
                let container = Container::load(&container_id, runtime).await?;
                for pid in container.processes().await? {
                    println!("{pid}");
                }
            }

            Commands::Stats { container_id } => {
                let container = Container::load(&container_id, runtime).await?;
                let stats = container.stats().await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }

            Commands::Pause { container_id } => {
                Container::load(&container_id, runtime).await?.pause().await?;
            }

            Commands::Resume { container_id } => {
                Container::load(&container_id, runtime).await?.resume().await?;
            }

            Commands::Kill {
                container_id,
                signal,
                all,
            } => {
                let signal = parse_signal(&signal)?;
                Container::load(&container_id, runtime)
                    .await?
                    .signal(signal, all)
                    .await?;
            }

            Commands::Update {
                container_id,
                resources,
            } => {
                let resources = read_json::<Resources>(&resources)?;
                let container = Container::load(&container_id, runtime).await?;
                let mut config = container.state().await?.config;
                config.cgroup.resources = resources;
                container.set(config).await?;
            }

            Commands::Delete {
                container_id,
                force,
            } => {
                let container = Container::load(&container_id, runtime).await?;
                if force {
                    force_stop(&container).await?;
                }
                container.destroy().await?;
                println!("Container {container_id} deleted");
            }

            Commands::Checkpoint {
                container_id,
                criu,
                leave_running,
                pre_dump,
                parent_path,
                page_server,
                auto_dedup,
            } => {
                let options = CriuOptions {
                    leave_running,
                    pre_dump,
                    parent_image: parent_path,
                    page_server: page_server.as_deref().map(parse_page_server).transpose()?,
                    auto_dedup,
                    ..criu.options()
                };
                let container = Container::load(&container_id, runtime).await?;
                container.checkpoint(&options).await?;
                println!("Container {container_id} checkpointed");
            }

            Commands::Restore {
                container_id,
                config,
                criu,
            } => {
                let config = read_json::<ContainerConfig>(&config)?;
                Container::restore(&container_id, config, &criu.options(), runtime).await?;
                println!("Container {container_id} restored");
            }

            Commands::Init => bail!("init is run by the engine, not by hand"),
        }
        Ok(0)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn build_process(
    mut process: Process,
    env: Vec<String>,
    cwd: Option<PathBuf>,
    user: Option<User>,
) -> Result<Process> {
    for entry in env {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("environment entry must be KEY=VALUE: {entry}");
        };
        process = process.with_env(key, value);
    }
    if let Some(cwd) = cwd {
        process = process.with_cwd(cwd);
    }
    if let Some(user) = user {
        process = process.with_user(user);
    }
    Ok(process)
}

/// Kill whatever is left of the container and wait for it to stop.
async fn force_stop(container: &Container) -> Result<()> {
    let status = container.status().await?;
    if status.is_stopped() {
        return Ok(());
    }
    if status.can_signal() {
        container.signal(libc::SIGKILL, true).await?;
    } else if let Some(pid) = container.state().await?.init_pid {
        // A created init is not in a signallable state yet.
        crate::exec::process::kill(pid, libc::SIGKILL)
            .wrap_err_with(|| format!("killing init {pid}"))?;
    }

    let deadline = tokio::time::Instant::now() + FORCE_DELETE_TIMEOUT;
    while !container.status().await?.is_stopped() {
        if tokio::time::Instant::now() >= deadline {
            bail!("container {} did not stop", container.id());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Parse `uid` or `uid:gid`.
fn parse_user(value: &str) -> Result<User> {
    let (uid, gid) = value.split_once(':').unwrap_or((value, value));
    Ok(User {
        uid: uid.parse().wrap_err_with(|| format!("invalid uid in {value}"))?,
        gid: gid.parse().wrap_err_with(|| format!("invalid gid in {value}"))?,
        additional_gids: Vec::new(),
    })
}

fn parse_page_server(value: &str) -> Result<PageServer> {
    let (address, port) = value
        .rsplit_once(':')
        .ok_or_else(|| eyre!("page server must be address:port: {value}"))?;
    Ok(PageServer {
        address: address.to_string(),
        port: port.parse().wrap_err_with(|| format!("invalid port in {value}"))?,
    })
}

fn parse_manage_cgroups_mode(value: &str) -> Result<ManageCgroupsMode, String> {
    Ok(match value {
        "default" => ManageCgroupsMode::Default,
        "soft" => ManageCgroupsMode::Soft,
        "full" => ManageCgroupsMode::Full,
        "strict" => ManageCgroupsMode::Strict,
        "ignore" => ManageCgroupsMode::Ignore,
        other => return Err(format!("unknown cgroup mode: {other}")),
    })
}

/// Parse a signal given as a number, `SIGTERM` or `TERM`.
fn parse_signal(value: &str) -> Result<i32> {
    if let Ok(number) = value.parse() {
        return Ok(number);
    }
    let name = value.strip_prefix("SIG").unwrap_or(value);
    Ok(match name.to_ascii_uppercase().as_str() {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "WINCH" => libc::SIGWINCH,
        _ => bail!("unknown signal: {value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn signals_by_name_and_number() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("kill").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("10").unwrap(), 10);
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn user_spec() {
        let user = parse_user("1000:100").unwrap();
        assert_eq!((user.uid, user.gid), (1000, 100));
        assert_eq!(parse_user("0").unwrap().gid, 0);
        assert!(parse_user("root").is_err());
    }

    #[test]
    fn page_server_spec() {
        let server = parse_page_server("10.0.0.2:27").unwrap();
        assert_eq!(server.address, "10.0.0.2");
        assert_eq!(server.port, 27);
        assert!(parse_page_server("10.0.0.2").is_err());
    }

    #[test]
    fn checkpoint_flags() {
        let cli = Cli::parse_from([
            "hutch",
            "--root",
            "/tmp/hutch",
            "checkpoint",
            "c1",
            "--image-path",
            "/images",
            "--leave-running",
            "--tcp-established",
            "--manage-cgroups-mode",
            "soft",
        ]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/hutch")));
        let Commands::Checkpoint {
            criu, leave_running, ..
        } = cli.command
        else {
            panic!("expected checkpoint");
        };
        assert!(leave_running);
        let options = criu.options();
        assert_eq!(options.images_directory, PathBuf::from("/images"));
        assert!(options.tcp_established);
        assert_eq!(options.manage_cgroups_mode, ManageCgroupsMode::Soft);
    }

    #[test]
    fn exec_takes_trailing_command() {
        let cli = Cli::parse_from(["hutch", "exec", "c1", "-e", "A=1", "sh", "-c", "echo hi"]);
        let Commands::Exec { command, env, .. } = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(command, ["sh", "-c", "echo hi"]);
        assert_eq!(env, ["A=1"]);

        let process = build_process(Process::new(command), env, None, None).unwrap();
        assert!(process.env.contains(&"A=1".to_string()));
    }
}
