//! The start barrier: a FIFO in the container directory.
//!
//! The bootstrapped init holds the FIFO open read-write and blocks reading
//! it. `run` opens it for writing, sends the process description as one JSON
//! line and removes it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use hutch_common::{HutchError, HutchResult};
use rustix::fs::{Mode, OFlags};

use super::process::ProcessSpec;

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Create the FIFO.
///
/// # Errors
///
/// Returns an error if `mkfifo` fails.
pub fn create(path: &Path) -> HutchResult<()> {
    rustix::fs::mkfifoat(rustix::fs::CWD, path, Mode::from_bits_truncate(0o622))
        .map_err(|e| HutchError::internal(format!("mkfifo {}: {e}", path.display())))
}

/// Open the FIFO for the blocked init. Read-write, so opening never blocks
/// and reading never sees end-of-file before the writer sends a line.
///
/// # Errors
///
/// Returns an error if the FIFO cannot be opened.
pub fn open_reader(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Block until the process description arrives.
///
/// # Errors
///
/// Returns an error if reading fails or the line is not a [`ProcessSpec`].
pub fn wait(fifo: File) -> HutchResult<ProcessSpec> {
    let mut line = String::new();
    BufReader::new(fifo).read_line(&mut line)?;
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Hand the process description to the blocked init and remove the FIFO.
///
/// Opening for writing fails with `ENXIO` while nobody holds the read side;
/// that is retried until `timeout`.
///
/// # Errors
///
/// Returns [`HutchError::BootstrapFailed`] if no reader shows up in time.
pub async fn release(path: &Path, spec: &ProcessSpec, timeout: Duration) -> HutchResult<()> {
    let deadline = Instant::now() + timeout;

    let mut fifo = loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => break file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if Instant::now() >= deadline {
                    return Err(HutchError::bootstrap(
                        "init is not waiting at the start barrier",
                    ));
                }
                tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(HutchError::bootstrap(format!(
                    "opening start barrier {}: {e}",
                    path.display()
                )));
            }
        }
    };

    clear_nonblocking(&fifo)?;

    let mut line = serde_json::to_vec(spec)?;
    line.push(b'\n');
    fifo.write_all(&line)
        .map_err(|e| HutchError::bootstrap(format!("writing start barrier: {e}")))?;
    drop(fifo);

    std::fs::remove_file(path)?;
    Ok(())
}

fn clear_nonblocking(file: &File) -> HutchResult<()> {
    let flags = rustix::fs::fcntl_getfl(file).map_err(std::io::Error::from)?;
    rustix::fs::fcntl_setfl(file, flags - OFlags::NONBLOCK).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Process;
    use hutch_config::ContainerConfig;

    #[tokio::test]
    async fn description_reaches_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.fifo");
        create(&path).unwrap();

        let reader = open_reader(&path).unwrap();
        let spec = ProcessSpec::new(Process::init(["/bin/true"]), &ContainerConfig::default());
        let waiter = std::thread::spawn(move || wait(reader).unwrap());

        release(&path, &spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(waiter.join().unwrap(), spec);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn release_without_reader_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.fifo");
        create(&path).unwrap();

        let spec = ProcessSpec::new(Process::init(["/bin/true"]), &ContainerConfig::default());
        let err = release(&path, &spec, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), hutch_common::ErrorKind::BootstrapFailed);
        assert!(path.exists());
    }
}
