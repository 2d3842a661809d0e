//! Launching the engine.
//!
//! [`SqliteLauncher`] runs bundled SQLite inside this process, so the engine
//! pid is our own and there is no port. [`HostProcessLauncher`] starts a
//! separate `refindex-engine` host that owns the database directory and
//! listens on an ephemeral loopback port, which is what the stale instance
//! reaper looks for after a crash.

use super::host::{prepare_database, ReadyLine};
use crate::config::{EngineDefaults, EngineOptions};
use crate::error::{RefIndexError, Result};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use tracing::{debug, warn};

/// What a launcher reports back about a started engine.
#[derive(Debug, Clone)]
pub struct LaunchedEngine {
    /// Pid of the engine process.
    pub pid: u32,
    /// Loopback port the engine listens on, if any.
    pub port: Option<u16>,
    /// Per-run directory holding the engine's files.
    pub data_dir: PathBuf,
    /// Database file connections are opened against.
    pub database_path: PathBuf,
}

impl LaunchedEngine {
    pub fn is_in_process(&self) -> bool {
        self.pid == std::process::id()
    }
}

/// Starts an engine instance. Called on the blocking pool.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, options: &EngineOptions) -> Result<LaunchedEngine>;
}

/// Empty per-run data directory for the run owned by `owner_pid`.
fn fresh_data_dir(options: &EngineOptions, owner_pid: u32) -> Result<PathBuf> {
    let data_dir = options
        .data_dir
        .join(format!("{}-{}", EngineDefaults::DATA_DIR_PREFIX, owner_pid));
    // Disposable: whatever an earlier run with this pid left is stale.
    if data_dir.exists() {
        std::fs::remove_dir_all(&data_dir).map_err(|e| RefIndexError::io_with_path(e, &data_dir))?;
    }
    std::fs::create_dir_all(&data_dir).map_err(|e| RefIndexError::io_with_path(e, &data_dir))?;
    Ok(data_dir)
}

/// Launches bundled SQLite in a fresh per-run data directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteLauncher;

impl EngineLauncher for SqliteLauncher {
    fn launch(&self, options: &EngineOptions) -> Result<LaunchedEngine> {
        let pid = std::process::id();
        let data_dir = fresh_data_dir(options, pid)?;
        let database_path = prepare_database(&data_dir)?;
        Ok(LaunchedEngine {
            pid,
            port: None,
            data_dir,
            database_path,
        })
    }
}

/// Spawns `program [args] --data-dir <dir> --port 0` and waits for its ready
/// line.
#[derive(Debug, Clone)]
pub struct HostProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl HostProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra argument placed before the generated ones.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn await_ready(&self, child: &mut Child, options: &EngineOptions) -> Result<ReadyLine> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RefIndexError::engine_unavailable("engine host has no stdout"))?;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let read = BufReader::new(stdout).read_line(&mut line).map(|_| line);
            // The launcher may have given up already.
            let _ = tx.send(read);
        });

        let line = match rx.recv_timeout(options.start_timeout) {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                return Err(RefIndexError::engine_unavailable(format!(
                    "failed to read engine host output: {e}"
                )))
            }
            Err(_) => {
                return Err(RefIndexError::engine_unavailable(format!(
                    "engine host did not report ready within {:?}",
                    options.start_timeout
                )))
            }
        };
        ReadyLine::parse(&line).ok_or_else(|| {
            RefIndexError::engine_unavailable(format!("unexpected engine host output {:?}", line.trim()))
        })
    }
}

impl EngineLauncher for HostProcessLauncher {
    fn launch(&self, options: &EngineOptions) -> Result<LaunchedEngine> {
        let data_dir = fresh_data_dir(options, std::process::id())?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--port")
            .arg("0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                RefIndexError::engine_unavailable(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let ready = match self.await_ready(&mut child, options) {
            Ok(ready) => ready,
            Err(e) => {
                if let Err(kill_err) = child.kill() {
                    warn!("Failed to kill engine host {}: {}", child.id(), kill_err);
                }
                let _ = child.wait();
                return Err(e);
            }
        };
        if ready.pid != child.id() {
            debug!("Engine host reports pid {} for child {}", ready.pid, child.id());
        }
        debug!("Engine host {} listening on port {}", child.id(), ready.port);

        Ok(LaunchedEngine {
            pid: child.id(),
            port: Some(ready.port),
            database_path: data_dir.join(EngineDefaults::DATABASE_FILENAME),
            data_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_launch_creates_per_run_dir() {
        let temp_dir = TempDir::new().unwrap();
        let options = EngineOptions::in_dir(temp_dir.path());

        let launched = SqliteLauncher.launch(&options).unwrap();
        assert!(launched.is_in_process());
        assert_eq!(launched.port, None);
        assert!(launched.data_dir.starts_with(temp_dir.path()));
        assert!(launched.database_path.exists());
    }

    #[test]
    fn test_relaunch_discards_previous_files() {
        let temp_dir = TempDir::new().unwrap();
        let options = EngineOptions::in_dir(temp_dir.path());
        let first = SqliteLauncher.launch(&options).unwrap();
        std::fs::write(first.data_dir.join("leftover"), "x").unwrap();

        let second = SqliteLauncher.launch(&options).unwrap();
        assert_eq!(first.data_dir, second.data_dir);
        assert!(!second.data_dir.join("leftover").exists());
    }

    #[test]
    fn test_missing_host_program_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let options = EngineOptions::in_dir(temp_dir.path());
        let err = HostProcessLauncher::new(temp_dir.path().join("no-such-engine"))
            .launch(&options)
            .unwrap_err();
        assert!(matches!(err, RefIndexError::EngineUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_host_without_ready_line_is_killed() {
        let temp_dir = TempDir::new().unwrap();
        let options = EngineOptions::in_dir(temp_dir.path());
        // `sh -c 'echo nope' sh --data-dir ... --port 0`
        let err = HostProcessLauncher::new("sh")
            .arg("-c")
            .arg("echo nope")
            .arg("sh")
            .launch(&options)
            .unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }
}
