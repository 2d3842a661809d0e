//! Startup cleanup of engines orphaned by crashed runs.
//!
//! Every run leaves an Engine Metadata Record next to its engine. A record
//! whose owner is gone means the owner crashed: whatever still listens on the
//! recorded port is killed (if it looks like our engine), the run's data
//! directory is deleted, and the record is removed so it is not seen again.
//! Nothing here is fatal; every failure is logged and the scan moves on.

use crate::config::ReaperOptions;
use crate::engine::EngineMetadataRecord;
use crate::error::{RefIndexError, Result};
use crate::platform;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// OS introspection used by the reaper.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    fn is_listening(&self, port: u16) -> bool;
    /// Pid of the process listening on `port`, if it can be resolved.
    fn listening_pid(&self, port: u16) -> Option<u32>;
    fn command_line(&self, pid: u32) -> Option<String>;
    fn terminate(&self, pid: u32, grace: Duration) -> Result<bool>;
}

/// [`ProcessProbe`] backed by the real operating system.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    connect_timeout: Duration,
}

impl SystemProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        platform::is_process_alive(pid)
    }

    fn is_listening(&self, port: u16) -> bool {
        platform::is_port_listening(port, self.connect_timeout)
    }

    fn listening_pid(&self, port: u16) -> Option<u32> {
        platform::find_listening_pid(port)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        platform::process_command_line(pid)
    }

    fn terminate(&self, pid: u32, grace: Duration) -> Result<bool> {
        platform::terminate_process(pid, grace)
    }
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Record files examined.
    pub scanned: usize,
    /// Records left alone because their owner is still running.
    pub skipped_alive: usize,
    /// Pids that were terminated.
    pub killed: Vec<u32>,
    /// Listeners found but not killed (unresolvable, or not an engine).
    pub kill_skipped: usize,
    /// Record files deleted.
    pub removed: usize,
    pub failures: Vec<String>,
}

pub struct StaleInstanceReaper {
    options: ReaperOptions,
    probe: Box<dyn ProcessProbe>,
    own_pid: u32,
}

impl StaleInstanceReaper {
    pub fn new(options: ReaperOptions) -> Self {
        let probe = SystemProbe::new(options.connect_timeout);
        Self::with_probe(options, Box::new(probe))
    }

    pub fn with_probe(options: ReaperOptions, probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            options,
            probe,
            own_pid: std::process::id(),
        }
    }

    /// Scan the metadata directory once. Blocks while waiting for killed
    /// processes to exit.
    pub fn reap(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let dir = &self.options.metadata_dir;

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No metadata directory to scan at {}: {}", dir.display(), e);
                return report;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(file_pid) =
                EngineMetadataRecord::owner_pid_from_file_name(&self.options.metadata_prefix, &name)
            else {
                continue;
            };
            report.scanned += 1;
            if let Err(e) = self.handle_record(&entry.path(), file_pid, &mut report) {
                warn!("{}", e);
                report.failures.push(e.to_string());
            }
        }

        if report.scanned > 0 {
            info!(
                "Reaper scanned {} records: {} alive, {} killed, {} removed, {} failures",
                report.scanned,
                report.skipped_alive,
                report.killed.len(),
                report.removed,
                report.failures.len()
            );
        }
        report
    }

    fn handle_record(&self, path: &Path, file_pid: u32, report: &mut ReapReport) -> Result<()> {
        let record = match EngineMetadataRecord::read(path) {
            Ok(record) => record,
            Err(e) => {
                warn!("Unparsable engine metadata record {}: {}", path.display(), e);
                self.remove_record(path, report)?;
                return Err(cleanup_failure(path, format!("unparsable record: {}", e)));
            }
        };

        let owner = record.owner_pid;
        if owner != file_pid {
            debug!(
                "Record {} names owner {} but file says {}",
                path.display(),
                owner,
                file_pid
            );
        }
        if owner == self.own_pid || self.probe.is_alive(owner) {
            debug!("Engine owner {} is alive, keeping {}", owner, path.display());
            report.skipped_alive += 1;
            return Ok(());
        }

        let mut failure = None;
        if let Some(port) = record.engine_port {
            if let Err(e) = self.kill_listener(port, report) {
                failure = Some(e);
            }
        }

        if let Some(data_dir) = &record.data_dir {
            if let Err(e) = std::fs::remove_dir_all(data_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failure.get_or_insert(cleanup_failure(
                        data_dir,
                        format!("failed to remove data dir: {}", e),
                    ));
                }
            }
        }

        self.remove_record(path, report)?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn kill_listener(&self, port: u16, report: &mut ReapReport) -> Result<()> {
        if !self.probe.is_listening(port) {
            debug!("Nothing listens on port {}", port);
            return Ok(());
        }
        let Some(pid) = self.probe.listening_pid(port) else {
            warn!("Cannot resolve pid listening on port {}, skipping kill", port);
            report.kill_skipped += 1;
            return Ok(());
        };
        if pid == self.own_pid {
            report.kill_skipped += 1;
            return Ok(());
        }

        let marker = self.options.engine_command_marker.to_lowercase();
        let is_engine = self
            .probe
            .command_line(pid)
            .map(|cmd| cmd.to_lowercase().contains(&marker))
            .unwrap_or(false);
        if !is_engine {
            info!(
                "Process {} on port {} is not an engine instance, leaving it running",
                pid, port
            );
            report.kill_skipped += 1;
            return Ok(());
        }

        info!("Terminating orphaned engine {} on port {}", pid, port);
        match self.probe.terminate(pid, self.options.kill_grace) {
            Ok(true) => {
                report.killed.push(pid);
                Ok(())
            }
            Ok(false) => Err(RefIndexError::ReaperCleanupFailure {
                path: self.options.metadata_dir.clone(),
                message: format!("process {} survived termination", pid),
            }),
            Err(e) => Err(RefIndexError::ReaperCleanupFailure {
                path: self.options.metadata_dir.clone(),
                message: format!("failed to terminate {}: {}", pid, e),
            }),
        }
    }

    fn remove_record(&self, path: &Path, report: &mut ReapReport) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                report.removed += 1;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cleanup_failure(path, format!("failed to delete record: {}", e))),
        }
    }
}

fn cleanup_failure(path: &Path, message: String) -> RefIndexError {
    RefIndexError::ReaperCleanupFailure {
        path: path.to_path_buf(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProbe {
        alive: Vec<u32>,
        listeners: HashMap<u16, Option<u32>>,
        commands: HashMap<u32, String>,
        terminated: Arc<Mutex<Vec<u32>>>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }
        fn is_listening(&self, port: u16) -> bool {
            self.listeners.contains_key(&port)
        }
        fn listening_pid(&self, port: u16) -> Option<u32> {
            self.listeners.get(&port).copied().flatten()
        }
        fn command_line(&self, pid: u32) -> Option<String> {
            self.commands.get(&pid).cloned()
        }
        fn terminate(&self, pid: u32, _grace: Duration) -> Result<bool> {
            self.terminated.lock().unwrap().push(pid);
            Ok(true)
        }
    }

    fn options(dir: &TempDir) -> ReaperOptions {
        ReaperOptions {
            metadata_dir: dir.path().to_path_buf(),
            ..ReaperOptions::default()
        }
    }

    fn write_record(dir: &TempDir, owner: u32, port: Option<u16>) -> std::path::PathBuf {
        let opts = options(dir);
        let path = EngineMetadataRecord::path_in(dir.path(), &opts.metadata_prefix, owner);
        EngineMetadataRecord::new(owner, port, None).write(&path).unwrap();
        path
    }

    #[test]
    fn test_live_owner_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, 100, Some(5433));
        let probe = FakeProbe {
            alive: vec![100],
            ..Default::default()
        };

        let report = StaleInstanceReaper::with_probe(options(&dir), Box::new(probe)).reap();
        assert_eq!(report.skipped_alive, 1);
        assert!(path.exists());
    }

    #[test]
    fn test_dead_owner_without_listener_removes_record() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, 100, Some(5433));
        let terminated = Arc::new(Mutex::new(Vec::new()));
        let probe = FakeProbe {
            terminated: terminated.clone(),
            ..Default::default()
        };

        let report = StaleInstanceReaper::with_probe(options(&dir), Box::new(probe)).reap();
        assert_eq!(report.removed, 1);
        assert!(report.killed.is_empty());
        assert!(terminated.lock().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_live_listener_is_killed() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, 100, Some(5433));
        let terminated = Arc::new(Mutex::new(Vec::new()));
        let probe = FakeProbe {
            listeners: HashMap::from([(5433, Some(200))]),
            commands: HashMap::from([(200, "/usr/bin/refindex-engine -p 5433".to_string())]),
            terminated: terminated.clone(),
            ..Default::default()
        };

        let report = StaleInstanceReaper::with_probe(options(&dir), Box::new(probe)).reap();
        assert_eq!(report.killed, vec![200]);
        assert_eq!(*terminated.lock().unwrap(), vec![200]);
        assert!(!path.exists());
    }

    #[test]
    fn test_foreign_listener_is_not_killed() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, 100, Some(8080));
        let terminated = Arc::new(Mutex::new(Vec::new()));
        let probe = FakeProbe {
            listeners: HashMap::from([(8080, Some(300))]),
            commands: HashMap::from([(300, "nginx: master process".to_string())]),
            terminated: terminated.clone(),
            ..Default::default()
        };

        let report = StaleInstanceReaper::with_probe(options(&dir), Box::new(probe)).reap();
        assert_eq!(report.kill_skipped, 1);
        assert!(terminated.lock().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_unresolvable_pid_skips_kill() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, 100, Some(5433));
        let probe = FakeProbe {
            listeners: HashMap::from([(5433, None)]),
            ..Default::default()
        };

        let report = StaleInstanceReaper::with_probe(options(&dir), Box::new(probe)).reap();
        assert_eq!(report.kill_skipped, 1);
        assert!(report.failures.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_unparsable_record_is_deleted_and_scan_continues() {
        let dir = TempDir::new().unwrap();
        let prefix = options(&dir).metadata_prefix;
        let broken = dir.path().join(format!("{}-7.json", prefix));
        std::fs::write(&broken, "{not json").unwrap();
        let good = write_record(&dir, 100, None);

        let report =
            StaleInstanceReaper::with_probe(options(&dir), Box::new(FakeProbe::default())).reap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(!broken.exists());
        assert!(!good.exists());
    }

    #[test]
    fn test_non_numeric_and_foreign_names_ignored() {
        let dir = TempDir::new().unwrap();
        let prefix = options(&dir).metadata_prefix;
        let odd = dir.path().join(format!("{}-abc.json", prefix));
        let other = dir.path().join("notes.json");
        std::fs::write(&odd, "{}").unwrap();
        std::fs::write(&other, "{}").unwrap();

        let report =
            StaleInstanceReaper::with_probe(options(&dir), Box::new(FakeProbe::default())).reap();
        assert_eq!(report.scanned, 0);
        assert!(odd.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_dead_owner_data_dir_removed() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("engine-100");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("fields.sqlite"), b"x").unwrap();
        let opts = options(&dir);
        let path = EngineMetadataRecord::path_in(dir.path(), &opts.metadata_prefix, 100);
        EngineMetadataRecord::new(100, None, Some(data_dir.clone()))
            .write(&path)
            .unwrap();

        StaleInstanceReaper::with_probe(opts, Box::new(FakeProbe::default())).reap();
        assert!(!data_dir.exists());
        assert!(!path.exists());
    }
}
