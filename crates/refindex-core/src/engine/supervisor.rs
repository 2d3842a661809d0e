use super::launcher::{EngineLauncher, HostProcessLauncher, LaunchedEngine, SqliteLauncher};
use super::pool::{ConnectionPool, PooledConnection};
use super::record::EngineMetadataRecord;
use super::schema::{EngineCapabilities, FieldSchema};
use crate::config::{EngineDefaults, EngineOptions};
use crate::error::{RefIndexError, Result};
use crate::platform;
use crate::query::TableLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Lifecycle of the embedded engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Stopped,
    Running,
    /// Start failed or timed out. Terminal for this supervisor.
    Unavailable,
    ShutDown,
}

struct SupervisorInner {
    state: EngineState,
    pool: Option<ConnectionPool>,
    launched: Option<LaunchedEngine>,
    record_path: Option<PathBuf>,
    capabilities: EngineCapabilities,
    schema_bootstrapped: bool,
}

/// Owns the one embedded engine instance of this run.
///
/// Construct once, share behind an `Arc` with everything that needs
/// connections, and call [`shutdown`](Self::shutdown) after the index manager
/// has been closed.
pub struct EngineSupervisor {
    options: EngineOptions,
    layout: TableLayout,
    launcher: Arc<dyn EngineLauncher>,
    inner: Mutex<SupervisorInner>,
    start_lock: tokio::sync::Mutex<()>,
}

impl EngineSupervisor {
    /// Supervisor with the launcher `options` ask for: a separate host when
    /// `host_program` is set, in-process SQLite otherwise.
    pub fn new(options: EngineOptions) -> Self {
        let launcher: Arc<dyn EngineLauncher> = match &options.host_program {
            Some(program) => Arc::new(HostProcessLauncher::new(program)),
            None => Arc::new(SqliteLauncher),
        };
        Self::with_launcher(options, launcher)
    }

    pub fn with_launcher(options: EngineOptions, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self {
            options,
            layout: TableLayout::default(),
            launcher,
            inner: Mutex::new(SupervisorInner {
                state: EngineState::Stopped,
                pool: None,
                launched: None,
                record_path: None,
                capabilities: EngineCapabilities::default(),
                schema_bootstrapped: false,
            }),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, SupervisorInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn state(&self) -> EngineState {
        self.lock_inner().state
    }

    pub fn is_available(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.lock_inner().capabilities
    }

    /// Port the engine listens on, for engines that use one.
    pub fn port(&self) -> Option<u16> {
        self.lock_inner().launched.as_ref().and_then(|l| l.port)
    }

    pub fn engine_pid(&self) -> Option<u32> {
        self.lock_inner().launched.as_ref().map(|l| l.pid)
    }

    /// Where this run's Engine Metadata Record was written, if it was.
    pub fn record_path(&self) -> Option<PathBuf> {
        self.lock_inner().record_path.clone()
    }

    /// Launch the engine, record ownership, and bootstrap the schema.
    ///
    /// The state becomes `Running` only once the schema exists, so no
    /// connection is handed out before that. Launch or bootstrap failure, or
    /// a launch slower than `start_timeout`, leaves the supervisor
    /// `Unavailable` for good. Calling `start` again returns the current
    /// state without relaunching.
    pub async fn start(&self) -> EngineState {
        let _guard = self.start_lock.lock().await;
        let current = self.state();
        if current != EngineState::Stopped {
            debug!("Engine start skipped, state is {:?}", current);
            return current;
        }

        let launcher = self.launcher.clone();
        let options = self.options.clone();
        let mut task = tokio::task::spawn_blocking(move || launcher.launch(&options));

        let outcome = tokio::time::timeout(self.options.start_timeout, &mut task).await;
        let launched = match outcome {
            Ok(Ok(Ok(launched))) => launched,
            Ok(Ok(Err(e))) => {
                error!("Embedded engine failed to start: {}", e);
                return self.mark_unavailable();
            }
            Ok(Err(join_err)) => {
                error!("Embedded engine launch task failed: {}", join_err);
                return self.mark_unavailable();
            }
            Err(_) => {
                error!(
                    "Embedded engine did not start within {:?}",
                    self.options.start_timeout
                );
                // The launch keeps running on the blocking pool; discard
                // whatever it produces.
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = task.await {
                        discard_launch(&late);
                    }
                });
                return self.mark_unavailable();
            }
        };

        info!(
            "Embedded engine running (pid {}, port {:?}) at {}",
            launched.pid,
            launched.port,
            launched.data_dir.display()
        );

        // Recorded before bootstrap so a crash from here on is reapable.
        let record_path = self.write_record(&launched);
        let pool = ConnectionPool::new(
            &launched.database_path,
            self.options.pool_size,
            self.options.acquire_timeout,
        );

        let layout = self.layout.clone();
        let bootstrap_pool = pool.clone();
        let bootstrapped = tokio::task::spawn_blocking(move || {
            let conn = bootstrap_pool.get()?;
            FieldSchema::new(&layout).bootstrap(&conn)
        })
        .await
        .map_err(|e| RefIndexError::Other(format!("schema bootstrap task failed: {e}")))
        .and_then(|outcome| outcome);

        let capabilities = match bootstrapped {
            Ok(capabilities) => capabilities,
            Err(e) => {
                error!("Field index schema bootstrap failed: {}", e);
                pool.close();
                drop(pool);
                discard_launch(&launched);
                if let Some(path) = record_path {
                    remove_record(&path);
                }
                return self.mark_unavailable();
            }
        };

        let mut inner = self.lock_inner();
        inner.capabilities = capabilities;
        inner.schema_bootstrapped = true;
        inner.pool = Some(pool);
        inner.launched = Some(launched);
        inner.record_path = record_path;
        inner.state = EngineState::Running;
        EngineState::Running
    }

    fn mark_unavailable(&self) -> EngineState {
        self.lock_inner().state = EngineState::Unavailable;
        warn!("Structured search is disabled for this run");
        EngineState::Unavailable
    }

    fn write_record(&self, launched: &LaunchedEngine) -> Option<PathBuf> {
        let owner_pid = std::process::id();
        let path = EngineMetadataRecord::path_in(
            &self.options.metadata_dir,
            &self.options.metadata_prefix,
            owner_pid,
        );
        let record =
            EngineMetadataRecord::new(owner_pid, launched.port, Some(launched.data_dir.clone()));
        match record.write(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Failed to write engine metadata record {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Drop and recreate the field index schema.
    ///
    /// Runs at most once per supervisor; later calls return the capabilities
    /// found the first time.
    pub fn bootstrap_schema(&self) -> Result<EngineCapabilities> {
        let mut inner = self.lock_inner();
        if inner.schema_bootstrapped {
            return Ok(inner.capabilities);
        }
        let pool = inner
            .pool
            .clone()
            .ok_or_else(|| RefIndexError::engine_unavailable("engine is not running"))?;
        let conn = pool.get()?;
        let capabilities = FieldSchema::new(&self.layout).bootstrap(&conn)?;
        inner.capabilities = capabilities;
        inner.schema_bootstrapped = true;
        Ok(capabilities)
    }

    /// A pooled connection, or `None` if the engine is not usable right now.
    pub fn get_connection(&self) -> Option<PooledConnection> {
        let pool = {
            let inner = self.lock_inner();
            if inner.state != EngineState::Running {
                return None;
            }
            inner.pool.clone()?
        };
        match pool.get() {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("No engine connection available: {}", e);
                None
            }
        }
    }

    /// Stop the engine and remove its record and data. Idempotent.
    pub fn shutdown(&self) {
        let (pool, launched, record_path) = {
            let mut inner = self.lock_inner();
            if inner.state == EngineState::ShutDown {
                return;
            }
            inner.state = EngineState::ShutDown;
            (
                inner.pool.take(),
                inner.launched.take(),
                inner.record_path.take(),
            )
        };

        if let Some(pool) = pool {
            pool.close();
        }
        if let Some(launched) = &launched {
            discard_launch(launched);
        }
        if let Some(path) = record_path {
            remove_record(&path);
        }
        info!("Embedded engine shut down");
    }
}

fn remove_record(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove engine metadata record {}: {}", path.display(), e);
        }
    }
}

/// Stop an out-of-process engine and delete its data directory.
fn discard_launch(launched: &LaunchedEngine) {
    if !launched.is_in_process() {
        match platform::terminate_process(launched.pid, EngineDefaults::STOP_GRACE) {
            Ok(true) => debug!("Engine host {} stopped", launched.pid),
            Ok(false) => warn!("Engine host {} survived termination", launched.pid),
            Err(e) => warn!("Failed to stop engine process {}: {}", launched.pid, e),
        }
    }
    if let Err(e) = std::fs::remove_dir_all(&launched.data_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "Failed to remove engine data dir {}: {}",
                launched.data_dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FailingLauncher;

    impl EngineLauncher for FailingLauncher {
        fn launch(&self, _options: &EngineOptions) -> Result<LaunchedEngine> {
            Err(RefIndexError::engine_unavailable("binary missing"))
        }
    }

    struct SlowLauncher(Duration);

    impl EngineLauncher for SlowLauncher {
        fn launch(&self, options: &EngineOptions) -> Result<LaunchedEngine> {
            std::thread::sleep(self.0);
            SqliteLauncher.launch(options)
        }
    }

    fn record_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
            .count()
    }

    #[tokio::test]
    async fn test_start_bootstraps_and_records() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = EngineSupervisor::new(EngineOptions::in_dir(temp_dir.path()));

        assert_eq!(supervisor.start().await, EngineState::Running);
        assert!(supervisor.capabilities().trigram);
        assert_eq!(record_count(&temp_dir), 1);

        let conn = supervisor.get_connection().unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM field_values", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
        drop(conn);

        // Idempotent: no second drop-and-recreate.
        conn_insert_marker(&supervisor);
        supervisor.bootstrap_schema().unwrap();
        let conn = supervisor.get_connection().unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM entities", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    fn conn_insert_marker(supervisor: &EngineSupervisor) {
        let conn = supervisor.get_connection().unwrap();
        conn.execute(
            "INSERT INTO entities(entity_id, content_hash) VALUES ('m', 'h')",
            [],
        )
        .unwrap();
    }

    /// Launches normally but leaves a file where the schema wants a table.
    struct PoisonedSchemaLauncher;

    impl EngineLauncher for PoisonedSchemaLauncher {
        fn launch(&self, options: &EngineOptions) -> Result<LaunchedEngine> {
            let launched = SqliteLauncher.launch(options)?;
            std::fs::write(&launched.database_path, b"not a database at all, just bytes")
                .map_err(|e| RefIndexError::io_with_path(e, &launched.database_path))?;
            Ok(launched)
        }
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_unavailable_and_cleaned_up() {
        let temp_dir = TempDir::new().unwrap();
        let mut options = EngineOptions::in_dir(temp_dir.path());
        options.acquire_timeout = Duration::from_millis(300);
        let supervisor = EngineSupervisor::with_launcher(options, Arc::new(PoisonedSchemaLauncher));

        assert_eq!(supervisor.start().await, EngineState::Unavailable);
        assert!(supervisor.get_connection().is_none());
        assert!(supervisor.record_path().is_none());
        assert_eq!(record_count(&temp_dir), 0);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_running_implies_bootstrapped_schema() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Arc::new(EngineSupervisor::with_launcher(
            EngineOptions::in_dir(temp_dir.path()),
            Arc::new(SlowLauncher(Duration::from_millis(100))),
        ));

        let starting = supervisor.clone();
        let start = tokio::spawn(async move { starting.start().await });
        // Poll while the launch and bootstrap are in flight.
        while !start.is_finished() {
            if let Some(conn) = supervisor.get_connection() {
                let n: i64 = conn
                    .query_row("SELECT count(*) FROM entities", [], |row| row.get(0))
                    .unwrap();
                assert_eq!(n, 0);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(start.await.unwrap(), EngineState::Running);
        assert_eq!(supervisor.engine_pid(), Some(std::process::id()));
        assert_eq!(supervisor.port(), None);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_failed_start_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = EngineSupervisor::with_launcher(
            EngineOptions::in_dir(temp_dir.path()),
            Arc::new(FailingLauncher),
        );

        assert_eq!(supervisor.start().await, EngineState::Unavailable);
        assert!(supervisor.get_connection().is_none());
        // Terminal: a second start does not retry.
        assert_eq!(supervisor.start().await, EngineState::Unavailable);
        assert_eq!(record_count(&temp_dir), 0);
    }

    #[tokio::test]
    async fn test_start_timeout_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let mut options = EngineOptions::in_dir(temp_dir.path());
        options.start_timeout = Duration::from_millis(50);
        let supervisor =
            EngineSupervisor::with_launcher(options, Arc::new(SlowLauncher(Duration::from_millis(400))));

        assert_eq!(supervisor.start().await, EngineState::Unavailable);
        assert!(supervisor.get_connection().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = EngineSupervisor::new(EngineOptions::in_dir(temp_dir.path()));
        supervisor.start().await;

        supervisor.shutdown();
        supervisor.shutdown();

        assert_eq!(supervisor.state(), EngineState::ShutDown);
        assert!(supervisor.get_connection().is_none());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
