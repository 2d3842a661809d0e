//! Connection pool over the engine's database file.
//!
//! Backed by r2d2. Connections are opened lazily up to `max_size`; every one
//! gets the same PRAGMAs and the helper SQL functions compiled queries rely
//! on (`regexp`, `unicode_lower`).

use crate::config::EngineDefaults;
use crate::error::{RefIndexError, Result};
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A checked-out connection; goes back to the pool on drop.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: r2d2::Pool<SqliteConnectionManager>,
    db_path: PathBuf,
    closed: Arc<AtomicBool>,
}

impl ConnectionPool {
    pub fn new(db_path: impl Into<PathBuf>, max_size: usize, acquire_timeout: Duration) -> Self {
        let db_path = db_path.into();
        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            configure_connection(conn)?;
            register_functions(conn)
        });
        let max_size = u32::try_from(max_size.max(1)).unwrap_or(u32::MAX);
        let pool = r2d2::Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(acquire_timeout.max(Duration::from_millis(1)))
            .build_unchecked(manager);
        Self {
            pool,
            db_path,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub fn get(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(RefIndexError::engine_unavailable("connection pool is closed"));
        }
        self.pool.get().map_err(|e| {
            RefIndexError::engine_unavailable(format!(
                "no connection to {}: {}",
                self.db_path.display(),
                e
            ))
        })
    }

    /// Refuse further checkouts. Open connections are closed once the last
    /// handle to the pool is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let state = self.pool.state();
            debug!(
                "Closing engine pool ({} connections, {} idle)",
                state.connections, state.idle_connections
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Configure connection for concurrent readers and one writer.
pub(crate) fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(EngineDefaults::BUSY_TIMEOUT)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    Ok(())
}

/// Install `regexp(pattern, text)` and `unicode_lower(text)`.
///
/// SQLite rewrites `text REGEXP pattern` to `regexp(pattern, text)`. Compiled
/// patterns are cached per statement through the function's aux data.
pub(crate) fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let is_match = match ctx.get_raw(1) {
                ValueRef::Null => false,
                ValueRef::Text(bytes) => regex.is_match(&String::from_utf8_lossy(bytes)),
                other => {
                    return Err(rusqlite::Error::UserFunctionError(
                        format!("regexp expects text, got {:?}", other.data_type()).into(),
                    ))
                }
            };
            Ok(is_match)
        },
    )?;

    conn.create_scalar_function(
        "unicode_lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )?;
    Ok(())
}
