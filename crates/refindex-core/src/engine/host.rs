//! Separate engine host process.
//!
//! `refindex-engine --data-dir <dir> --port 0` prepares the database in
//! `<dir>`, binds a loopback port and announces itself on stdout with one
//! ready line. It then answers every connection with a status line until it
//! is killed. The owning run opens the database file directly; the port is
//! how the stale instance reaper finds a host whose owner crashed.

use crate::config::EngineDefaults;
use crate::error::{RefIndexError, Result};
use rusqlite::Connection;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Create the engine database in `data_dir` and check it supports FTS5.
pub fn prepare_database(data_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(data_dir).map_err(|e| RefIndexError::io_with_path(e, data_dir))?;
    let database_path = data_dir.join(EngineDefaults::DATABASE_FILENAME);
    let conn = Connection::open(&database_path)?;
    let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
    let fts5: bool = conn.query_row(
        "SELECT sqlite_compileoption_used('ENABLE_FTS5')",
        [],
        |row| row.get(0),
    )?;
    if !fts5 {
        return Err(RefIndexError::engine_unavailable(
            "SQLite was built without FTS5",
        ));
    }
    debug!("Prepared SQLite {} database at {}", version, database_path.display());
    Ok(database_path)
}

/// What a host reports once it is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyLine {
    pub pid: u32,
    pub port: u16,
}

impl ReadyLine {
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(EngineDefaults::HOST_READY_PREFIX)?;
        let mut pid = None;
        let mut port = None;
        for pair in rest.split_whitespace() {
            match pair.split_once('=') {
                Some(("pid", v)) => pid = v.parse().ok(),
                Some(("port", v)) => port = v.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            pid: pid?,
            port: port?,
        })
    }
}

impl std::fmt::Display for ReadyLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pid={} port={}",
            EngineDefaults::HOST_READY_PREFIX,
            self.pid,
            self.port
        )
    }
}

pub struct EngineHost {
    listener: TcpListener,
    database_path: PathBuf,
}

impl EngineHost {
    /// Prepare the database and bind `127.0.0.1:port`; port 0 picks a free one.
    pub fn bind(data_dir: &Path, port: u16) -> Result<Self> {
        let database_path = prepare_database(data_dir)?;
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .map_err(|e| RefIndexError::engine_unavailable(format!("cannot bind port {port}: {e}")))?;
        Ok(Self {
            listener,
            database_path,
        })
    }

    pub fn ready_line(&self) -> Result<ReadyLine> {
        let port = self
            .listener
            .local_addr()
            .map_err(|e| RefIndexError::engine_unavailable(format!("no local address: {e}")))?
            .port();
        Ok(ReadyLine {
            pid: std::process::id(),
            port,
        })
    }

    /// Answer status requests until the process is killed.
    pub fn serve(self) -> Result<()> {
        info!("Engine host serving {}", self.database_path.display());
        let status = format!("ok {}\n", self.database_path.display());
        for stream in self.listener.incoming() {
            match stream {
                Ok(mut stream) => {
                    if let Err(e) = stream.write_all(status.as_bytes()) {
                        debug!("Status request dropped: {}", e);
                    }
                }
                Err(e) => warn!("Engine host accept failed: {}", e),
            }
        }
        Ok(())
    }
}
