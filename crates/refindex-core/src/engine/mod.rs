//! Embedded engine supervision.
//!
//! - `host` - The separate engine host process
//! - `launcher` - Starting an engine instance
//! - `pool` - Connection pool with helper SQL functions
//! - `record` - Engine Metadata Records for the stale instance reaper
//! - `schema` - Field index schema bootstrap
//! - `supervisor` - Lifecycle owner tying the above together

mod host;
mod launcher;
mod pool;
mod record;
mod schema;
mod supervisor;

pub use host::{prepare_database, EngineHost, ReadyLine};
pub use launcher::{EngineLauncher, HostProcessLauncher, LaunchedEngine, SqliteLauncher};
pub use pool::{ConnectionPool, PooledConnection};
pub use record::EngineMetadataRecord;
pub use schema::{EngineCapabilities, FieldSchema};
pub use supervisor::{EngineState, EngineSupervisor};

pub(crate) use pool::{configure_connection, register_functions};
