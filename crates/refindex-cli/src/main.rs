//! refindex - index a JSON record file and run one search against it.
//!
//! Reaps engines left behind by crashed runs, starts a fresh embedded engine,
//! brings both indexes in line with the records, prints the search results as
//! JSON and shuts everything down again.

use anyhow::{Context, Result};
use clap::Parser;
use refindex_core::config::EngineDefaults;
use refindex_core::{
    EngineOptions, EngineState, EngineSupervisor, InMemoryRecordStore, IndexManager,
    IndexOptions, ReaperOptions, SearchFlags, StaleInstanceReaper,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "refindex")]
#[command(about = "Search a reference library by fields and linked document text")]
struct Args {
    /// JSON array of records: [{"id": ..., "fields": {...}}, ...]
    #[arg(short, long)]
    records: PathBuf,

    /// Directory for the engine and the document index (defaults to the
    /// platform temp and application-data directories)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Also search the text of linked documents
    #[arg(long)]
    fulltext: bool,

    /// Run the engine as a separate refindex-engine process
    #[arg(long)]
    separate_engine: bool,

    /// Match case exactly
    #[arg(long)]
    case_sensitive: bool,

    /// Treat search terms as regular expressions
    #[arg(long)]
    regex: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// The query, e.g. `author:Euler AND NOT title:"graph theory"`
    query: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let (mut engine_options, index_options) = match &args.data_dir {
        Some(dir) => (EngineOptions::in_dir(dir), IndexOptions::in_dir(dir)),
        None => (EngineOptions::default(), IndexOptions::default()),
    };
    if args.separate_engine {
        engine_options.host_program = Some(engine_host_program()?);
    }

    let report = StaleInstanceReaper::new(ReaperOptions::for_engine(&engine_options)).reap();
    if !report.killed.is_empty() || !report.failures.is_empty() {
        info!(
            "Reaped stale engines: killed {:?}, {} failures",
            report.killed,
            report.failures.len()
        );
    }

    let store = Arc::new(
        InMemoryRecordStore::from_json_file(&args.records)
            .with_context(|| format!("Failed to load records from {}", args.records.display()))?,
    );
    info!("Loaded {} records", store.len());

    let engine = Arc::new(EngineSupervisor::new(engine_options));
    if engine.start().await != EngineState::Running {
        warn!("Embedded engine unavailable, field search will return no results");
    }

    let manager = IndexManager::builder(engine.clone(), store.clone())
        .options(index_options)
        .build();
    let indexed = manager.update_index().wait().await;
    if !indexed.is_ok() {
        warn!("Indexing finished with errors: {:?}", indexed);
    }

    let flags = SearchFlags::default()
        .case_sensitive(args.case_sensitive)
        .regular_expression(args.regex)
        .fulltext(args.fulltext);
    let outcome = manager.search(&args.query, flags);

    manager.close_and_wait().await;
    engine.shutdown();

    let results = outcome?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

/// The engine host binary installed next to this one.
fn engine_host_program() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate the refindex executable")?;
    Ok(exe.with_file_name(format!(
        "{}{}",
        EngineDefaults::HOST_BINARY_NAME,
        std::env::consts::EXE_SUFFIX
    )))
}
