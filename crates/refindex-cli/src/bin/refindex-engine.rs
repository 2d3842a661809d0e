//! refindex-engine - separate engine host.
//!
//! Started by a refindex run that asked for an out-of-process engine. Prints
//! one ready line with its pid and port on stdout, then serves until killed.

use anyhow::{Context, Result};
use clap::Parser;
use refindex_core::engine::EngineHost;
use std::io::Write;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "refindex-engine")]
#[command(about = "Engine host process for refindex")]
struct Args {
    /// Per-run directory holding the engine database
    #[arg(long)]
    data_dir: PathBuf,

    /// Loopback port to listen on; 0 picks a free one
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let host = EngineHost::bind(&args.data_dir, args.port)
        .with_context(|| format!("Failed to start engine in {}", args.data_dir.display()))?;
    let ready = host.ready_line()?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{ready}")?;
    stdout.flush()?;
    drop(stdout);

    host.serve()?;
    Ok(())
}
