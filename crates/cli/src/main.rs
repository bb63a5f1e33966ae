//! CLI for the amdahl intra-transaction parallelism and redundancy
//! profiler.
//!
//! Pipeline: open substate archive -> replay blocks in parallel with the
//! trace inspector -> analyze per-frame graphs -> one CSV file per block.

use amdahl_analyzer::driver::{TaskFilter, TaskPool, TraceKind};
use amdahl_core::AmdahlError;
use amdahl_substate::DirStore;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "amdahl", version, about = "EVM transaction parallelism and redundancy profiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collect per-frame dependency-graph scheduling stats for each tx.
    DependencyTrace(TraceArgs),
    /// Collect reuse and value-cache stats for each tx.
    RedundancyTrace(TraceArgs),
}

#[derive(Args, Debug)]
struct TraceArgs {
    /// First block of the range (inclusive).
    first_block: u64,
    /// Last block of the range (inclusive).
    last_block: u64,

    /// Number of worker threads that execute in parallel.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Skip transactions that only transfer ETH.
    #[arg(long)]
    skip_transfer_txs: bool,

    /// Skip CALL transactions to accounts with contract bytecode.
    #[arg(long)]
    skip_call_txs: bool,

    /// Skip CREATE transactions.
    #[arg(long)]
    skip_create_txs: bool,

    /// Substate archive directory.
    #[arg(long, env = "AMDAHL_SUBSTATE_DIR", default_value = "substate")]
    substate_dir: PathBuf,

    /// Directory receiving one CSV file per block.
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (kind, name, args) = match cli.command {
        Commands::DependencyTrace(args) => (TraceKind::Dependency, "dependency trace", args),
        Commands::RedundancyTrace(args) => (TraceKind::Redundancy, "redundancy trace", args),
    };

    if args.first_block > args.last_block {
        return Err(Box::new(AmdahlError::InvalidInput(format!(
            "first block {} is greater than last block {}",
            args.first_block, args.last_block
        ))));
    }
    if !args.output_dir.is_dir() {
        return Err(Box::new(AmdahlError::InvalidInput(format!(
            "output directory {} does not exist",
            args.output_dir.display()
        ))));
    }

    let store = DirStore::open_read_only(&args.substate_dir)?;

    let pool = TaskPool {
        name,
        kind,
        store: &store,
        first: args.first_block,
        last: args.last_block,
        workers: args.workers,
        filter: TaskFilter {
            skip_transfer_txs: args.skip_transfer_txs,
            skip_call_txs: args.skip_call_txs,
            skip_create_txs: args.skip_create_txs,
        },
        output_dir: args.output_dir,
    };

    let stats = pool.execute()?;
    tracing::info!(blocks = stats.blocks, txs = stats.txs, "run complete");
    Ok(())
}
