//! CLI sync harness for exercising the engine against a simulated chain
//!
//! This tool allows testing:
//! - Catch-up from birthday, in memory or on SQLite
//! - Reorg recovery
//! - Flaky or stalling remotes
//! - Interrupt/resume scenarios
//! - Performance benchmarking

use anyhow::{bail, ensure, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use lightwallet_sync::memory::{
    ChainFault, MemoryBlockCache, MemoryChain, MemoryDerivedStore, TagScanner,
};
use lightwallet_sync::continuity::first_break;
use lightwallet_sync::planner::batches_remaining;
use lightwallet_sync::{
    Birthday, BlockCache, DerivedStateStore, RetryConfig, ScanRange, SqliteBlockCache,
    SqliteDerivedStore, StopReason, SyncConfig, SyncEngine, SyncEvent, SyncProgress,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Payload byte the harness scanner treats as a wallet transaction
const WALLET_TAG: u8 = 7;

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Light wallet sync testing harness", long_about = None)]
struct Cli {
    /// Maximum blocks per range
    #[arg(long, global = true, default_value = "100")]
    batch: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a simulated chain from birthday to tip
    CatchUp {
        /// Chain tip height
        #[arg(short, long, default_value = "20000")]
        tip: u64,

        /// Birthday height
        #[arg(short, long, default_value = "1000")]
        birthday: u64,

        /// Put a wallet payment in every Nth block
        #[arg(short, long, default_value = "97")]
        pay_every: u64,

        /// Persist to SQLite in this directory instead of memory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Reorganize the chain after a sync and check recovery
    Reorg {
        /// Chain tip height
        #[arg(short, long, default_value = "5000")]
        tip: u64,

        /// Birthday height
        #[arg(short, long, default_value = "1000")]
        birthday: u64,

        /// Blocks replaced by the competing branch
        #[arg(short, long, default_value = "10")]
        depth: u64,

        /// Heights skipped per step of the ancestor search
        #[arg(short, long, default_value = "1")]
        step: u64,
    },

    /// Sync through injected remote failures
    Flaky {
        /// Chain tip height
        #[arg(short, long, default_value = "5000")]
        tip: u64,

        /// Birthday height
        #[arg(short, long, default_value = "1000")]
        birthday: u64,

        /// Failure to inject
        #[arg(short, long, value_enum, default_value = "connection")]
        fault: FaultArg,

        /// Consecutive failed fetches
        #[arg(short = 'n', long, default_value = "3")]
        failures: usize,

        /// Attempt budget per failure streak
        #[arg(short, long, default_value = "5")]
        attempts: u32,
    },

    /// Cancel a running sync, then resume it
    Interrupt {
        /// Chain tip height
        #[arg(short, long, default_value = "20000")]
        tip: u64,

        /// Birthday height
        #[arg(short, long, default_value = "1000")]
        birthday: u64,

        /// Cancel after this many milliseconds
        #[arg(short, long, default_value = "200")]
        interrupt_after: u64,

        /// Simulated scan cost per block in microseconds
        #[arg(long, default_value = "50")]
        scan_cost: u64,
    },

    /// Benchmark sync throughput
    Benchmark {
        /// Number of blocks to sync
        #[arg(short, long, default_value = "50000")]
        blocks: u64,

        /// Number of runs
        #[arg(short, long, default_value = "3")]
        runs: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FaultArg {
    Stall,
    Connection,
    Short,
    Broken,
}

impl From<FaultArg> for ChainFault {
    fn from(fault: FaultArg) -> Self {
        match fault {
            FaultArg::Stall => ChainFault::Stall,
            FaultArg::Connection => ChainFault::Connection,
            FaultArg::Short => ChainFault::ShortResponse,
            FaultArg::Broken => ChainFault::BrokenLink,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig {
        max_batch_size: cli.batch,
        ..SyncConfig::from_env()
    };

    match cli.command {
        Commands::CatchUp {
            tip,
            birthday,
            pay_every,
            data_dir,
        } => run_catch_up(config, tip, birthday, pay_every, data_dir).await?,
        Commands::Reorg {
            tip,
            birthday,
            depth,
            step,
        } => run_reorg(config, tip, birthday, depth, step).await?,
        Commands::Flaky {
            tip,
            birthday,
            fault,
            failures,
            attempts,
        } => run_flaky(config, tip, birthday, fault.into(), failures, attempts).await?,
        Commands::Interrupt {
            tip,
            birthday,
            interrupt_after,
            scan_cost,
        } => run_interrupt(config, tip, birthday, interrupt_after, scan_cost).await?,
        Commands::Benchmark { blocks, runs } => run_benchmark(config, blocks, runs).await?,
    }

    Ok(())
}

/// Simulated chain with a payment every `pay_every` blocks above `birthday`
fn build_chain(tip: u64, birthday: u64, pay_every: u64) -> anyhow::Result<Arc<MemoryChain>> {
    ensure!(birthday < tip, "birthday {} must be below tip {}", birthday, tip);
    let chain = Arc::new(MemoryChain::new(tip));
    if pay_every > 0 {
        for height in (birthday + 1..=tip).filter(|h| h % pay_every == 0) {
            chain.pay_at(height, WALLET_TAG);
        }
    }
    Ok(chain)
}

fn birthday_of(chain: &MemoryChain, height: u64) -> anyhow::Result<Birthday> {
    let block = chain
        .block(height)
        .with_context(|| format!("no block at birthday height {}", height))?;
    Ok(Birthday::with_hash(height, block.hash))
}

struct Wallet {
    cache: Arc<dyn BlockCache>,
    store: Arc<dyn DerivedStateStore>,
}

impl Wallet {
    fn in_memory() -> Self {
        Self {
            cache: Arc::new(MemoryBlockCache::new()),
            store: Arc::new(MemoryDerivedStore::new()),
        }
    }

    fn on_disk(dir: &std::path::Path) -> anyhow::Result<Self> {
        Ok(Self {
            cache: Arc::new(SqliteBlockCache::open(dir.join("blocks.db"))?),
            store: Arc::new(SqliteDerivedStore::open(dir.join("wallet.db"))?),
        })
    }

    async fn engine(
        &self,
        chain: &Arc<MemoryChain>,
        scanner: TagScanner,
        birthday: Birthday,
        config: SyncConfig,
    ) -> anyhow::Result<SyncEngine> {
        Ok(SyncEngine::open(
            chain.clone(),
            self.cache.clone(),
            self.store.clone(),
            Arc::new(scanner),
            birthday,
            config,
        )
        .await?)
    }

    async fn transaction_count(&self, birthday: u64, tip: u64) -> anyhow::Result<usize> {
        let Some(range) = lightwallet_sync::ScanRange::new(birthday + 1, tip) else {
            return Ok(0);
        };
        Ok(self.store.transactions(range).await?.len())
    }
}

/// Progress bar fed from the engine's tracker until the returned task is aborted
fn spawn_progress_bar(
    progress: SyncProgress,
) -> anyhow::Result<(ProgressBar, tokio::task::JoinHandle<()>)> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% {msg}")?
            .progress_chars("=>-"),
    );

    let pb_clone = pb.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            pb_clone.set_position(progress.percentage() as u64);
            pb_clone.set_message(progress.summary());
        }
    });
    Ok((pb, task))
}

async fn run_catch_up(
    config: SyncConfig,
    tip: u64,
    birthday: u64,
    pay_every: u64,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Starting catch-up from birthday {} to tip {}", birthday, tip);

    let chain = build_chain(tip, birthday, pay_every)?;
    let wallet = match &data_dir {
        Some(dir) => {
            info!("Persisting to {}", dir.display());
            Wallet::on_disk(dir)?
        }
        None => Wallet::in_memory(),
    };
    let batch_size = config.max_batch_size;
    let mut engine = wallet
        .engine(
            &chain,
            TagScanner::new(WALLET_TAG),
            birthday_of(&chain, birthday)?,
            config,
        )
        .await?;

    let resume_from = engine.state().highest_scanned_height;
    if resume_from > birthday {
        info!("Resuming from high-water mark {}", resume_from);
    }
    info!(
        "Planned {} batch(es) of up to {} blocks",
        batches_remaining(resume_from, tip, batch_size),
        batch_size
    );

    let (pb, progress_task) = spawn_progress_bar(engine.progress())?;
    let started = Instant::now();
    let result = engine.sync_to_tip().await;
    progress_task.abort();

    let height = match result {
        Ok(height) => {
            pb.finish_with_message("Sync complete");
            height
        }
        Err(e) => {
            pb.abandon_with_message("Sync failed");
            bail!("sync failed: {}", e);
        }
    };

    if let Some(range) = ScanRange::new(birthday + 1, height) {
        let cached = engine.view().blocks(range).await?;
        if let Some(broken) = first_break(&cached) {
            bail!("cached chain broken at height {}", broken);
        }
        ensure!(
            cached.len() as u64 == range.len(),
            "cache holds {} of {} committed blocks",
            cached.len(),
            range.len()
        );
    }

    let counters = engine.progress().counters();
    let found = wallet.transaction_count(birthday, height).await?;
    info!("Synced to {} in {:.2}s", height, started.elapsed().as_secs_f64());
    info!(
        "  Batches: {} | Transactions: {} | Avg batch: {}ms",
        counters.batches_committed, found, counters.avg_batch_ms
    );
    if pay_every > 0 {
        let expected = (birthday + 1..=tip).filter(|h| h % pay_every == 0).count();
        ensure!(
            found == expected,
            "found {} transactions, expected {}",
            found,
            expected
        );
    }
    Ok(())
}

async fn run_reorg(
    config: SyncConfig,
    tip: u64,
    birthday: u64,
    depth: u64,
    step: u64,
) -> anyhow::Result<()> {
    info!("Starting reorg test: depth {} with step {}", depth, step);
    let chain = build_chain(tip, birthday, 13)?;
    ensure!(
        depth > 0 && depth < tip - birthday,
        "reorg depth {} must be between 1 and the distance to birthday {}",
        depth,
        birthday
    );
    let config = SyncConfig {
        reorg_step: step,
        ..config
    };
    let wallet = Wallet::in_memory();
    let birthday_block = birthday_of(&chain, birthday)?;
    let mut engine = wallet
        .engine(
            &chain,
            TagScanner::new(WALLET_TAG),
            birthday_block.clone(),
            config.clone(),
        )
        .await?;
    let mut events = engine.subscribe();
    engine.sync_to_tip().await?;

    let fork_height = tip - depth + 1;
    chain.fork_at(fork_height, 1);
    chain.mine(1);
    info!("Replaced blocks from {} and mined to {}", fork_height, chain.tip());

    let height = engine.sync_to_tip().await?;
    let mut reorgs = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ReorgDetected {
            from_height,
            to_height,
        } = event
        {
            reorgs.push((from_height, to_height));
        }
    }
    ensure!(!reorgs.is_empty(), "no reorg was detected");
    for (from, to) in &reorgs {
        info!("Reorg recovered: {} -> {}", from, to);
    }
    let counters = engine.progress().counters();
    info!("Rewinds: {} | synced to {}", counters.rewinds, height);

    // Compare against a fresh sync of the final chain
    let reference = Wallet::in_memory();
    let mut fresh = reference
        .engine(&chain, TagScanner::new(WALLET_TAG), birthday_block, config)
        .await?;
    fresh.sync_to_tip().await?;
    let ours = wallet.transaction_count(birthday, height).await?;
    let theirs = reference.transaction_count(birthday, height).await?;
    ensure!(
        ours == theirs && wallet.store.scan_state().await? == reference.store.scan_state().await?,
        "recovered wallet diverges from a fresh sync"
    );
    info!("Recovered wallet matches a fresh sync ({} transactions)", ours);
    Ok(())
}

async fn run_flaky(
    config: SyncConfig,
    tip: u64,
    birthday: u64,
    fault: ChainFault,
    failures: usize,
    attempts: u32,
) -> anyhow::Result<()> {
    info!(
        "Starting flaky-remote test: {:?} x{} with {} attempts",
        fault, failures, attempts
    );

    let chain = build_chain(tip, birthday, 0)?;
    chain.fail_fetches(fault, failures);
    let config = SyncConfig {
        retry: RetryConfig {
            max_attempts: attempts,
            ..config.retry.clone()
        },
        request_timeout: Duration::from_secs(2),
        ..config
    };

    let wallet = Wallet::in_memory();
    let mut engine = wallet
        .engine(
            &chain,
            TagScanner::new(WALLET_TAG),
            birthday_of(&chain, birthday)?,
            config,
        )
        .await?;
    let mut events = engine.subscribe();

    let result = engine.sync_to_tip().await;
    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::Error { recoverable: true, .. }) {
            retries += 1;
        }
    }

    match result {
        Ok(height) => info!("Synced to {} after {} retries", height, retries),
        Err(e) if failures >= attempts as usize => {
            info!("Stopped as expected after {} retries: {}", retries, e);
        }
        Err(e) => bail!("sync failed within its retry budget: {}", e),
    }
    Ok(())
}

async fn run_interrupt(
    config: SyncConfig,
    tip: u64,
    birthday: u64,
    interrupt_after: u64,
    scan_cost: u64,
) -> anyhow::Result<()> {
    info!("Starting interrupt test");
    info!("Will interrupt after {}ms", interrupt_after);

    let chain = build_chain(tip, birthday, 31)?;
    let wallet = Wallet::in_memory();
    let birthday_block = birthday_of(&chain, birthday)?;
    let scanner = || TagScanner::new(WALLET_TAG).with_delay(Duration::from_micros(scan_cost));

    let mut engine = wallet
        .engine(&chain, scanner(), birthday_block.clone(), config.clone())
        .await?;
    let handle = engine.handle();
    let run = tokio::spawn(async move {
        let reason = engine.start(None).await;
        (engine, reason)
    });

    tokio::time::sleep(Duration::from_millis(interrupt_after)).await;
    warn!("Interrupting sync...");
    handle.cancel();
    let (engine, reason) = run.await?;
    ensure!(
        reason == StopReason::Cancelled,
        "run stopped for another reason: {:?}",
        reason
    );

    let interrupted_at = engine.state().highest_scanned_height;
    info!("Interrupted at height {}", interrupted_at);
    drop(engine);

    // Resume with a new engine over the same stores
    let mut resumed = wallet
        .engine(&chain, scanner(), birthday_block, config)
        .await?;
    ensure!(
        resumed.state().highest_scanned_height == interrupted_at,
        "resumed engine did not pick up the committed height"
    );
    let height = resumed.sync_to_tip().await?;
    info!("Resume completed at {}", height);

    let found = wallet.transaction_count(birthday, height).await?;
    let expected = (birthday + 1..=tip).filter(|h| h % 31 == 0).count();
    ensure!(
        found == expected,
        "found {} transactions after resume, expected {}",
        found,
        expected
    );
    Ok(())
}

async fn run_benchmark(config: SyncConfig, blocks: u64, runs: u32) -> anyhow::Result<()> {
    info!("Starting benchmark: {} blocks, {} runs", blocks, runs);
    ensure!(runs > 0 && blocks > 0, "nothing to benchmark");

    let chain = build_chain(blocks, 0, 101)?;
    let mut total_duration = Duration::ZERO;
    let mut total_blocks = 0u64;

    for run in 1..=runs {
        info!("Run {}/{}", run, runs);

        let wallet = Wallet::in_memory();
        let mut engine = wallet
            .engine(
                &chain,
                TagScanner::new(WALLET_TAG),
                birthday_of(&chain, 0)?,
                config.clone(),
            )
            .await?;
        let start_time = Instant::now();
        engine.sync_to_tip().await?;

        let elapsed = start_time.elapsed();
        let blocks_per_sec = blocks as f64 / elapsed.as_secs_f64();

        info!(
            "  Duration: {:.2}s | {:.1} blocks/s",
            elapsed.as_secs_f64(),
            blocks_per_sec
        );

        total_duration += elapsed;
        total_blocks += blocks;
    }

    let avg_duration = total_duration / runs;
    let avg_blocks_per_sec = total_blocks as f64 / total_duration.as_secs_f64();

    info!("Benchmark Results:");
    info!("  Runs: {}", runs);
    info!("  Total blocks: {}", total_blocks);
    info!("  Average duration: {:.2}s", avg_duration.as_secs_f64());
    info!("  Average speed: {:.1} blocks/s", avg_blocks_per_sec);

    Ok(())
}
