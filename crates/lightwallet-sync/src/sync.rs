//! Block synchronization engine
//!
//! Drives the fetch → validate → scan → persist pipeline one range at a time:
//! - Plans the next range above the high-water mark
//! - Validates it against the cached tip and internally
//! - Scans it sequentially on the blocking pool
//! - Appends the blocks to the cache and commits the derived state with the new high-water mark
//! - Walks back to a common ancestor and rewinds when the remote chain diverged
//!
//! Retryable failures are absorbed with exponential backoff; everything else stops the engine
//! until the host restarts it.

use crate::block::{BlockHash, BlockSummary, ScanRange};
use crate::block_cache::BlockCache;
use crate::client::{call_with_deadline, submit_transaction, ChainSource, SubmittedTransaction};
use crate::continuity::validate_range;
use crate::control::{CancelToken, PauseGate};
use crate::error::{ScanFailure, SourceError};
use crate::events::{EventSink, SyncEvent};
use crate::planner::plan_next_range;
use crate::progress::SyncProgress;
use crate::reorg::AncestorSearch;
use crate::retry::{duration_ms, Backoff, RetryConfig};
use crate::scan::{scan_batch, BlockScanner, ScanState, ScannedBatch};
use crate::state::{Birthday, StopReason, SyncPhase, SyncState};
use crate::store::{CommitBatch, CommittedView, DerivedStateStore};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Environment overrides read by [`SyncConfig::from_env`]
pub const BATCH_SIZE_ENV: &str = "LIGHTWALLET_SYNC_BATCH_SIZE";
/// See [`BATCH_SIZE_ENV`]
pub const MAX_ATTEMPTS_ENV: &str = "LIGHTWALLET_SYNC_MAX_ATTEMPTS";
/// See [`BATCH_SIZE_ENV`]
pub const TIMEOUT_SECS_ENV: &str = "LIGHTWALLET_SYNC_TIMEOUT_SECS";
/// See [`BATCH_SIZE_ENV`]
pub const POLL_SECS_ENV: &str = "LIGHTWALLET_SYNC_POLL_SECS";

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum blocks per range
    pub max_batch_size: u64,
    /// Backoff curve and attempt budget for network failures
    pub retry: RetryConfig,
    /// Attempt budget for scan failures (same backoff curve)
    pub scan_max_attempts: u32,
    /// Deadline for any single chain source call
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Delay between tip polls once caught up
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Heights skipped per step while walking back after a divergence
    pub reorg_step: u64,
    /// Deepest rewind accepted without stopping (None = down to the birthday)
    pub max_reorg_depth: Option<u64>,
    /// Events buffered per subscriber
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            retry: RetryConfig::default(),
            scan_max_attempts: 3,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(20),
            reorg_step: 1,
            max_reorg_depth: None,
            event_buffer: 256,
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}", name, raw);
            None
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `LIGHTWALLET_SYNC_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(batch) = env_override(BATCH_SIZE_ENV) {
            config.max_batch_size = batch;
        }
        if let Some(attempts) = env_override(MAX_ATTEMPTS_ENV) {
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = env_override(TIMEOUT_SECS_ENV) {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_override(POLL_SECS_ENV) {
            config.poll_interval = Duration::from_secs(secs);
        }
        config
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let reject = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.max_batch_size == 0 {
            return reject("max_batch_size must be at least 1");
        }
        if self.retry.max_attempts == 0 || self.scan_max_attempts == 0 {
            return reject("attempt budgets must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return reject("backoff_multiplier must be at least 1.0");
        }
        if self.request_timeout.is_zero() {
            return reject("request_timeout must be non-zero");
        }
        if self.reorg_step == 0 {
            return reject("reorg_step must be at least 1");
        }
        if self.event_buffer == 0 {
            return reject("event_buffer must be at least 1");
        }
        Ok(())
    }
}

/// Whether a run ends once caught up or keeps following the tip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Follow,
    UntilCaughtUp,
}

/// Next unit of work
enum Step {
    /// Between batches; pause is honored here
    Idle,
    /// Ask the remote for its tip
    Poll,
    /// Caught up with the remote
    CaughtUp,
    Fetch(ScanRange),
    Validate(ScanRange, Vec<BlockSummary>),
    Scan(ScanRange, Vec<BlockSummary>),
    Persist(Vec<BlockSummary>, ScannedBatch),
    /// Local block at `mismatch_height` disagrees with the remote
    Recover { mismatch_height: u64 },
}

/// Per-run retry budgets
struct Budgets {
    network: Backoff,
    scan: Backoff,
}

impl Budgets {
    fn new(config: &SyncConfig) -> Self {
        Self {
            network: Backoff::new(config.retry.clone()),
            scan: Backoff::new(config.retry.with_max_attempts(config.scan_max_attempts)),
        }
    }

    fn reset(&mut self) {
        self.network.reset();
        self.scan.reset();
    }
}

/// Cloneable control surface for a running engine
#[derive(Clone)]
pub struct SyncHandle {
    cancel: CancelToken,
    pause: PauseGate,
    events: EventSink,
    state: Arc<RwLock<SyncState>>,
    source: Arc<dyn ChainSource>,
    request_timeout: Duration,
}

impl SyncHandle {
    /// Stop the current run at the next opportunity.
    ///
    /// In-flight network calls and backoff sleeps are abandoned immediately, scanning stops
    /// between blocks, a commit already under way completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
        tracing::info!("Sync cancellation requested");
    }

    /// Park the engine before its next range
    pub fn pause(&self) {
        self.pause.pause();
        tracing::info!("Sync pause requested");
    }

    /// Continue with the next planned range
    pub fn resume(&self) {
        self.pause.resume();
        tracing::info!("Sync resumed");
    }

    /// Whether a pause is in effect
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the engine state
    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    /// Broadcast a raw transaction once; never retried
    pub async fn submit_transaction(&self, raw_tx: Vec<u8>) -> Result<SubmittedTransaction> {
        submit_transaction(
            self.source.as_ref(),
            raw_tx,
            self.request_timeout,
            &CancelToken::new(),
        )
        .await
    }
}

/// Sync engine
pub struct SyncEngine {
    source: Arc<dyn ChainSource>,
    cache: Arc<dyn BlockCache>,
    store: Arc<dyn DerivedStateStore>,
    scanner: Arc<dyn BlockScanner>,
    birthday: Birthday,
    config: SyncConfig,
    state: SyncState,
    shared_state: Arc<RwLock<SyncState>>,
    events: EventSink,
    progress: SyncProgress,
    cancel: CancelToken,
    pause: PauseGate,
    announced_height: Option<u64>,
}

impl SyncEngine {
    /// Open an engine over its collaborators.
    ///
    /// Resumes from the store's high-water mark (the birthday when nothing is committed) and
    /// aligns the block cache with it.
    pub async fn open(
        source: Arc<dyn ChainSource>,
        cache: Arc<dyn BlockCache>,
        store: Arc<dyn DerivedStateStore>,
        scanner: Arc<dyn BlockScanner>,
        birthday: Birthday,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let high_water_mark = store.current_high_water_mark().await?;
        let persisted = store.sync_state().await?;
        if let Some(persisted) = &persisted {
            if persisted.birthday_height != birthday.height {
                return Err(Error::Config(format!(
                    "store belongs to a wallet with birthday {}, not {}",
                    persisted.birthday_height, birthday.height
                )));
            }
        }

        let mut state = SyncState::initial(birthday.height, high_water_mark);
        if let Some(persisted) = persisted {
            let remote = persisted
                .latest_known_remote_height
                .max(state.highest_scanned_height);
            state = state.observe_remote(remote);
        }

        tracing::info!(
            "Opening sync engine: birthday={}, high_water_mark={}",
            birthday.height,
            state.highest_scanned_height
        );

        let mut engine = Self {
            source,
            cache,
            store,
            scanner,
            events: EventSink::new(config.event_buffer),
            shared_state: Arc::new(RwLock::new(state.clone())),
            state,
            birthday,
            config,
            progress: SyncProgress::new(),
            cancel: CancelToken::new(),
            pause: PauseGate::new(),
            announced_height: None,
        };
        engine.reconcile().await?;
        Ok(engine)
    }

    /// Control handle for other tasks
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            cancel: self.cancel.clone(),
            pause: self.pause.clone(),
            events: self.events.clone(),
            state: Arc::clone(&self.shared_state),
            source: Arc::clone(&self.source),
            request_timeout: self.config.request_timeout,
        }
    }

    /// Current engine state
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Progress tracker
    pub fn progress(&self) -> SyncProgress {
        self.progress.clone()
    }

    /// Read-only view over committed heights
    pub fn view(&self) -> CommittedView {
        CommittedView::new(Arc::clone(&self.cache), Arc::clone(&self.store))
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run until stopped by cancellation or a fatal error, following the tip once caught up.
    ///
    /// With `from_height` below the next unscanned height, first rewinds so scanning resumes at
    /// `from_height` (never below the birthday). A higher `from_height` is ignored.
    pub async fn start(&mut self, from_height: Option<u64>) -> StopReason {
        let outcome = match self.prepare(from_height).await {
            Ok(()) => self.drive(RunMode::Follow).await,
            Err(e) => Err(e),
        };
        // A follow run only ends with an error
        let error = match outcome {
            Ok(_) => Error::Cancelled,
            Err(e) => e,
        };
        self.stop(&error)
    }

    /// Sync up to the current remote tip and return the committed height
    pub async fn sync_to_tip(&mut self) -> Result<u64> {
        let outcome = match self.prepare(None).await {
            Ok(()) => self.drive(RunMode::UntilCaughtUp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            self.stop(e);
        }
        outcome
    }

    /// Broadcast a raw transaction once; never retried
    pub async fn submit_transaction(&self, raw_tx: Vec<u8>) -> Result<SubmittedTransaction> {
        self.handle().submit_transaction(raw_tx).await
    }

    async fn prepare(&mut self, from_height: Option<u64>) -> Result<()> {
        self.cancel.reset();
        self.set_phase(SyncPhase::Idle);
        self.reconcile().await?;

        if let Some(from_height) = from_height {
            let next = self.state.next_height();
            if from_height > next {
                tracing::warn!(
                    "Ignoring start height {} above next unscanned height {}",
                    from_height,
                    next
                );
            } else {
                let target = from_height.saturating_sub(1).max(self.birthday.height);
                if target < self.state.highest_scanned_height {
                    tracing::info!(
                        "Rewinding from {} to {} on host request",
                        self.state.highest_scanned_height,
                        target
                    );
                    self.rewind_to(target).await?;
                }
            }
        }

        self.progress.start(self.state.highest_scanned_height);
        self.progress.set_target(self.state.latest_known_remote_height);
        self.announced_height = None;
        Ok(())
    }

    /// Align engine state and the cache with the store, which is authoritative for the
    /// high-water mark.
    async fn reconcile(&mut self) -> Result<()> {
        let hwm = self
            .store
            .current_high_water_mark()
            .await?
            .unwrap_or(self.birthday.height)
            .max(self.birthday.height);
        if hwm != self.state.highest_scanned_height {
            tracing::warn!(
                "Engine high-water mark {} disagrees with store at {}, following the store",
                self.state.highest_scanned_height,
                hwm
            );
            self.update(|s| s.resume_at(hwm));
            self.progress.record_rewind(hwm);
        }

        let cache_tip = self.cache.latest_height().await?;

        if let Some(tip) = cache_tip {
            if tip > hwm {
                tracing::warn!(
                    "Dropping {} uncommitted cached block(s) above {}",
                    tip - hwm,
                    hwm
                );
                self.cache.truncate_from(hwm + 1).await?;
            }
        }

        let cached_floor = cache_tip.unwrap_or(self.birthday.height).max(self.birthday.height);
        if cached_floor < hwm {
            tracing::warn!(
                "Block cache ends at {} below high-water mark {}, rescanning from there",
                cached_floor,
                hwm
            );
            self.rewind_to(cached_floor).await?;
        }
        Ok(())
    }

    async fn drive(&mut self, mode: RunMode) -> Result<u64> {
        let mut budgets = Budgets::new(&self.config);
        let mut step = Step::Idle;

        loop {
            step = match step {
                Step::Idle => self.idle().await?,
                Step::Poll => self.poll(&mut budgets).await?,
                Step::CaughtUp => {
                    let height = self.state.highest_scanned_height;
                    if self.announced_height != Some(height) {
                        self.announced_height = Some(height);
                        self.events.emit(SyncEvent::CaughtUp { height });
                    }
                    if mode == RunMode::UntilCaughtUp {
                        return Ok(height);
                    }
                    self.sleep(self.config.poll_interval).await?;
                    Step::Idle
                }
                Step::Fetch(range) => self.fetch(range, &mut budgets).await?,
                Step::Validate(range, blocks) => {
                    self.validate(range, blocks, &mut budgets).await?
                }
                Step::Scan(range, blocks) => self.scan(range, blocks, &mut budgets).await?,
                Step::Persist(blocks, batch) => self.persist(blocks, batch).await?,
                Step::Recover { mismatch_height } => {
                    budgets.reset();
                    let step = self.recover(mismatch_height, &mut budgets).await?;
                    budgets.reset();
                    step
                }
            };
        }
    }

    async fn idle(&mut self) -> Result<Step> {
        self.set_phase(SyncPhase::Idle);
        if !self.pause.wait_open(&self.cancel).await {
            return Err(Error::Cancelled);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Step::Poll)
    }

    fn plan(&self) -> Step {
        match plan_next_range(
            self.state.highest_scanned_height,
            self.state.latest_known_remote_height,
            self.config.max_batch_size,
        ) {
            Some(range) => Step::Fetch(range),
            None => Step::CaughtUp,
        }
    }

    async fn poll(&mut self, budgets: &mut Budgets) -> Result<Step> {
        let latest = match self.call(self.source.latest_height()).await {
            Ok(latest) => latest,
            Err(e) => {
                self.retry(&mut budgets.network, e).await?;
                return Ok(Step::Poll);
            }
        };
        budgets.network.reset();

        let hwm = self.state.highest_scanned_height;
        if latest != self.state.latest_known_remote_height {
            tracing::debug!("Remote tip: {}", latest);
        }
        self.update(|s| s.observe_remote(latest));
        self.progress.set_target(latest.max(hwm));

        if latest < hwm {
            return self.check_regressed_tip(latest, budgets).await;
        }
        Ok(self.plan())
    }

    /// The remote reports a tip below the high-water mark: either it lags behind, or the chain
    /// reorganized to a shorter branch.
    async fn check_regressed_tip(&mut self, latest: u64, budgets: &mut Budgets) -> Result<Step> {
        tracing::warn!(
            "Remote tip {} is below high-water mark {}",
            latest,
            self.state.highest_scanned_height
        );
        if latest <= self.birthday.height {
            return Ok(Step::CaughtUp);
        }

        let Some(remote) = self.fetch_one(latest, budgets).await? else {
            // Remote could not serve its own tip; check again on the next poll
            return Ok(Step::CaughtUp);
        };
        match self.known_hash(latest).await? {
            Some(local) if local == remote.hash => Ok(Step::CaughtUp),
            _ => Ok(Step::Recover {
                mismatch_height: latest,
            }),
        }
    }

    async fn fetch(&mut self, range: ScanRange, budgets: &mut Budgets) -> Result<Step> {
        self.set_phase(SyncPhase::FetchingRange);
        tracing::debug!("Fetching range {}", range);

        match self.call(self.source.fetch_range(range)).await {
            Ok(blocks) => Ok(Step::Validate(range, blocks)),
            Err(e) => {
                self.retry(&mut budgets.network, e).await?;
                Ok(Step::Fetch(range))
            }
        }
    }

    async fn validate(
        &mut self,
        range: ScanRange,
        blocks: Vec<BlockSummary>,
        budgets: &mut Budgets,
    ) -> Result<Step> {
        self.set_phase(SyncPhase::Validating);

        let anchor = match range.start.checked_sub(1) {
            Some(below) => self.known_hash(below).await?,
            None => None,
        };

        match validate_range(range, &blocks, anchor.as_ref()) {
            Ok(()) => {
                budgets.network.reset();
                Ok(Step::Scan(range, blocks))
            }
            Err(e) if e.is_tip_mismatch() => {
                tracing::warn!("Range {} does not extend local history: {}", range, e);
                Ok(Step::Recover {
                    mismatch_height: range.start - 1,
                })
            }
            Err(e) => {
                self.retry(&mut budgets.network, e.into()).await?;
                Ok(Step::Fetch(range))
            }
        }
    }

    async fn scan(
        &mut self,
        range: ScanRange,
        blocks: Vec<BlockSummary>,
        budgets: &mut Budgets,
    ) -> Result<Step> {
        self.set_phase(SyncPhase::Scanning);

        let prior = self.prior_scan_state().await?;
        let scanner = Arc::clone(&self.scanner);
        let cancel = self.cancel.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = scan_batch(scanner.as_ref(), range, &blocks, &prior, &cancel);
            (blocks, result)
        })
        .await;

        let error = match joined {
            Ok((blocks, Ok(batch))) => {
                budgets.scan.reset();
                return Ok(Step::Persist(blocks, batch));
            }
            Ok((_, Err(e))) => e,
            Err(join_error) => ScanFailure {
                height: range.start,
                reason: format!("scanner task failed: {}", join_error),
            }
            .into(),
        };

        if matches!(error, Error::Cancelled) {
            tracing::warn!("Sync cancelled while scanning {}", range);
            return Err(error);
        }
        self.retry(&mut budgets.scan, error).await?;
        Ok(Step::Fetch(range))
    }

    async fn persist(&mut self, blocks: Vec<BlockSummary>, batch: ScannedBatch) -> Result<Step> {
        if self.cancel.is_cancelled() {
            tracing::warn!("Sync cancelled before committing {}", batch.range);
            return Err(Error::Cancelled);
        }
        self.set_phase(SyncPhase::Persisting);

        let started = Instant::now();
        let range = batch.range;
        let transactions = batch.transactions.len() as u64;
        let committed = self
            .state
            .clone()
            .advance(range.end)
            .with_phase(SyncPhase::Idle);

        // Cache first: a crash before the store commit leaves only cache residue above the
        // high-water mark, dropped by `reconcile`.
        self.cache.append(&blocks).await?;
        self.store
            .commit(CommitBatch::from_scanned(batch, committed.clone()))
            .await?;

        self.update(|_| committed);
        self.progress
            .record_commit(range.end, transactions, started.elapsed());
        tracing::debug!(
            "Committed {} ({} transaction(s)) in {:?}",
            range,
            transactions,
            started.elapsed()
        );
        self.events.emit(SyncEvent::Progress {
            scanned_height: range.end,
            target_height: self.state.latest_known_remote_height,
        });
        Ok(Step::Idle)
    }

    async fn recover(&mut self, mismatch_height: u64, budgets: &mut Budgets) -> Result<Step> {
        self.set_phase(SyncPhase::RecoveringReorg);
        tracing::warn!(
            "Chain divergence at height {}, searching for common ancestor",
            mismatch_height
        );

        let search = AncestorSearch::new(
            mismatch_height,
            self.birthday.height,
            self.config.reorg_step,
            self.config.max_reorg_depth,
        );
        for candidate in search {
            let Some(remote) = self.fetch_one(candidate, budgets).await? else {
                continue;
            };
            let local = self.known_hash(candidate).await?;
            tracing::debug!(
                "Ancestor check at {}: remote={} local={:?}",
                candidate,
                remote.hash,
                local
            );
            if local == Some(remote.hash) {
                self.rewind_to(candidate).await?;
                self.events.emit(SyncEvent::ReorgDetected {
                    from_height: mismatch_height,
                    to_height: candidate,
                });
                self.announced_height = None;
                return Ok(self.plan());
            }
        }

        Err(Error::UnrecoverableReorg {
            from_height: mismatch_height,
            birthday_height: self.birthday.height,
        })
    }

    /// Fetch the remote block at `height`, retrying on the network budget.
    ///
    /// `None` when the remote does not have that height.
    async fn fetch_one(
        &mut self,
        height: u64,
        budgets: &mut Budgets,
    ) -> Result<Option<BlockSummary>> {
        let range = ScanRange::single(height);
        loop {
            let outcome = match self.call(self.source.fetch_range(range)).await {
                Ok(blocks) if blocks.is_empty() => return Ok(None),
                Ok(mut blocks) if blocks.len() == 1 && blocks[0].height == height => {
                    return Ok(blocks.pop())
                }
                Ok(blocks) => Error::from(SourceError::Malformed(format!(
                    "requested block {}, received {} block(s)",
                    height,
                    blocks.len()
                ))),
                Err(e) => e,
            };
            self.retry(&mut budgets.network, outcome).await?;
        }
    }

    /// Roll the store and cache back to `height`, store first.
    async fn rewind_to(&mut self, height: u64) -> Result<()> {
        let height = height.max(self.birthday.height);
        let from = self.state.highest_scanned_height;

        self.store.rollback_to(height).await?;
        self.cache.truncate_from(height + 1).await?;

        self.update(|s| s.rewind(height));
        self.progress.record_rewind(height);
        tracing::info!("Rewound from {} to {}", from, height);
        Ok(())
    }

    /// Hash this wallet holds for the block at `height`, if any.
    async fn known_hash(&self, height: u64) -> Result<Option<BlockHash>> {
        if let Some(block) = self.cache.get(height).await? {
            return Ok(Some(block.hash));
        }
        if height != self.birthday.height {
            return Ok(None);
        }
        if let Some(hash) = self.birthday.hash {
            return Ok(Some(hash));
        }
        // The first cached block records the birthday block it was fetched on top of
        Ok(self
            .cache
            .get(height + 1)
            .await?
            .map(|block| block.prev_hash))
    }

    async fn prior_scan_state(&self) -> Result<ScanState> {
        if self.state.highest_scanned_height <= self.birthday.height {
            return Ok(self.birthday.initial_state.clone());
        }
        Ok(self
            .store
            .scan_state()
            .await?
            .unwrap_or_else(|| self.birthday.initial_state.clone()))
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, SourceError>>,
    {
        call_with_deadline(fut, self.config.request_timeout, &self.cancel).await
    }

    /// Charge `error` against `backoff` and wait, or fail once the budget is spent.
    async fn retry(&mut self, backoff: &mut Backoff, error: Error) -> Result<()> {
        if error.retry_class().is_none() {
            return Err(error);
        }
        let Some(delay) = backoff.next_delay() else {
            return Err(error.exhausted(backoff.failures()));
        };

        tracing::warn!(
            attempt = backoff.failures(),
            "Retrying after {:?}: {}",
            delay,
            error
        );
        self.update(|s| s.record_error(&error, true));
        self.events.emit(SyncEvent::Error {
            kind: error.kind(),
            recoverable: true,
            detail: error.to_string(),
        });
        self.sleep(delay).await
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    fn stop(&mut self, error: &Error) -> StopReason {
        let reason = StopReason::from_error(error);
        if !matches!(error, Error::Cancelled) {
            tracing::error!("Sync stopped: {}", error);
            self.update(|s| s.record_error(error, false));
            self.events.emit(SyncEvent::Error {
                kind: error.kind(),
                recoverable: false,
                detail: error.to_string(),
            });
        }
        self.set_phase(SyncPhase::Stopped(reason.clone()));
        self.events.emit(SyncEvent::Stopped {
            reason: reason.clone(),
        });
        reason
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.state.phase != phase {
            tracing::trace!("Phase: {}", phase.name());
            self.update(|s| s.with_phase(phase));
        }
    }

    fn update(&mut self, transition: impl FnOnce(SyncState) -> SyncState) {
        self.state = transition(self.state.clone());
        *self.shared_state.write() = self.state.clone();
    }
}
