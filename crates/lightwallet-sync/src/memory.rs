//! In-memory collaborators: a simulated chain with fault injection, a block cache, a
//! derived-state store and a deterministic scanner.
//!
//! Used by the sync harness and the test suite; the stores honor the same invariants as their
//! SQLite counterparts.

use crate::block::{BlockHash, BlockSummary, ScanRange};
use crate::block_cache::{check_extends, BlockCache};
use crate::client::{ChainSource, SubmissionResult};
use crate::error::{ScanFailure, SourceError, StoreError};
use crate::scan::{BlockScanner, DetectedTransaction, ScanOutput, ScanState};
use crate::state::SyncState;
use crate::store::{CommitBatch, DerivedStateStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Failure injected into a chain source call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFault {
    /// Never respond; the caller's deadline fires
    Stall,
    /// Connection dropped
    Connection,
    /// Respond with one block too few
    ShortResponse,
    /// Respond with a broken hash link inside the range
    BrokenLink,
}

#[derive(Debug)]
struct ChainInner {
    /// Index is height
    blocks: Vec<BlockSummary>,
    fetch_faults: VecDeque<ChainFault>,
    height_faults: VecDeque<ChainFault>,
    fetch_log: Vec<ScanRange>,
    submitted: Vec<Vec<u8>>,
    submit_response: SubmissionResult,
    latency: Duration,
}

/// Simulated remote chain
#[derive(Debug)]
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

fn block_hash(tag: u32, height: u64, prev: &BlockHash) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(tag.to_le_bytes());
    hasher.update(height.to_le_bytes());
    hasher.update(prev.as_bytes());
    BlockHash(hasher.finalize().into())
}

fn make_block(tag: u32, height: u64, prev_hash: BlockHash, payload: Vec<u8>) -> BlockSummary {
    BlockSummary {
        height,
        hash: block_hash(tag, height, &prev_hash),
        prev_hash,
        time: 1_600_000_000u32.wrapping_add((height as u32).wrapping_mul(75)),
        payload,
    }
}

impl MemoryChain {
    /// Chain with blocks `0..=tip`
    pub fn new(tip: u64) -> Self {
        let chain = Self {
            inner: Mutex::new(ChainInner {
                blocks: Vec::new(),
                fetch_faults: VecDeque::new(),
                height_faults: VecDeque::new(),
                fetch_log: Vec::new(),
                submitted: Vec::new(),
                submit_response: SubmissionResult::accepted(),
                latency: Duration::ZERO,
            }),
        };
        chain.mine(tip + 1);
        chain
    }

    /// Current tip height
    pub fn tip(&self) -> u64 {
        (self.inner.lock().blocks.len() as u64).saturating_sub(1)
    }

    /// Block at `height`
    pub fn block(&self, height: u64) -> Option<BlockSummary> {
        self.inner.lock().blocks.get(height as usize).cloned()
    }

    /// Extend the chain by `count` blocks
    pub fn mine(&self, count: u64) {
        let mut inner = self.inner.lock();
        for _ in 0..count {
            let height = inner.blocks.len() as u64;
            let prev = inner
                .blocks
                .last()
                .map(|b| b.hash)
                .unwrap_or_default();
            inner.blocks.push(make_block(0, height, prev, Vec::new()));
        }
    }

    /// Replace every block from `height` up with a competing branch of the same length.
    ///
    /// Blocks below `height` are unchanged. Different `tag`s give different branches.
    pub fn fork_at(&self, height: u64, tag: u32) {
        let mut inner = self.inner.lock();
        let tip = inner.blocks.len() as u64;
        for h in height..tip {
            let idx = h as usize;
            let prev = if h == 0 {
                BlockHash::default()
            } else {
                inner.blocks[idx - 1].hash
            };
            let payload = inner.blocks[idx].payload.clone();
            inner.blocks[idx] = make_block(tag, h, prev, payload);
        }
    }

    /// Drop every block above `tip`
    pub fn truncate(&self, tip: u64) {
        self.inner.lock().blocks.truncate(tip as usize + 1);
    }

    /// Put a transaction byte `tag` into the block at `height`.
    ///
    /// Changes the payload only; hashes are unchanged.
    pub fn pay_at(&self, height: u64, tag: u8) {
        if let Some(block) = self.inner.lock().blocks.get_mut(height as usize) {
            block.payload.push(tag);
        }
    }

    /// Fail the next `times` range fetches with `fault`
    pub fn fail_fetches(&self, fault: ChainFault, times: usize) {
        let mut inner = self.inner.lock();
        inner.fetch_faults.extend(std::iter::repeat(fault).take(times));
    }

    /// Fail the next `times` latest-height queries with `fault`
    pub fn fail_latest_height(&self, fault: ChainFault, times: usize) {
        let mut inner = self.inner.lock();
        inner.height_faults.extend(std::iter::repeat(fault).take(times));
    }

    /// Delay every response by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Response for the next submissions
    pub fn set_submit_response(&self, response: SubmissionResult) {
        self.inner.lock().submit_response = response;
    }

    /// Every range fetch requested so far
    pub fn fetch_log(&self) -> Vec<ScanRange> {
        self.inner.lock().fetch_log.clone()
    }

    /// Raw transactions received so far
    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.inner.lock().submitted.clone()
    }

    async fn respond<T>(
        &self,
        fault: Option<ChainFault>,
        value: T,
    ) -> Result<T, SourceError> {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(ChainFault::Stall) => {
                std::future::pending::<()>().await;
                Err(SourceError::Connection("stalled".to_string()))
            }
            Some(ChainFault::Connection) => {
                Err(SourceError::Connection("connection reset by peer".to_string()))
            }
            _ => Ok(value),
        }
    }
}

#[async_trait]
impl ChainSource for MemoryChain {
    async fn latest_height(&self) -> Result<u64, SourceError> {
        let (fault, tip) = {
            let mut inner = self.inner.lock();
            let fault = inner.height_faults.pop_front();
            (fault, (inner.blocks.len() as u64).saturating_sub(1))
        };
        self.respond(fault, tip).await
    }

    async fn fetch_range(&self, range: ScanRange) -> Result<Vec<BlockSummary>, SourceError> {
        let (fault, mut blocks) = {
            let mut inner = self.inner.lock();
            inner.fetch_log.push(range);
            let fault = inner.fetch_faults.pop_front();
            let end = (range.end as usize + 1).min(inner.blocks.len());
            let start = (range.start as usize).min(end);
            (fault, inner.blocks[start..end].to_vec())
        };

        match fault {
            Some(ChainFault::ShortResponse) => {
                blocks.pop();
            }
            Some(ChainFault::BrokenLink) if blocks.len() > 1 => {
                let last = blocks.len() - 1;
                blocks[last].prev_hash = BlockHash([0xee; 32]);
            }
            _ => {}
        }
        self.respond(fault, blocks).await
    }

    async fn submit(&self, raw_tx: Vec<u8>) -> Result<SubmissionResult, SourceError> {
        let response = {
            let mut inner = self.inner.lock();
            inner.submitted.push(raw_tx);
            inner.submit_response.clone()
        };
        self.respond(None, response).await
    }
}

/// In-memory block cache
#[derive(Debug, Default)]
pub struct MemoryBlockCache {
    blocks: Mutex<BTreeMap<u64, BlockSummary>>,
    fail_appends: AtomicBool,
    fail_truncates: AtomicBool,
}

impl MemoryBlockCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append fail until switched off
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every truncation fail (removing nothing) until switched off
    pub fn set_fail_truncates(&self, fail: bool) {
        self.fail_truncates.store(fail, Ordering::SeqCst);
    }

    /// Every cached block, ascending
    pub fn snapshot(&self) -> Vec<BlockSummary> {
        self.blocks.lock().values().cloned().collect()
    }
}

#[async_trait]
impl BlockCache for MemoryBlockCache {
    async fn append(&self, blocks: &[BlockSummary]) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        let mut cached = self.blocks.lock();
        check_extends(cached.values().next_back(), blocks)?;
        for block in blocks {
            cached.insert(block.height, block.clone());
        }
        Ok(())
    }

    async fn get(&self, height: u64) -> Result<Option<BlockSummary>, StoreError> {
        Ok(self.blocks.lock().get(&height).cloned())
    }

    async fn truncate_from(&self, height: u64) -> Result<(), StoreError> {
        if self.fail_truncates.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("truncate failed")));
        }
        self.blocks.lock().retain(|h, _| *h < height);
        Ok(())
    }

    async fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.blocks.lock().keys().next_back().copied())
    }

    async fn range(&self, range: ScanRange) -> Result<Vec<BlockSummary>, StoreError> {
        Ok(self
            .blocks
            .lock()
            .range(range.start..=range.end)
            .map(|(_, block)| block.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    high_water_mark: Option<u64>,
    scan_states: BTreeMap<u64, ScanState>,
    transactions: BTreeMap<u64, Vec<DetectedTransaction>>,
    sync_state: Option<SyncState>,
}

/// In-memory derived-state store
#[derive(Debug, Default)]
pub struct MemoryDerivedStore {
    inner: Mutex<StoreInner>,
    fail_commits: AtomicBool,
    fail_rollbacks: AtomicBool,
}

impl MemoryDerivedStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every commit fail (writing nothing) until switched off
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make every rollback fail (writing nothing) until switched off
    pub fn set_fail_rollbacks(&self, fail: bool) {
        self.fail_rollbacks.store(fail, Ordering::SeqCst);
    }

    /// Every committed transaction, ascending by height
    pub fn all_transactions(&self) -> Vec<DetectedTransaction> {
        self.inner
            .lock()
            .transactions
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DerivedStateStore for MemoryDerivedStore {
    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("commit failed")));
        }
        let mut inner = self.inner.lock();
        batch.check(inner.high_water_mark)?;

        let hwm = batch.high_water_mark();
        inner.scan_states.extend(batch.scan_states);
        for tx in batch.transactions {
            inner.transactions.entry(tx.height).or_default().push(tx);
        }
        inner.sync_state = Some(batch.sync_state);
        inner.high_water_mark = Some(hwm);
        Ok(())
    }

    async fn rollback_to(&self, height: u64) -> Result<(), StoreError> {
        if self.fail_rollbacks.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("rollback failed")));
        }
        let mut inner = self.inner.lock();
        match inner.high_water_mark {
            Some(hwm) if height < hwm => {}
            _ => return Ok(()),
        }

        let state = inner
            .sync_state
            .clone()
            .ok_or_else(|| StoreError::Corrupt("missing sync state".to_string()))?;
        if height < state.birthday_height {
            return Err(StoreError::Corrupt(format!(
                "rollback to {} below birthday {}",
                height, state.birthday_height
            )));
        }

        inner.scan_states.retain(|h, _| *h <= height);
        inner.transactions.retain(|h, _| *h <= height);
        inner.sync_state = Some(state.rewind(height));
        inner.high_water_mark = Some(height);
        Ok(())
    }

    async fn current_high_water_mark(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().high_water_mark)
    }

    async fn scan_state(&self) -> Result<Option<ScanState>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .high_water_mark
            .and_then(|hwm| inner.scan_states.get(&hwm).cloned()))
    }

    async fn transactions(
        &self,
        range: ScanRange,
    ) -> Result<Vec<DetectedTransaction>, StoreError> {
        Ok(self
            .inner
            .lock()
            .transactions
            .range(range.start..=range.end)
            .flat_map(|(_, txs)| txs.iter().cloned())
            .collect())
    }

    async fn sync_state(&self) -> Result<Option<SyncState>, StoreError> {
        Ok(self.inner.lock().sync_state.clone())
    }
}

/// Deterministic scanner.
///
/// Every payload byte equal to `tag` is a wallet transaction. The scanning state is a running
/// SHA-256 over the scanned block hashes.
#[derive(Debug)]
pub struct TagScanner {
    tag: u8,
    failures: Mutex<HashMap<u64, u32>>,
    delay: Duration,
}

impl TagScanner {
    /// Scanner detecting payload bytes equal to `tag`
    pub fn new(tag: u8) -> Self {
        Self {
            tag,
            failures: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
        }
    }

    /// Fail the next `times` scans of the block at `height`
    pub fn fail_at(&self, height: u64, times: u32) {
        self.failures.lock().insert(height, times);
    }

    /// Block the scanning thread for `delay` per block
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl BlockScanner for TagScanner {
    fn scan_block(
        &self,
        block: &BlockSummary,
        state: &ScanState,
    ) -> Result<ScanOutput, ScanFailure> {
        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&block.height) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ScanFailure {
                        height: block.height,
                        reason: "scanner resources exhausted".to_string(),
                    });
                }
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut hasher = Sha256::new();
        hasher.update(&state.bytes);
        hasher.update(block.hash.as_bytes());
        let next = ScanState::new(hasher.finalize().to_vec());

        let transactions = block
            .payload
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte == self.tag)
            .map(|(index, _)| {
                let mut hasher = Sha256::new();
                hasher.update(block.hash.as_bytes());
                hasher.update((index as u32).to_le_bytes());
                DetectedTransaction {
                    height: block.height,
                    index: index as u32,
                    txid: hasher.finalize().into(),
                    data: vec![self.tag],
                }
            })
            .collect();

        Ok(ScanOutput {
            state: next,
            transactions,
        })
    }
}
