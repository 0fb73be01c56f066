//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use lightwallet_sync::continuity::first_break;
use lightwallet_sync::memory::{MemoryBlockCache, MemoryChain, MemoryDerivedStore, TagScanner};
use lightwallet_sync::{
    Birthday, BlockCache, BlockScanner, BlockSummary, RetryConfig, ScanRange, SyncConfig,
    SyncEngine, SyncEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Payload byte the test scanner treats as a wallet transaction
pub const WALLET_TAG: u8 = 7;

/// Retry quickly, never jitter
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry: RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        request_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        ..SyncConfig::default()
    }
}

/// Simulated chain plus in-memory collaborators
pub struct Fixture {
    pub chain: Arc<MemoryChain>,
    pub cache: Arc<MemoryBlockCache>,
    pub store: Arc<MemoryDerivedStore>,
    pub scanner: Arc<TagScanner>,
}

impl Fixture {
    pub fn new(tip: u64) -> Self {
        Self {
            chain: Arc::new(MemoryChain::new(tip)),
            cache: Arc::new(MemoryBlockCache::new()),
            store: Arc::new(MemoryDerivedStore::new()),
            scanner: Arc::new(TagScanner::new(WALLET_TAG)),
        }
    }

    /// Birthday anchored to the chain's current block at `height`
    pub fn birthday(&self, height: u64) -> Birthday {
        Birthday::with_hash(height, self.chain.block(height).unwrap().hash)
    }

    pub async fn engine(&self, birthday: Birthday, config: SyncConfig) -> SyncEngine {
        self.engine_with_scanner(birthday, config, self.scanner.clone())
            .await
    }

    pub async fn engine_with_scanner(
        &self,
        birthday: Birthday,
        config: SyncConfig,
        scanner: Arc<dyn BlockScanner>,
    ) -> SyncEngine {
        SyncEngine::open(
            self.chain.clone(),
            self.cache.clone(),
            self.store.clone(),
            scanner,
            birthday,
            config,
        )
        .await
        .unwrap()
    }
}

/// Every event already delivered to `rx`
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait for the first event matching `pred`
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Cached blocks from `start`, checked to be hash-linked and gap-free
pub async fn cached_chain(cache: &dyn BlockCache, start: u64) -> Vec<BlockSummary> {
    let Some(tip) = cache.latest_height().await.unwrap() else {
        return Vec::new();
    };
    let Some(range) = ScanRange::new(start, tip) else {
        return Vec::new();
    };
    let blocks = cache.range(range).await.unwrap();
    assert_eq!(first_break(&blocks), None, "cache is not hash-linked");
    blocks
}
