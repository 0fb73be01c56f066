//! Pause, resume, cancellation and transaction submission

mod common;

use common::{fast_config, wait_for, Fixture, WALLET_TAG};
use lightwallet_sync::memory::TagScanner;
use lightwallet_sync::{
    compute_txid, BlockScanner, BlockSummary, DerivedStateStore, Error, ScanFailure, ScanOutput,
    ScanState, SourceError, StopReason, SubmissionResult, SyncConfig, SyncEngine, SyncEvent,
    SyncHandle, SyncPhase,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

fn spawn_follow(mut engine: SyncEngine, from: Option<u64>) -> JoinHandle<(SyncEngine, StopReason)> {
    tokio::spawn(async move {
        let reason = engine.start(from).await;
        (engine, reason)
    })
}

#[tokio::test]
async fn test_pause_before_start_then_resume() {
    let fx = Fixture::new(130);
    let engine = fx.engine(fx.birthday(100), fast_config()).await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    handle.pause();
    assert!(handle.is_paused());
    let task = spawn_follow(engine, None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fx.chain.fetch_log().is_empty());
    assert_eq!(handle.state().phase, SyncPhase::Idle);

    handle.resume();
    let caught_up = wait_for(&mut events, |e| matches!(e, SyncEvent::CaughtUp { .. })).await;
    assert_eq!(caught_up, SyncEvent::CaughtUp { height: 130 });

    handle.cancel();
    let (engine, reason) = task.await.unwrap();
    assert_eq!(reason, StopReason::Cancelled);
    assert_eq!(engine.state().phase, SyncPhase::Stopped(StopReason::Cancelled));
    assert_eq!(handle.state().highest_scanned_height, 130);
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SyncEvent::Stopped { .. })).await,
        SyncEvent::Stopped {
            reason: StopReason::Cancelled
        }
    );
}

#[tokio::test]
async fn test_cancel_while_paused() {
    let fx = Fixture::new(130);
    let engine = fx.engine(fx.birthday(100), fast_config()).await;
    let handle = engine.handle();

    handle.pause();
    let task = spawn_follow(engine, None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let (_, reason) = task.await.unwrap();
    assert_eq!(reason, StopReason::Cancelled);
    assert!(fx.chain.fetch_log().is_empty());
    assert_eq!(fx.store.current_high_water_mark().await.unwrap(), None);
}

/// Scanner that requests a pause the first time it reaches `height`
struct PauseAt {
    inner: TagScanner,
    height: u64,
    fired: AtomicBool,
    handle: OnceLock<SyncHandle>,
}

impl BlockScanner for PauseAt {
    fn scan_block(
        &self,
        block: &BlockSummary,
        state: &ScanState,
    ) -> Result<ScanOutput, ScanFailure> {
        if block.height == self.height && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.handle.get() {
                handle.pause();
            }
        }
        self.inner.scan_block(block, state)
    }
}

#[tokio::test]
async fn test_pause_takes_effect_after_current_batch() {
    let fx = Fixture::new(150);
    let scanner = Arc::new(PauseAt {
        inner: TagScanner::new(WALLET_TAG),
        height: 115,
        fired: AtomicBool::new(false),
        handle: OnceLock::new(),
    });
    let config = SyncConfig {
        max_batch_size: 10,
        ..fast_config()
    };
    let engine = fx
        .engine_with_scanner(fx.birthday(100), config, scanner.clone())
        .await;
    let handle = engine.handle();
    assert!(scanner.handle.set(handle.clone()).is_ok());
    let mut events = handle.subscribe();
    let task = spawn_follow(engine, None);

    // The batch holding the pause request still commits
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Progress { scanned_height: 120, .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_paused());
    assert_eq!(fx.store.current_high_water_mark().await.unwrap(), Some(120));
    assert_eq!(fx.chain.fetch_log().len(), 2);

    handle.resume();
    wait_for(&mut events, |e| matches!(e, SyncEvent::CaughtUp { height: 150 })).await;
    handle.cancel();
    let (_, reason) = task.await.unwrap();
    assert_eq!(reason, StopReason::Cancelled);
}

#[tokio::test]
async fn test_follow_picks_up_new_blocks() {
    let fx = Fixture::new(110);
    let engine = fx.engine(fx.birthday(100), fast_config()).await;
    let handle = engine.handle();
    let mut events = handle.subscribe();
    let task = spawn_follow(engine, None);

    wait_for(&mut events, |e| matches!(e, SyncEvent::CaughtUp { height: 110 })).await;
    fx.chain.mine(4);
    wait_for(&mut events, |e| matches!(e, SyncEvent::CaughtUp { height: 114 })).await;

    handle.cancel();
    let (engine, _) = task.await.unwrap();
    assert_eq!(engine.state().highest_scanned_height, 114);
    assert_eq!(engine.progress().current_height(), 114);
}

#[tokio::test]
async fn test_start_height_above_next_is_ignored() {
    let fx = Fixture::new(120);
    let mut engine = fx.engine(fx.birthday(100), fast_config()).await;
    engine.sync_to_tip().await.unwrap();
    let handle = engine.handle();
    let mut events = handle.subscribe();

    let task = spawn_follow(engine, Some(500));
    wait_for(&mut events, |e| matches!(e, SyncEvent::CaughtUp { .. })).await;
    handle.cancel();
    task.await.unwrap();

    // No rewind, nothing refetched
    assert_eq!(fx.chain.fetch_log(), vec![lightwallet_sync::ScanRange::new(101, 120).unwrap()]);
}

#[tokio::test]
async fn test_submit_accepted() {
    let fx = Fixture::new(10);
    let engine = fx.engine(fx.birthday(5), fast_config()).await;
    let raw = vec![0xde, 0xad, 0xbe, 0xef];

    let submitted = engine.submit_transaction(raw.clone()).await.unwrap();
    assert_eq!(submitted.txid, compute_txid(&raw));
    assert!(submitted.result.is_success());
    assert_eq!(fx.chain.submitted(), vec![raw]);
}

#[tokio::test]
async fn test_submit_rejection_is_reported_once() {
    let fx = Fixture::new(10);
    let engine = fx.engine(fx.birthday(5), fast_config()).await;
    fx.chain.set_submit_response(SubmissionResult {
        code: -26,
        message: "txn-mempool-conflict".to_string(),
    });

    match engine.submit_transaction(vec![1, 2, 3]).await {
        Err(Error::Submission { code, message }) => {
            assert_eq!(code, -26);
            assert_eq!(message, "txn-mempool-conflict");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fx.chain.submitted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_submit_timeout_is_not_retried() {
    let fx = Fixture::new(10);
    let engine = fx.engine(fx.birthday(5), fast_config()).await;
    fx.chain.set_latency(Duration::from_secs(60));

    assert!(matches!(
        engine.submit_transaction(vec![9; 32]).await,
        Err(Error::TransientNetwork {
            source: SourceError::Timeout(_),
            ..
        })
    ));
    assert_eq!(fx.chain.submitted().len(), 1);
}

#[tokio::test]
async fn test_submit_through_handle_while_syncing() {
    let fx = Fixture::new(110);
    let engine = fx.engine(fx.birthday(100), fast_config()).await;
    let handle = engine.handle();
    let mut events = handle.subscribe();
    let task = spawn_follow(engine, None);

    let submitted = handle.submit_transaction(vec![4, 5, 6]).await.unwrap();
    assert_eq!(submitted.txid, compute_txid(&[4, 5, 6]));

    // Submission does not disturb the sync run
    wait_for(&mut events, |e| matches!(e, SyncEvent::CaughtUp { height: 110 })).await;
    handle.cancel();
    let (_, reason) = task.await.unwrap();
    assert_eq!(reason, StopReason::Cancelled);
}
