//! Retry budgets for network, malformed-response and scan failures

mod common;

use common::{cached_chain, drain, fast_config, Fixture, WALLET_TAG};
use lightwallet_sync::memory::ChainFault;
use lightwallet_sync::{
    DerivedStateStore, Error, ErrorKind, RetryConfig, ScanRange, SourceError, SyncConfig,
    SyncEvent,
};

fn with_attempts(max_attempts: u32) -> SyncConfig {
    let config = fast_config();
    SyncConfig {
        retry: RetryConfig {
            max_attempts,
            ..config.retry.clone()
        },
        ..config
    }
}

#[tokio::test]
async fn test_connection_errors_are_absorbed() {
    let fx = Fixture::new(120);
    fx.chain.fail_latest_height(ChainFault::Connection, 2);
    fx.chain.fail_fetches(ChainFault::Connection, 2);
    let mut engine = fx.engine(fx.birthday(100), fast_config()).await;
    let mut events = engine.subscribe();

    assert_eq!(engine.sync_to_tip().await.unwrap(), 120);

    let retries: Vec<SyncEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::Error { .. }))
        .collect();
    assert_eq!(retries.len(), 4);
    assert!(retries.iter().all(|e| matches!(
        e,
        SyncEvent::Error {
            kind: ErrorKind::TransientNetwork,
            recoverable: true,
            ..
        }
    )));

    // The last recorded error stays visible after recovering
    let last_error = engine.state().last_error.clone().unwrap();
    assert!(last_error.recoverable);
}

#[tokio::test]
async fn test_network_budget_resets_after_success() {
    // Two attempts per failure streak: one failed tip query, then one failed fetch
    let fx = Fixture::new(110);
    fx.chain.fail_latest_height(ChainFault::Connection, 1);
    fx.chain.fail_fetches(ChainFault::Connection, 1);
    let mut engine = fx.engine(fx.birthday(100), with_attempts(2)).await;

    assert_eq!(engine.sync_to_tip().await.unwrap(), 110);
}

#[tokio::test]
async fn test_short_response_is_refetched() {
    let fx = Fixture::new(120);
    fx.chain.fail_fetches(ChainFault::ShortResponse, 1);
    let mut engine = fx.engine(fx.birthday(100), fast_config()).await;

    assert_eq!(engine.sync_to_tip().await.unwrap(), 120);
    let range = ScanRange::new(101, 120).unwrap();
    assert_eq!(fx.chain.fetch_log(), vec![range, range]);
    assert_eq!(cached_chain(fx.cache.as_ref(), 101).await.len(), 20);
}

#[tokio::test]
async fn test_broken_link_is_not_a_reorg() {
    let fx = Fixture::new(120);
    let mut engine = fx.engine(fx.birthday(100), fast_config()).await;
    let mut events = engine.subscribe();
    fx.chain.fail_fetches(ChainFault::BrokenLink, 2);

    assert_eq!(engine.sync_to_tip().await.unwrap(), 120);
    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SyncEvent::ReorgDetected { .. })));
    assert_eq!(fx.chain.fetch_log().len(), 3);
}

#[tokio::test]
async fn test_malformed_responses_exhaust_as_network_error() {
    let fx = Fixture::new(120);
    fx.chain.fail_fetches(ChainFault::BrokenLink, 3);
    let mut engine = fx.engine(fx.birthday(100), with_attempts(3)).await;

    match engine.sync_to_tip().await {
        Err(Error::TransientNetwork {
            attempts: 3,
            source: SourceError::Malformed(_),
        }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fx.store.current_high_water_mark().await.unwrap(), None);
    assert!(engine.state().phase.is_stopped());
}

#[tokio::test]
async fn test_scan_failure_is_retried_from_fetch() {
    let fx = Fixture::new(110);
    fx.chain.pay_at(106, WALLET_TAG);
    fx.scanner.fail_at(105, 2);
    let mut engine = fx.engine(fx.birthday(100), fast_config()).await;
    let mut events = engine.subscribe();

    assert_eq!(engine.sync_to_tip().await.unwrap(), 110);

    let range = ScanRange::new(101, 110).unwrap();
    assert_eq!(fx.chain.fetch_log(), vec![range, range, range]);
    assert_eq!(fx.store.all_transactions().len(), 1);
    let scan_errors = drain(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SyncEvent::Error {
                    kind: ErrorKind::Scan,
                    ..
                }
            )
        })
        .count();
    assert_eq!(scan_errors, 2);
}

#[tokio::test]
async fn test_scan_failure_exhausts_its_own_budget() {
    let fx = Fixture::new(110);
    fx.scanner.fail_at(105, 10);
    // Network budget is larger; the scan budget decides
    let config = SyncConfig {
        scan_max_attempts: 3,
        ..with_attempts(8)
    };
    let mut engine = fx.engine(fx.birthday(100), config).await;

    match engine.sync_to_tip().await {
        Err(Error::Scan {
            attempts: 3,
            source,
        }) => assert_eq!(source.height, 105),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fx.chain.fetch_log().len(), 3);
    assert_eq!(fx.store.current_high_water_mark().await.unwrap(), None);
    assert_eq!(engine.state().last_error.clone().unwrap().kind, ErrorKind::Scan);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_tip_query_times_out_and_retries() {
    let fx = Fixture::new(105);
    fx.chain.fail_latest_height(ChainFault::Stall, 1);
    let mut engine = fx.engine(fx.birthday(100), fast_config()).await;
    let mut events = engine.subscribe();

    assert_eq!(engine.sync_to_tip().await.unwrap(), 105);
    let first = drain(&mut events).into_iter().next().unwrap();
    assert!(matches!(
        first,
        SyncEvent::Error {
            kind: ErrorKind::TransientNetwork,
            recoverable: true,
            ..
        }
    ));
}
