//! Property-based tests for the sync engine
//!
//! Uses proptest to check planner bounds, the rewind floor and convergence after random
//! chain reorganizations

mod common;

use common::{cached_chain, fast_config, Fixture, WALLET_TAG};
use lightwallet_sync::memory::TagScanner;
use lightwallet_sync::planner::{batches_remaining, plan_next_range};
use lightwallet_sync::reorg::AncestorSearch;
use lightwallet_sync::scan::scan_batch;
use lightwallet_sync::{
    Birthday, CancelToken, DerivedStateStore, ScanRange, ScanState, SyncConfig, SyncEvent,
};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// One change to the remote chain between syncs
#[derive(Debug, Clone)]
enum ChainChange {
    /// Extend the tip
    Mine(u64),
    /// Replace the top `depth` blocks (always above the birthday) with branch `tag`, then mine one
    Fork { depth: u64, tag: u32 },
}

fn change_strategy() -> impl Strategy<Value = ChainChange> {
    prop_oneof![
        (1u64..=8).prop_map(ChainChange::Mine),
        (1u64..=12, 1u32..1000).prop_map(|(depth, tag)| ChainChange::Fork { depth, tag }),
    ]
}

fn payments_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(101u64..=130, 0..6)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Planner and ancestor search
// ============================================================================

proptest! {
    /// Property: a planned range starts right above the high-water mark and never passes the tip
    #[test]
    fn prop_planned_range_within_bounds(
        hwm in 0u64..10_000,
        ahead in 0u64..500,
        batch in 1u64..200
    ) {
        let latest = hwm + ahead;
        match plan_next_range(hwm, latest, batch) {
            None => prop_assert_eq!(ahead, 0),
            Some(range) => {
                prop_assert_eq!(range.start, hwm + 1);
                prop_assert!(range.end <= latest);
                prop_assert!(range.len() >= 1 && range.len() <= batch);
                prop_assert!(range.len() == batch || range.end == latest);
            }
        }
    }

    /// Property: the walk goes strictly down and never below its floor
    #[test]
    fn prop_ancestor_search_respects_floor(
        birthday in 0u64..1_000,
        above in 0u64..300,
        step in 1u64..20,
        depth in prop::option::of(1u64..100)
    ) {
        let mismatch = birthday + above;
        let search = AncestorSearch::new(mismatch, birthday, step, depth);
        let floor = search.floor();
        let heights: Vec<u64> = search.collect();

        prop_assert!(floor >= birthday);
        prop_assert!(heights.iter().all(|h| *h < mismatch && *h >= floor));
        prop_assert!(heights.windows(2).all(|w| w[1] < w[0]));
        if mismatch > floor {
            prop_assert_eq!(heights.last().copied(), Some(floor));
        } else {
            prop_assert!(heights.is_empty());
        }
    }
}

// ============================================================================
// Engine properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: scanning the same blocks from the same state gives the same batch
    #[test]
    fn prop_scan_is_idempotent(payments in payments_strategy()) {
        let fx = Fixture::new(130);
        for height in &payments {
            fx.chain.pay_at(*height, WALLET_TAG);
        }
        let range = ScanRange::new(101, 130).unwrap();
        let blocks: Vec<_> = range.heights().map(|h| fx.chain.block(h).unwrap()).collect();
        let scanner = TagScanner::new(WALLET_TAG);
        let cancel = CancelToken::new();

        let first = scan_batch(&scanner, range, &blocks, &ScanState::default(), &cancel).unwrap();
        let second = scan_batch(&scanner, range, &blocks, &ScanState::default(), &cancel).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.transactions.len(), payments.len());
    }

    /// Property: one progress event per planned batch when catching up
    #[test]
    fn prop_catch_up_batches(tip in 101u64..200, batch in 1u64..40) {
        let rt = runtime();
        rt.block_on(async {
            let fx = Fixture::new(tip);
            let config = SyncConfig { max_batch_size: batch, ..fast_config() };
            let mut engine = fx.engine(fx.birthday(100), config).await;
            let mut events = engine.subscribe();

            prop_assert_eq!(engine.sync_to_tip().await.unwrap(), tip);
            let progress = common::drain(&mut events)
                .into_iter()
                .filter(|e| matches!(e, SyncEvent::Progress { .. }))
                .count() as u64;
            prop_assert_eq!(progress, batches_remaining(100, tip, batch));
            prop_assert_eq!(fx.chain.fetch_log().len() as u64, progress);
            Ok(())
        })?;
    }

    /// Property: after any sequence of reorgs above the birthday, the wallet holds exactly what a
    /// fresh sync of the final chain would
    #[test]
    fn prop_reorged_sync_matches_fresh_sync(
        changes in prop::collection::vec(change_strategy(), 1..6),
        payments in payments_strategy(),
        batch in 1u64..25,
        step in 1u64..5
    ) {
        let rt = runtime();
        rt.block_on(async {
            let birthday_height = 100;
            let fx = Fixture::new(120);
            for height in &payments {
                fx.chain.pay_at(*height, WALLET_TAG);
            }
            let birthday: Birthday = fx.birthday(birthday_height);
            let config = SyncConfig {
                max_batch_size: batch,
                reorg_step: step,
                ..fast_config()
            };
            let mut engine = fx.engine(birthday.clone(), config.clone()).await;
            prop_assert_eq!(engine.sync_to_tip().await.unwrap(), 120);

            for change in &changes {
                match change {
                    ChainChange::Mine(count) => fx.chain.mine(*count),
                    ChainChange::Fork { depth, tag } => {
                        let tip = fx.chain.tip();
                        let height = tip.saturating_sub(*depth).max(birthday_height + 1);
                        fx.chain.fork_at(height, *tag);
                        // A same-height reorg is only visible once the new branch grows
                        fx.chain.mine(1);
                    }
                }
                let tip = fx.chain.tip();
                prop_assert_eq!(engine.sync_to_tip().await.unwrap(), tip);

                // Local history is a gap-free prefix of the remote chain
                let cached = cached_chain(fx.cache.as_ref(), birthday_height + 1).await;
                prop_assert_eq!(cached.len() as u64, tip - birthday_height);
                prop_assert_eq!(cached.last().cloned(), fx.chain.block(tip));
                prop_assert!(fx.store.current_high_water_mark().await.unwrap() >= Some(birthday_height));
            }

            let fresh = Fixture {
                chain: fx.chain.clone(),
                ..Fixture::new(0)
            };
            let mut reference = fresh.engine(birthday, config).await;
            reference.sync_to_tip().await.unwrap();

            prop_assert_eq!(fx.store.all_transactions(), fresh.store.all_transactions());
            prop_assert_eq!(
                fx.store.scan_state().await.unwrap(),
                fresh.store.scan_state().await.unwrap()
            );
            prop_assert_eq!(fx.cache.snapshot(), fresh.cache.snapshot());
            Ok(())
        })?;
    }
}
