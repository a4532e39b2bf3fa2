use std::sync::{Arc, Mutex};
use std::time::Duration;

use azeroth_crypto::UserKey;
use azeroth_test_fixtures::{
    init_test_tracing, native_token, network, network_with, test_config, user_key, wallet,
    NoteEvent, SyncHarness, NETWORK_UID,
};
use azeroth_wallet::config::WalletConfig;
use azeroth_wallet::sync::{
    process_cached_zk_events, AppProfile, BackwardNoteSync, BackwardProgress, BackwardTick,
    EventSource, ForwardNoteSync, ForwardTick, ListenerCallback, NoteProgressNotification,
    ProcessInput, BACKWARD_SYNC_LISTENER_KEY, FORWARD_SYNC_LISTENER_KEY,
};
use azeroth_wallet::{BlockRange, LocalStore, Network, NoteOwnership, Wallet, ZkEventFilter};
use tokio_util::sync::CancellationToken;

struct Setup {
    h: SyncHarness,
    wallet: Wallet,
    key: UserKey,
    network: Network,
}

impl Setup {
    fn new(config: WalletConfig) -> Self {
        Self::with_network(config, network())
    }

    fn with_network(config: WalletConfig, network: Network) -> Self {
        init_test_tracing();
        let h = SyncHarness::new(config);
        let wallet = wallet(1);
        let key = user_key(7);
        h.store.add_wallet(wallet.clone()).unwrap();
        h.store.add_network(network.clone()).unwrap();
        h.store.add_token(native_token(&network.uid)).unwrap();
        h.secrets.insert(&wallet, key.clone());
        h.chain.with(|chain| {
            chain.head = 100;
            chain.register(&wallet.address, &key);
        });
        Self {
            h,
            wallet,
            key,
            network,
        }
    }

    fn profile(&self) -> AppProfile {
        AppProfile::new(self.wallet.clone(), self.network.clone())
    }

    fn add_events(&self, events: &[NoteEvent]) {
        let built: Vec<_> = events.iter().map(|e| e.build().unwrap()).collect();
        self.h.chain.with(|chain| chain.events.extend(built));
    }

    fn set_head(&self, head: u64) {
        self.h.chain.with(|chain| chain.head = head);
    }
}

fn running_flags(log: &[(String, NoteProgressNotification)]) -> Vec<bool> {
    log.iter().map(|(_, data)| data.is_running).collect()
}

// === Forward sync ===

#[tokio::test]
async fn forward_run_claims_note_and_moves_watermarks() {
    let s = Setup::new(test_config());
    let log = s.h.record(FORWARD_SYNC_LISTENER_KEY);
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward.start(s.profile()).await;

    let event = NoteEvent::native(&s.key, 100, 120);
    s.add_events(&[event.clone()]);
    s.set_head(150);

    let outcome = forward.tick().await;
    assert_eq!(
        outcome,
        ForwardTick::Completed {
            cached: BlockRange::new(100, 150),
            staged_transfers: 1,
        }
    );

    let net = s.h.store.network(NETWORK_UID).unwrap().unwrap();
    assert_eq!(net.start_zk_event_blk_num, Some(100));
    assert_eq!(net.latest_zk_event_blk_num, Some(150));
    let meta = s.h.store.wn_meta(&s.wallet.address, NETWORK_UID).unwrap();
    assert_eq!(meta.latest_zk_event_blk_num, Some(151));
    assert_eq!(meta.ena_exist, Some(true));

    let transfers = s.h.store.zk_transfers(NETWORK_UID).unwrap();
    assert_eq!(transfers.len(), 1);
    let leg = transfers[0].amounts.to_private.clone().unwrap();
    assert_eq!(leg.amount, 100);
    assert_eq!(leg.note, event.note());
    assert_eq!(transfers[0].transaction_hash, event.tx_hash());
    assert_eq!(transfers[0].token_uid, native_token(NETWORK_UID).token_uid);
    assert!(s.h.store.zk_events(NETWORK_UID, ZkEventFilter::All).unwrap().is_empty());

    let log = log.lock().unwrap().clone();
    let first = &log[0].1;
    assert!(first.is_running);
    assert_eq!(first.total_blocks, 51);
    assert_eq!(first.scan_range, BlockRange::new(100, 150));
    assert_eq!(log.last().unwrap().1, NoteProgressNotification::stopped());

    assert_eq!(forward.tick().await, ForwardTick::NoNewBlocks);
    forward.stop();
    assert!(!forward.is_running());
}

#[tokio::test]
async fn forward_places_note_at_last_leaf() {
    let s = Setup::new(test_config());
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward.start(s.profile()).await;

    let event = NoteEvent::native(&s.key, 100, 110)
        .with_open(9)
        .with_num_leaves(3);
    s.add_events(&[event.clone()]);
    s.set_head(120);
    forward.tick().await;

    let transfers = s.h.store.zk_transfers(NETWORK_UID).unwrap();
    let note = transfers[0].amounts.to_private.clone().unwrap().note;
    assert_eq!(note.index, 2);
    assert_eq!(note.amount, 100);
    assert_eq!(note.addr, s.key.ena());
    assert!(!note.is_spent);
    assert!(note.is_valid());
    assert!(!transfers[0].amounts.to_private_note_is_spent);
}

#[tokio::test]
async fn forward_marks_spent_notes() {
    let s = Setup::new(test_config());
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward.start(s.profile()).await;

    let event = NoteEvent::native(&s.key, 40, 130);
    let sk = s.key.sk;
    s.h.chain.with(|chain| chain.nullify(&event.note(), &sk));
    s.add_events(&[event]);
    s.set_head(140);
    forward.tick().await;

    let transfers = s.h.store.zk_transfers(NETWORK_UID).unwrap();
    assert!(transfers[0].amounts.to_private_note_is_spent);
    assert!(transfers[0].amounts.to_private.clone().unwrap().note.is_spent);
}

#[tokio::test]
async fn forward_without_ena_only_caches() {
    let s = Setup::new(test_config());
    let stranger = wallet(2);
    s.h.store.add_wallet(stranger.clone()).unwrap();
    s.h.secrets.insert(&stranger, user_key(8));
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward
        .start(AppProfile::new(stranger.clone(), s.network.clone()))
        .await;

    s.add_events(&[NoteEvent::native(&s.key, 5, 105)]);
    s.set_head(110);

    assert_eq!(forward.tick().await, ForwardTick::EnaNotRegistered);
    assert_eq!(s.h.store.zk_events(NETWORK_UID, ZkEventFilter::All).unwrap().len(), 1);
    let meta = s.h.store.wn_meta(&stranger.address, NETWORK_UID).unwrap();
    assert_eq!(meta.latest_zk_event_blk_num, None);
    assert!(s.h.store.zk_transfers(NETWORK_UID).unwrap().is_empty());
}

#[tokio::test]
async fn forward_cleanup_waits_for_every_wallet() {
    let s = Setup::new(test_config());
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward.start(s.profile()).await;

    // addressed to someone else, so it stays in the cache after processing
    let foreign = NoteEvent::native(&user_key(99), 5, 105);
    s.add_events(&[foreign]);
    s.set_head(110);

    s.h.store.add_wallet(wallet(3)).unwrap();
    forward.tick().await;
    assert_eq!(s.h.store.zk_events(NETWORK_UID, ZkEventFilter::All).unwrap().len(), 1);

    s.h.store
        .set_wallet_latest_blk(&wallet(3).address, NETWORK_UID, 111)
        .unwrap();
    s.set_head(112);
    forward.tick().await;
    assert!(s.h.store.zk_events(NETWORK_UID, ZkEventFilter::All).unwrap().is_empty());
}

#[tokio::test]
async fn forward_countdown_and_fast_forward() {
    let mut config = test_config();
    config.sync.forward.rerun_countdown = 2;
    let s = Setup::new(config);
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward.start(s.profile()).await;
    s.set_head(105);

    assert_eq!(forward.tick().await, ForwardTick::Countdown(1));
    assert_eq!(forward.tick().await, ForwardTick::Countdown(0));
    assert!(matches!(forward.tick().await, ForwardTick::Completed { .. }));
    assert_eq!(forward.tick().await, ForwardTick::Countdown(1));

    forward.fast_forward();
    assert_eq!(forward.tick().await, ForwardTick::NoNewBlocks);
    assert_eq!(forward.tick().await, ForwardTick::Countdown(1));
}

#[tokio::test]
async fn forward_caches_in_bounded_windows() {
    let mut config = test_config();
    config.sync.forward.blocks_per_fetch = 10;
    let s = Setup::new(config);
    let forward = ForwardNoteSync::new(s.h.ctx.clone());
    forward.start(s.profile()).await;
    s.set_head(125);

    forward.tick().await;
    assert_eq!(
        s.h.chain.fetched(),
        vec![
            BlockRange::new(100, 109),
            BlockRange::new(110, 119),
            BlockRange::new(120, 125),
        ]
    );
}

// === Event processing ===

#[tokio::test]
async fn stopped_processing_yields_nothing() {
    let s = Setup::new(test_config());
    let event = NoteEvent::native(&s.key, 100, 120).build().unwrap();
    let input = ProcessInput {
        store: s.h.store.clone(),
        chain: Arc::new(s.h.chain.clone()),
        wallet: s.wallet.clone(),
        network: s.network.clone(),
        ownership: NoteOwnership::new(s.key.sk),
        yield_between: std::time::Duration::ZERO,
    };

    let handle = process_cached_zk_events(
        input.clone(),
        EventSource::Fresh(vec![event.clone()]),
        CancellationToken::new(),
    );
    assert_eq!(handle.progress().total, 1);
    handle.stop();
    assert!(handle.join().await.unwrap().map_list.is_empty());

    let handle = process_cached_zk_events(
        input,
        EventSource::Fresh(vec![event]),
        CancellationToken::new(),
    );
    let param = handle.join().await.unwrap();
    assert_eq!(param.map_list.len(), 1);
    assert_eq!(param.map_list[0].cached_event_to_remove, None);
    assert_eq!(param.map_list[0].transfer.block_date_time, 1_700_000_000 + 12 * 120);
}

// === Backward sync ===

/// 288 s blocks: one day is 300 blocks.
fn backward_config() -> WalletConfig {
    let mut config = test_config();
    config.sync.backward.blocks_per_fetch = 100;
    config
}

fn backward_setup() -> Setup {
    let s = Setup::with_network(backward_config(), network_with(NETWORK_UID, 288.0));
    s.set_head(1_000);
    s
}

#[tokio::test]
async fn backward_scan_walks_windows_down() {
    let s = backward_setup();
    let log = s.h.record(BACKWARD_SYNC_LISTENER_KEY);
    s.add_events(&[
        NoteEvent::native(&s.key, 10, 950),
        NoteEvent::native(&s.key, 20, 750),
        NoteEvent::native(&s.key, 30, 650),
    ]);

    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 1).await.unwrap();
    assert!(backward.is_running());
    assert_eq!(backward.progress(), BackwardProgress { scanned: 0, total: 300 });

    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert_eq!(backward.progress(), BackwardProgress { scanned: 100, total: 300 });
    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert_eq!(backward.tick().await, BackwardTick::Completed);

    assert_eq!(
        s.h.chain.fetched(),
        vec![
            BlockRange::new(900, 999),
            BlockRange::new(800, 899),
            BlockRange::new(700, 799),
        ]
    );
    let meta = s.h.store.wn_meta(&s.wallet.address, NETWORK_UID).unwrap();
    assert_eq!(meta.earliest_zk_event_blk_num, Some(700));

    let amounts: Vec<u128> = s
        .h
        .store
        .zk_transfers(NETWORK_UID)
        .unwrap()
        .iter()
        .map(|t| t.amounts.to_private.as_ref().unwrap().amount)
        .collect();
    assert_eq!(amounts, vec![20, 10]);

    assert!(!backward.is_running());
    assert_eq!(backward.progress(), BackwardProgress::default());
    let log = log.lock().unwrap().clone();
    assert_eq!(running_flags(&log), vec![true, true, true, true, false]);
    assert_eq!(log[3].1.total_scanned, 300);
    assert_eq!(log[3].1.scan_range, BlockRange::new(700, 1_000));

    // the next request continues below the previous scan
    backward.start(s.profile(), 1).await.unwrap();
    backward.tick().await;
    assert_eq!(s.h.chain.fetched().last(), Some(&BlockRange::new(600, 699)));
}

#[tokio::test]
async fn backward_retries_a_failed_window() {
    let s = backward_setup();
    s.h.chain.with(|chain| chain.event_failures = 1);
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 1).await.unwrap();

    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert!(s.h.chain.fetched().is_empty());
    assert_eq!(backward.progress().scanned, 0);

    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert_eq!(s.h.chain.fetched(), vec![BlockRange::new(900, 999)]);
}

#[tokio::test]
async fn backward_gives_up_after_repeated_failures() {
    let mut config = backward_config();
    config.sync.backward.max_retries = 1;
    let s = Setup::with_network(config, network_with(NETWORK_UID, 288.0));
    s.set_head(1_000);
    s.h.chain.with(|chain| chain.event_failures = 5);
    let log = s.h.record(BACKWARD_SYNC_LISTENER_KEY);
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 1).await.unwrap();

    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert_eq!(backward.tick().await, BackwardTick::Stopped);
    assert!(!backward.is_running());
    assert!(s.h.chain.fetched().is_empty());
    assert_eq!(
        log.lock().unwrap().last().unwrap().1,
        NoteProgressNotification::stopped()
    );
}

#[tokio::test]
async fn backward_successful_window_resets_the_failure_budget() {
    let mut config = backward_config();
    config.sync.backward.max_retries = 1;
    let s = Setup::with_network(config, network_with(NETWORK_UID, 288.0));
    s.set_head(1_000);
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 1).await.unwrap();

    s.h.chain.with(|chain| chain.event_failures = 1);
    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert_eq!(backward.tick().await, BackwardTick::Continue);
    s.h.chain.with(|chain| chain.event_failures = 1);
    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert!(backward.is_running());
    assert_eq!(backward.tick().await, BackwardTick::Continue);
    assert_eq!(backward.progress().scanned, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backward_listeners_may_query_the_engine() {
    let s = backward_setup();
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    let seen: Arc<Mutex<Vec<(bool, u64, bool)>>> = Default::default();
    let sink = seen.clone();
    let engine = Arc::downgrade(&backward);
    let callback: ListenerCallback<NoteProgressNotification> =
        Arc::new(move |_key: &str, _id, _data: &NoteProgressNotification| {
            if let Some(engine) = engine.upgrade() {
                let observed = (
                    engine.is_running(),
                    engine.progress().scanned,
                    engine.profile().is_some(),
                );
                sink.lock().unwrap().push(observed);
            }
        });
    s.h.progress.add_listener(Some(BACKWARD_SYNC_LISTENER_KEY), callback);

    let profile = s.profile();
    let scenario = tokio::spawn(async move {
        backward.start(profile, 1).await.unwrap();
        assert_eq!(backward.tick().await, BackwardTick::Continue);
        backward.stop();
        backward
    });
    let backward = tokio::time::timeout(Duration::from_secs(5), scenario)
        .await
        .expect("listener callbacks do not block the engine")
        .unwrap();
    assert!(!backward.is_running());

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&(true, 0, true)));
    assert_eq!(seen[1], (true, 100, true));
    assert_eq!(seen.last(), Some(&(false, 0, true)));
}

#[tokio::test]
async fn backward_switching_profile_stops_first() {
    let s = backward_setup();
    let other = wallet(2);
    let other_key = user_key(8);
    s.h.store.add_wallet(other.clone()).unwrap();
    s.h.secrets.insert(&other, other_key.clone());
    s.h.chain.with(|chain| chain.register(&other.address, &other_key));
    s.h.store
        .set_wallet_earliest_blk(&other.address, NETWORK_UID, 500)
        .unwrap();
    let log = s.h.record(BACKWARD_SYNC_LISTENER_KEY);

    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 1).await.unwrap();
    backward
        .start(AppProfile::new(other.clone(), s.network.clone()), 1)
        .await
        .unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(running_flags(&log), vec![true, false, true]);
    assert_eq!(log[0].1.scan_range, BlockRange::new(700, 1_000));
    assert_eq!(log[2].1.scan_range, BlockRange::new(200, 500));
    assert_eq!(backward.profile().unwrap().wallet, other);

    backward.tick().await;
    assert_eq!(s.h.chain.fetched(), vec![BlockRange::new(400, 499)]);
    let first = s.h.store.wn_meta(&s.wallet.address, NETWORK_UID).unwrap();
    assert_eq!(first.earliest_zk_event_blk_num, Some(1_000));
}

#[tokio::test]
async fn backward_same_profile_is_ignored_and_stop_is_final() {
    let s = backward_setup();
    let log = s.h.record(BACKWARD_SYNC_LISTENER_KEY);
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 1).await.unwrap();
    backward.start(s.profile(), 5).await.unwrap();
    assert_eq!(running_flags(&log.lock().unwrap()), vec![true]);

    backward.stop();
    assert!(!backward.is_running());
    assert_eq!(backward.tick().await, BackwardTick::Stopped);
    assert!(s.h.chain.fetched().is_empty());
    assert_eq!(running_flags(&log.lock().unwrap()), vec![true, false]);
    assert_eq!(backward.profile().unwrap().wallet, s.wallet);
}

#[tokio::test]
async fn backward_dev_network_scans_fixed_span() {
    let s = Setup::with_network(backward_config(), network_with(NETWORK_UID, 0.5));
    s.set_head(1_000);
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward.start(s.profile(), 30).await.unwrap();
    assert_eq!(backward.progress().total, 50);

    assert_eq!(backward.tick().await, BackwardTick::Completed);
    assert_eq!(s.h.chain.fetched(), vec![BlockRange::new(950, 999)]);
}

#[tokio::test]
async fn backward_without_ena_stops() {
    let s = backward_setup();
    let stranger = wallet(4);
    s.h.secrets.insert(&stranger, user_key(12));
    let backward = BackwardNoteSync::new(s.h.ctx.clone());
    backward
        .start(AppProfile::new(stranger, s.network.clone()), 1)
        .await
        .unwrap();
    assert_eq!(backward.tick().await, BackwardTick::Stopped);
    assert!(!backward.is_running());
}
