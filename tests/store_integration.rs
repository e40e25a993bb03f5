// Integration tests: codec ↔ store ↔ queue ↔ bridge ↔ coordinator
// Exercises the full write-queue path end to end against real files.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spv_wallet::primitives::transaction::{TxInput, TxOutput};
use spv_wallet::wallet::coordinator::{ChainView, SyncCoordinator, SyncState};
use spv_wallet::{
    MasterPubKey, MerkleBlock, Peer, StoreEvent, StoreHandle, Transaction, WalletBridge,
    BLOCK_UNKNOWN_HEIGHT, UNCONFIRMED_HEIGHT,
};
use tokio::sync::watch;

// Honors RUST_LOG so queue/store tracing is visible under --nocapture.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn mock_tx(seed: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_hash: [seed; 32],
            prev_index: u32::from(seed),
            script_sig: vec![0x76, 0xa9, seed],
            sequence: 0xFFFF_FFFF,
        }],
        outputs: vec![TxOutput { value: 10_000 + u64::from(seed), script_pubkey: vec![0xAC, seed] }],
        lock_time: 0,
        block_height: UNCONFIRMED_HEIGHT,
        timestamp: 0,
    }
}

fn mock_block(seed: u8, height: u32) -> MerkleBlock {
    let mut b = MerkleBlock::new();
    b.version = 2;
    b.prev_block = [seed; 32];
    b.merkle_root = [seed.wrapping_add(0x40); 32];
    b.timestamp = 1_700_000_000 + u64::from(seed);
    b.target = 0x1d00_ffff;
    b.nonce = u32::from(seed) * 7;
    b.total_tx = 2;
    b.height = height;
    b.set_merkle_proof(vec![[seed; 32], [seed.wrapping_add(1); 32]], vec![0xB5]);
    b
}

// ========== STORE QUEUE: END-TO-END SCENARIOS ==========

#[tokio::test]
async fn test_scenario_unconfirmed_roundtrip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, _events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();

    let tx1 = mock_tx(1);
    store.add_transaction(tx1.clone());

    let loaded = store.load_transactions().await.unwrap();
    assert_eq!(loaded.transactions.len(), 1);
    assert_eq!(loaded.transactions[0].block_height, UNCONFIRMED_HEIGHT);
    assert_eq!(loaded.transactions[0].to_wire_bytes(), tx1.to_wire_bytes());
    assert!(!loaded.rescan_recommended);
    store.close().await;
}

#[tokio::test]
async fn test_scenario_confirmation_update() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, _events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();

    let tx1 = mock_tx(2);
    store.add_transaction(tx1.clone());
    store.update_transactions(vec![tx1.txid()], 500_000, 1_700_000_000);

    let loaded = store.load_transactions().await.unwrap();
    assert_eq!(loaded.transactions.len(), 1);
    assert_eq!(loaded.transactions[0].block_height, 500_000);
    // exact Unix value after un-rebasing
    assert_eq!(loaded.transactions[0].timestamp, 1_700_000_000);
    store.close().await;
}

#[tokio::test]
async fn test_scenario_delete_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, _events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();

    let tx1 = mock_tx(3);
    store.add_transaction(tx1.clone());
    store.delete_transaction(tx1.txid());
    assert!(store.load_transactions().await.unwrap().transactions.is_empty());

    // deleting again is a no-op, not an error
    store.delete_transaction(tx1.txid());
    assert!(store.load_transactions().await.unwrap().transactions.is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_scenario_corrupt_row_recommends_rescan() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.sqlite");

    let tx1 = mock_tx(4);
    let tx2 = mock_tx(5);
    {
        let (store, _events) = StoreHandle::open(&path).await.unwrap();
        store.add_transaction(tx1.clone());
        store.add_transaction(tx2.clone());
        store.close().await;
    }

    // Truncate tx1's core region out-of-band, keeping the footer so
    // the load continues past the damaged row.
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        let blob = tx1.to_storage_bytes();
        let corrupt = [&blob[..2], &blob[blob.len() - 8..]].concat();
        conn.execute(
            "update tx_metadata set blob = ?1 where tx_hash = ?2",
            rusqlite::params![corrupt, tx1.txid().as_slice()],
        )
        .unwrap();
    }

    let (store, mut events) = StoreHandle::open(&path).await.unwrap();
    let loaded = store.load_transactions().await.unwrap();
    assert_eq!(loaded.transactions.len(), 1);
    assert_eq!(loaded.transactions[0].txid(), tx2.txid());
    assert!(loaded.rescan_recommended);

    // exactly one rescan signal for that load
    assert_eq!(events.try_recv().unwrap(), StoreEvent::RescanRecommended);
    assert!(events.try_recv().is_err());
    store.close().await;
}

#[tokio::test]
async fn test_update_mismatch_emits_integrity_violation() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, mut events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();

    let tx1 = mock_tx(6);
    store.add_transaction(tx1.clone());
    store.update_transactions(vec![tx1.txid(), [0xEE; 32]], 100, 1_700_000_000);

    // drain the queue so the event is guaranteed to have been emitted
    let _ = store.load_transactions().await.unwrap();
    assert_eq!(
        events.try_recv().unwrap(),
        StoreEvent::IntegrityViolation { expected: 2, updated: 1 }
    );
    store.close().await;
}

#[tokio::test]
async fn test_primary_keys_monotonic_across_concurrent_callers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.sqlite");
    let (store, _events) = StoreHandle::open(&path).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.add_transaction(mock_tx(i));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(store.load_transactions().await.unwrap().transactions.len(), 8);
    store.close().await;

    let conn = rusqlite::Connection::open(&path).unwrap();
    let pks: Vec<i64> = conn
        .prepare("select pk from tx_metadata order by pk")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pks, (1..=8).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_blocks_skip_and_replace() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, _events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();

    let valid = mock_block(1, 4_000);
    let invalid = mock_block(2, BLOCK_UNKNOWN_HEIGHT);
    store.save_blocks(false, vec![valid.clone(), invalid]);

    let loaded = store.load_blocks().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].block_hash(), valid.block_hash());

    let replacement = vec![mock_block(3, 4_001), mock_block(4, 4_002)];
    store.save_blocks(true, replacement.clone());
    let loaded = store.load_blocks().await.unwrap();
    let mut got: Vec<[u8; 32]> = loaded.iter().map(|b| b.block_hash()).collect();
    let mut want: Vec<[u8; 32]> = replacement.iter().map(|b| b.block_hash()).collect();
    got.sort_unstable();
    want.sort_unstable();
    assert_eq!(got, want);

    store.save_blocks(false, vec![mock_block(5, 4_003)]);
    assert_eq!(store.load_blocks().await.unwrap().len(), 3);
    store.close().await;
}

#[tokio::test]
async fn test_peers_roundtrip_through_queue() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, _events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();

    let peers = vec![
        Peer::new(Ipv4Addr::new(10, 1, 2, 3), 9333, 1, 1_700_000_000),
        Peer::new(Ipv4Addr::new(172, 16, 0, 9), 9333, 13, 1_700_000_500),
    ];
    store.save_peers(true, peers.clone());
    let loaded = store.load_peers().await.unwrap();
    assert_eq!(loaded, peers);
    assert_eq!(loaded[0].ipv6_mapped().to_string(), "::ffff:10.1.2.3");
    store.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, _events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();
    store.close().await;
    store.close().await;
    // reads after close fail rather than hang
    assert!(store.load_transactions().await.is_err());
}

// ========== WALLET BRIDGE ==========

#[tokio::test]
async fn test_bridge_bootstrap_and_callbacks() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.sqlite");
    let (store, store_events) = StoreHandle::open(&path).await.unwrap();

    let (bridge, seed, _events) =
        WalletBridge::bootstrap(store, store_events, MasterPubKey::default(), 1_500_000_000)
            .await
            .unwrap();
    assert!(seed.blocks.is_empty());
    assert!(seed.peers.is_empty());

    let cb = bridge.callbacks();
    let tx1 = mock_tx(1);
    cb.on_transaction_added(tx1.clone());
    cb.on_balance_changed(42_000);

    assert_eq!(bridge.balance(), 42_000);
    assert_eq!(bridge.transactions().len(), 1);

    // the write made it through the queue, not just the memory view
    bridge.reload_transactions().await.unwrap();
    assert_eq!(bridge.transactions()[0].txid(), tx1.txid());

    cb.on_transactions_updated(vec![tx1.txid()], 600_000, 1_710_000_000);
    bridge.reload_transactions().await.unwrap();
    assert_eq!(bridge.transactions()[0].block_height, 600_000);
    assert_eq!(bridge.transactions()[0].timestamp, 1_710_000_000);

    cb.on_blocks_saved(false, vec![mock_block(1, 10)]);
    cb.on_peers_saved(true, vec![Peer::new(Ipv4Addr::new(1, 2, 3, 4), 9333, 0, 1_700_000_000)]);

    bridge.shutdown().await;

    // a second bootstrap sees everything the callbacks persisted
    let (store, store_events) = StoreHandle::open(&path).await.unwrap();
    let (bridge2, seed2, _events2) =
        WalletBridge::bootstrap(store, store_events, MasterPubKey::default(), 1_500_000_000)
            .await
            .unwrap();
    assert_eq!(bridge2.transactions().len(), 1);
    assert_eq!(seed2.blocks.len(), 1);
    assert_eq!(seed2.peers.len(), 1);
    bridge2.shutdown().await;
}

#[tokio::test]
async fn test_bridge_rejection_event_and_shutdown_gate() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, store_events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();
    let (bridge, _seed, mut events) =
        WalletBridge::bootstrap(store, store_events, MasterPubKey::default(), 0)
            .await
            .unwrap();
    let cb = bridge.callbacks();

    let tx1 = mock_tx(9);
    cb.on_transaction_added(tx1.clone());
    cb.on_transaction_deleted(tx1.txid(), true, true);

    bridge.reload_transactions().await.unwrap();
    assert!(bridge.transactions().is_empty());

    // skip the TxStatusUpdate-free path: first event is the rejection
    let ev = events.recv().await.unwrap();
    assert_eq!(
        ev,
        spv_wallet::WalletEvent::TxRejected { txid: tx1.txid(), recommend_rescan: true }
    );

    let balance_before = bridge.balance();
    bridge.shutdown().await;
    // callbacks after shutdown are ignored, not queued
    cb.on_transaction_added(mock_tx(10));
    cb.on_balance_changed(999_999);
    assert!(bridge.transactions().is_empty());
    assert_eq!(bridge.balance(), balance_before);
}

// ========== SYNC COORDINATOR ==========

struct MockChain {
    current: AtomicU32,
    estimated: AtomicU32,
    last_ts: AtomicU64,
}

impl MockChain {
    fn new(current: u32, estimated: u32) -> Self {
        MockChain {
            current: AtomicU32::new(current),
            estimated: AtomicU32::new(estimated),
            last_ts: AtomicU64::new(1_700_000_000),
        }
    }
}

impl ChainView for MockChain {
    fn last_block_height(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }
    fn estimated_block_height(&self) -> u32 {
        self.estimated.load(Ordering::Relaxed)
    }
    fn last_block_timestamp(&self) -> u64 {
        self.last_ts.load(Ordering::Relaxed)
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<SyncState>,
    pred: impl Fn(&SyncState) -> bool,
) -> SyncState {
    for _ in 0..200 {
        {
            let s = rx.borrow();
            if pred(&s) {
                return s.clone();
            }
        }
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("timed out waiting for state change")
            .expect("state channel closed");
    }
    panic!("state never matched predicate");
}

#[tokio::test(start_paused = true)]
async fn test_sync_cycle_publishes_progress() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, store_events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();
    let (bridge, _seed, events) =
        WalletBridge::bootstrap(store, store_events, MasterPubKey::default(), 0)
            .await
            .unwrap();
    let cb = bridge.callbacks();

    let chain = Arc::new(MockChain::new(1_000, 2_000));
    let baseline = dir.path().join("baseline.json");
    let (coordinator, mut state) =
        SyncCoordinator::new(chain.clone(), bridge.clone(), events, baseline.clone());
    tokio::spawn(coordinator.run());

    cb.on_sync_started();
    let s = wait_for(&mut state, |s| s.is_syncing).await;
    assert!(s.last_error.is_none());

    // baseline starts at 0, so halfway through the estimated chain
    let s = wait_for(&mut state, |s| s.progress > 0.0).await;
    assert!((s.progress - 0.5).abs() < 0.01, "progress was {}", s.progress);

    chain.current.store(2_000, Ordering::Relaxed);
    cb.on_sync_succeeded();
    let s = wait_for(&mut state, |s| !s.is_syncing).await;
    assert_eq!(s.progress, 1.0);
    assert_eq!(s.last_block_timestamp, 1_700_000_000);

    // the finished height persists as the next baseline
    let raw = std::fs::read_to_string(&baseline).unwrap();
    assert!(raw.contains("2000"), "baseline file was {raw}");

    // a later failure is surfaced and retryable
    cb.on_sync_started();
    wait_for(&mut state, |s| s.is_syncing).await;
    cb.on_sync_failed(61, "connection reset");
    let s = wait_for(&mut state, |s| !s.is_syncing).await;
    assert_eq!(s.last_error.as_deref(), Some("connection reset"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_balance_event_flows_to_state() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (store, store_events) = StoreHandle::open(&dir.path().join("w.sqlite")).await.unwrap();
    let (bridge, _seed, events) =
        WalletBridge::bootstrap(store, store_events, MasterPubKey::default(), 0)
            .await
            .unwrap();
    let cb = bridge.callbacks();

    let chain = Arc::new(MockChain::new(0, 0));
    let (coordinator, mut state) = SyncCoordinator::new(
        chain,
        bridge.clone(),
        events,
        dir.path().join("baseline.json"),
    );
    tokio::spawn(coordinator.run());

    cb.on_balance_changed(77_777);
    let s = wait_for(&mut state, |s| s.balance == 77_777).await;
    assert!(!s.is_syncing);

    bridge.shutdown().await;
}
