// Wallet runtime bridge.
//
// Owns the in-memory wallet view and the callback surface the
// peer-to-peer layer drives. Callbacks arrive on whatever thread the
// network layer runs; their first act is always to hand the work to
// the store's serial queue, never to touch the connection directly.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::primitives::block::MerkleBlock;
use crate::primitives::peer::Peer;
use crate::primitives::transaction::{Transaction, UNCONFIRMED_HEIGHT};
use crate::store::queue::{StoreEvent, StoreHandle};
use crate::store::StoreError;
use crate::wallet::events::WalletEvent;

/// Extended master public key handed over by the authenticator. The
/// bridge never derives keys itself; it only seeds the runtime wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterPubKey {
    pub fingerprint: u32,
    pub chain_code: [u8; 32],
    pub pub_key: [u8; 33],
}

// Not derivable: arrays longer than 32 elements have no Default impl.
impl Default for MasterPubKey {
    fn default() -> Self {
        MasterPubKey { fingerprint: 0, chain_code: [0; 32], pub_key: [0; 33] }
    }
}

/// Blocks and peers loaded at startup, used to seed the external peer
/// manager's chain state and address book.
#[derive(Debug, Default)]
pub struct ChainSeed {
    pub blocks: Vec<MerkleBlock>,
    pub peers: Vec<Peer>,
}

/// In-memory wallet state reconstructed from store rows at load time.
/// Holds values only - nothing here is persisted directly.
#[derive(Debug)]
pub struct Wallet {
    transactions: Vec<Transaction>,
    balance: u64,
    master_pub_key: MasterPubKey,
    earliest_key_time: u64,
}

impl Wallet {
    fn new(master_pub_key: MasterPubKey, earliest_key_time: u64, mut transactions: Vec<Transaction>) -> Self {
        Self::sort_transactions(&mut transactions);
        Wallet { transactions, balance: 0, master_pub_key, earliest_key_time }
    }

    // Most-recent-first, unconfirmed transactions ahead of everything.
    fn sort_transactions(txs: &mut [Transaction]) {
        txs.sort_by_key(|tx| {
            std::cmp::Reverse((tx.block_height == UNCONFIRMED_HEIGHT, tx.timestamp, tx.block_height))
        });
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn master_pub_key(&self) -> &MasterPubKey {
        &self.master_pub_key
    }

    /// Timestamp before which the wallet's keys could not have been
    /// used; bounds the initial sync scan range.
    pub fn earliest_key_time(&self) -> u64 {
        self.earliest_key_time
    }
}

/// The storage-facing half of the wallet runtime. Constructed by
/// [`WalletBridge::bootstrap`]; hand its [`WalletCallbacks`] to the
/// peer manager.
#[derive(Clone)]
pub struct WalletBridge {
    store: StoreHandle,
    wallet: Arc<Mutex<Wallet>>,
    events: mpsc::UnboundedSender<WalletEvent>,
    accepting: Arc<AtomicBool>,
}

impl WalletBridge {
    /// Loads transactions, blocks, and peers from the store and builds
    /// the in-memory wallet. Returns the bridge, the chain seed for
    /// the peer manager, and the receiver carrying wallet events for
    /// the coordinator.
    pub async fn bootstrap(
        store: StoreHandle,
        store_events: mpsc::UnboundedReceiver<StoreEvent>,
        master_pub_key: MasterPubKey,
        earliest_key_time: u64,
    ) -> Result<(Self, ChainSeed, mpsc::UnboundedReceiver<WalletEvent>), StoreError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Store-level signals become wallet events; an integrity
        // violation escalates to a forced rescan instead of taking the
        // process down.
        tokio::spawn(forward_store_events(store_events, event_tx.clone()));

        let loaded = store.load_transactions().await?;
        let blocks = store.load_blocks().await?;
        let peers = store.load_peers().await?;
        info!(
            transactions = loaded.transactions.len(),
            blocks = blocks.len(),
            peers = peers.len(),
            "wallet bootstrapped from store"
        );

        let wallet = Wallet::new(master_pub_key, earliest_key_time, loaded.transactions);
        Ok((
            WalletBridge {
                store,
                wallet: Arc::new(Mutex::new(wallet)),
                events: event_tx,
                accepting: Arc::new(AtomicBool::new(true)),
            },
            ChainSeed { blocks, peers },
            event_rx,
        ))
    }

    /// The inbound callback surface to register with the peer manager.
    pub fn callbacks(&self) -> WalletCallbacks {
        WalletCallbacks { bridge: self.clone() }
    }

    /// Snapshot of the transaction list, most recent first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock_wallet().transactions.clone()
    }

    pub fn balance(&self) -> u64 {
        self.lock_wallet().balance
    }

    pub fn earliest_key_time(&self) -> u64 {
        self.lock_wallet().earliest_key_time
    }

    /// Re-reads the store and replaces the in-memory transaction list.
    /// Used whenever status notifications indicate the view may be
    /// stale.
    pub async fn reload_transactions(&self) -> Result<(), StoreError> {
        let loaded = self.store.load_transactions().await?;
        let mut txs = loaded.transactions;
        Wallet::sort_transactions(&mut txs);
        self.lock_wallet().transactions = txs;
        Ok(())
    }

    /// Stops accepting callback-driven writes and closes the store.
    /// Does not wait for the network layer's own teardown.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("wallet bridge shutting down");
        }
        self.store.close().await;
    }

    fn lock_wallet(&self) -> std::sync::MutexGuard<'_, Wallet> {
        self.wallet.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn forward_store_events(
    mut store_events: mpsc::UnboundedReceiver<StoreEvent>,
    events: mpsc::UnboundedSender<WalletEvent>,
) {
    while let Some(ev) = store_events.recv().await {
        let mapped = match ev {
            StoreEvent::RescanRecommended => WalletEvent::RescanRecommended { forced: false },
            StoreEvent::IntegrityViolation { expected, updated } => {
                error!(
                    expected, updated,
                    "transaction update count mismatch, forcing rescan to repair history"
                );
                WalletEvent::RescanRecommended { forced: true }
            }
        };
        if events.send(mapped).is_err() {
            return;
        }
    }
}

/// Inbound callback slots invoked by the peer-to-peer layer, from its
/// own threads. Clone freely; everything funnels into the one queue.
#[derive(Clone)]
pub struct WalletCallbacks {
    bridge: WalletBridge,
}

impl WalletCallbacks {
    pub fn on_balance_changed(&self, balance: u64) {
        if !self.bridge.accepting.load(Ordering::Acquire) {
            return;
        }
        self.bridge.lock_wallet().balance = balance;
        let _ = self.bridge.events.send(WalletEvent::BalanceChanged(balance));
    }

    pub fn on_transaction_added(&self, tx: Transaction) {
        if !self.bridge.accepting.load(Ordering::Acquire) {
            warn!("transaction callback after shutdown, ignored");
            return;
        }
        {
            let mut wallet = self.bridge.lock_wallet();
            wallet.transactions.push(tx.clone());
            Wallet::sort_transactions(&mut wallet.transactions);
        }
        self.bridge.store.add_transaction(tx);
    }

    pub fn on_transactions_updated(&self, hashes: Vec<[u8; 32]>, block_height: u32, timestamp: u64) {
        if !self.bridge.accepting.load(Ordering::Acquire) {
            return;
        }
        {
            let mut wallet = self.bridge.lock_wallet();
            for tx in wallet.transactions.iter_mut() {
                if hashes.contains(&tx.txid()) {
                    tx.block_height = block_height;
                    tx.timestamp = timestamp;
                }
            }
            Wallet::sort_transactions(&mut wallet.transactions);
        }
        self.bridge.store.update_transactions(hashes, block_height, timestamp);
        let _ = self.bridge.events.send(WalletEvent::TxStatusUpdate);
    }

    pub fn on_transaction_deleted(&self, hash: [u8; 32], notify_user: bool, recommend_rescan: bool) {
        if !self.bridge.accepting.load(Ordering::Acquire) {
            return;
        }
        self.bridge.lock_wallet().transactions.retain(|tx| tx.txid() != hash);
        self.bridge.store.delete_transaction(hash);
        if notify_user {
            let _ = self
                .bridge
                .events
                .send(WalletEvent::TxRejected { txid: hash, recommend_rescan });
        }
    }

    pub fn on_sync_started(&self) {
        let _ = self.bridge.events.send(WalletEvent::SyncStarted);
    }

    pub fn on_sync_succeeded(&self) {
        let _ = self.bridge.events.send(WalletEvent::SyncSucceeded);
    }

    pub fn on_sync_failed(&self, code: i32, message: impl Into<String>) {
        let _ = self
            .bridge
            .events
            .send(WalletEvent::SyncFailed { code, message: message.into() });
    }

    /// Blocks arrive here already cloned out of the network layer's
    /// buffers; they move into the queue as owned values.
    pub fn on_blocks_saved(&self, replace: bool, blocks: Vec<MerkleBlock>) {
        if !self.bridge.accepting.load(Ordering::Acquire) {
            return;
        }
        self.bridge.store.save_blocks(replace, blocks);
    }

    pub fn on_peers_saved(&self, replace: bool, peers: Vec<Peer>) {
        if !self.bridge.accepting.load(Ordering::Acquire) {
            return;
        }
        self.bridge.store.save_peers(replace, peers);
    }
}
