// Serial write queue.
//
// One dedicated thread per open store owns the sqlite connection and
// drains a FIFO command channel. Every mutation and every load goes
// through this channel, so writes are totally ordered, reads observe
// all previously enqueued writes, and nothing else ever touches the
// connection. Completion for loads is delivered over oneshot channels
// awaited on the caller's own context; the queue never blocks on that
// delivery.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use super::db::{LoadedTransactions, WalletDb};
use super::StoreError;
use crate::primitives::block::MerkleBlock;
use crate::primitives::peer::Peer;
use crate::primitives::transaction::Transaction;

/// Out-of-band signals from the store to the wallet layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// One or more stored transactions could not be parsed; the wallet
    /// should offer the user a rescan.
    RescanRecommended,
    /// An update touched fewer rows than requested. The original
    /// implementation terminated the process here; we keep the
    /// detection but surface it so the wallet can force a rescan
    /// instead of dying.
    IntegrityViolation { expected: usize, updated: usize },
}

enum StoreCommand {
    AddTransaction(Box<Transaction>),
    UpdateTransactions { hashes: Vec<[u8; 32]>, block_height: u32, timestamp: u64 },
    DeleteTransaction([u8; 32]),
    SaveBlocks { replace: bool, blocks: Vec<MerkleBlock> },
    SavePeers { replace: bool, peers: Vec<Peer> },
    LoadTransactions(oneshot::Sender<Result<LoadedTransactions, StoreError>>),
    LoadBlocks(oneshot::Sender<Result<Vec<MerkleBlock>, StoreError>>),
    LoadPeers(oneshot::Sender<Result<Vec<Peer>, StoreError>>),
    Close(oneshot::Sender<()>),
}

/// Handle to one wallet store. Cheap to clone; all clones feed the
/// same serial queue.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
    closed: Arc<AtomicBool>,
    path: PathBuf,
}

impl StoreHandle {
    /// Opens the store on its queue thread. The open result (including
    /// the release-build delete-and-retry policy) comes back before
    /// this returns; events observed during later operations arrive on
    /// the returned receiver.
    pub async fn open(
        path: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StoreEvent>), StoreError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = oneshot::channel();

        let thread_path = path.to_path_buf();
        std::thread::Builder::new()
            .name("wallet-store".into())
            .spawn(move || run_queue(thread_path, cmd_rx, event_tx, open_tx))?;

        open_rx.await.map_err(|_| StoreError::Closed)??;

        Ok((
            StoreHandle {
                tx: cmd_tx,
                closed: Arc::new(AtomicBool::new(false)),
                path: path.to_path_buf(),
            },
            event_rx,
        ))
    }

    fn send(&self, cmd: StoreCommand) {
        if self.closed.load(Ordering::Acquire) {
            warn!("store command dropped after close");
            return;
        }
        if self.tx.send(cmd).is_err() {
            warn!("store queue is gone, command dropped");
        }
    }

    /// Fire-and-forget write. Failure is logged on the queue thread;
    /// callers must not assume the write happened and reconcile via a
    /// later full reload if they detect drift.
    pub fn add_transaction(&self, tx: Transaction) {
        self.send(StoreCommand::AddTransaction(Box::new(tx)));
    }

    pub fn update_transactions(&self, hashes: Vec<[u8; 32]>, block_height: u32, timestamp: u64) {
        self.send(StoreCommand::UpdateTransactions { hashes, block_height, timestamp });
    }

    pub fn delete_transaction(&self, hash: [u8; 32]) {
        self.send(StoreCommand::DeleteTransaction(hash));
    }

    pub fn save_blocks(&self, replace: bool, blocks: Vec<MerkleBlock>) {
        self.send(StoreCommand::SaveBlocks { replace, blocks });
    }

    pub fn save_peers(&self, replace: bool, peers: Vec<Peer>) {
        self.send(StoreCommand::SavePeers { replace, peers });
    }

    pub async fn load_transactions(&self) -> Result<LoadedTransactions, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StoreCommand::LoadTransactions(reply_tx));
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn load_blocks(&self) -> Result<Vec<MerkleBlock>, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StoreCommand::LoadBlocks(reply_tx));
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn load_peers(&self) -> Result<Vec<Peer>, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StoreCommand::LoadPeers(reply_tx));
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Drains pending work, releases the connection, and stops the
    /// queue thread. Safe to call more than once; later calls no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Removes the backing files (wallet wipe). Call after `close`.
    pub fn delete(&self) {
        WalletDb::delete(&self.path);
    }
}

fn run_queue(
    path: PathBuf,
    mut cmd_rx: mpsc::UnboundedReceiver<StoreCommand>,
    events: mpsc::UnboundedSender<StoreEvent>,
    open_tx: oneshot::Sender<Result<(), StoreError>>,
) {
    let mut db = match WalletDb::open(&path) {
        Ok(db) => {
            let _ = open_tx.send(Ok(()));
            db
        }
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };

    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            StoreCommand::AddTransaction(tx) => {
                if let Err(e) = db.add_transaction(&tx) {
                    error!(txid = %hex::encode(tx.txid()), error = %e, "add transaction failed");
                }
            }
            StoreCommand::UpdateTransactions { hashes, block_height, timestamp } => {
                match db.update_transactions(&hashes, block_height, timestamp) {
                    Ok(()) => {}
                    Err(StoreError::Integrity { expected, updated }) => {
                        let _ = events.send(StoreEvent::IntegrityViolation { expected, updated });
                    }
                    Err(e) => error!(error = %e, "update transactions failed"),
                }
            }
            StoreCommand::DeleteTransaction(hash) => {
                if let Err(e) = db.delete_transaction(&hash) {
                    error!(txid = %hex::encode(hash), error = %e, "delete transaction failed");
                }
            }
            StoreCommand::SaveBlocks { replace, blocks } => {
                if let Err(e) = db.save_blocks(replace, &blocks) {
                    error!(count = blocks.len(), error = %e, "save blocks failed");
                }
            }
            StoreCommand::SavePeers { replace, peers } => {
                if let Err(e) = db.save_peers(replace, &peers) {
                    error!(count = peers.len(), error = %e, "save peers failed");
                }
            }
            StoreCommand::LoadTransactions(reply) => {
                let result = db.load_transactions();
                if let Ok(loaded) = &result {
                    if loaded.rescan_recommended {
                        let _ = events.send(StoreEvent::RescanRecommended);
                    }
                }
                let _ = reply.send(result);
            }
            StoreCommand::LoadBlocks(reply) => {
                let _ = reply.send(db.load_blocks());
            }
            StoreCommand::LoadPeers(reply) => {
                let _ = reply.send(db.load_peers());
            }
            StoreCommand::Close(done) => {
                drop(db);
                let _ = done.send(());
                return;
            }
        }
    }
}
