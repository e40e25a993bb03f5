// Sync progress coordinator.
//
// Maps peer-manager lifecycle notifications onto observable state:
//   Idle -> Syncing -> (Succeeded | Failed) -> Idle
// While syncing, a periodic sampler polls the chain view and publishes
// a progress fraction computed against the height the previous sync
// finished at ("baseline"), which persists across launches.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::PROGRESS_UPDATE_INTERVAL_MS;
use crate::wallet::events::WalletEvent;
use crate::wallet::runtime::WalletBridge;

/// Read-only view of the peer manager's chain state, sampled by the
/// progress timer. Implemented by the external network layer.
pub trait ChainView: Send + Sync {
    fn last_block_height(&self) -> u32;
    fn estimated_block_height(&self) -> u32;
    /// Unix seconds of the most recently accepted block.
    fn last_block_timestamp(&self) -> u64;
}

/// State published to the observation layer. Updated only from the
/// coordinator task; consumers watch, never mutate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub is_syncing: bool,
    /// Fraction in [0, 1].
    pub progress: f64,
    pub last_block_timestamp: u64,
    pub balance: u64,
    /// Set when stored data could not be fully recovered and the user
    /// should be offered a rescan.
    pub rescan_recommended: bool,
    /// Last sync failure, cleared when a new sync starts. Retryable.
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SyncBaseline {
    last_block_height: u32,
}

pub struct SyncCoordinator {
    chain: Arc<dyn ChainView>,
    bridge: WalletBridge,
    events: mpsc::UnboundedReceiver<WalletEvent>,
    state_tx: watch::Sender<SyncState>,
    baseline_path: PathBuf,
    start_height: u32,
    syncing: bool,
}

impl SyncCoordinator {
    pub fn new(
        chain: Arc<dyn ChainView>,
        bridge: WalletBridge,
        events: mpsc::UnboundedReceiver<WalletEvent>,
        baseline_path: PathBuf,
    ) -> (Self, watch::Receiver<SyncState>) {
        let start_height = load_baseline(&baseline_path);
        let (state_tx, state_rx) = watch::channel(SyncState::default());
        (
            SyncCoordinator {
                chain,
                bridge,
                events,
                state_tx,
                baseline_path,
                start_height,
                syncing: false,
            },
            state_rx,
        )
    }

    /// Drives the coordinator until the event channel closes (bridge
    /// shutdown). The sampling timer only does work while a sync is in
    /// flight; stopping it when already stopped is a no-op by
    /// construction.
    pub async fn run(mut self) {
        let mut sampler = tokio::time::interval(Duration::from_millis(PROGRESS_UPDATE_INTERVAL_MS));
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => return,
                    }
                }
                _ = sampler.tick(), if self.syncing => {
                    self.sample_progress();
                }
            }
        }
    }

    async fn handle_event(&mut self, event: WalletEvent) {
        match event {
            WalletEvent::SyncStarted => {
                // A new sync-started always restarts the cycle,
                // whatever state we were in.
                self.syncing = true;
                self.state_tx.send_modify(|s| {
                    s.is_syncing = true;
                    s.progress = 0.0;
                    s.last_error = None;
                });
                info!(start_height = self.start_height, "sync started");
            }
            WalletEvent::SyncSucceeded => {
                self.start_height = self.chain.last_block_height();
                store_baseline(&self.baseline_path, self.start_height);
                self.syncing = false;
                self.state_tx.send_modify(|s| {
                    s.is_syncing = false;
                    s.progress = 1.0;
                    s.last_block_timestamp = self.chain.last_block_timestamp();
                });
                info!(height = self.start_height, "sync succeeded");
            }
            WalletEvent::SyncFailed { code, message } => {
                self.syncing = false;
                warn!(code, message, "sync failed");
                self.state_tx.send_modify(|s| {
                    s.is_syncing = false;
                    s.last_error = Some(message);
                });
            }
            WalletEvent::BalanceChanged(balance) => {
                self.state_tx.send_modify(|s| s.balance = balance);
                self.refresh_transactions().await;
            }
            WalletEvent::TxStatusUpdate => {
                self.refresh_transactions().await;
            }
            WalletEvent::TxRejected { txid, recommend_rescan } => {
                info!(txid = %hex::encode(txid), recommend_rescan, "transaction rejected");
                if recommend_rescan {
                    self.state_tx.send_modify(|s| s.rescan_recommended = true);
                }
                self.refresh_transactions().await;
            }
            WalletEvent::RescanRecommended { forced } => {
                if forced {
                    warn!("forced rescan recommended, transaction history unreliable");
                }
                self.state_tx.send_modify(|s| s.rescan_recommended = true);
            }
        }
    }

    // Transaction-list and balance notifications are orthogonal to the
    // sync state machine; they refresh the wallet view whenever they
    // arrive.
    async fn refresh_transactions(&self) {
        if let Err(e) = self.bridge.reload_transactions().await {
            warn!(error = %e, "failed to refresh transactions from store");
        }
    }

    fn sample_progress(&self) {
        let current = self.chain.last_block_height();
        let estimated = self.chain.estimated_block_height();
        let progress = progress_fraction(self.start_height, current, estimated);
        self.state_tx.send_modify(|s| {
            s.progress = progress;
            s.last_block_timestamp = self.chain.last_block_timestamp();
        });
    }
}

/// (current - start) / (estimated - start), clamped to [0, 1].
fn progress_fraction(start: u32, current: u32, estimated: u32) -> f64 {
    if estimated <= start {
        return 1.0;
    }
    let done = f64::from(current.saturating_sub(start));
    let total = f64::from(estimated - start);
    (done / total).clamp(0.0, 1.0)
}

fn load_baseline(path: &PathBuf) -> u32 {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<SyncBaseline>(&raw) {
            Ok(b) => b.last_block_height,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed sync baseline, starting from 0");
                0
            }
        },
        Err(_) => 0,
    }
}

fn store_baseline(path: &PathBuf, last_block_height: u32) {
    let baseline = SyncBaseline { last_block_height };
    match serde_json::to_string(&baseline) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(path, raw) {
                warn!(path = %path.display(), error = %e, "failed to persist sync baseline");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode sync baseline"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction_clamped() {
        assert_eq!(progress_fraction(100, 100, 200), 0.0);
        assert_eq!(progress_fraction(100, 150, 200), 0.5);
        assert_eq!(progress_fraction(100, 200, 200), 1.0);
        assert_eq!(progress_fraction(100, 300, 200), 1.0);
        // nothing to sync
        assert_eq!(progress_fraction(200, 200, 200), 1.0);
        assert_eq!(progress_fraction(200, 150, 100), 1.0);
    }

    #[test]
    fn test_baseline_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        assert_eq!(load_baseline(&path), 0);
        store_baseline(&path, 654_321);
        assert_eq!(load_baseline(&path), 654_321);
    }

    #[test]
    fn test_malformed_baseline_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_baseline(&path), 0);
    }
}
