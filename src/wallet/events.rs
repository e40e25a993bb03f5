/// Notifications flowing from the wallet/peer-manager layer to the
/// sync coordinator and, through it, to the observation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    BalanceChanged(u64),
    /// Confirmation status of one or more transactions changed.
    TxStatusUpdate,
    /// A transaction was rejected/invalidated (double spend, conflict,
    /// reorg).
    TxRejected { txid: [u8; 32], recommend_rescan: bool },
    SyncStarted,
    SyncSucceeded,
    SyncFailed { code: i32, message: String },
    /// Stored data could not be fully recovered; offer the user a
    /// rescan. `forced` marks the integrity-violation escalation where
    /// the transaction history can no longer be trusted at all.
    RescanRecommended { forced: bool },
}
