/// Default database file name, one per wallet/currency.
pub const DB_FILE_NAME: &str = "spv-wallet.sqlite";

/// File holding the last fully synced block height, used as the
/// baseline for progress computation across launches.
pub const SYNC_BASELINE_FILE: &str = "sync-baseline.json";

/// How often the coordinator samples sync height while syncing.
pub const PROGRESS_UPDATE_INTERVAL_MS: u64 = 500;

/// Data directory name
pub const DATA_DIR: &str = ".spv-wallet";

/// Default data directory under the user's home.
pub fn default_data_dir() -> std::path::PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    std::path::PathBuf::from(home).join(DATA_DIR)
}
