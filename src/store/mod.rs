pub mod db;
pub mod queue;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to open store at {path}: {source}")]
    Open { path: PathBuf, source: rusqlite::Error },
    /// Fewer transaction rows updated than hashes requested. Left
    /// unrepaired this makes transactions vanish from the user's
    /// history, so it is never swallowed.
    #[error("updated {updated} transaction rows, expected {expected}")]
    Integrity { expected: usize, updated: usize },
    /// The primary-key tracker moved underneath an insert. The serial
    /// write queue makes this unreachable unless a second writer exists.
    #[error("primary key tracker conflict for entity {ent}")]
    KeyConflict { ent: i64 },
    #[error("store is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
