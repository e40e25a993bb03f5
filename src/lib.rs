// SPV wallet persistence and synchronization core.
//
// Layering (leaves first):
//   primitives - transaction / merkle block / peer records and their
//                binary codecs
//   store      - the sqlite-backed relational store and the serial
//                write queue that owns it
//   wallet     - the in-memory wallet, the callback bridge fed by the
//                peer-to-peer layer, and the sync progress coordinator
//
// Everything UI-facing, the peer wire protocol itself, and key
// derivation live outside this crate; they talk to it through
// `WalletCallbacks`, `ChainView`, and plain parameters.

pub mod config;
pub mod crypto;
pub mod epoch;
pub mod primitives;
pub mod store;
pub mod wallet;

pub use primitives::block::{MerkleBlock, BLOCK_UNKNOWN_HEIGHT};
pub use primitives::peer::Peer;
pub use primitives::transaction::{Transaction, UNCONFIRMED_HEIGHT};
pub use primitives::CodecError;
pub use store::db::LoadedTransactions;
pub use store::queue::{StoreEvent, StoreHandle};
pub use store::StoreError;
pub use wallet::coordinator::{ChainView, SyncCoordinator, SyncState};
pub use wallet::events::WalletEvent;
pub use wallet::runtime::{ChainSeed, MasterPubKey, WalletBridge, WalletCallbacks};
