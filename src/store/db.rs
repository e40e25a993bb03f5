// Relational store backing one wallet.
//
// Tables (schema inherited from a legacy object-graph persistence
// layer - the entity tags, the `opt` column, and the side primary-key
// tracker all emulate its row identity scheme):
//   tx_metadata    - pk, ent, opt, record_type, blob, tx_hash
//   merkle_blocks  - pk, ent, opt, height, nonce, target, total_tx,
//                    version, timestamp, block_hash, flags, hashes,
//                    merkle_root, prev_block
//   peers          - pk, ent, opt, address, misbehaving, port,
//                    services, timestamp
//   primary_keys   - ent, name, super, max_pk (running max per entity)
//
// All methods here are synchronous and must only be called from the
// store's write-queue thread (queue.rs); the queue is the entire
// concurrency control mechanism.
use std::path::{Path, PathBuf};

use rusqlite::{params, params_from_iter, Connection, OpenFlags, TransactionBehavior};
use tracing::{error, info, warn};

use super::StoreError;
use crate::epoch;
use crate::primitives::block::{MerkleBlock, BLOCK_UNKNOWN_HEIGHT};
use crate::primitives::peer::Peer;
use crate::primitives::transaction::{Transaction, STORAGE_FOOTER_BYTES};

const ENT_TX: i64 = 6;
const ENT_BLOCK: i64 = 2;
const ENT_PEER: i64 = 3;

const ENT_TX_NAME: &str = "TxMetadata";
const ENT_BLOCK_NAME: &str = "MerkleBlock";
const ENT_PEER_NAME: &str = "Peer";

/// Record-type value marking a live transaction row. Other values are
/// legacy entity kinds and are ignored on read.
const TX_RECORD_TYPE_LIVE: i64 = 1;

const SCHEMA: &str = "
create table if not exists tx_metadata (
    pk integer primary key,
    ent integer,
    opt integer,
    record_type integer,
    blob blob,
    tx_hash blob);
create index if not exists tx_metadata_tx_hash_index on tx_metadata (tx_hash);
create index if not exists tx_metadata_record_type_index on tx_metadata (record_type);

create table if not exists merkle_blocks (
    pk integer primary key,
    ent integer,
    opt integer,
    height integer,
    nonce integer,
    target integer,
    total_tx integer,
    version integer,
    timestamp integer,
    block_hash blob,
    flags blob,
    hashes blob,
    merkle_root blob,
    prev_block blob);
create index if not exists merkle_blocks_block_hash_index on merkle_blocks (block_hash);
create index if not exists merkle_blocks_height_index on merkle_blocks (height);
create index if not exists merkle_blocks_prev_block_index on merkle_blocks (prev_block);

create table if not exists peers (
    pk integer primary key,
    ent integer,
    opt integer,
    address integer,
    misbehaving integer,
    port integer,
    services integer,
    timestamp integer);
create index if not exists peers_address_index on peers (address);
create index if not exists peers_misbehaving_index on peers (misbehaving);
create index if not exists peers_port_index on peers (port);
create index if not exists peers_timestamp_index on peers (timestamp);

create table if not exists primary_keys (
    ent integer primary key,
    name varchar,
    super integer,
    max_pk integer);
";

/// Result of a full transaction load. A row that fails to deserialize
/// is skipped rather than aborting the load; `rescan_recommended`
/// tells the caller at least one row was dropped and the wallet should
/// be offered a rescan.
#[derive(Debug, Default)]
pub struct LoadedTransactions {
    pub transactions: Vec<Transaction>,
    pub rescan_recommended: bool,
}

pub struct WalletDb {
    conn: Connection,
    path: PathBuf,
    tx_ent: i64,
    block_ent: i64,
    peer_ent: i64,
}

impl WalletDb {
    /// Opens or creates the backing file and sets up the schema
    /// idempotently. In debug builds an open failure propagates; in
    /// release builds the (presumed corrupt) file is deleted and the
    /// open retried once before propagating.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = match Self::open_connection(path) {
            Ok(conn) => conn,
            Err(e) if !cfg!(debug_assertions) => {
                warn!(path = %path.display(), error = %e, "store open failed, recreating");
                Self::remove_files(path);
                Self::open_connection(path)
                    .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?
            }
            Err(source) => {
                return Err(StoreError::Open { path: path.to_path_buf(), source });
            }
        };

        conn.execute_batch(SCHEMA)?;

        // Seed the tracker rows only where absent, keeping any existing
        // running max intact.
        for (ent, name) in [(ENT_TX, ENT_TX_NAME), (ENT_BLOCK, ENT_BLOCK_NAME), (ENT_PEER, ENT_PEER_NAME)] {
            conn.execute(
                "insert into primary_keys (ent, name, super, max_pk)
                 select ?1, ?2, 0, 0 except
                 select ?1, name, 0, 0 from primary_keys where name = ?2",
                params![ent, name],
            )?;
        }

        let mut db = WalletDb {
            conn,
            path: path.to_path_buf(),
            tx_ent: 0,
            block_ent: 0,
            peer_ent: 0,
        };

        let mut stmt = db.conn.prepare("select ent, name from primary_keys")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        for (ent, name) in rows {
            match name.as_str() {
                ENT_TX_NAME => db.tx_ent = ent,
                ENT_BLOCK_NAME => db.block_ent = ent,
                ENT_PEER_NAME => db.peer_ent = ent,
                _ => {}
            }
        }

        db.set_file_protection();
        info!(path = %path.display(), "wallet store opened");
        Ok(db)
    }

    fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
    }

    fn remove_files(path: &Path) {
        for p in Self::sibling_files(path) {
            let _ = std::fs::remove_file(p);
        }
    }

    fn sibling_files(path: &Path) -> [PathBuf; 3] {
        let base = path.to_path_buf();
        let mut wal = path.as_os_str().to_owned();
        wal.push("-wal");
        let mut shm = path.as_os_str().to_owned();
        shm.push("-shm");
        [base, PathBuf::from(wal), PathBuf::from(shm)]
    }

    /// Removes the backing files entirely (wallet wipe). Failures are
    /// logged but never block the wipe flow.
    pub fn delete(path: &Path) {
        for p in Self::sibling_files(path) {
            if p.exists() {
                if let Err(e) = std::fs::remove_file(&p) {
                    warn!(path = %p.display(), error = %e, "failed to delete store file");
                }
            }
        }
    }

    /// Best-effort: keep the on-disk files readable by background
    /// processing (owner read/write only, no OS encryption classes to
    /// fight on this platform). Never fatal.
    pub fn set_file_protection(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for p in Self::sibling_files(&self.path) {
                if p.exists() {
                    if let Err(e) = std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o600)) {
                        warn!(path = %p.display(), error = %e, "failed to set store file permissions");
                    }
                }
            }
        }
    }

    /// Inserts one transaction row. Reads the tracker's running max,
    /// inserts with key max+1, then advances the tracker with a
    /// compare-and-swap guard. Any failure aborts the whole unit.
    pub fn add_transaction(&mut self, tx: &Transaction) -> Result<(), StoreError> {
        let blob = tx.to_storage_bytes();
        let hash = tx.txid();

        let t = self.conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let max: i64 = t.query_row(
            "select max_pk from primary_keys where ent = ?1",
            [self.tx_ent],
            |r| r.get(0),
        )?;
        t.execute(
            "insert into tx_metadata (pk, ent, opt, record_type, blob, tx_hash)
             values (?1, ?2, 1, ?3, ?4, ?5)",
            params![max + 1, self.tx_ent, TX_RECORD_TYPE_LIVE, blob, hash.as_slice()],
        )?;
        let guarded = t.execute(
            "update primary_keys set max_pk = ?1 where ent = ?2 and max_pk = ?3",
            params![max + 1, self.tx_ent, max],
        )?;
        if guarded != 1 {
            // Nothing should be racing the queue thread; bail without
            // committing.
            return Err(StoreError::KeyConflict { ent: self.tx_ent });
        }
        t.commit()?;
        Ok(())
    }

    /// Batch-updates the confirmation footer for every live row whose
    /// hash is in `hashes`. A row count short of the hash count means
    /// transactions are about to silently vanish from history and is
    /// reported as [`StoreError::Integrity`].
    pub fn update_transactions(
        &mut self,
        hashes: &[[u8; 32]],
        block_height: u32,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        if hashes.is_empty() {
            return Ok(());
        }

        let stored_ts = epoch::rebase(timestamp);
        let mut footer = [0u8; STORAGE_FOOTER_BYTES];
        footer[..4].copy_from_slice(&block_height.to_le_bytes());
        footer[4..].copy_from_slice(&stored_ts.to_le_bytes());

        let t = self.conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let mut updated = 0usize;
        {
            let mut select = t.prepare(&format!(
                "select tx_hash, blob from tx_metadata where record_type = {TX_RECORD_TYPE_LIVE} \
                 and tx_hash in ({placeholders})"
            ))?;
            let mut update = t.prepare("update tx_metadata set blob = ?1 where tx_hash = ?2")?;

            let mut rows = select.query(params_from_iter(hashes.iter().map(|h| h.to_vec())))?;
            while let Some(row) = rows.next()? {
                let hash: Vec<u8> = row.get(0)?;
                let mut blob: Vec<u8> = row.get(1)?;
                // A blob with no room for a core region ahead of the
                // footer is corrupt; leaving it uncounted routes it
                // through the integrity check below.
                if blob.len() <= STORAGE_FOOTER_BYTES {
                    warn!(len = blob.len(), "transaction blob too short to carry a footer, not updated");
                    continue;
                }
                let at = blob.len() - STORAGE_FOOTER_BYTES;
                blob[at..].copy_from_slice(&footer);
                update.execute(params![blob, hash])?;
                updated += 1;
            }
        }
        t.commit()?;

        if updated != hashes.len() {
            error!(
                expected = hashes.len(),
                updated, "fewer tx records updated than hashes, transactions at risk of going missing"
            );
            return Err(StoreError::Integrity { expected: hashes.len(), updated });
        }
        Ok(())
    }

    /// Removes the row for `hash`. Missing rows are a no-op.
    pub fn delete_transaction(&mut self, hash: &[u8; 32]) -> Result<(), StoreError> {
        self.conn.execute(
            "delete from tx_metadata where record_type = ?1 and tx_hash = ?2",
            params![TX_RECORD_TYPE_LIVE, hash.as_slice()],
        )?;
        Ok(())
    }

    /// Bulk save. `replace` wipes the table first; otherwise rows
    /// append after the tracker's running max. Blocks with the unknown
    /// height sentinel or a timestamp that cannot be re-based are
    /// skipped without aborting the batch. The batch commits once;
    /// any insert failure rolls the whole thing back.
    pub fn save_blocks(&mut self, replace: bool, blocks: &[MerkleBlock]) -> Result<(), StoreError> {
        let t = self.conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let mut pk: i64 = if replace {
            t.execute("delete from merkle_blocks", [])?;
            0
        } else {
            t.query_row(
                "select max_pk from primary_keys where ent = ?1",
                [self.block_ent],
                |r| r.get(0),
            )?
        };

        {
            let mut insert = t.prepare(
                "insert into merkle_blocks (pk, ent, opt, height, nonce, target, total_tx, \
                 version, timestamp, block_hash, flags, hashes, merkle_root, prev_block) \
                 values (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;

            for b in blocks {
                let Some(stored_ts) = u32::try_from(b.timestamp)
                    .ok()
                    .and_then(epoch::checked_rebase_i32)
                else {
                    warn!(timestamp = b.timestamp, "skipped block with overflowed timestamp");
                    continue;
                };
                if b.height == BLOCK_UNKNOWN_HEIGHT {
                    warn!("skipped block with invalid height");
                    continue;
                }

                pk += 1;
                insert.execute(params![
                    pk,
                    self.block_ent,
                    b.height,
                    b.nonce,
                    b.target,
                    b.total_tx,
                    b.version,
                    stored_ts,
                    b.block_hash().as_slice(),
                    b.flags,
                    b.hashes_blob(),
                    b.merkle_root.as_slice(),
                    b.prev_block.as_slice(),
                ])?;
            }
        }

        t.execute(
            "update primary_keys set max_pk = ?1 where ent = ?2",
            params![pk, self.block_ent],
        )?;
        t.commit()?;
        Ok(())
    }

    /// Same replace/append and all-or-nothing semantics as
    /// [`save_blocks`]. Peer timestamps are plain Unix seconds; the
    /// misbehavior column is reserved and always written zero.
    pub fn save_peers(&mut self, replace: bool, peers: &[Peer]) -> Result<(), StoreError> {
        let t = self.conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let mut pk: i64 = if replace {
            t.execute("delete from peers", [])?;
            0
        } else {
            t.query_row(
                "select max_pk from primary_keys where ent = ?1",
                [self.peer_ent],
                |r| r.get(0),
            )?
        };

        {
            let mut insert = t.prepare(
                "insert into peers (pk, ent, opt, address, misbehaving, port, services, timestamp) \
                 values (?1, ?2, 1, ?3, 0, ?4, ?5, ?6)",
            )?;
            for p in peers {
                pk += 1;
                insert.execute(params![
                    pk,
                    self.peer_ent,
                    p.address,
                    p.port,
                    p.services as i64,
                    p.timestamp as i64,
                ])?;
            }
        }

        t.execute(
            "update primary_keys set max_pk = ?1 where ent = ?2",
            params![pk, self.peer_ent],
        )?;
        t.commit()?;
        Ok(())
    }

    /// Loads every live transaction row, re-applying the stored footer.
    /// Blobs shorter than the footer end the scan (the store is not
    /// trustworthy past that point); blobs whose core region fails to
    /// parse are skipped and flagged for a rescan.
    pub fn load_transactions(&self) -> Result<LoadedTransactions, StoreError> {
        let mut out = LoadedTransactions::default();
        let mut stmt = self
            .conn
            .prepare("select blob from tx_metadata where record_type = ?1")?;
        let mut rows = stmt.query([TX_RECORD_TYPE_LIVE])?;

        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(0)?;
            if blob.len() < STORAGE_FOOTER_BYTES {
                warn!(len = blob.len(), "transaction blob shorter than footer, aborting scan");
                break;
            }
            match Transaction::from_storage_bytes(&blob) {
                Ok(tx) => out.transactions.push(tx),
                Err(e) => {
                    // Unable to parse a stored tx: drop the row and let
                    // the wallet rescan from before its earliest key use.
                    warn!(error = %e, "failed to parse transaction from store");
                    out.rescan_recommended = true;
                }
            }
        }
        Ok(out)
    }

    /// Loads all block rows, skipping invalid heights and overflowed
    /// timestamps with the same conditions the save path applies.
    pub fn load_blocks(&self) -> Result<Vec<MerkleBlock>, StoreError> {
        let mut blocks = Vec::new();
        let mut stmt = self.conn.prepare(
            "select height, nonce, target, total_tx, version, timestamp, block_hash, \
             flags, hashes, merkle_root, prev_block from merkle_blocks",
        )?;
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            let mut b = MerkleBlock::new();
            b.height = row.get::<_, i64>(0)? as u32;
            if b.height == BLOCK_UNKNOWN_HEIGHT {
                warn!("skipped block row with invalid height");
                continue;
            }
            b.nonce = row.get::<_, i64>(1)? as u32;
            b.target = row.get::<_, i64>(2)? as u32;
            b.total_tx = row.get::<_, i64>(3)? as u32;
            b.version = row.get::<_, i64>(4)? as u32;
            let stored_ts = row.get::<_, i64>(5)? as i32;
            let Some(ts) = epoch::checked_unrebase_i32(stored_ts) else {
                warn!(stored = stored_ts, "skipped block row with overflowed timestamp");
                continue;
            };
            b.timestamp = u64::from(ts);

            let block_hash: Vec<u8> = row.get(6)?;
            let flags: Vec<u8> = row.get(7)?;
            let hashes_blob: Vec<u8> = row.get(8)?;
            let merkle_root: Vec<u8> = row.get(9)?;
            let prev_block: Vec<u8> = row.get(10)?;
            if block_hash.len() != 32 || merkle_root.len() != 32 || prev_block.len() != 32 {
                warn!("skipped block row with malformed hash column");
                continue;
            }
            let hashes = match MerkleBlock::hashes_from_blob(&hashes_blob) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "skipped block row with malformed merkle proof");
                    continue;
                }
            };
            b.set_merkle_proof(hashes, flags);
            b.merkle_root.copy_from_slice(&merkle_root);
            b.prev_block.copy_from_slice(&prev_block);
            blocks.push(b);
        }
        Ok(blocks)
    }

    /// Loads all peer rows, restoring the IPv6-mapped address form and
    /// skipping rows whose timestamp does not map back onto Unix time.
    pub fn load_peers(&self) -> Result<Vec<Peer>, StoreError> {
        let mut peers = Vec::new();
        let mut stmt = self
            .conn
            .prepare("select address, port, services, timestamp from peers")?;
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            let address = row.get::<_, i64>(0)? as u32;
            let port = row.get::<_, i64>(1)? as u16;
            let services = row.get::<_, i64>(2)? as u64;
            let ts: i64 = row.get(3)?;
            let Ok(timestamp) = u64::try_from(ts) else {
                warn!(stored = ts, "skipped peer row with overflowed timestamp");
                continue;
            };
            peers.push(Peer { address, port, services, timestamp });
        }
        Ok(peers)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
