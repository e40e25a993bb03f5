// Data Structures: Merkle Block
//
// A block header plus the partial merkle tree (flag bytes + tx hash
// list) proving which transactions the header commits to. Blocks are
// owned values: "copy before crossing a thread boundary" is a Clone,
// release is a Drop.
use serde::{Deserialize, Serialize};

use super::{read_compact_size, write_compact_size, CodecError, MAX_ELEMENT_COUNT};
use crate::crypto::hash::sha256d;

/// Sentinel height for a block whose position in the chain is unknown.
/// Rows carrying it are skipped on both save and load.
pub const BLOCK_UNKNOWN_HEIGHT: u32 = 0xFFFF_FFFF;

/// Serialized header size (without the merkle proof).
pub const BLOCK_HEADER_BYTES: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleBlock {
    pub version: u32,
    pub prev_block: [u8; 32],
    pub merkle_root: [u8; 32],
    /// Unix seconds.
    pub timestamp: u64,
    pub target: u32,
    pub nonce: u32,
    pub total_tx: u32,
    pub height: u32,

    // Partial merkle tree. Flag bytes and hash list vary in length
    // independently; hash count = hashes.len(), byte length = 32 * count.
    pub hashes: Vec<[u8; 32]>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    /// A zeroed block, filled in field by field by the load path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the partial merkle proof. Does not verify it against
    /// the merkle root; proof verification is a peer-protocol concern.
    pub fn set_merkle_proof(&mut self, hashes: Vec<[u8; 32]>, flags: Vec<u8>) {
        self.hashes = hashes;
        self.flags = flags;
    }

    /// Flag bytes and hash list as contiguous blobs, the form the
    /// store persists.
    pub fn hashes_blob(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.hashes.len() * 32);
        for h in &self.hashes {
            b.extend_from_slice(h);
        }
        b
    }

    /// Rebuilds the hash list from a stored blob. Length must be a
    /// multiple of 32.
    pub fn hashes_from_blob(blob: &[u8]) -> Result<Vec<[u8; 32]>, CodecError> {
        if blob.len() % 32 != 0 {
            return Err(CodecError::Truncated {
                offset: blob.len() - blob.len() % 32,
                need: 32,
                have: blob.len() % 32,
            });
        }
        Ok(blob
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                h
            })
            .collect())
    }

    fn header_bytes(&self) -> [u8; BLOCK_HEADER_BYTES] {
        let mut b = [0u8; BLOCK_HEADER_BYTES];
        b[0..4].copy_from_slice(&self.version.to_le_bytes());
        b[4..36].copy_from_slice(&self.prev_block);
        b[36..68].copy_from_slice(&self.merkle_root);
        b[68..72].copy_from_slice(&(self.timestamp as u32).to_le_bytes());
        b[72..76].copy_from_slice(&self.target.to_le_bytes());
        b[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        b
    }

    /// Block hash: double SHA-256 of the 80-byte header.
    pub fn block_hash(&self) -> [u8; 32] {
        sha256d(&self.header_bytes())
    }

    /// Serializes header, total tx count, hash list, and flag bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(BLOCK_HEADER_BYTES + 8 + self.hashes.len() * 32 + self.flags.len());
        b.extend_from_slice(&self.header_bytes());
        b.extend_from_slice(&self.total_tx.to_le_bytes());
        write_compact_size(&mut b, self.hashes.len() as u64);
        for h in &self.hashes {
            b.extend_from_slice(h);
        }
        write_compact_size(&mut b, self.flags.len() as u64);
        b.extend_from_slice(&self.flags);
        b.extend_from_slice(&self.height.to_le_bytes());
        b
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, CodecError> {
        let need = |off: usize, n: usize| -> Result<(), CodecError> {
            if d.len() < off + n {
                Err(CodecError::Truncated { offset: off, need: n, have: d.len().saturating_sub(off) })
            } else {
                Ok(())
            }
        };

        need(0, BLOCK_HEADER_BYTES + 4)?;
        let version = u32::from_le_bytes(d[0..4].try_into().unwrap());
        let mut prev_block = [0u8; 32];
        prev_block.copy_from_slice(&d[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&d[36..68]);
        let timestamp = u64::from(u32::from_le_bytes(d[68..72].try_into().unwrap()));
        let target = u32::from_le_bytes(d[72..76].try_into().unwrap());
        let nonce = u32::from_le_bytes(d[76..80].try_into().unwrap());
        let total_tx = u32::from_le_bytes(d[80..84].try_into().unwrap());
        let mut off = 84usize;

        let (hash_count, n) = read_compact_size(d, off)?;
        off += n;
        if hash_count > MAX_ELEMENT_COUNT {
            return Err(CodecError::OversizedCount { offset: off, count: hash_count });
        }
        let mut hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            need(off, 32)?;
            let mut h = [0u8; 32];
            h.copy_from_slice(&d[off..off + 32]);
            off += 32;
            hashes.push(h);
        }

        let (flags_len, n) = read_compact_size(d, off)?;
        off += n;
        if flags_len > MAX_ELEMENT_COUNT {
            return Err(CodecError::OversizedCount { offset: off, count: flags_len });
        }
        need(off, flags_len as usize)?;
        let flags = d[off..off + flags_len as usize].to_vec();
        off += flags_len as usize;

        need(off, 4)?;
        let height = u32::from_le_bytes(d[off..off + 4].try_into().unwrap());
        off += 4;

        if off != d.len() {
            return Err(CodecError::TrailingBytes { parsed: off, len: d.len() });
        }

        Ok(MerkleBlock {
            version,
            prev_block,
            merkle_root,
            timestamp,
            target,
            nonce,
            total_tx,
            height,
            hashes,
            flags,
        })
    }
}
