// Data Structures: Transaction
//
// Two serialized forms, which must never be confused:
//   wire form    - what goes to the network: version, inputs, outputs,
//                  lock time, compact-size counts, little-endian scalars
//   storage form - wire form plus an 8-byte footer: block height (LE
//                  u32) and the re-based confirmation timestamp (LE u32)
use serde::{Deserialize, Serialize};

use super::{read_compact_size, write_compact_size, CodecError, MAX_ELEMENT_COUNT};
use crate::crypto::hash::sha256d;
use crate::epoch;

/// Block height recorded on a transaction that has not confirmed.
pub const UNCONFIRMED_HEIGHT: u32 = 0xFFFF_FFFF;

/// Size of the storage footer: height (4) + re-based timestamp (4).
pub const STORAGE_FOOTER_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,

    // Confirmation metadata. Not part of the wire form; carried in the
    // storage footer and kept here so the loaded wallet sees it.
    pub block_height: u32,
    /// Unix seconds; 0 means no timestamp.
    pub timestamp: u64,
}

impl Transaction {
    /// Network serialization: no footer. Deterministic for equal
    /// logical transactions.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(64);
        b.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut b, self.inputs.len() as u64);
        for input in &self.inputs {
            b.extend_from_slice(&input.prev_hash);
            b.extend_from_slice(&input.prev_index.to_le_bytes());
            write_compact_size(&mut b, input.script_sig.len() as u64);
            b.extend_from_slice(&input.script_sig);
            b.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut b, self.outputs.len() as u64);
        for output in &self.outputs {
            b.extend_from_slice(&output.value.to_le_bytes());
            write_compact_size(&mut b, output.script_pubkey.len() as u64);
            b.extend_from_slice(&output.script_pubkey);
        }
        b.extend_from_slice(&self.lock_time.to_le_bytes());
        b
    }

    /// Storage serialization: wire form plus the height/timestamp footer.
    pub fn to_storage_bytes(&self) -> Vec<u8> {
        let mut b = self.to_wire_bytes();
        b.extend_from_slice(&self.block_height.to_le_bytes());
        b.extend_from_slice(&epoch::rebase(self.timestamp).to_le_bytes());
        b
    }

    /// Parses one transaction starting at the beginning of `d`,
    /// returning it with the number of bytes consumed. Confirmation
    /// metadata comes back as unconfirmed/none.
    pub fn read_wire(d: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut off = 0usize;

        let need = |off: usize, n: usize| -> Result<(), CodecError> {
            if d.len() < off + n {
                Err(CodecError::Truncated { offset: off, need: n, have: d.len().saturating_sub(off) })
            } else {
                Ok(())
            }
        };

        need(off, 4)?;
        let version = u32::from_le_bytes(d[off..off + 4].try_into().unwrap());
        off += 4;

        let (in_count, n) = read_compact_size(d, off)?;
        off += n;
        if in_count > MAX_ELEMENT_COUNT {
            return Err(CodecError::OversizedCount { offset: off, count: in_count });
        }

        let mut inputs = Vec::with_capacity(in_count as usize);
        for _ in 0..in_count {
            need(off, 36)?;
            let mut prev_hash = [0u8; 32];
            prev_hash.copy_from_slice(&d[off..off + 32]);
            off += 32;
            let prev_index = u32::from_le_bytes(d[off..off + 4].try_into().unwrap());
            off += 4;

            let (script_len, n) = read_compact_size(d, off)?;
            off += n;
            if script_len > MAX_ELEMENT_COUNT {
                return Err(CodecError::OversizedCount { offset: off, count: script_len });
            }
            need(off, script_len as usize + 4)?;
            let script_sig = d[off..off + script_len as usize].to_vec();
            off += script_len as usize;
            let sequence = u32::from_le_bytes(d[off..off + 4].try_into().unwrap());
            off += 4;

            inputs.push(TxInput { prev_hash, prev_index, script_sig, sequence });
        }

        let (out_count, n) = read_compact_size(d, off)?;
        off += n;
        if out_count > MAX_ELEMENT_COUNT {
            return Err(CodecError::OversizedCount { offset: off, count: out_count });
        }

        let mut outputs = Vec::with_capacity(out_count as usize);
        for _ in 0..out_count {
            need(off, 8)?;
            let value = u64::from_le_bytes(d[off..off + 8].try_into().unwrap());
            off += 8;

            let (script_len, n) = read_compact_size(d, off)?;
            off += n;
            if script_len > MAX_ELEMENT_COUNT {
                return Err(CodecError::OversizedCount { offset: off, count: script_len });
            }
            need(off, script_len as usize)?;
            let script_pubkey = d[off..off + script_len as usize].to_vec();
            off += script_len as usize;

            outputs.push(TxOutput { value, script_pubkey });
        }

        need(off, 4)?;
        let lock_time = u32::from_le_bytes(d[off..off + 4].try_into().unwrap());
        off += 4;

        Ok((
            Transaction {
                version,
                inputs,
                outputs,
                lock_time,
                block_height: UNCONFIRMED_HEIGHT,
                timestamp: 0,
            },
            off,
        ))
    }

    /// Parses a wire-form transaction, requiring the whole slice to be
    /// consumed.
    pub fn from_wire_bytes(d: &[u8]) -> Result<Self, CodecError> {
        let (tx, n) = Self::read_wire(d)?;
        if n != d.len() {
            return Err(CodecError::TrailingBytes { parsed: n, len: d.len() });
        }
        Ok(tx)
    }

    /// Parses a storage blob: the wire form occupies everything before
    /// the footer, then the footer fields are re-applied with the
    /// timestamp converted back to Unix seconds.
    pub fn from_storage_bytes(d: &[u8]) -> Result<Self, CodecError> {
        if d.len() < STORAGE_FOOTER_BYTES {
            return Err(CodecError::MissingFooter(STORAGE_FOOTER_BYTES));
        }
        let core = d.len() - STORAGE_FOOTER_BYTES;
        let mut tx = Self::from_wire_bytes(&d[..core])?;
        tx.block_height = u32::from_le_bytes(d[core..core + 4].try_into().unwrap());
        let stored = u32::from_le_bytes(d[core + 4..core + 8].try_into().unwrap());
        tx.timestamp = epoch::unrebase(stored);
        Ok(tx)
    }

    /// Transaction id: double SHA-256 of the wire form.
    pub fn txid(&self) -> [u8; 32] {
        sha256d(&self.to_wire_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn mock_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: [0x11; 32],
                prev_index: 0,
                script_sig: vec![0x76, 0xa9, 0x14],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![
                TxOutput { value: 50_000, script_pubkey: vec![0xac, 0x88] },
                TxOutput { value: 12_345, script_pubkey: vec![] },
            ],
            lock_time: 0,
            block_height: UNCONFIRMED_HEIGHT,
            timestamp: 0,
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let tx = mock_tx();
        let bytes = tx.to_wire_bytes();
        let decoded = Transaction::from_wire_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_storage_roundtrip_confirmed() {
        let mut tx = mock_tx();
        tx.block_height = 500_000;
        tx.timestamp = 1_700_000_000;
        let decoded = Transaction::from_storage_bytes(&tx.to_storage_bytes()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_storage_roundtrip_unconfirmed() {
        let tx = mock_tx();
        let decoded = Transaction::from_storage_bytes(&tx.to_storage_bytes()).unwrap();
        assert_eq!(decoded.block_height, UNCONFIRMED_HEIGHT);
        assert_eq!(decoded.timestamp, 0);
    }

    #[test]
    fn test_wire_form_has_no_footer() {
        let mut tx = mock_tx();
        tx.block_height = 123;
        tx.timestamp = 1_700_000_000;
        let wire = tx.to_wire_bytes();
        let storage = tx.to_storage_bytes();
        assert_eq!(storage.len(), wire.len() + STORAGE_FOOTER_BYTES);
        assert_eq!(&storage[..wire.len()], &wire[..]);
    }

    #[test]
    fn test_txid_independent_of_confirmation() {
        let mut a = mock_tx();
        let mut b = mock_tx();
        a.block_height = 1;
        a.timestamp = 1_600_000_000;
        b.block_height = 99;
        b.timestamp = 1_700_000_000;
        assert_eq!(a.txid(), b.txid());
    }

    #[test]
    fn test_truncated_input_fails_cleanly() {
        let bytes = mock_tx().to_wire_bytes();
        for cut in [0, 1, 4, 5, bytes.len() - 1] {
            assert!(Transaction::from_wire_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = mock_tx().to_wire_bytes();
        bytes.push(0);
        assert!(matches!(
            Transaction::from_wire_bytes(&bytes),
            Err(CodecError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn test_oversized_count_rejected() {
        // version + absurd input count
        let mut bytes = 1u32.to_le_bytes().to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            Transaction::from_wire_bytes(&bytes),
            Err(CodecError::OversizedCount { .. })
        ));
    }

    #[test]
    fn test_storage_blob_shorter_than_footer() {
        assert!(matches!(
            Transaction::from_storage_bytes(&[0u8; 7]),
            Err(CodecError::MissingFooter(_))
        ));
    }
}
