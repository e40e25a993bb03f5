pub mod block;
pub mod peer;
pub mod transaction;

/// Errors from the binary transaction/block codecs. Every variant means
/// "this blob is not usable"; the caller's policy is to skip the record
/// and, for transactions, flag the wallet for a rescan.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input: need {need} bytes at offset {offset}, have {have}")]
    Truncated { offset: usize, need: usize, have: usize },
    #[error("trailing bytes after {parsed}-byte record ({len} total)")]
    TrailingBytes { parsed: usize, len: usize },
    #[error("unreasonable element count {count} at offset {offset}")]
    OversizedCount { offset: usize, count: u64 },
    #[error("storage blob shorter than the {0}-byte footer")]
    MissingFooter(usize),
}

// Sanity bound on varint-encoded element counts. A merkle proof or tx
// list claiming more entries than this is malformed, not merely large.
pub(crate) const MAX_ELEMENT_COUNT: u64 = 1 << 20;

/// Reads a Bitcoin compact-size varint, returning (value, bytes consumed).
pub(crate) fn read_compact_size(d: &[u8], off: usize) -> Result<(u64, usize), CodecError> {
    let need = |n: usize| -> Result<(), CodecError> {
        if d.len() < off + n {
            Err(CodecError::Truncated { offset: off, need: n, have: d.len().saturating_sub(off) })
        } else {
            Ok(())
        }
    };
    need(1)?;
    match d[off] {
        0xfd => {
            need(3)?;
            Ok((u64::from(u16::from_le_bytes([d[off + 1], d[off + 2]])), 3))
        }
        0xfe => {
            need(5)?;
            let mut b = [0u8; 4];
            b.copy_from_slice(&d[off + 1..off + 5]);
            Ok((u64::from(u32::from_le_bytes(b)), 5))
        }
        0xff => {
            need(9)?;
            let mut b = [0u8; 8];
            b.copy_from_slice(&d[off + 1..off + 9]);
            Ok((u64::from_le_bytes(b), 9))
        }
        n => Ok((u64::from(n), 1)),
    }
}

/// Appends a compact-size varint.
pub(crate) fn write_compact_size(out: &mut Vec<u8>, v: u64) {
    match v {
        0..=0xfc => out.push(v as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(v as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(v as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}
