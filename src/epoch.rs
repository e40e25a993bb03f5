// Timestamp re-basing between the Unix epoch and the legacy storage
// epoch (2001-01-01). On-disk timestamps are offsets from the storage
// epoch; everything in memory is Unix seconds. Mixing the two bases
// corrupts displayed dates, so every read path must undo exactly what
// the write path applied.

/// Seconds from 1970-01-01 to 2001-01-01.
pub const REFERENCE_EPOCH: u64 = 978_307_200;

/// Unix seconds to stored offset. Timestamps at or before the reference
/// epoch collapse to 0, which readers treat as "no timestamp".
pub fn rebase(unix: u64) -> u32 {
    if unix > REFERENCE_EPOCH {
        u32::try_from(unix - REFERENCE_EPOCH).unwrap_or(u32::MAX)
    } else {
        0
    }
}

/// Stored offset back to Unix seconds. 0 stays 0 ("no timestamp").
pub fn unrebase(stored: u32) -> u64 {
    if stored == 0 { 0 } else { u64::from(stored) + REFERENCE_EPOCH }
}

/// Signed-32-bit re-base used on the block save path. Block timestamps
/// live in an i32 column; a value that cannot be represented after
/// subtracting the reference epoch means the record must be skipped.
pub fn checked_rebase_i32(unix: u32) -> Option<i32> {
    (unix as i32).checked_sub(REFERENCE_EPOCH as i32)
}

/// Inverse of [`checked_rebase_i32`], used on the block load path.
/// `None` means the stored value would overflow back into u32.
pub fn checked_unrebase_i32(stored: i32) -> Option<u32> {
    (stored as u32).checked_add(REFERENCE_EPOCH as u32)
}
