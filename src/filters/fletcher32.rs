//! Fletcher32 checksum filter
//!
//! The checksum is the HDF5 variant: 16-bit big-endian words summed in blocks of 360 words,
//! stored little-endian in four bytes appended to the data.

use crate::error::FilterError;

use bytes::{BufMut, Bytes, BytesMut};

/// Number of words summed before the running sums are folded.
const BLOCK_WORDS: usize = 360;

/// Fold a running sum back into 16 bits plus carry.
fn fold(sum: u32) -> u32 {
    (sum & 0xffff) + (sum >> 16)
}

/// Compute the fletcher32 checksum of some data.
///
/// # Arguments
///
/// * `data`: Data to checksum, excluding any stored checksum
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut words = data.chunks_exact(2);
    let mut remaining = data.len() / 2;
    while remaining > 0 {
        let block = remaining.min(BLOCK_WORDS);
        remaining -= block;
        for word in words.by_ref().take(block) {
            sum1 += u32::from(u16::from_be_bytes([word[0], word[1]]));
            sum2 += sum1;
        }
        sum1 = fold(sum1);
        sum2 = fold(sum2);
    }
    if let [last] = words.remainder() {
        sum1 += u32::from(*last) << 8;
        sum2 += sum1;
        sum1 = fold(sum1);
        sum2 = fold(sum2);
    }
    sum1 = fold(sum1);
    sum2 = fold(sum2);
    (sum2 << 16) | sum1
}

/// Checksum as written by library versions that stored the halves byte-swapped.
fn legacy_order(checksum: u32) -> u32 {
    ((checksum & 0x00ff_00ff) << 8) | ((checksum & 0xff00_ff00) >> 8)
}

/// Verify the trailing checksum and return the data without it.
///
/// A mismatch is an error, never a silent pass.
///
/// # Arguments
///
/// * `data`: Data followed by its 4-byte checksum
pub fn verify(data: &Bytes) -> Result<Bytes, FilterError> {
    if data.len() < 4 {
        return Err(FilterError::MissingChecksum { length: data.len() });
    }
    let split = data.len() - 4;
    let stored = u32::from_le_bytes([data[split], data[split + 1], data[split + 2], data[split + 3]]);
    let computed = checksum(&data[..split]);
    if stored != computed && stored != legacy_order(computed) {
        return Err(FilterError::ChecksumMismatch { stored, computed });
    }
    Ok(data.slice(..split))
}

/// Append the checksum of some data.
///
/// # Arguments
///
/// * `data`: Data to checksum
pub fn append(data: &Bytes) -> Bytes {
    let mut result = BytesMut::with_capacity(data.len() + 4);
    result.put_slice(data);
    result.put_u32_le(checksum(data));
    result.freeze()
}
