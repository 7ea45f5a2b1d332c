//! Filter pipeline.
//!
//! Chunk filters are recorded in the order they were applied on write. Decoding runs them in
//! reverse, so a chunk written with `[shuffle, deflate]` is inflated and then de-shuffled.

use crate::error::FilterError;
use crate::filters;
use crate::models::FilterKind;

use bytes::Bytes;

/// Returns the decoded bytes of a chunk.
///
/// The decoded length must equal `expected_decoded_length`; a mismatch is an error.
///
/// # Arguments
///
/// * `raw`: Chunk bytes as stored
/// * `filters`: Filters in write order
/// * `element_size`: Size of each element in bytes
/// * `expected_decoded_length`: Length of the chunk once decoded
#[tracing::instrument(level = "DEBUG", skip(raw, filters))]
pub fn decode(
    raw: Bytes,
    filters: &[FilterKind],
    element_size: usize,
    expected_decoded_length: usize,
) -> Result<Bytes, FilterError> {
    let decoded = filters.iter().rev().try_fold(raw, |data, filter| {
        filters::decode(filter, &data, element_size, expected_decoded_length)
    })?;
    if decoded.len() != expected_decoded_length {
        return Err(FilterError::LengthMismatch {
            expected: expected_decoded_length,
            actual: decoded.len(),
        });
    }
    Ok(decoded)
}

/// Returns chunk bytes as they would be stored after applying filters in write order.
///
/// # Arguments
///
/// * `data`: Decoded chunk bytes
/// * `filters`: Filters in write order
/// * `element_size`: Size of each element in bytes
pub fn encode(
    data: Bytes,
    filters: &[FilterKind],
    element_size: usize,
) -> Result<Bytes, FilterError> {
    filters
        .iter()
        .try_fold(data, |data, filter| filters::encode(filter, &data, element_size))
}
