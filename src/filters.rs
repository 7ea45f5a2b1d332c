//! Filter implementations.

pub mod fletcher32;
pub mod shuffle;

use crate::compression;
use crate::error::FilterError;
use crate::models::FilterKind;

use bytes::Bytes;

/// Decodes some bytes using the specified filter and returns the result.
///
/// # Arguments
///
/// * `filter`: Filter kind
/// * `data`: Filtered data [Bytes]
/// * `element_size`: Size of each element in bytes, needed by the shuffle filter
/// * `size_hint`: Expected size of the decoded data, used to size buffers
pub fn decode(
    filter: &FilterKind,
    data: &Bytes,
    element_size: usize,
    size_hint: usize,
) -> Result<Bytes, FilterError> {
    match filter {
        FilterKind::Deflate { .. } => compression::inflate(data, size_hint),
        FilterKind::Shuffle if element_size == 0 => Err(FilterError::ZeroElementSize),
        FilterKind::Shuffle => Ok(shuffle::deshuffle(data, element_size)),
        FilterKind::Fletcher32 => fletcher32::verify(data),
        FilterKind::Other { code, name } => Err(FilterError::Unsupported {
            id: *code,
            name: name.clone(),
        }),
    }
}

/// Encodes some bytes using the specified filter and returns the result.
///
/// # Arguments
///
/// * `filter`: Filter kind
/// * `data`: Data to filter
/// * `element_size`: Size of each element in bytes, needed by the shuffle filter
pub fn encode(filter: &FilterKind, data: &Bytes, element_size: usize) -> Result<Bytes, FilterError> {
    match filter {
        FilterKind::Deflate { level } => {
            compression::deflate(data, level.unwrap_or(compression::DEFAULT_LEVEL))
        }
        FilterKind::Shuffle if element_size == 0 => Err(FilterError::ZeroElementSize),
        FilterKind::Shuffle => Ok(shuffle::shuffle(data, element_size)),
        FilterKind::Fletcher32 => Ok(fletcher32::append(data)),
        FilterKind::Other { code, name } => Err(FilterError::Unsupported {
            id: *code,
            name: name.clone(),
        }),
    }
}
