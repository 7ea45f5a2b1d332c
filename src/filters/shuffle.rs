//! Byte shuffle filter

use bytes::Bytes;

/// Returns a zeroed, 8-byte aligned buffer of `len` bytes.
fn aligned_buffer(len: usize) -> Vec<u8> {
    let mut buf = maligned::align_first::<u8, maligned::A8>(len);
    buf.resize(len, 0);
    buf
}

/// Decode the byte shuffle filter.
///
/// The byte shuffle filter encodes data by reordering bytes with the aim of improving compression
/// ratio. For an array of N elements where each element is M bytes, the filter writes the 0th byte
/// of each element first, followed by the 1st byte of each element, and so on. This function
/// inverts the shuffle filter.
///
/// Bytes beyond the last whole element are not shuffled on write and are copied through.
///
/// # Arguments
///
/// * `data`: `Bytes` to deshuffle.
/// * `element_size`: Size of each element in bytes.
pub fn deshuffle(data: &Bytes, element_size: usize) -> Bytes {
    let num_elements = data.len() / element_size.max(1);
    if element_size < 2 || num_elements < 2 {
        return data.clone();
    }
    let body = num_elements * element_size;
    let mut result = aligned_buffer(data.len());
    // Walk the output element by element so that writes are sequential.
    for (element, out) in result[..body].chunks_exact_mut(element_size).enumerate() {
        let mut src_index = element;
        for byte in out.iter_mut() {
            *byte = data[src_index];
            src_index += num_elements;
        }
    }
    result[body..].copy_from_slice(&data[body..]);
    result.into()
}

/// Apply the byte shuffle filter.
///
/// # Arguments
///
/// * `data`: `Bytes` to shuffle.
/// * `element_size`: Size of each element in bytes.
pub fn shuffle(data: &Bytes, element_size: usize) -> Bytes {
    let num_elements = data.len() / element_size.max(1);
    if element_size < 2 || num_elements < 2 {
        return data.clone();
    }
    let body = num_elements * element_size;
    let mut result = aligned_buffer(data.len());
    for (element, src) in data[..body].chunks_exact(element_size).enumerate() {
        let mut dest_index = element;
        for byte in src {
            result[dest_index] = *byte;
            dest_index += num_elements;
        }
    }
    result[body..].copy_from_slice(&data[body..]);
    result.into()
}
