//! Deflate (zlib) support.

use crate::error::FilterError;

use bytes::Bytes;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;
use zune_inflate::{DeflateDecoder, DeflateOptions};

/// Default zlib level when a deflate filter does not record one.
pub const DEFAULT_LEVEL: u32 = 6;

/// Inflates a zlib stream and returns the uncompressed data.
///
/// zune-inflate does the work. Streams it rejects are retried with flate2, which tolerates
/// trailing bytes after the end of the stream.
///
/// # Arguments
///
/// * `data`: Compressed data
/// * `size_hint`: Expected uncompressed size in bytes
pub fn inflate(data: &Bytes, size_hint: usize) -> Result<Bytes, FilterError> {
    let options = DeflateOptions::default().set_size_hint(size_hint);
    let mut decoder = DeflateDecoder::new_with_options(data, options);
    match decoder.decode_zlib() {
        Ok(inflated) => Ok(inflated.into()),
        Err(zune_err) => {
            tracing::debug!("zune-inflate failed ({:?}), retrying with flate2", zune_err.error);
            let mut decoder = ZlibDecoder::new(&data[..]);
            // Decode into an 8-byte aligned buffer so the result may be viewed as wider types.
            let mut buf = maligned::align_first::<u8, maligned::A8>(size_hint);
            match decoder.read_to_end(&mut buf) {
                Ok(_) => Ok(buf.into()),
                Err(_) => Err(FilterError::Inflate(zune_err)),
            }
        }
    }
}

/// Deflates some data into a zlib stream.
///
/// # Arguments
///
/// * `data`: Uncompressed data
/// * `level`: zlib compression level, 0-9
pub fn deflate(data: &Bytes, level: u32) -> Result<Bytes, FilterError> {
    let mut result = Vec::<u8>::new();
    let mut encoder = ZlibEncoder::new(&data[..], Compression::new(level.min(9)));
    encoder
        .read_to_end(&mut result)
        .map_err(FilterError::Deflate)?;
    Ok(result.into())
}
