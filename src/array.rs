//! Functions and utilities for working with [ndarray] objects.
//!
//! Variable data is handled as bytes. A buffer of `n` elements of `element_size` bytes is viewed
//! as a `u8` array whose last axis holds the bytes of one element, so that element selection and
//! byte reversal are both plain slicing.

use crate::error::DmrppError;

use bytes::Bytes;
use ndarray::prelude::*;
use ndarray::{SliceInfo, SliceInfoElem};

/// Convert from Bytes to `&[T]`.
///
/// Zerocopy provides a mechanism for converting between types.
/// Correct alignment of the data is necessary.
///
/// # Arguments
///
/// * `data`: Bytes containing data to convert.
pub fn from_bytes<T: zerocopy::FromBytes>(data: &Bytes) -> Result<&[T], DmrppError> {
    let layout = zerocopy::LayoutVerified::<_, [T]>::new_slice(&data[..]).ok_or(
        DmrppError::FromBytes {
            type_name: std::any::type_name::<T>(),
        },
    )?;
    Ok(layout.into_slice())
}

/// Returns a zeroed, 8-byte aligned buffer of `len` bytes.
///
/// The alignment allows the finished buffer to be viewed as any numeric element type.
pub fn aligned_buffer(len: usize) -> Vec<u8> {
    let mut buf = maligned::align_first::<u8, maligned::A8>(len);
    buf.resize(len, 0);
    buf
}

/// Returns the shape of the byte view of an array: its shape plus a trailing element axis.
fn byte_shape(shape: &[usize], element_size: usize) -> Vec<usize> {
    shape
        .iter()
        .copied()
        .chain(std::iter::once(element_size))
        .collect()
}

/// Returns an [ndarray::ArrayView] of some element bytes.
///
/// # Arguments
///
/// * `data`: Element bytes in C order
/// * `shape`: Array shape in elements
/// * `element_size`: Size of each element in bytes
pub fn byte_view<'a>(
    data: &'a [u8],
    shape: &[usize],
    element_size: usize,
) -> Result<ArrayViewD<'a, u8>, DmrppError> {
    Ok(ArrayViewD::from_shape(byte_shape(shape, element_size), data)?)
}

/// Returns an [ndarray::ArrayViewMut] of some element bytes.
///
/// # Arguments
///
/// * `data`: Element bytes in C order
/// * `shape`: Array shape in elements
/// * `element_size`: Size of each element in bytes
pub fn byte_view_mut<'a>(
    data: &'a mut [u8],
    shape: &[usize],
    element_size: usize,
) -> Result<ArrayViewMutD<'a, u8>, DmrppError> {
    Ok(ArrayViewMutD::from_shape(
        byte_shape(shape, element_size),
        data,
    )?)
}

/// One axis of a strided element range: `start`, `start + step`, ... up to `end` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisRange {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl AxisRange {
    /// Returns a range covering `start..end` with a step of one.
    pub fn dense(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            step: 1,
        }
    }

    fn to_slice_elem(self) -> Result<SliceInfoElem, DmrppError> {
        Ok(SliceInfoElem::Slice {
            start: self.start.try_into()?,
            end: Some(self.end.try_into()?),
            step: self.step.try_into()?,
        })
    }
}

/// Returns an [ndarray] SliceInfo selecting element ranges from a byte view.
///
/// With `reverse_bytes`, the element axis is walked backwards, which reverses the bytes of every
/// selected element.
fn build_slice_info(
    ranges: &[AxisRange],
    reverse_bytes: bool,
) -> Result<SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn>, DmrppError> {
    let mut elems = ranges
        .iter()
        .map(|range| range.to_slice_elem())
        .collect::<Result<Vec<_>, _>>()?;
    elems.push(SliceInfoElem::Slice {
        start: 0,
        end: None,
        step: if reverse_bytes { -1 } else { 1 },
    });
    // An IxDyn input and output never fails the dimensionality check.
    SliceInfo::try_from(elems).map_err(DmrppError::ShapeInvalid)
}

/// Copies a strided region of one byte view into a region of another.
///
/// Both regions must select the same number of elements along each axis. When both regions are
/// contiguous and no byte reversal is needed this is a single block copy; otherwise elements are
/// scattered one at a time.
///
/// # Arguments
///
/// * `dest`: Destination byte view
/// * `dest_ranges`: Region of `dest` to write
/// * `src`: Source byte view
/// * `src_ranges`: Region of `src` to read
/// * `reverse_bytes`: Whether to reverse the bytes of each element
pub fn copy_region(
    dest: &mut ArrayViewMutD<u8>,
    dest_ranges: &[AxisRange],
    src: &ArrayViewD<u8>,
    src_ranges: &[AxisRange],
    reverse_bytes: bool,
) -> Result<(), DmrppError> {
    let src_info = build_slice_info(src_ranges, reverse_bytes)?;
    let dest_info = build_slice_info(dest_ranges, false)?;
    let src_region = src.slice(src_info);
    let mut dest_region = dest.slice_mut(dest_info);
    if src_region.shape() != dest_region.shape() {
        return Err(DmrppError::ShapeInvalid(ndarray::ShapeError::from_kind(
            ndarray::ErrorKind::IncompatibleShape,
        )));
    }
    match (dest_region.as_slice_mut(), src_region.as_slice()) {
        (Some(dest_slice), Some(src_slice)) => dest_slice.copy_from_slice(src_slice),
        _ => dest_region.assign(&src_region),
    }
    Ok(())
}

/// Writes one element value into every element of a region of a byte view.
///
/// # Arguments
///
/// * `dest`: Destination byte view
/// * `dest_ranges`: Region of `dest` to write
/// * `element`: Bytes of the element value, in the destination byte order
pub fn fill_region(
    dest: &mut ArrayViewMutD<u8>,
    dest_ranges: &[AxisRange],
    element: &[u8],
) -> Result<(), DmrppError> {
    let dest_info = build_slice_info(dest_ranges, false)?;
    let mut dest_region = dest.slice_mut(dest_info);
    let element = aview1(element);
    let element = element
        .broadcast(dest_region.raw_dim())
        .ok_or_else(|| {
            DmrppError::ShapeInvalid(ndarray::ShapeError::from_kind(
                ndarray::ErrorKind::IncompatibleShape,
            ))
        })?;
    dest_region.assign(&element);
    Ok(())
}
