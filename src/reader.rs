//! Partial array reader.
//!
//! Resolves a hyperslab selection of a variable against its chunk map, fetches and decodes only
//! the chunks the selection touches, and assembles the selected elements into one buffer.

use crate::array::{self, AxisRange};
use crate::byte_range_fetcher::ByteRangeFetcher;
use crate::chunk_map::{Block, Chunk, ChunkMap};
use crate::error::{DmrppError, FilterError};
use crate::filter_pipeline;
use crate::metrics::{CHUNK_FETCHES, FETCHED_BYTES, FILL_HOLE_CELLS};
use crate::models::{ArrayBuffer, FilterKind, Hyperslab, Manifest, Variable, VariableData};
use crate::resource_manager::ResourceManager;
use crate::types::{ByteOrder, NATIVE_BYTE_ORDER};

use bytes::Bytes;
use ndarray::{ArrayViewMutD, Dimension as _, IxDyn};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Where the selected elements of one chunk come from and go to.
#[derive(Debug)]
struct Placement {
    /// Element ranges within the chunk
    src: Vec<AxisRange>,
    /// Element ranges within the output
    dest: Vec<AxisRange>,
}

/// A stored chunk that the selection touches.
#[derive(Debug)]
struct ChunkJob {
    chunk: Chunk,
    placement: Placement,
}

/// Reads hyperslabs of variables described by a manifest.
///
/// Chunks are fetched and decoded concurrently. Stored chunks that sit back to back in the source
/// are fetched with a single byte range request and split before decoding. The output buffer is
/// allocated once per read and written only after each chunk task has finished, so a read
/// abandoned by its caller never writes into a discarded buffer.
#[derive(Debug)]
pub struct PartialArrayReader<F> {
    /// Byte range fetcher for chunk data.
    fetcher: Arc<F>,
    /// Limits on concurrent fetches, memory and tasks.
    resource_manager: Arc<ResourceManager>,
    /// Whether to decode chunks on the rayon thread pool.
    use_rayon: bool,
}

impl<F> Clone for PartialArrayReader<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            resource_manager: self.resource_manager.clone(),
            use_rayon: self.use_rayon,
        }
    }
}

impl<F: ByteRangeFetcher + 'static> PartialArrayReader<F> {
    /// Create a new reader.
    ///
    /// # Arguments
    ///
    /// * `fetcher`: Byte range fetcher for chunk data
    /// * `resource_manager`: ResourceManager object
    /// * `use_rayon`: Whether to decode chunks on the rayon thread pool
    pub fn new(fetcher: Arc<F>, resource_manager: Arc<ResourceManager>, use_rayon: bool) -> Self {
        Self {
            fetcher,
            resource_manager,
            use_rayon,
        }
    }

    /// Returns the byte range fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Read a hyperslab of a variable.
    ///
    /// Returns the selected elements in row-major order. Any fetch or decode failure aborts the
    /// whole read; partial results are never returned.
    ///
    /// # Arguments
    ///
    /// * `manifest`: Manifest of the source
    /// * `variable`: Name of the variable
    /// * `selection`: One hyperslab per dimension, or `None` for the whole variable
    /// * `byte_order`: Byte order of the output, or `None` for native order
    #[tracing::instrument(level = "DEBUG", skip(self, manifest))]
    pub async fn read(
        &self,
        manifest: &Manifest,
        variable: &str,
        selection: Option<&[Hyperslab]>,
        byte_order: Option<ByteOrder>,
    ) -> Result<ArrayBuffer, DmrppError> {
        let var = manifest.variable(variable)?;
        let byte_order = byte_order.unwrap_or(NATIVE_BYTE_ORDER);
        let element_size = var.element_type.size_of();
        let Some(selection) = resolve_selection(var, selection)? else {
            // A variable with an empty extent has nothing to read.
            return Ok(ArrayBuffer {
                data: Bytes::new(),
                element_type: var.element_type,
                shape: to_usize(&var.shape())?,
                byte_order,
            });
        };
        let counts = selection
            .iter()
            .map(|hyperslab| usize::try_from(hyperslab.count()))
            .collect::<Result<Vec<_>, _>>()?;
        let length = byte_length(&counts, element_size).ok_or_else(|| {
            DmrppError::InvalidSelection {
                variable: var.name.clone(),
                reason: format!("a selection of shape {:?} is too large to address", counts),
            }
        })?;
        self.resource_manager.check_memory(length)?;
        let mut buf = array::aligned_buffer(length);
        {
            let mut out = array::byte_view_mut(&mut buf, &counts, element_size)?;
            match &var.storage {
                VariableData::Chunks(map) => {
                    self.read_chunks(manifest, var, map, &selection, byte_order, &mut out)
                        .await?
                }
                VariableData::Inline {
                    values,
                    byte_order: recorded,
                } => copy_in_memory(var, values, *recorded, &selection, byte_order, &mut out)?,
                VariableData::Synthesized { values } => copy_in_memory(
                    var,
                    values,
                    Some(ByteOrder::Little),
                    &selection,
                    byte_order,
                    &mut out,
                )?,
            }
        }
        Ok(ArrayBuffer {
            data: buf.into(),
            element_type: var.element_type,
            shape: counts,
            byte_order,
        })
    }

    /// Read the selected elements of a variable stored in chunks.
    async fn read_chunks(
        &self,
        manifest: &Manifest,
        var: &Variable,
        map: &ChunkMap,
        selection: &[Hyperslab],
        byte_order: ByteOrder,
        out: &mut ArrayViewMutD<'_, u8>,
    ) -> Result<(), DmrppError> {
        let dims = var.shape();
        let chunk_shape = map.chunk_shape(&dims);
        if chunk_shape.len() != dims.len() || chunk_shape.contains(&0) {
            return Err(DmrppError::InvalidChunk {
                position: vec![0; dims.len()],
                reason: format!("chunk shape {:?} does not fit shape {:?}", chunk_shape, dims),
            });
        }
        let element_size = var.element_type.size_of();
        let chunk_shape_usize = to_usize(&chunk_shape)?;
        let expected_length = byte_length(&chunk_shape_usize, element_size).ok_or_else(|| {
            DmrppError::InvalidChunk {
                position: vec![0; dims.len()],
                reason: format!("chunk shape {:?} is too large to address", chunk_shape),
            }
        })?;
        let fill = fill_element(var, map, byte_order)?;

        // Stride never changes which cells are touched, only which of their elements are kept.
        let first_cell: Vec<u64> = std::iter::zip(selection, &chunk_shape)
            .map(|(hyperslab, size)| hyperslab.start / size)
            .collect();
        let span = std::iter::zip(selection, &chunk_shape)
            .zip(&first_cell)
            .map(|((hyperslab, size), first)| usize::try_from(hyperslab.stop / size - first + 1))
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::new();
        let mut holes = 0_u64;
        for offset in ndarray::indices(IxDyn(&span)) {
            let cell: Vec<u64> = std::iter::zip(offset.slice(), &first_cell)
                .map(|(offset, first)| *offset as u64 + first)
                .collect();
            let origin = map.origin_of_cell(&cell);
            let Some(placement) = place(selection, &origin, &chunk_shape, &dims)? else {
                continue;
            };
            match map.get(&origin) {
                Some(chunk) => jobs.push(ChunkJob {
                    chunk: chunk.clone(),
                    placement,
                }),
                None => {
                    array::fill_region(out, &placement.dest, &fill)?;
                    holes += 1;
                }
            }
        }
        FILL_HOLE_CELLS.inc_by(holes);
        tracing::debug!(
            "{} chunks to fetch, {} fill cells for {}",
            jobs.len(),
            holes,
            var.name
        );

        // Never group more chunks than the memory pool holds at once.
        let max_group = self
            .resource_manager
            .total_memory()
            .and_then(|total| total.checked_div(expected_length))
            .unwrap_or(usize::MAX)
            .max(1);
        let groups = group_adjacent(&jobs, max_group);
        tracing::debug!("{} chunks in {} fetches", jobs.len(), groups.len());

        let source_id: Arc<str> = manifest.source_file_identifier.as_str().into();
        let variable: Arc<str> = var.name.as_str().into();
        let filters: Arc<[FilterKind]> = map.filters.clone().into();
        let mut tasks = JoinSet::new();
        for group in groups {
            let fetcher = self.fetcher.clone();
            let resource_manager = self.resource_manager.clone();
            let source_id = source_id.clone();
            let variable = variable.clone();
            let filters = filters.clone();
            let chunks: Vec<(usize, Chunk)> = group
                .into_iter()
                .map(|index| (index, jobs[index].chunk.clone()))
                .collect();
            let use_rayon = self.use_rayon;
            tasks.spawn(
                async move {
                    let _task_permit = resource_manager.task().await?;
                    let memory_permit = resource_manager
                        .memory(expected_length.saturating_mul(chunks.len()))
                        .await?;
                    let raws =
                        fetch_group(&*fetcher, &resource_manager, &source_id, &variable, &chunks)
                            .await?;
                    let mut decoded = Vec::with_capacity(chunks.len());
                    for ((index, chunk), raw) in chunks.iter().zip(raws) {
                        let bytes = decode_chunk(
                            raw,
                            filters.clone(),
                            element_size,
                            expected_length,
                            use_rayon,
                        )
                        .await
                        .map_err(|cause| {
                            decode_failure(&source_id, &variable, &chunk.logical_position, cause)
                        })?;
                        decoded.push((*index, bytes));
                    }
                    Ok::<_, DmrppError>((decoded, memory_permit))
                }
                .instrument(tracing::Span::current()),
            );
        }

        // Dropping the JoinSet on an early return aborts the remaining tasks.
        while let Some(result) = tasks.join_next().await {
            let (decoded, _memory_permit) = result??;
            for (index, bytes) in decoded {
                let job = &jobs[index];
                let reverse = var.element_type.is_byte_order_sensitive()
                    && byte_order.needs_swap(job.chunk.byte_order);
                let src = array::byte_view(&bytes, &chunk_shape_usize, element_size)?;
                array::copy_region(out, &job.placement.dest, &src, &job.placement.src, reverse)?;
            }
        }
        Ok(())
    }
}

/// Returns the selection to read, or `None` when the variable has an empty extent.
///
/// Every hyperslab must have a stride of at least one, a start no greater than its stop, and a
/// stop inside the dimension.
fn resolve_selection(
    var: &Variable,
    selection: Option<&[Hyperslab]>,
) -> Result<Option<Vec<Hyperslab>>, DmrppError> {
    let shape = var.shape();
    let Some(selection) = selection else {
        return Ok(shape.iter().map(|size| Hyperslab::all(*size)).collect());
    };
    let invalid = |reason: String| DmrppError::InvalidSelection {
        variable: var.name.clone(),
        reason,
    };
    if selection.len() != shape.len() {
        return Err(invalid(format!(
            "{} hyperslabs given for a variable of rank {}",
            selection.len(),
            shape.len()
        )));
    }
    for (axis, (hyperslab, size)) in std::iter::zip(selection, &shape).enumerate() {
        if hyperslab.stride == 0 {
            return Err(invalid(format!("stride of axis {} is zero", axis)));
        }
        if hyperslab.start > hyperslab.stop {
            return Err(invalid(format!(
                "start {} exceeds stop {} on axis {}",
                hyperslab.start, hyperslab.stop, axis
            )));
        }
        if hyperslab.stop >= *size {
            return Err(invalid(format!(
                "stop {} is outside axis {} of size {}",
                hyperslab.stop, axis, size
            )));
        }
    }
    Ok(Some(selection.to_vec()))
}

/// Returns where the selected elements of the chunk at `origin` come from and go to, or `None`
/// if the selection keeps none of its elements.
///
/// # Arguments
///
/// * `selection`: One hyperslab per dimension
/// * `origin`: Chunk origin in element-index space
/// * `chunk_shape`: Chunk shape
/// * `dims`: Variable shape
fn place(
    selection: &[Hyperslab],
    origin: &[u64],
    chunk_shape: &[u64],
    dims: &[u64],
) -> Result<Option<Placement>, DmrppError> {
    let mut src = Vec::with_capacity(selection.len());
    let mut dest = Vec::with_capacity(selection.len());
    for (((hyperslab, origin), size), dim) in selection.iter().zip(origin).zip(chunk_shape).zip(dims)
    {
        // Edge chunks are stored whole but extend past the variable.
        let Some(last_in_chunk) = origin.saturating_add(*size).min(*dim).checked_sub(1) else {
            return Ok(None);
        };
        let last_wanted = hyperslab.stop.min(last_in_chunk);
        let first_step = if hyperslab.start >= *origin {
            0
        } else {
            (origin - hyperslab.start).div_ceil(hyperslab.stride)
        };
        let first = hyperslab.start + first_step * hyperslab.stride;
        if first > last_wanted {
            return Ok(None);
        }
        let last_step = (last_wanted - hyperslab.start) / hyperslab.stride;
        let last = hyperslab.start + last_step * hyperslab.stride;
        src.push(AxisRange {
            start: usize::try_from(first - origin)?,
            end: usize::try_from(last - origin + 1)?,
            step: usize::try_from(hyperslab.stride)?,
        });
        dest.push(AxisRange::dense(
            usize::try_from(first_step)?,
            usize::try_from(last_step + 1)?,
        ));
    }
    Ok(Some(Placement { src, dest }))
}

/// Returns the bytes of one fill element in the output byte order.
///
/// Without a declared fill value, holes read as zeros.
fn fill_element(var: &Variable, map: &ChunkMap, byte_order: ByteOrder) -> Result<Vec<u8>, DmrppError> {
    match &map.fill_value {
        Some(value) => var.element_type.encode_scalar(value, byte_order),
        None => Ok(vec![0; var.element_type.size_of()]),
    }
}

/// Copy the selected elements of a variable held in the manifest itself.
fn copy_in_memory(
    var: &Variable,
    values: &[u8],
    recorded: Option<ByteOrder>,
    selection: &[Hyperslab],
    byte_order: ByteOrder,
    out: &mut ArrayViewMutD<'_, u8>,
) -> Result<(), DmrppError> {
    let dims = var.shape();
    let element_size = var.element_type.size_of();
    let shape = to_usize(&dims)?;
    let expected = byte_length(&shape, element_size);
    if Some(values.len()) != expected {
        return Err(DmrppError::InvalidChunk {
            position: vec![0; dims.len()],
            reason: format!(
                "{} bytes of values held for {:?} elements of {} bytes",
                values.len(),
                shape,
                element_size
            ),
        });
    }
    let origin = vec![0; dims.len()];
    let Some(placement) = place(selection, &origin, &dims, &dims)? else {
        return Ok(());
    };
    let reverse = var.element_type.is_byte_order_sensitive() && byte_order.needs_swap(recorded);
    let src = array::byte_view(values, &shape, element_size)?;
    array::copy_region(out, &placement.dest, &src, &placement.src, reverse)
}

/// Returns the number of bytes held by elements of `element_size` bytes in an array of `shape`,
/// or `None` if that overflows.
fn byte_length(shape: &[usize], element_size: usize) -> Option<usize> {
    shape
        .iter()
        .try_fold(element_size, |length, size| length.checked_mul(*size))
}

/// Returns the only block of a chunk that holds bytes, if it has exactly one.
fn single_block(chunk: &Chunk) -> Option<Block> {
    let mut blocks = chunk.blocks.iter().filter(|block| block.length > 0);
    match (blocks.next(), blocks.next()) {
        (Some(block), None) => Some(*block),
        _ => None,
    }
}

/// Split chunk jobs into fetch groups.
///
/// A group is a run of consecutive jobs, each a single-block chunk starting where the previous
/// one ends in the source, of at most `max_group` jobs. Any other job is a group of its own.
///
/// # Arguments
///
/// * `jobs`: Chunk jobs in chunk-grid order
/// * `max_group`: Largest number of jobs in one group
fn group_adjacent(jobs: &[ChunkJob], max_group: usize) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut run_end: Option<u64> = None;
    for (index, job) in jobs.iter().enumerate() {
        let block = single_block(&job.chunk);
        let extends = matches!(
            (block, run_end, groups.last()),
            (Some(block), Some(end), Some(group)) if block.offset == end && group.len() < max_group
        );
        match (extends, groups.last_mut()) {
            (true, Some(group)) => group.push(index),
            _ => groups.push(vec![index]),
        }
        run_end = block.map(|block| block.offset + block.length);
    }
    groups
}

/// Fetch one byte range for a chunk.
///
/// # Arguments
///
/// * `fetcher`: Byte range fetcher
/// * `resource_manager`: ResourceManager object
/// * `source_id`: Source identifier recorded in the manifest
/// * `variable`: Name of the variable
/// * `position`: Position of the chunk the range is reported against
/// * `block`: Byte range to fetch
async fn fetch_range<F: ByteRangeFetcher>(
    fetcher: &F,
    resource_manager: &ResourceManager,
    source_id: &str,
    variable: &str,
    position: &[u64],
    block: Block,
) -> Result<Bytes, DmrppError> {
    let failure = |cause: DmrppError| DmrppError::ChunkFetchFailure {
        source_id: source_id.to_string(),
        variable: variable.to_string(),
        position: position.to_vec(),
        offset: block.offset,
        length: block.length,
        cause: Box::new(cause),
    };
    let _conn_permit = resource_manager.fetch_connection().await?;
    let bytes = fetcher
        .fetch(source_id, block.offset, block.length)
        .await
        .map_err(failure)?;
    if bytes.len() as u64 != block.length {
        return Err(failure(DmrppError::InvalidChunk {
            position: position.to_vec(),
            reason: format!("fetched {} bytes, expected {}", bytes.len(), block.length),
        }));
    }
    CHUNK_FETCHES.inc();
    FETCHED_BYTES.inc_by(block.length);
    Ok(bytes)
}

/// Fetch all blocks of a chunk and concatenate them in order.
///
/// # Arguments
///
/// * `fetcher`: Byte range fetcher
/// * `resource_manager`: ResourceManager object
/// * `source_id`: Source identifier recorded in the manifest
/// * `variable`: Name of the variable
/// * `chunk`: Chunk to fetch
#[tracing::instrument(level = "DEBUG", skip(fetcher, resource_manager, chunk), fields(position = ?chunk.logical_position))]
async fn fetch_chunk<F: ByteRangeFetcher>(
    fetcher: &F,
    resource_manager: &ResourceManager,
    source_id: &str,
    variable: &str,
    chunk: &Chunk,
) -> Result<Bytes, DmrppError> {
    let mut parts = Vec::with_capacity(chunk.blocks.len());
    for block in chunk.blocks.iter().filter(|block| block.length > 0) {
        let bytes = fetch_range(
            fetcher,
            resource_manager,
            source_id,
            variable,
            &chunk.logical_position,
            *block,
        )
        .await?;
        parts.push(bytes);
    }
    if parts.len() <= 1 {
        return Ok(parts.pop().unwrap_or_default());
    }
    let length = parts.iter().map(Bytes::len).sum();
    let mut buf = maligned::align_first::<u8, maligned::A8>(length);
    parts.iter().for_each(|part| buf.extend_from_slice(part));
    Ok(buf.into())
}

/// Fetch the raw bytes of a group of chunks, in group order.
///
/// A group of several chunks is fetched as one byte range and split along the chunks' blocks.
/// A failure is reported against the first chunk of the group.
///
/// # Arguments
///
/// * `fetcher`: Byte range fetcher
/// * `resource_manager`: ResourceManager object
/// * `source_id`: Source identifier recorded in the manifest
/// * `variable`: Name of the variable
/// * `chunks`: Chunks of one group from [group_adjacent], with their job indices
async fn fetch_group<F: ByteRangeFetcher>(
    fetcher: &F,
    resource_manager: &ResourceManager,
    source_id: &str,
    variable: &str,
    chunks: &[(usize, Chunk)],
) -> Result<Vec<Bytes>, DmrppError> {
    let blocks: Option<Vec<Block>> = chunks.iter().map(|(_, chunk)| single_block(chunk)).collect();
    let (Some(blocks), [(_, first), _, ..]) = (blocks, chunks) else {
        let mut raws = Vec::with_capacity(chunks.len());
        for (_, chunk) in chunks {
            raws.push(fetch_chunk(fetcher, resource_manager, source_id, variable, chunk).await?);
        }
        return Ok(raws);
    };
    let start = blocks[0].offset;
    let end = blocks
        .last()
        .map_or(start, |block| block.offset + block.length);
    let range = Block::new(start, end - start);
    tracing::debug!(
        "fetching {} adjacent chunks as bytes {}..{}",
        chunks.len(),
        start,
        end
    );
    let bytes = fetch_range(
        fetcher,
        resource_manager,
        source_id,
        variable,
        &first.logical_position,
        range,
    )
    .await?;
    blocks
        .iter()
        .map(|block| {
            let from = usize::try_from(block.offset - start)?;
            let to = usize::try_from(block.offset + block.length - start)?;
            Ok(bytes.slice(from..to))
        })
        .collect()
}

/// Decode a chunk, on the rayon thread pool if requested.
async fn decode_chunk(
    raw: Bytes,
    filters: Arc<[FilterKind]>,
    element_size: usize,
    expected_length: usize,
    use_rayon: bool,
) -> Result<Bytes, FilterError> {
    if use_rayon && !filters.is_empty() {
        tokio_rayon::spawn(move || {
            filter_pipeline::decode(raw, &filters, element_size, expected_length)
        })
        .await
    } else {
        filter_pipeline::decode(raw, &filters, element_size, expected_length)
    }
}

/// Attach a chunk's identity to a filter error.
fn decode_failure(source_id: &str, variable: &str, position: &[u64], cause: FilterError) -> DmrppError {
    match cause {
        FilterError::ChecksumMismatch { .. } => DmrppError::FilterVerificationFailure {
            source_id: source_id.to_string(),
            variable: variable.to_string(),
            position: position.to_vec(),
            cause,
        },
        FilterError::Unsupported { id, name } => DmrppError::UnsupportedFilter {
            variable: variable.to_string(),
            id,
            name,
        },
        cause => DmrppError::ChunkDecodeFailure {
            source_id: source_id.to_string(),
            variable: variable.to_string(),
            position: position.to_vec(),
            cause,
        },
    }
}

fn to_usize(values: &[u64]) -> Result<Vec<usize>, DmrppError> {
    Ok(values
        .iter()
        .map(|value| usize::try_from(*value))
        .collect::<Result<Vec<_>, _>>()?)
}
