//! Per-variable chunk maps and the linked-block merge.
//!
//! A [ChunkMap] records where each stored chunk of a variable lives in the source file. Chunk
//! positions are origins in element-index space, so the chunk covering grid cell `(1, 2)` of a
//! variable chunked as `[10, 20]` has logical position `[10, 40]`.

use crate::error::DmrppError;
use crate::models::FilterKind;
use crate::types::ByteOrder;

use serde::{Deserialize, Serialize};

/// A physical byte range in the source.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Block {
    /// Offset of the first byte
    pub offset: u64,
    /// Number of bytes
    pub length: u64,
}

impl Block {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// One independently fetchable unit of a variable's data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Chunk {
    /// Origin of the chunk in element-index space
    pub logical_position: Vec<u64>,
    /// Blocks which, concatenated in order, hold the chunk's stored bytes
    pub blocks: Vec<Block>,
    /// Byte order of the chunk's elements, if the element type has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
}

impl Chunk {
    /// Total stored length of the chunk in bytes.
    pub fn stored_length(&self) -> u64 {
        self.blocks.iter().map(|block| block.length).sum()
    }
}

/// Storage description of one variable.
///
/// For chunked storage `chunk_dim_sizes` is present and every recorded chunk sits at a chunk-grid
/// origin; grid cells without a chunk read as the fill value. Contiguous storage has no chunk
/// dimensions and at most one chunk at the all-zero position.
///
/// Deserialising sorts the chunks and rejects maps that break these rules.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(try_from = "ChunkMapRecord")]
pub struct ChunkMap {
    /// Chunk shape, absent for non-chunked storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_dim_sizes: Option<Vec<u64>>,
    /// Filters in the order they were applied when the data was written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterKind>,
    /// Fill value in canonical text form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<String>,
    /// Chunks, ordered by logical position
    pub chunks: Vec<Chunk>,
    /// Whether any chunk is made of more than one block
    #[serde(default)]
    pub multi_block: bool,
}

/// A chunk map as it appears in a serialised manifest, before validation.
#[derive(Deserialize)]
struct ChunkMapRecord {
    #[serde(default)]
    chunk_dim_sizes: Option<Vec<u64>>,
    #[serde(default)]
    filters: Vec<FilterKind>,
    #[serde(default)]
    fill_value: Option<String>,
    chunks: Vec<Chunk>,
    #[serde(default)]
    multi_block: bool,
}

impl TryFrom<ChunkMapRecord> for ChunkMap {
    type Error = DmrppError;

    fn try_from(record: ChunkMapRecord) -> Result<Self, Self::Error> {
        let mut chunks = record.chunks;
        chunks.sort_by(|a, b| a.logical_position.cmp(&b.logical_position));
        let multi_block = record.multi_block || chunks.iter().any(|chunk| chunk.blocks.len() > 1);
        let map = ChunkMap {
            chunk_dim_sizes: record.chunk_dim_sizes,
            filters: record.filters,
            fill_value: record.fill_value,
            chunks,
            multi_block,
        };
        map.validate()?;
        Ok(map)
    }
}

impl ChunkMap {
    /// Returns an empty chunk map for chunked storage.
    ///
    /// # Arguments
    ///
    /// * `chunk_dim_sizes`: Chunk shape
    /// * `filters`: Filters in write order
    pub fn chunked(chunk_dim_sizes: Vec<u64>, filters: Vec<FilterKind>) -> Self {
        Self {
            chunk_dim_sizes: Some(chunk_dim_sizes),
            filters,
            ..Default::default()
        }
    }

    /// Returns an empty chunk map for contiguous storage.
    ///
    /// # Arguments
    ///
    /// * `filters`: Filters in write order. HDF4 may compress non-chunked data.
    pub fn contiguous(filters: Vec<FilterKind>) -> Self {
        Self {
            filters,
            ..Default::default()
        }
    }

    /// Whether the map describes chunked storage.
    pub fn is_chunked(&self) -> bool {
        self.chunk_dim_sizes.is_some()
    }

    /// Record a chunk's blocks, merging with any blocks already recorded at the same position.
    ///
    /// Physically adjacent blocks are coalesced with [merge_linked_blocks].
    ///
    /// # Arguments
    ///
    /// * `logical_position`: Chunk origin in element-index space
    /// * `blocks`: Blocks in the order the source reported them
    /// * `byte_order`: Byte order of the chunk's elements
    pub fn add_chunk(
        &mut self,
        logical_position: Vec<u64>,
        blocks: Vec<Block>,
        byte_order: Option<ByteOrder>,
    ) -> Result<(), DmrppError> {
        if blocks.is_empty() {
            return Err(DmrppError::InvalidChunk {
                position: logical_position,
                reason: "a chunk needs at least one block".to_string(),
            });
        }
        self.check_position(&logical_position)?;

        let index = self
            .chunks
            .binary_search_by(|chunk| chunk.logical_position.cmp(&logical_position));
        let index = match index {
            Ok(index) => {
                let chunk = &mut self.chunks[index];
                chunk.blocks.extend(blocks);
                chunk.blocks = merge_linked_blocks(&chunk.blocks);
                index
            }
            Err(index) => {
                self.chunks.insert(
                    index,
                    Chunk {
                        logical_position,
                        blocks: merge_linked_blocks(&blocks),
                        byte_order,
                    },
                );
                index
            }
        };
        if self.chunks[index].blocks.len() > 1 {
            self.multi_block = true;
        }
        Ok(())
    }

    /// Fail unless `logical_position` is a chunk origin of this map.
    fn check_position(&self, logical_position: &[u64]) -> Result<(), DmrppError> {
        let invalid = |reason: String| DmrppError::InvalidChunk {
            position: logical_position.to_vec(),
            reason,
        };
        match &self.chunk_dim_sizes {
            Some(chunk_dims) => {
                if logical_position.len() != chunk_dims.len() {
                    return Err(invalid(format!("expected rank {}", chunk_dims.len())));
                }
                let aligned = std::iter::zip(logical_position, chunk_dims)
                    .all(|(position, size)| *size > 0 && position % size == 0);
                if !aligned {
                    return Err(invalid(format!(
                        "not a chunk origin for chunk shape {:?}",
                        chunk_dims
                    )));
                }
            }
            None => {
                if logical_position.iter().any(|position| *position != 0) {
                    return Err(invalid(
                        "non-chunked storage has a single chunk at the origin".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Check the map's own invariants.
    ///
    /// Chunk dimensions are non-zero, every chunk has at least one block and sits at a chunk
    /// origin, and positions are unique and sorted.
    pub fn validate(&self) -> Result<(), DmrppError> {
        if let Some(chunk_dims) = &self.chunk_dim_sizes {
            if chunk_dims.contains(&0) {
                return Err(DmrppError::InvalidChunk {
                    position: vec![0; chunk_dims.len()],
                    reason: format!("chunk shape {:?} has an empty axis", chunk_dims),
                });
            }
        }
        for chunk in &self.chunks {
            if chunk.blocks.is_empty() {
                return Err(DmrppError::InvalidChunk {
                    position: chunk.logical_position.clone(),
                    reason: "a chunk needs at least one block".to_string(),
                });
            }
            self.check_position(&chunk.logical_position)?;
        }
        if let Some(pair) = self
            .chunks
            .windows(2)
            .find(|pair| pair[0].logical_position >= pair[1].logical_position)
        {
            let reason = if pair[0].logical_position == pair[1].logical_position {
                "recorded more than once"
            } else {
                "chunks are not ordered by position"
            };
            return Err(DmrppError::InvalidChunk {
                position: pair[1].logical_position.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Check the map against the shape of its variable.
    ///
    /// Besides [ChunkMap::validate], the chunk shape and every position have the variable's rank
    /// and every chunk starts inside the variable.
    ///
    /// # Arguments
    ///
    /// * `dims`: Variable shape
    pub fn validate_for(&self, dims: &[u64]) -> Result<(), DmrppError> {
        self.validate()?;
        if let Some(chunk_dims) = &self.chunk_dim_sizes {
            if chunk_dims.len() != dims.len() {
                return Err(DmrppError::InvalidChunk {
                    position: vec![0; dims.len()],
                    reason: format!("chunk shape {:?} does not fit shape {:?}", chunk_dims, dims),
                });
            }
        }
        for chunk in &self.chunks {
            let inside = chunk.logical_position.len() == dims.len()
                && std::iter::zip(&chunk.logical_position, dims)
                    .all(|(position, dim)| *position == 0 || position < dim);
            if !inside {
                return Err(DmrppError::InvalidChunk {
                    position: chunk.logical_position.clone(),
                    reason: format!("outside a variable of shape {:?}", dims),
                });
            }
        }
        Ok(())
    }

    /// Returns the chunk recorded at a position, if any.
    pub fn get(&self, logical_position: &[u64]) -> Option<&Chunk> {
        self.chunks
            .binary_search_by(|chunk| chunk.logical_position.as_slice().cmp(logical_position))
            .ok()
            .map(|index| &self.chunks[index])
    }

    /// Returns the number of chunks along each axis of the chunk grid.
    ///
    /// Non-chunked storage has a single cell along every axis.
    ///
    /// # Arguments
    ///
    /// * `dims`: Variable shape
    pub fn grid_shape(&self, dims: &[u64]) -> Vec<u64> {
        match &self.chunk_dim_sizes {
            Some(chunk_dims) => std::iter::zip(dims, chunk_dims)
                .map(|(dim, chunk)| dim.div_ceil(*chunk))
                .collect(),
            None => vec![1; dims.len()],
        }
    }

    /// Returns the number of cells in the chunk grid.
    pub fn grid_cell_count(&self, dims: &[u64]) -> u64 {
        self.grid_shape(dims).iter().product()
    }

    /// Returns the shape of one chunk: the chunk shape, or the variable shape when not chunked.
    pub fn chunk_shape(&self, dims: &[u64]) -> Vec<u64> {
        self.chunk_dim_sizes
            .clone()
            .unwrap_or_else(|| dims.to_vec())
    }

    /// Returns the origin of a chunk-grid cell in element-index space.
    pub fn origin_of_cell(&self, grid_index: &[u64]) -> Vec<u64> {
        match &self.chunk_dim_sizes {
            Some(chunk_dims) => std::iter::zip(grid_index, chunk_dims)
                .map(|(index, size)| index * size)
                .collect(),
            None => vec![0; grid_index.len()],
        }
    }
}

/// Coalesce physically adjacent blocks.
///
/// A single pass over the blocks in the given order: a block starting exactly where the running
/// block ends is folded into it, anything else starts a new block. Order is preserved and a chunk
/// made only of zero-length blocks keeps one zero-length block.
///
/// # Arguments
///
/// * `blocks`: Blocks in source order
pub fn merge_linked_blocks(blocks: &[Block]) -> Vec<Block> {
    let mut merged = Vec::with_capacity(blocks.len());
    let mut iter = blocks.iter();
    let Some(first) = iter.next() else {
        return merged;
    };
    let mut current = *first;
    for block in iter {
        if block.offset == current.offset + current.length {
            current.length += block.length;
        } else {
            merged.push(current);
            current = *block;
        }
    }
    merged.push(current);
    merged
}
