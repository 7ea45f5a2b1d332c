//! Fixtures shared by unit tests.

use crate::byte_range_fetcher::ByteRangeFetcher;
use crate::chunk_map::{Block, ChunkMap};
use crate::error::DmrppError;
use crate::filter_pipeline;
use crate::models::*;
use crate::source::{
    AttributeValue, Attributes, NativeFill, StorageRecord, StorageSource, VariableDescriptor,
};
use crate::types::{ByteOrder, ElementType};

use bytes::Bytes;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Identifier of the in-memory source used by the fixtures.
pub(crate) const SOURCE_ID: &str = "memory://quadrant.h5";

/// One call made to a [MemoryFetcher].
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FetchCall {
    pub source_id: String,
    pub offset: u64,
    pub length: u64,
}

/// A byte range fetcher serving in-memory sources that records every call.
#[derive(Debug, Default)]
pub(crate) struct MemoryFetcher {
    sources: HashMap<String, Bytes>,
    calls: Mutex<Vec<FetchCall>>,
    failing_offset: Option<u64>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` for `source_id`.
    pub fn with_source(mut self, source_id: &str, data: impl Into<Bytes>) -> Self {
        self.sources.insert(source_id.to_string(), data.into());
        self
    }

    /// Fail any fetch starting at `offset`.
    pub fn failing_at(mut self, offset: u64) -> Self {
        self.failing_offset = Some(offset);
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ByteRangeFetcher for MemoryFetcher {
    async fn fetch(&self, source_id: &str, offset: u64, length: u64) -> Result<Bytes, DmrppError> {
        self.calls.lock().unwrap().push(FetchCall {
            source_id: source_id.to_string(),
            offset,
            length,
        });
        if self.failing_offset == Some(offset) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected failure").into());
        }
        let data = self
            .sources
            .get(source_id)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(data.slice(start..end))
    }
}

/// Lays chunks out one after another in an in-memory source file.
#[derive(Debug, Default)]
pub(crate) struct SourceFile {
    data: Vec<u8>,
}

impl SourceFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append some bytes and return the block they occupy.
    pub fn append(&mut self, bytes: &[u8]) -> Block {
        let block = Block::new(self.data.len() as u64, bytes.len() as u64);
        self.data.extend_from_slice(bytes);
        block
    }

    /// Encode a chunk with `filters`, append it and return its block.
    pub fn append_encoded(&mut self, data: &[u8], filters: &[FilterKind], element_size: usize) -> Block {
        let encoded =
            filter_pipeline::encode(Bytes::copy_from_slice(data), filters, element_size).unwrap();
        self.append(&encoded)
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.into()
    }
}

/// Little-endian bytes of some `i32` values.
pub(crate) fn i32_le(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// Big-endian bytes of some `i32` values.
pub(crate) fn i32_be(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_be_bytes()).collect()
}

/// Returns a manifest holding a single variable.
pub(crate) fn single_variable_manifest(variable: Variable) -> Manifest {
    Manifest {
        source_file_identifier: SOURCE_ID.to_string(),
        format: SourceFormat::Hdf5,
        build_timestamp: "2024-01-01T00:00:00Z".to_string(),
        builder_version: "0.3.0".to_string(),
        variables: BTreeMap::from([(variable.name.clone(), variable)]),
        build_dmrpp_metadata: None,
    }
}

/// A 4x4 `int32` variable `/quadrant` in 2x2 chunks, written with `[shuffle, deflate]`, and the
/// source file holding its chunks.
///
/// Only grid cells (0,0) and (1,1) are stored, holding `0..4` and `10..14` little-endian.
/// The fill value is -1.
pub(crate) fn quadrant_source() -> (Manifest, Bytes) {
    let filters = vec![FilterKind::Shuffle, FilterKind::Deflate { level: Some(6) }];
    let mut file = SourceFile::new();
    let mut map = ChunkMap::chunked(vec![2, 2], filters.clone());
    map.fill_value = Some("-1".to_string());
    let upper_left = file.append_encoded(&i32_le(&[0, 1, 2, 3]), &filters, 4);
    let lower_right = file.append_encoded(&i32_le(&[10, 11, 12, 13]), &filters, 4);
    map.add_chunk(vec![0, 0], vec![upper_left], Some(ByteOrder::Little))
        .unwrap();
    map.add_chunk(vec![2, 2], vec![lower_right], Some(ByteOrder::Little))
        .unwrap();
    let manifest = single_variable_manifest(Variable {
        name: "/quadrant".to_string(),
        dims: vec![Dimension::named("y", 4), Dimension::named("x", 4)],
        element_type: ElementType::Int32,
        storage: VariableData::Chunks(map),
    });
    (manifest, file.into_bytes())
}

/// [quadrant_source] served by a [MemoryFetcher] under [SOURCE_ID].
pub(crate) fn quadrant_fixture() -> (Manifest, MemoryFetcher) {
    let (manifest, data) = quadrant_source();
    (manifest, MemoryFetcher::new().with_source(SOURCE_ID, data))
}

/// The manifest of [quadrant_fixture].
pub(crate) fn quadrant_manifest() -> Manifest {
    quadrant_fixture().0
}

/// A storage source held in memory.
#[derive(Debug)]
pub(crate) struct MemorySource {
    identifier: String,
    format: SourceFormat,
    variables: Vec<(VariableDescriptor, StorageRecord)>,
    fills: HashMap<String, NativeFill>,
    root_attributes: Attributes,
    fail_open: bool,
}

impl MemorySource {
    pub fn new(identifier: &str, format: SourceFormat) -> Self {
        Self {
            identifier: identifier.to_string(),
            format,
            variables: Vec::new(),
            fills: HashMap::new(),
            root_attributes: Attributes::new(),
            fail_open: false,
        }
    }

    pub fn with_variable(mut self, descriptor: VariableDescriptor, storage: StorageRecord) -> Self {
        self.variables.push((descriptor, storage));
        self
    }

    pub fn with_fill(mut self, variable: &str, fill: NativeFill) -> Self {
        self.fills.insert(variable.to_string(), fill);
        self
    }

    pub fn with_root_attribute(mut self, name: &str, value: AttributeValue) -> Self {
        self.root_attributes.insert(name.to_string(), value);
        self
    }

    pub fn without_root_attribute(mut self, name: &str) -> Self {
        self.root_attributes.remove(name);
        self
    }

    /// Fail to list variables, as an unreadable file would.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl StorageSource for MemorySource {
    fn source_identifier(&self) -> &str {
        &self.identifier
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    fn variables(&self) -> Result<Vec<VariableDescriptor>, DmrppError> {
        if self.fail_open {
            return Err(DmrppError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not an HDF file",
            )));
        }
        Ok(self
            .variables
            .iter()
            .map(|(descriptor, _)| descriptor.clone())
            .collect())
    }

    fn root_attributes(&self) -> Result<Attributes, DmrppError> {
        Ok(self.root_attributes.clone())
    }

    fn storage(&self, variable: &str) -> Result<StorageRecord, DmrppError> {
        self.variables
            .iter()
            .find(|(descriptor, _)| descriptor.name == variable)
            .map(|(_, storage)| storage.clone())
            .ok_or_else(|| DmrppError::VariableNotFound {
                source_id: self.identifier.clone(),
                variable: variable.to_string(),
            })
    }

    fn fill_value(&self, variable: &str) -> Result<Option<NativeFill>, DmrppError> {
        Ok(self.fills.get(variable).cloned())
    }
}
