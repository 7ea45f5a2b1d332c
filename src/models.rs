//! Data types and associated functions and methods

use crate::chunk_map::ChunkMap;
use crate::error::DmrppError;
use crate::types::{ByteOrder, ElementType};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

/// A filter applied to chunk bytes when the data was written.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "id")]
pub enum FilterKind {
    /// zlib deflate
    Deflate {
        /// Compression level used on write, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<u32>,
    },
    /// Byte shuffle
    Shuffle,
    /// Fletcher32 checksum
    Fletcher32,
    /// A filter recorded by some other producer that cannot be decoded here
    Other { code: u32, name: String },
}

/// Format family of a source file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Hdf5,
    Hdf4,
}

/// Fixed extent of one array axis.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Dimension {
    /// Optional dimension name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Number of elements
    pub size: u64,
}

impl Dimension {
    /// Return an anonymous dimension.
    pub fn new(size: u64) -> Self {
        Dimension { name: None, size }
    }

    /// Return a named dimension.
    pub fn named(name: &str, size: u64) -> Self {
        Dimension {
            name: Some(name.to_string()),
            size,
        }
    }
}

/// Where a variable's values come from.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum VariableData {
    /// Values live in the source, in chunks described by a [ChunkMap]
    Chunks(ChunkMap),
    /// Compact storage: values were read at build time
    Inline {
        /// Values in `byte_order`
        #[serde(with = "hex_bytes")]
        values: Vec<u8>,
        /// Byte order of `values`, if the element type has one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        byte_order: Option<ByteOrder>,
    },
    /// Values were computed from grid metadata, in little-endian order
    Synthesized {
        #[serde(with = "hex_bytes")]
        values: Vec<u8>,
    },
}

/// A variable and the description of its stored data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Variable {
    /// Fully qualified name
    pub name: String,
    /// Dimensions, slowest varying first
    pub dims: Vec<Dimension>,
    /// Element type
    pub element_type: ElementType,
    /// Stored data
    pub storage: VariableData,
}

impl Variable {
    /// Returns the variable's shape.
    pub fn shape(&self) -> Vec<u64> {
        self.dims.iter().map(|dim| dim.size).collect()
    }

    /// Returns the chunk map, if the values live in the source.
    pub fn chunk_map(&self) -> Option<&ChunkMap> {
        match &self.storage {
            VariableData::Chunks(chunk_map) => Some(chunk_map),
            _ => None,
        }
    }

    /// Whether the values were computed rather than read from the source.
    pub fn missing_data_synthesized(&self) -> bool {
        matches!(self.storage, VariableData::Synthesized { .. })
    }
}

/// Provenance annotation recorded by the builder on request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Provenance {
    /// Build time (RFC 3339, UTC)
    pub created: String,
    /// Version of the builder
    pub build_dmrpp_version: String,
    /// Effective build options
    pub configuration: String,
    /// Command line of the build
    pub invocation: String,
}

/// The chunk maps of every variable of one source file.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Manifest {
    /// Identifier passed verbatim to the byte range fetcher
    pub source_file_identifier: String,
    /// Format family of the source
    pub format: SourceFormat,
    /// Build time (RFC 3339, UTC)
    pub build_timestamp: String,
    /// Version of the builder
    pub builder_version: String,
    /// Variables by fully qualified name
    pub variables: BTreeMap<String, Variable>,
    /// Optional provenance annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dmrpp_metadata: Option<Provenance>,
}

impl Manifest {
    /// Returns the named variable.
    pub fn variable(&self, name: &str) -> Result<&Variable, DmrppError> {
        self.variables
            .get(name)
            .ok_or_else(|| DmrppError::VariableNotFound {
                source_id: self.source_file_identifier.clone(),
                variable: name.to_string(),
            })
    }

    /// Serialise to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, DmrppError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialise from JSON.
    ///
    /// Chunk maps are sorted while parsing and checked against their variables' shapes.
    pub fn from_json(data: &[u8]) -> Result<Self, DmrppError> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        manifest.check_chunk_maps()?;
        Ok(manifest)
    }

    /// Check every chunk map against the shape of its variable.
    pub fn check_chunk_maps(&self) -> Result<(), DmrppError> {
        for var in self.variables.values() {
            if let VariableData::Chunks(map) = &var.storage {
                map.validate_for(&var.shape())
                    .map_err(|cause| DmrppError::InvalidManifest {
                        variable: var.name.clone(),
                        cause: Box::new(cause),
                    })?;
            }
        }
        Ok(())
    }
}

/// A `(start, stride, stop)` selection on one dimension. `stop` is inclusive.
// NOTE: In serde, structs can be deserialised from sequences or maps. This allows us to support
// the [<start>, <stride>, <stop>] API, with the convenience of named fields.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_hyperslab"))]
pub struct Hyperslab {
    /// First index
    pub start: u64,
    /// Step between indices
    pub stride: u64,
    /// Last index, inclusive
    pub stop: u64,
}

impl Hyperslab {
    /// Return a new Hyperslab object.
    pub fn new(start: u64, stride: u64, stop: u64) -> Self {
        Hyperslab {
            start,
            stride,
            stop,
        }
    }

    /// Select every element of a dimension of `size` elements.
    ///
    /// Returns [None] for an empty dimension, which has no valid selection.
    pub fn all(size: u64) -> Option<Self> {
        (size > 0).then(|| Hyperslab::new(0, 1, size - 1))
    }

    /// Number of selected indices.
    pub fn count(&self) -> u64 {
        (self.stop - self.start) / self.stride + 1
    }
}

/// Validate a hyperslab
fn validate_hyperslab(hyperslab: &Hyperslab) -> Result<(), ValidationError> {
    if hyperslab.stride == 0 {
        let mut error = ValidationError::new("Selection stride must be at least 1");
        error.add_param("stride".into(), &hyperslab.stride);
        return Err(error);
    }
    if hyperslab.start > hyperslab.stop {
        let mut error = ValidationError::new("Selection start must not exceed stop");
        error.add_param("start".into(), &hyperslab.start);
        error.add_param("stop".into(), &hyperslab.stop);
        return Err(error);
    }
    Ok(())
}

/// Request to read part of a variable
#[derive(Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReadRequest {
    /// Logical name of the manifest in the store
    #[validate(length(min = 1, message = "manifest must not be empty"))]
    pub manifest: String,
    /// Fully qualified variable name
    #[validate(length(min = 1, message = "variable must not be empty"))]
    pub variable: String,
    /// One hyperslab per dimension; the whole variable when absent
    #[validate]
    pub selection: Option<Vec<Hyperslab>>,
    /// Byte order of the returned elements; native order when absent
    pub byte_order: Option<ByteOrder>,
}

/// Elements read from a variable.
#[derive(Debug)]
pub struct ArrayBuffer {
    /// Element bytes, row-major, 8-byte aligned
    pub data: Bytes,
    /// Element type
    pub element_type: ElementType,
    /// Shape of the selection
    pub shape: Vec<usize>,
    /// Byte order of the elements
    pub byte_order: ByteOrder,
}

impl ArrayBuffer {
    /// Returns the elements as a typed slice, without copying.
    ///
    /// `T` must match the element type; the byte order is not checked.
    pub fn values<T: zerocopy::FromBytes>(&self) -> Result<&[T], DmrppError> {
        crate::array::from_bytes(&self.data)
    }
}

/// Serde adapter storing bytes as a lowercase hex string.
pub(crate) mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(D::Error::custom)
    }
}
