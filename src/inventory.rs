//! Storage source backed by a JSON layout inventory.
//!
//! The native format libraries are not linked into this crate. Instead, a walk of the file made
//! with them is recorded as two JSON documents next to the source:
//!
//! * a descriptor, `{ "attributes": {...}, "variables": [...] }`, giving the variables with
//!   their dimensions, types and attributes;
//! * a layout, `{ "variables": { name: { "storage": {...}, "fill_value": ... } } }`, giving the
//!   storage record and declared fill value of each variable.
//!
//! [InventorySource::open] checks the source file's signature before reading either document.

use crate::error::DmrppError;
use crate::models::SourceFormat;
use crate::source::{
    Attributes, NativeFill, StorageRecord, StorageSource, VariableDescriptor,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// HDF5 superblock signature.
pub const HDF5_SIGNATURE: [u8; 8] = *b"\x89HDF\r\n\x1a\n";

/// HDF4 file signature.
pub const HDF4_SIGNATURE: [u8; 4] = [0x0e, 0x03, 0x13, 0x01];

/// Offset of the first HDF5 superblock search position after 0.
const HDF5_USER_BLOCK_MIN: u64 = 512;

/// Variable and attribute structure of a source.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Descriptor {
    #[serde(default)]
    pub attributes: Attributes,
    pub variables: Vec<VariableDescriptor>,
}

/// Storage of one variable as reported by the native library.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LayoutEntry {
    pub storage: StorageRecord,
    #[serde(default)]
    pub fill_value: Option<NativeFill>,
}

/// Storage of every variable of a source.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Layout {
    pub variables: BTreeMap<String, LayoutEntry>,
}

/// Detect the format family of a file from its signature.
///
/// HDF5 files may carry a user block, so the HDF5 signature is searched at offset 0 and at
/// every power of two from 512 up to the file's length.
///
/// # Arguments
///
/// * `path`: Path of the source file
pub fn detect_format(path: &Path) -> Result<SourceFormat, DmrppError> {
    let open_failure = |reason: String| DmrppError::SourceOpenFailure {
        source_id: path.display().to_string(),
        reason,
    };
    let mut file = std::fs::File::open(path).map_err(|err| open_failure(err.to_string()))?;
    let length = file
        .metadata()
        .map_err(|err| open_failure(err.to_string()))?
        .len();

    let mut header = [0; 8];
    let mut read_at = |offset: u64, buf: &mut [u8]| -> std::io::Result<bool> {
        if offset + buf.len() as u64 > length {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(true)
    };
    let io_failure = |err: std::io::Error| open_failure(err.to_string());

    if read_at(0, &mut header[..4]).map_err(io_failure)? && header[..4] == HDF4_SIGNATURE {
        return Ok(SourceFormat::Hdf4);
    }
    let mut offset = 0;
    while offset + HDF5_SIGNATURE.len() as u64 <= length {
        if read_at(offset, &mut header).map_err(io_failure)? && header == HDF5_SIGNATURE {
            return Ok(SourceFormat::Hdf5);
        }
        offset = match offset {
            0 => HDF5_USER_BLOCK_MIN,
            offset => offset * 2,
        };
    }
    Err(open_failure("not an HDF4 or HDF5 file".to_string()))
}

fn read_json<T: serde::de::DeserializeOwned>(source_id: &str, path: &Path) -> Result<T, DmrppError> {
    let open_failure = |reason: String| DmrppError::SourceOpenFailure {
        source_id: source_id.to_string(),
        reason: format!("{}: {}", path.display(), reason),
    };
    let data = std::fs::read(path).map_err(|err| open_failure(err.to_string()))?;
    serde_json::from_slice(&data).map_err(|err| open_failure(err.to_string()))
}

/// A [StorageSource] reading a descriptor and layout inventory.
#[derive(Debug)]
pub struct InventorySource {
    identifier: String,
    format: SourceFormat,
    descriptor: Descriptor,
    layout: Layout,
}

impl InventorySource {
    /// Open a source file with its inventory.
    ///
    /// # Arguments
    ///
    /// * `source`: Path of the source file, whose signature is checked
    /// * `descriptor`: Path of the descriptor JSON
    /// * `layout`: Path of the layout JSON
    pub fn open(source: &Path, descriptor: &Path, layout: &Path) -> Result<Self, DmrppError> {
        let format = detect_format(source)?;
        let identifier = source.display().to_string();
        let descriptor = read_json(&identifier, descriptor)?;
        let layout = read_json(&identifier, layout)?;
        tracing::debug!("opened {} as {:?}", identifier, format);
        Ok(Self::new(identifier, format, descriptor, layout))
    }

    /// Create a source from an inventory already in memory.
    pub fn new(identifier: String, format: SourceFormat, descriptor: Descriptor, layout: Layout) -> Self {
        Self {
            identifier,
            format,
            descriptor,
            layout,
        }
    }

    fn entry(&self, variable: &str) -> Result<&LayoutEntry, DmrppError> {
        self.layout
            .variables
            .get(variable)
            .ok_or_else(|| DmrppError::VariableNotFound {
                source_id: self.identifier.clone(),
                variable: variable.to_string(),
            })
    }
}

impl StorageSource for InventorySource {
    fn source_identifier(&self) -> &str {
        &self.identifier
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    fn variables(&self) -> Result<Vec<VariableDescriptor>, DmrppError> {
        Ok(self.descriptor.variables.clone())
    }

    fn root_attributes(&self) -> Result<Attributes, DmrppError> {
        Ok(self.descriptor.attributes.clone())
    }

    fn storage(&self, variable: &str) -> Result<StorageRecord, DmrppError> {
        Ok(self.entry(variable)?.storage.clone())
    }

    fn fill_value(&self, variable: &str) -> Result<Option<NativeFill>, DmrppError> {
        Ok(self.entry(variable)?.fill_value.clone())
    }
}
