//! Storage layout extractor.
//!
//! Walks the variables of a [StorageSource] and records, for each one, where its bytes live:
//! a chunk map for contiguous and chunked storage, the values themselves for compact storage,
//! or computed values for missing coordinates.

use crate::chunk_map::ChunkMap;
use crate::error::DmrppError;
use crate::models::{FilterKind, Manifest, Provenance, SourceFormat, Variable, VariableData};
use crate::source::{
    Attributes, NativeFill, NativeFilter, StorageRecord, StorageSource, VariableDescriptor,
    VariableType,
};
use crate::synthesis;
use crate::types::{ByteOrder, ElementType};

use rayon::prelude::*;
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Version recorded in manifests.
pub const BUILDER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Options controlling a build.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Record declared fill values
    pub capture_fill_values: bool,
    /// Compute missing coordinate variables; skip them otherwise
    pub synthesize_missing: bool,
    /// Provenance block to record in the manifest
    pub provenance: Option<Provenance>,
    /// Variables whose failure fails the whole build
    pub required: Vec<String>,
    /// Identifier to record instead of the source's own
    pub source_identifier: Option<String>,
    /// Build variables on the rayon thread pool
    pub parallel: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            capture_fill_values: true,
            synthesize_missing: true,
            provenance: None,
            required: Vec::new(),
            source_identifier: None,
            parallel: false,
        }
    }
}

/// A variable whose chunk map could not be built.
#[derive(Debug)]
pub struct VariableFailure {
    pub variable: String,
    pub error: DmrppError,
}

/// Result of a build that did not fail as a whole.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Manifest of every variable that was built
    pub manifest: Manifest,
    /// Variables that failed, in source order
    pub failures: Vec<VariableFailure>,
    /// Variables skipped with a warning, in source order
    pub skipped: Vec<String>,
}

/// Returns the current UTC time in RFC 3339 form.
pub fn now_rfc3339() -> Result<String, DmrppError> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

impl Provenance {
    /// Returns a provenance block created now by this version of the builder.
    ///
    /// # Arguments
    ///
    /// * `configuration`: Effective build options
    /// * `invocation`: Command line of the build
    pub fn now(configuration: &str, invocation: &str) -> Result<Self, DmrppError> {
        Ok(Self {
            created: now_rfc3339()?,
            build_dmrpp_version: BUILDER_VERSION.to_string(),
            configuration: configuration.to_string(),
            invocation: invocation.to_string(),
        })
    }
}

/// Map a native filter to a [FilterKind].
///
/// HDF5 identifies deflate, shuffle and fletcher32 as 1, 2 and 3. HDF4 identifies deflate as 4.
/// Any other filter fails the variable.
///
/// # Arguments
///
/// * `format`: Format family of the source
/// * `variable`: Variable name, for errors
/// * `filter`: Native filter
pub fn filter_kind(
    format: SourceFormat,
    variable: &str,
    filter: &NativeFilter,
) -> Result<FilterKind, DmrppError> {
    match (format, filter.id) {
        (SourceFormat::Hdf5, 1) | (SourceFormat::Hdf4, 4) => Ok(FilterKind::Deflate {
            level: filter.params.first().copied(),
        }),
        (SourceFormat::Hdf5, 2) => Ok(FilterKind::Shuffle),
        (SourceFormat::Hdf5, 3) => Ok(FilterKind::Fletcher32),
        (_, id) => Err(DmrppError::UnsupportedFilter {
            variable: variable.to_string(),
            id,
            name: filter.name.clone(),
        }),
    }
}

/// Builds manifests from storage sources.
#[derive(Debug, Default)]
pub struct StorageLayoutExtractor {
    options: BuildOptions,
}

impl StorageLayoutExtractor {
    /// Create a new extractor.
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    /// Build the manifest of a source.
    ///
    /// Failing to open the source fails the build. A failure local to one variable is recorded
    /// in [BuildOutcome::failures] and the build continues, unless that variable is required.
    ///
    /// # Arguments
    ///
    /// * `source`: Storage source
    #[tracing::instrument(level = "DEBUG", skip_all, fields(source = source.source_identifier()))]
    pub fn build<S: StorageSource>(&self, source: &S) -> Result<BuildOutcome, DmrppError> {
        let open_failure = |err: DmrppError| match err {
            DmrppError::SourceOpenFailure { .. } => err,
            err => DmrppError::SourceOpenFailure {
                source_id: source.source_identifier().to_string(),
                reason: err.to_string(),
            },
        };
        let descriptors = source.variables().map_err(open_failure)?;
        let root_attributes = source.root_attributes().map_err(open_failure)?;

        let build_one = |descriptor: &VariableDescriptor| {
            (
                descriptor.name.clone(),
                self.build_variable(source, &root_attributes, descriptor),
            )
        };
        let results: Vec<_> = if self.options.parallel {
            descriptors.par_iter().map(build_one).collect()
        } else {
            descriptors.iter().map(build_one).collect()
        };

        let mut variables = BTreeMap::new();
        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        for (name, result) in results {
            match result {
                Ok(Some(variable)) => {
                    variables.insert(name, variable);
                }
                Ok(None) => skipped.push(name),
                Err(error) if self.options.required.contains(&name) => {
                    tracing::error!("required variable {} failed: {}", name, error);
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!("variable {} failed: {}", name, error);
                    failures.push(VariableFailure {
                        variable: name,
                        error,
                    });
                }
            }
        }
        for name in &self.options.required {
            if !variables.contains_key(name) {
                return Err(match skipped.contains(name) {
                    true => DmrppError::UnsupportedLayout {
                        variable: name.clone(),
                        reason: "the variable was skipped".to_string(),
                    },
                    false => DmrppError::VariableNotFound {
                        source_id: source.source_identifier().to_string(),
                        variable: name.clone(),
                    },
                });
            }
        }

        let source_file_identifier = self
            .options
            .source_identifier
            .clone()
            .unwrap_or_else(|| source.source_identifier().to_string());
        tracing::info!(
            "built {} variables of {} ({} failed, {} skipped)",
            variables.len(),
            source_file_identifier,
            failures.len(),
            skipped.len()
        );
        Ok(BuildOutcome {
            manifest: Manifest {
                source_file_identifier,
                format: source.format(),
                build_timestamp: now_rfc3339()?,
                builder_version: BUILDER_VERSION.to_string(),
                variables,
                build_dmrpp_metadata: self.options.provenance.clone(),
            },
            failures,
            skipped,
        })
    }

    /// Build one variable, or return `None` to skip it.
    fn build_variable<S: StorageSource>(
        &self,
        source: &S,
        root_attributes: &Attributes,
        descriptor: &VariableDescriptor,
    ) -> Result<Option<Variable>, DmrppError> {
        let name = descriptor.name.as_str();
        let element_type = match &descriptor.variable_type {
            VariableType::Element(element_type) => *element_type,
            VariableType::Unsupported(type_name) => {
                tracing::warn!("skipping variable {} of unsupported type {}", name, type_name);
                return Ok(None);
            }
        };
        let shape = descriptor.shape();
        if shape.contains(&0) {
            tracing::warn!("skipping variable {} with empty extent {:?}", name, shape);
            return Ok(None);
        }
        let variable = |storage| Variable {
            name: name.to_string(),
            dims: descriptor.dims.clone(),
            element_type,
            storage,
        };

        if let Some(axis) = synthesis::missing_coordinate(&descriptor.attributes) {
            if !self.options.synthesize_missing {
                tracing::warn!("skipping missing coordinate variable {}", name);
                return Ok(None);
            }
            let values = synthesis::synthesize(
                name,
                element_type,
                &shape,
                axis,
                &descriptor.attributes,
                root_attributes,
            )?;
            tracing::debug!("synthesized {} values for {}", shape[0], name);
            return Ok(Some(variable(VariableData::Synthesized { values })));
        }

        let byte_order_of = |byte_order: Option<ByteOrder>| {
            byte_order.filter(|_| element_type.is_byte_order_sensitive())
        };
        let mut map = match source.storage(name)? {
            StorageRecord::Compact { bytes, byte_order } => {
                let expected = shape.iter().product::<u64>() * element_type.size_of() as u64;
                if bytes.len() as u64 != expected {
                    return Err(DmrppError::UnsupportedLayout {
                        variable: name.to_string(),
                        reason: format!(
                            "compact data holds {} bytes, {} expected",
                            bytes.len(),
                            expected
                        ),
                    });
                }
                return Ok(Some(variable(VariableData::Inline {
                    values: bytes,
                    byte_order: byte_order_of(byte_order),
                })));
            }
            StorageRecord::Contiguous {
                blocks,
                filters,
                byte_order,
            } => {
                let mut map = ChunkMap::contiguous(self.filters(source.format(), name, &filters)?);
                if blocks.iter().any(|block| block.length > 0) {
                    map.add_chunk(vec![0; shape.len()], blocks, byte_order_of(byte_order))?;
                }
                map
            }
            StorageRecord::Chunked {
                chunk_dims,
                filters,
                cells,
                byte_order,
            } => {
                if chunk_dims.len() != shape.len() || chunk_dims.contains(&0) {
                    return Err(DmrppError::UnsupportedLayout {
                        variable: name.to_string(),
                        reason: format!(
                            "chunk shape {:?} does not fit shape {:?}",
                            chunk_dims, shape
                        ),
                    });
                }
                let mut map =
                    ChunkMap::chunked(chunk_dims, self.filters(source.format(), name, &filters)?);
                let grid = map.grid_shape(&shape);
                for cell in cells {
                    let inside = cell.grid_index.len() == grid.len()
                        && std::iter::zip(&cell.grid_index, &grid).all(|(index, size)| index < size);
                    if !inside {
                        return Err(DmrppError::InvalidChunk {
                            position: cell.grid_index,
                            reason: format!("outside chunk grid {:?}", grid),
                        });
                    }
                    let origin = map.origin_of_cell(&cell.grid_index);
                    map.add_chunk(origin, cell.blocks, byte_order_of(byte_order))?;
                }
                if map.multi_block {
                    tracing::debug!("variable {} has chunks in linked blocks", name);
                }
                map
            }
            StorageRecord::Unsupported { reason } => {
                return Err(DmrppError::UnsupportedLayout {
                    variable: name.to_string(),
                    reason,
                })
            }
        };

        if self.options.capture_fill_values {
            map.fill_value = source
                .fill_value(name)?
                .map(|fill| canonical_fill(element_type, fill))
                .transpose()?;
        }
        tracing::debug!(
            "variable {}: {} of {} chunks stored",
            name,
            map.chunks.len(),
            map.grid_cell_count(&shape)
        );
        Ok(Some(variable(VariableData::Chunks(map))))
    }

    fn filters(
        &self,
        format: SourceFormat,
        variable: &str,
        filters: &[NativeFilter],
    ) -> Result<Vec<FilterKind>, DmrppError> {
        filters
            .iter()
            .map(|filter| filter_kind(format, variable, filter))
            .collect()
    }
}

/// Returns the canonical string of a declared fill value.
fn canonical_fill(element_type: ElementType, fill: NativeFill) -> Result<String, DmrppError> {
    match fill {
        NativeFill::Text(text) => element_type.canonical_fill(&text),
        NativeFill::Bytes { bytes, byte_order } => {
            element_type.canonical_from_native(&bytes, byte_order)
        }
    }
}
