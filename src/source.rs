//! The interface between the builder and a native format library.
//!
//! A [StorageSource] reports a file's variables and, for each one, how its bytes are laid out.
//! The builder turns those reports into chunk maps and never calls a native library itself.

use crate::chunk_map::Block;
use crate::error::DmrppError;
use crate::models::{Dimension, SourceFormat};
use crate::types::{ByteOrder, ElementType};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type of a variable as reported by the source.
///
/// Types without an [ElementType] (compounds, sequences, references) are kept by name so the
/// builder can skip them with a warning.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VariableType {
    Element(ElementType),
    Unsupported(String),
}

/// Value of a file or variable attribute.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Numbers(Vec<f64>),
    Text(String),
}

impl AttributeValue {
    /// Returns the value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text.trim_end_matches('\0')),
            _ => None,
        }
    }

    /// Returns the value as numbers. Text is split on commas and whitespace.
    pub fn as_numbers(&self) -> Option<Vec<f64>> {
        match self {
            AttributeValue::Number(number) => Some(vec![*number]),
            AttributeValue::Numbers(numbers) => Some(numbers.clone()),
            AttributeValue::Text(text) => text
                .trim_end_matches('\0')
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|field| !field.is_empty())
                .map(|field| field.parse().ok())
                .collect(),
        }
    }

    /// Returns the value as a single number.
    pub fn as_number(&self) -> Option<f64> {
        match self.as_numbers()?.as_slice() {
            [number] => Some(*number),
            _ => None,
        }
    }
}

/// Attributes by name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A variable as reported by the source.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VariableDescriptor {
    /// Fully qualified name
    pub name: String,
    /// Dimensions in storage order
    #[serde(default)]
    pub dims: Vec<Dimension>,
    /// Type of each element
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    /// Variable attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl VariableDescriptor {
    /// Returns the size of each dimension.
    pub fn shape(&self) -> Vec<u64> {
        self.dims.iter().map(|dim| dim.size).collect()
    }
}

/// A filter as identified by the native library.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NativeFilter {
    /// Native filter id
    pub id: u32,
    /// Native filter name
    #[serde(default)]
    pub name: String,
    /// Filter client data
    #[serde(default)]
    pub params: Vec<u32>,
}

/// One populated cell of a chunk grid.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChunkCell {
    /// Index of the cell in the chunk grid, not in element space
    pub grid_index: Vec<u64>,
    /// Blocks holding the cell's bytes, in order
    pub blocks: Vec<Block>,
}

/// How a variable's bytes are stored.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "layout")]
pub enum StorageRecord {
    /// A single byte range, possibly split into linked blocks
    Contiguous {
        blocks: Vec<Block>,
        #[serde(default)]
        filters: Vec<NativeFilter>,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
    },
    /// A regular grid of chunks
    Chunked {
        chunk_dims: Vec<u64>,
        #[serde(default)]
        filters: Vec<NativeFilter>,
        cells: Vec<ChunkCell>,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
    },
    /// Values held in the file's metadata
    Compact {
        #[serde(with = "crate::models::hex_bytes")]
        bytes: Vec<u8>,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
    },
    /// Anything the native library cannot describe as byte ranges
    Unsupported { reason: String },
}

/// A declared fill value as the native library reports it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeFill {
    /// Raw bytes of one element
    Bytes {
        #[serde(with = "crate::models::hex_bytes")]
        bytes: Vec<u8>,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
    },
    /// Textual value, for libraries that report fill values as attributes
    Text(String),
}

/// Storage source trait.
///
/// Implemented over a native format library, or over an inventory produced from one. Errors from
/// [StorageSource::variables] and [StorageSource::root_attributes] mean the source could not be
/// opened. Errors from the per-variable methods are local to that variable.
pub trait StorageSource: Sync {
    /// Identifier of the source, recorded in the manifest for later byte range fetches.
    fn source_identifier(&self) -> &str;

    /// Format family of the source.
    fn format(&self) -> SourceFormat;

    /// Variables of the source.
    fn variables(&self) -> Result<Vec<VariableDescriptor>, DmrppError>;

    /// File-level attributes.
    fn root_attributes(&self) -> Result<Attributes, DmrppError>;

    /// Storage layout of a variable.
    ///
    /// # Arguments
    ///
    /// * `variable`: Fully qualified variable name
    fn storage(&self, variable: &str) -> Result<StorageRecord, DmrppError>;

    /// Declared fill value of a variable, if any.
    ///
    /// # Arguments
    ///
    /// * `variable`: Fully qualified variable name
    fn fill_value(&self, variable: &str) -> Result<Option<NativeFill>, DmrppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_type_untagged() {
        let element: VariableType = serde_json::from_str(r#""float32""#).unwrap();
        assert_eq!(VariableType::Element(ElementType::Float32), element);
        let other: VariableType = serde_json::from_str(r#""compound""#).unwrap();
        assert_eq!(VariableType::Unsupported("compound".to_string()), other);
    }

    #[test]
    fn attribute_numbers() {
        let value: AttributeValue = serde_json::from_str("[1.5, -2]").unwrap();
        assert_eq!(Some(vec![1.5, -2.0]), value.as_numbers());
        assert_eq!(None, value.as_number());
        let value = AttributeValue::Text("-180000000.00, 90000000.00\0".to_string());
        assert_eq!(Some(vec![-180000000.0, 90000000.0]), value.as_numbers());
        let value = AttributeValue::Text("3600".to_string());
        assert_eq!(Some(3600.0), value.as_number());
        let value = AttributeValue::Text("GEO".to_string());
        assert_eq!(None, value.as_numbers());
        assert_eq!(Some("GEO"), value.as_text());
    }

    #[test]
    fn storage_record_from_json() {
        let record: StorageRecord = serde_json::from_str(
            r#"{
                "layout": "chunked",
                "chunk_dims": [2, 2],
                "filters": [{"id": 2}, {"id": 1, "name": "deflate", "params": [4]}],
                "cells": [{"grid_index": [1, 0], "blocks": [{"offset": 96, "length": 40}]}],
                "byte_order": "little"
            }"#,
        )
        .unwrap();
        match record {
            StorageRecord::Chunked {
                chunk_dims,
                filters,
                cells,
                byte_order,
            } => {
                assert_eq!(vec![2, 2], chunk_dims);
                assert_eq!(2, filters.len());
                assert_eq!(vec![4], filters[1].params);
                assert_eq!(vec![1, 0], cells[0].grid_index);
                assert_eq!(Block::new(96, 40), cells[0].blocks[0]);
                assert_eq!(Some(ByteOrder::Little), byte_order);
            }
            record => panic!("unexpected record {:?}", record),
        }
    }

    #[test]
    fn native_fill_forms() {
        let fill: NativeFill = serde_json::from_str(r#"{"text": "-9999"}"#).unwrap();
        assert_eq!(NativeFill::Text("-9999".to_string()), fill);
        let fill: NativeFill =
            serde_json::from_str(r#"{"bytes": {"bytes": "ffff", "byte_order": "big"}}"#).unwrap();
        assert_eq!(
            NativeFill::Bytes {
                bytes: vec![0xff, 0xff],
                byte_order: Some(ByteOrder::Big)
            },
            fill
        );
    }
}
