//! BinaryCIF container and writer
//!
//! The container is a MessagePack map:
//! `{version, encoder, dataBlocks: [{header, categories: [{name, rowCount,
//! columns: [{name, data: {encoding, data}, mask}]}]}]}`.

use super::data::ColumnData;
use super::encoders::{EncodedData, Encoding, EncodingStep};
use super::pipeline::{encode_column, EncodingPolicy, Pipeline};
use crate::error::{Result, VolsegError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// BinaryCIF format version written into every file
pub const BINARY_CIF_VERSION: &str = "0.3.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryCifFile {
    pub version: String,
    pub encoder: String,
    pub data_blocks: Vec<DataBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBlock {
    pub header: String,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Category name including the leading underscore
    pub name: String,
    pub row_count: usize,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: EncodedData,
    pub mask: Option<EncodedData>,
}

/// Collects the columns of one category; every column must have the same
/// number of rows.
#[derive(Debug, Clone)]
pub struct CategoryBuilder {
    name: String,
    policy: EncodingPolicy,
    row_count: Option<usize>,
    columns: Vec<Column>,
}

impl CategoryBuilder {
    /// `name` without the leading underscore.
    pub fn new(name: &str, policy: EncodingPolicy) -> Self {
        Self {
            name: format!("_{}", name.trim_start_matches('_')),
            policy,
            row_count: None,
            columns: Vec::new(),
        }
    }

    fn check_rows(&mut self, column: &str, rows: usize) -> Result<()> {
        match self.row_count {
            Some(expected) if expected != rows => Err(VolsegError::InvalidDimensions(format!(
                "column {}.{} has {rows} rows, the category has {expected}",
                self.name, column
            ))),
            _ => {
                self.row_count = Some(rows);
                Ok(())
            }
        }
    }

    /// Add a column encoded with the automatically chosen pipeline.
    pub fn column(mut self, name: &str, data: ColumnData) -> Result<Self> {
        self.check_rows(name, data.len())?;
        let encoded = encode_column(&data, &self.policy)?;
        self.push(name, encoded);
        Ok(self)
    }

    /// Add a column encoded with an explicit pipeline.
    pub fn column_with(mut self, name: &str, data: ColumnData, pipeline: &Pipeline) -> Result<Self> {
        self.check_rows(name, data.len())?;
        let encoded = pipeline.encode(&data)?;
        self.push(name, encoded);
        Ok(self)
    }

    /// Add a text column.
    pub fn string_column<S: AsRef<str>>(mut self, name: &str, values: &[S]) -> Result<Self> {
        self.check_rows(name, values.len())?;
        let encoded = encode_strings(values)?;
        self.push(name, encoded);
        Ok(self)
    }

    fn push(&mut self, name: &str, data: EncodedData) {
        self.columns.push(Column {
            name: name.to_string(),
            data,
            mask: None,
        });
    }

    pub fn build(self) -> Category {
        Category {
            name: self.name,
            row_count: self.row_count.unwrap_or(0),
            columns: self.columns,
        }
    }
}

/// Encode strings as unique values plus an index column.
pub fn encode_strings<S: AsRef<str>>(values: &[S]) -> Result<EncodedData> {
    let mut lookup: HashMap<&str, i32> = HashMap::new();
    let mut string_data = String::new();
    // Offsets count characters, not bytes
    let mut offsets: Vec<i32> = vec![0];
    let mut chars = 0i64;
    let mut indices: Vec<i32> = Vec::with_capacity(values.len());

    for value in values {
        let value = value.as_ref();
        let index = match lookup.get(value) {
            Some(&index) => index,
            None => {
                let index = i32::try_from(lookup.len()).map_err(|_| {
                    VolsegError::EncoderRange("too many distinct strings".to_string())
                })?;
                string_data.push_str(value);
                chars += value.chars().count() as i64;
                offsets.push(i32::try_from(chars).map_err(|_| {
                    VolsegError::EncoderRange("string data exceeds Int32 offsets".to_string())
                })?);
                lookup.insert(value, index);
                index
            }
        };
        indices.push(index);
    }

    let offset_pipeline = Pipeline::new(vec![EncodingStep::Delta, EncodingStep::IntegerPacking]);
    let index_pipeline = Pipeline::new(vec![
        EncodingStep::Delta,
        EncodingStep::RunLength,
        EncodingStep::IntegerPacking,
    ]);
    let offsets = offset_pipeline.encode(&ColumnData::Int32(offsets))?;
    let indices = index_pipeline.encode(&ColumnData::Int32(indices))?;

    Ok(EncodedData {
        encoding: vec![Encoding::StringArray {
            data_encoding: indices.encoding,
            string_data,
            offset_encoding: offsets.encoding,
            offsets: offsets.data,
        }],
        data: indices.data,
    })
}

/// Accumulates data blocks and serializes them to MessagePack.
#[derive(Debug, Clone)]
pub struct CifWriter {
    encoder: String,
    blocks: Vec<DataBlock>,
}

impl CifWriter {
    pub fn new(encoder: impl Into<String>) -> Self {
        Self {
            encoder: encoder.into(),
            blocks: Vec::new(),
        }
    }

    pub fn start_data_block(&mut self, header: impl Into<String>) {
        self.blocks.push(DataBlock {
            header: header.into(),
            categories: Vec::new(),
        });
    }

    /// Append a category to the current data block.
    pub fn write_category(&mut self, category: Category) -> Result<()> {
        let block = self.blocks.last_mut().ok_or_else(|| {
            VolsegError::Serialization(format!(
                "category {} written before any data block",
                category.name
            ))
        })?;
        debug!(
            block = %block.header,
            category = %category.name,
            rows = category.row_count,
            "writing category"
        );
        block.categories.push(category);
        Ok(())
    }

    pub fn into_file(self) -> BinaryCifFile {
        BinaryCifFile {
            version: BINARY_CIF_VERSION.to_string(),
            encoder: self.encoder,
            data_blocks: self.blocks,
        }
    }

    /// Serialize everything written so far.
    pub fn encode(self) -> Result<Bytes> {
        let file = self.into_file();
        Ok(Bytes::from(rmp_serde::to_vec_named(&file)?))
    }
}

/// Encoder name written into files produced by this crate
pub fn default_encoder_name() -> String {
    format!("volseg {}", env!("CARGO_PKG_VERSION"))
}
