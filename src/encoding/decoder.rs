//! Reading BinaryCIF files back into typed columns

use super::data::ColumnData;
use super::encoders::{EncodedData, Encoding};
use super::writer::{BinaryCifFile, Category, Column, DataBlock};
use crate::error::{Result, VolsegError};
use crate::types::DataType;

/// Decode a numeric column.
pub fn decode(encoded: &EncodedData) -> Result<ColumnData> {
    decode_chain(&encoded.encoding, &encoded.data)
}

fn decode_chain(encoding: &[Encoding], bytes: &[u8]) -> Result<ColumnData> {
    let (last, rest) = encoding
        .split_last()
        .ok_or_else(|| VolsegError::Decode("column has no encoding".to_string()))?;
    let mut data = match last {
        Encoding::ByteArray { data_type } => ColumnData::from_le_bytes(bytes, *data_type)?,
        other => {
            return Err(VolsegError::Decode(format!(
                "numeric data must end with ByteArray, found {}",
                other.kind()
            )))
        }
    };
    for step in rest.iter().rev() {
        data = step.decode(data)?;
    }
    Ok(data)
}

/// Decode a text column.
pub fn decode_strings(encoded: &EncodedData) -> Result<Vec<String>> {
    let (data_encoding, string_data, offset_encoding, offsets) = match &encoded.encoding[..] {
        [Encoding::StringArray {
            data_encoding,
            string_data,
            offset_encoding,
            offsets,
        }] => (data_encoding, string_data, offset_encoding, offsets),
        _ => {
            return Err(VolsegError::Decode(
                "text column must use a single StringArray encoding".to_string(),
            ))
        }
    };

    let offsets = decode_chain(offset_encoding, offsets)?.to_i64_vec()?;
    let indices = decode_chain(data_encoding, &encoded.data)?.to_i64_vec()?;

    // Character offset to byte offset
    let mut byte_at: Vec<usize> = string_data.char_indices().map(|(i, _)| i).collect();
    byte_at.push(string_data.len());
    let byte_offset = |chars: i64| -> Result<usize> {
        usize::try_from(chars)
            .ok()
            .and_then(|c| byte_at.get(c).copied())
            .ok_or_else(|| VolsegError::Decode(format!("string offset {chars} out of range")))
    };

    let uniques = offsets
        .windows(2)
        .map(|w| {
            let (start, end) = (byte_offset(w[0])?, byte_offset(w[1])?);
            if start > end {
                return Err(VolsegError::Decode(format!(
                    "string offsets {} and {} are decreasing",
                    w[0], w[1]
                )));
            }
            Ok(string_data[start..end].to_string())
        })
        .collect::<Result<Vec<String>>>()?;

    indices
        .into_iter()
        .map(|i| {
            usize::try_from(i)
                .ok()
                .and_then(|i| uniques.get(i).cloned())
                .ok_or_else(|| VolsegError::Decode(format!("string index {i} out of range")))
        })
        .collect()
}

impl BinaryCifFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn block(&self, header: &str) -> Option<&DataBlock> {
        self.data_blocks.iter().find(|b| b.header == header)
    }
}

impl DataBlock {
    /// Look up a category by name, with or without the leading underscore.
    pub fn category(&self, name: &str) -> Option<&Category> {
        let name = name.trim_start_matches('_');
        self.categories
            .iter()
            .find(|c| c.name.trim_start_matches('_') == name)
    }
}

impl Category {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Decoded numeric values of a column that must exist.
    pub fn values(&self, name: &str) -> Result<ColumnData> {
        self.required(name)?.values()
    }

    /// Decoded text values of a column that must exist.
    pub fn strings(&self, name: &str) -> Result<Vec<String>> {
        self.required(name)?.strings()
    }

    fn required(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| VolsegError::NotFound(format!("column {}.{}", self.name, name)))
    }
}

impl Column {
    pub fn values(&self) -> Result<ColumnData> {
        let values = decode(&self.data)?;
        if let Some(mask) = &self.mask {
            let mask = decode(mask)?;
            if mask.len() != values.len() {
                return Err(VolsegError::Decode(format!(
                    "mask of column {} has {} rows, data has {}",
                    self.name,
                    mask.len(),
                    values.len()
                )));
            }
        }
        Ok(values)
    }

    pub fn strings(&self) -> Result<Vec<String>> {
        decode_strings(&self.data)
    }

    /// Element type after decoding, as declared by the outermost encoding.
    pub fn source_type(&self) -> Option<DataType> {
        match self.data.encoding.first()? {
            Encoding::ByteArray { data_type } => Some(*data_type),
            Encoding::FixedPoint { src_type, .. }
            | Encoding::IntervalQuantization { src_type, .. }
            | Encoding::RunLength { src_type, .. }
            | Encoding::Delta { src_type, .. } => Some(*src_type),
            Encoding::IntegerPacking { .. } => Some(DataType::Int32),
            Encoding::StringArray { .. } => None,
        }
    }
}
