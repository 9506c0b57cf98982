//! Compression of persisted level payloads
//!
//! Every stored blob starts with a one-byte method tag so a reader never
//! needs to know which method the writer was configured with.

use crate::error::{Result, VolsegError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

const DEFLATE_LEVEL: u32 = 6;
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to grid payloads in the pyramid store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StorageCompression {
    None = 0,
    Deflate = 1,
    #[default]
    Zstd = 3,
}

impl StorageCompression {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StorageCompression::None),
            1 => Some(StorageCompression::Deflate),
            3 => Some(StorageCompression::Zstd),
            _ => None,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            StorageCompression::None => Ok(data.to_vec()),
            StorageCompression::Deflate => {
                let mut encoder = DeflateEncoder::new(data, FlateCompression::new(DEFLATE_LEVEL));
                let mut compressed = Vec::new();
                encoder
                    .read_to_end(&mut compressed)
                    .map_err(|e| VolsegError::Compression(e.to_string()))?;
                Ok(compressed)
            }
            StorageCompression::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| VolsegError::Compression(e.to_string())),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            StorageCompression::None => Ok(data.to_vec()),
            StorageCompression::Deflate => {
                let mut decoder = DeflateDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| VolsegError::Decompression(e.to_string()))?;
                Ok(out)
            }
            StorageCompression::Zstd => {
                zstd::decode_all(data).map_err(|e| VolsegError::Decompression(e.to_string()))
            }
        }
    }
}

/// Compress `data` and prefix it with the method tag.
pub fn pack_payload(method: StorageCompression, data: &[u8]) -> Result<Vec<u8>> {
    let body = method.compress(data)?;
    let mut blob = Vec::with_capacity(body.len() + 1);
    blob.push(method as u8);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Undo [`pack_payload`].
pub fn unpack_payload(blob: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = blob
        .split_first()
        .ok_or_else(|| VolsegError::Decompression("empty payload".to_string()))?;
    let method = StorageCompression::from_u8(tag).ok_or_else(|| {
        VolsegError::Decompression(format!("unknown compression tag {tag}"))
    })?;
    method.decompress(body)
}
