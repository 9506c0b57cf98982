//! Pyramid build configuration
//!
//! A [`BuildConfig`] is usually loaded from JSON; every field has a default
//! so a partial document is enough. Invalid combinations are reported by
//! [`BuildConfig::validate`] before anything is written.

use crate::compression::StorageCompression;
use crate::error::{Result, VolsegError};
use crate::quantization::QuantizationDtype;
use crate::types::DataType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Levels are never halved below this many voxels.
pub const DEFAULT_MIN_GRID_SIZE: usize = 100 * 100 * 100;

/// Levels are never halved once smaller than this on disk.
pub const DEFAULT_MIN_DOWNSAMPLED_FILE_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Which downsampling levels are computed and which are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownsamplingParams {
    /// Smallest ratio to keep (power of two)
    pub min_downsampling_level: Option<u32>,
    /// Largest ratio to compute (power of two)
    pub max_downsampling_level: Option<u32>,
    /// Drop ratio 1 once the pyramid is built
    pub remove_original_resolution: bool,
    /// Levels bigger than this are computed but not kept
    pub max_size_per_downsampling_lvl_mb: Option<f64>,
    pub min_grid_size: usize,
    pub min_downsampled_file_size_bytes: usize,
}

impl Default for DownsamplingParams {
    fn default() -> Self {
        Self {
            min_downsampling_level: None,
            max_downsampling_level: None,
            remove_original_resolution: false,
            max_size_per_downsampling_lvl_mb: None,
            min_grid_size: DEFAULT_MIN_GRID_SIZE,
            min_downsampled_file_size_bytes: DEFAULT_MIN_DOWNSAMPLED_FILE_SIZE_BYTES,
        }
    }
}

impl DownsamplingParams {
    pub fn validate(&self) -> Result<()> {
        for (name, level) in [
            ("min_downsampling_level", self.min_downsampling_level),
            ("max_downsampling_level", self.max_downsampling_level),
        ] {
            if let Some(level) = level {
                if !level.is_power_of_two() {
                    return Err(VolsegError::Configuration(format!(
                        "{name} must be a power of two, got {level}"
                    )));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_downsampling_level, self.max_downsampling_level)
        {
            if min > max {
                return Err(VolsegError::Configuration(format!(
                    "min_downsampling_level {min} exceeds max_downsampling_level {max}"
                )));
            }
        }
        if let Some(mb) = self.max_size_per_downsampling_lvl_mb {
            if !(mb > 0.0) {
                return Err(VolsegError::Configuration(format!(
                    "max_size_per_downsampling_lvl_mb must be positive, got {mb}"
                )));
            }
        }
        if self.remove_original_resolution && self.max_downsampling_level == Some(1) {
            return Err(VolsegError::Configuration(
                "removing the original resolution leaves no level when max_downsampling_level is 1"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Log-domain quantization of volume levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    pub dtype: QuantizationDtype,
    /// Ratios to quantize; `None` quantizes every kept level
    #[serde(default)]
    pub levels: Option<Vec<u32>>,
}

impl QuantizationParams {
    pub fn applies_to(&self, ratio: u32) -> bool {
        self.levels.as_ref().map_or(true, |l| l.contains(&ratio))
    }
}

/// Full configuration of an entry build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub downsampling: DownsamplingParams,
    pub quantization: Option<QuantizationParams>,
    /// Storage type of volume levels; `None` keeps the source type
    pub volume_storage_dtype: Option<DataType>,
    pub compression: StorageCompression,
    /// Worker threads for independent lattices/channels/time frames;
    /// `None` uses one per core
    pub workers: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            downsampling: DownsamplingParams::default(),
            quantization: None,
            volume_storage_dtype: None,
            compression: StorageCompression::default(),
            workers: None,
        }
    }
}

impl BuildConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BuildConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.downsampling.validate()?;
        if let Some(q) = &self.quantization {
            if let Some(levels) = &q.levels {
                if let Some(bad) = levels.iter().find(|l| !l.is_power_of_two()) {
                    return Err(VolsegError::Configuration(format!(
                        "quantization level {bad} is not a power of two"
                    )));
                }
            }
        }
        if let Some(dtype) = self.volume_storage_dtype {
            if dtype == DataType::Int32 || dtype == DataType::Uint32 {
                return Err(VolsegError::Configuration(format!(
                    "{dtype} is not a volume storage type"
                )));
            }
        }
        if self.workers == Some(0) {
            return Err(VolsegError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
