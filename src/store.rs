//! Persisted pyramid levels
//!
//! Layout under an entry's storage location:
//!
//! ```text
//! metadata.json
//! volume/{ratio}/{timeframe}/{channel}/grid.bin
//! volume/{ratio}/{timeframe}/{channel}/quantization.json
//! segmentation/{lattice}/{ratio}/{timeframe}/{channel}/grid.bin
//! segmentation/{lattice}/{ratio}/{timeframe}/set_table.json
//! ```
//!
//! Grid payloads are bincode-encoded arrays behind a one-byte compression tag.

use crate::compression::{pack_payload, unpack_payload, StorageCompression};
use crate::error::{Result, VolsegError};
use crate::grid::GridData;
use crate::io::{create_io_manager, IOManager};
use crate::metadata::{EntryMetadata, FormatVersion, SamplingInfo};
use crate::quantization::QuantizationDescriptor;
use crate::set_table::SetTable;
use crate::utils::{format_bytes, grid_path, quantization_path, set_table_path};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// File holding the entry metadata
pub const METADATA_PATH: &str = "metadata.json";

/// Channel id of every segmentation lattice level
pub const LATTICE_CHANNEL: &str = "0";

/// Which grid family a level belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GridFamily {
    /// The continuous volume channels
    Volume,
    /// A segmentation lattice, by id
    Segmentation(String),
}

impl GridFamily {
    pub fn segmentation(id: impl Into<String>) -> Self {
        GridFamily::Segmentation(id.into())
    }

    /// Storage prefix of the family.
    pub fn storage_key(&self) -> String {
        match self {
            GridFamily::Volume => "volume".to_string(),
            GridFamily::Segmentation(id) => format!("segmentation/{id}"),
        }
    }

    pub fn sampling<'a>(&self, metadata: &'a EntryMetadata) -> Result<&'a SamplingInfo> {
        match self {
            GridFamily::Volume => Ok(&metadata.volumes()?.sampling),
            GridFamily::Segmentation(id) => Ok(&metadata.lattice(id)?.sampling),
        }
    }

    pub fn sampling_mut<'a>(&self, metadata: &'a mut EntryMetadata) -> Result<&'a mut SamplingInfo> {
        let entry = metadata.entry_id.clone();
        match self {
            GridFamily::Volume => metadata
                .volumes
                .as_mut()
                .map(|v| &mut v.sampling)
                .ok_or_else(|| VolsegError::NotFound(format!("volume data of entry {entry}"))),
            GridFamily::Segmentation(id) => metadata
                .segmentation_lattices
                .get_mut(id)
                .map(|l| &mut l.sampling)
                .ok_or_else(|| {
                    VolsegError::NotFound(format!("segmentation lattice {id} of entry {entry}"))
                }),
        }
    }
}

impl fmt::Display for GridFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridFamily::Volume => write!(f, "volume"),
            GridFamily::Segmentation(id) => write!(f, "segmentation lattice {id}"),
        }
    }
}

/// Storage collaborator of the pyramid builder and the query service.
#[async_trait]
pub trait PyramidStore: Send + Sync {
    async fn read_level(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
        channel: &str,
    ) -> Result<GridData>;

    async fn read_set_table(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
    ) -> Result<SetTable>;

    /// Write one level. Segmentation levels pass their set table, which is
    /// written before the grid so a visible grid always has its table.
    async fn write_level(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
        channel: &str,
        grid: &GridData,
        set_table: Option<&SetTable>,
    ) -> Result<()>;

    /// Descriptor of a quantized volume level, `None` for raw levels.
    async fn read_quantization(
        &self,
        ratio: u32,
        timeframe: u32,
        channel: &str,
    ) -> Result<Option<QuantizationDescriptor>>;

    async fn write_quantization(
        &self,
        ratio: u32,
        timeframe: u32,
        channel: &str,
        descriptor: &QuantizationDescriptor,
    ) -> Result<()>;

    async fn entry_metadata(&self) -> Result<EntryMetadata>;

    async fn write_metadata(&self, metadata: &EntryMetadata) -> Result<()>;

    /// Mark `ratio` unavailable for `family` and delete its data.
    async fn remove_level(&self, family: &GridFamily, ratio: u32) -> Result<()>;

    /// Read one level for several channels concurrently.
    async fn read_channels(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
        channels: &[String],
    ) -> Result<Vec<GridData>> {
        try_join_all(
            channels
                .iter()
                .map(|channel| self.read_level(family, ratio, timeframe, channel)),
        )
        .await
    }
}

/// [`PyramidStore`] over any [`IOManager`]
pub struct IoPyramidStore {
    io: Arc<dyn IOManager>,
    compression: StorageCompression,
}

impl IoPyramidStore {
    pub fn new(io: Arc<dyn IOManager>, compression: StorageCompression) -> Self {
        Self { io, compression }
    }

    /// Open the store behind a `file://` or `memory://` URL.
    pub async fn open(url: &str, compression: StorageCompression) -> Result<Self> {
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(url).await?);
        Ok(Self::new(io, compression))
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.io
    }

    /// Delete every object under `prefix`, returning how many were removed.
    async fn delete_tree(&self, prefix: &str) -> Result<usize> {
        let mut pending = vec![prefix.to_string()];
        let mut deleted = 0;
        while let Some(dir) = pending.pop() {
            for child in self.io.list(&dir).await? {
                let path = format!("{dir}/{child}");
                if self.io.list(&path).await?.is_empty() {
                    self.io.delete(&path).await?;
                    deleted += 1;
                } else {
                    pending.push(path);
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl PyramidStore for IoPyramidStore {
    async fn read_level(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
        channel: &str,
    ) -> Result<GridData> {
        let path = grid_path(&family.storage_key(), ratio, timeframe, channel);
        let blob = self.io.read(&path).await?;
        let raw = unpack_payload(&blob)?;
        Ok(bincode::deserialize(&raw)?)
    }

    async fn read_set_table(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
    ) -> Result<SetTable> {
        let path = set_table_path(&family.storage_key(), ratio, timeframe);
        SetTable::from_json(&self.io.read(&path).await?)
    }

    #[instrument(level = "debug", skip(self, family, grid, set_table), fields(family = %family))]
    async fn write_level(
        &self,
        family: &GridFamily,
        ratio: u32,
        timeframe: u32,
        channel: &str,
        grid: &GridData,
        set_table: Option<&SetTable>,
    ) -> Result<()> {
        let key = family.storage_key();
        if let Some(table) = set_table {
            self.io
                .write(&set_table_path(&key, ratio, timeframe), &table.to_json()?)
                .await?;
        }
        let raw = bincode::serialize(grid)?;
        let blob = pack_payload(self.compression, &raw)?;
        debug!(
            raw = %format_bytes(raw.len()),
            stored = %format_bytes(blob.len()),
            "writing level"
        );
        self.io
            .write(&grid_path(&key, ratio, timeframe, channel), &blob)
            .await
    }

    async fn read_quantization(
        &self,
        ratio: u32,
        timeframe: u32,
        channel: &str,
    ) -> Result<Option<QuantizationDescriptor>> {
        let path = quantization_path(&GridFamily::Volume.storage_key(), ratio, timeframe, channel);
        if !self.io.exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.io.read(&path).await?)?))
    }

    async fn write_quantization(
        &self,
        ratio: u32,
        timeframe: u32,
        channel: &str,
        descriptor: &QuantizationDescriptor,
    ) -> Result<()> {
        let path = quantization_path(&GridFamily::Volume.storage_key(), ratio, timeframe, channel);
        self.io
            .write(&path, &serde_json::to_vec_pretty(descriptor)?)
            .await
    }

    async fn entry_metadata(&self) -> Result<EntryMetadata> {
        let bytes = self.io.read(METADATA_PATH).await?;
        let metadata: EntryMetadata = serde_json::from_slice(&bytes)?;
        if !metadata.version.is_compatible(&FormatVersion::CURRENT) {
            return Err(VolsegError::Integrity(format!(
                "entry {} has format {}.{}, expected {}.x",
                metadata.entry_id,
                metadata.version.major,
                metadata.version.minor,
                FormatVersion::CURRENT.major
            )));
        }
        Ok(metadata)
    }

    async fn write_metadata(&self, metadata: &EntryMetadata) -> Result<()> {
        self.io
            .write(METADATA_PATH, &serde_json::to_vec_pretty(metadata)?)
            .await
    }

    #[instrument(level = "info", skip(self, family), fields(family = %family))]
    async fn remove_level(&self, family: &GridFamily, ratio: u32) -> Result<()> {
        let mut metadata = self.entry_metadata().await?;
        family.sampling_mut(&mut metadata)?.mark_unavailable(ratio)?;
        metadata.touch();
        // Unpublish first: a reader that sees the level listed can still read it
        self.write_metadata(&metadata).await?;

        let prefix = format!("{}/{}", family.storage_key(), ratio);
        let deleted = self.delete_tree(&prefix).await?;
        info!(ratio, deleted, "removed downsampling level");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileSystemIOManager, InMemoryIOManager};
    use crate::metadata::{DownsamplingLevelRecord, LatticeMetadata, TimeInfo};
    use crate::quantization::{quantize, QuantizationDtype};
    use ndarray::Array3;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn memory_store() -> IoPyramidStore {
        IoPyramidStore::new(Arc::new(InMemoryIOManager::new()), StorageCompression::Zstd)
    }

    #[tokio::test]
    async fn test_level_round_trip() {
        let store = memory_store();
        let family = GridFamily::Volume;
        let grid = GridData::from(Array3::from_shape_fn((3, 4, 5), |(x, y, z)| {
            (x * 100 + y * 10 + z) as f32
        }));
        store.write_level(&family, 1, 0, "0", &grid, None).await.unwrap();
        assert_eq!(store.read_level(&family, 1, 0, "0").await.unwrap(), grid);
        assert!(matches!(
            store.read_level(&family, 2, 0, "0").await,
            Err(VolsegError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_segmentation_level_with_table() {
        let temp_dir = TempDir::new().unwrap();
        let store = IoPyramidStore::new(
            Arc::new(FileSystemIOManager::new(temp_dir.path())),
            StorageCompression::Deflate,
        );
        let family = GridFamily::segmentation("0");
        let mut table = SetTable::from_labels([1, 2]);
        let both = table.resolve_category(&[1, 2]).unwrap();
        let grid = GridData::from(Array3::from_elem((2, 2, 2), both));

        store
            .write_level(&family, 2, 0, "0", &grid, Some(&table))
            .await
            .unwrap();
        assert_eq!(store.read_level(&family, 2, 0, "0").await.unwrap(), grid);
        assert_eq!(store.read_set_table(&family, 2, 0).await.unwrap(), table);
        assert!(temp_dir
            .path()
            .join("segmentation/0/2/0/set_table.json")
            .exists());
    }

    #[tokio::test]
    async fn test_quantization_descriptor() {
        let store = memory_store();
        assert_eq!(store.read_quantization(1, 0, "0").await.unwrap(), None);
        let grid = GridData::from(Array3::from_shape_fn((4, 4, 4), |(x, _, _)| x as f32));
        let (_, descriptor) = quantize(&grid, QuantizationDtype::U8).unwrap();
        store.write_quantization(1, 0, "0", &descriptor).await.unwrap();
        assert_eq!(store.read_quantization(1, 0, "0").await.unwrap(), Some(descriptor));
    }

    #[tokio::test]
    async fn test_read_channels() {
        let store = memory_store();
        let family = GridFamily::Volume;
        for (i, channel) in ["a", "b"].iter().enumerate() {
            let grid = GridData::from(Array3::from_elem((1, 1, 1), i as u8));
            store.write_level(&family, 1, 0, channel, &grid, None).await.unwrap();
        }
        let channels = vec!["a".to_string(), "b".to_string()];
        let grids = store.read_channels(&family, 1, 0, &channels).await.unwrap();
        assert_eq!(grids[1], GridData::from(Array3::from_elem((1, 1, 1), 1u8)));
    }

    #[tokio::test]
    async fn test_remove_level() {
        let store = memory_store();
        let family = GridFamily::segmentation("mask");
        let mut metadata = EntryMetadata::new("entry");
        metadata.segmentation_lattices.insert(
            "mask".to_string(),
            LatticeMetadata {
                sampling: SamplingInfo {
                    spatial_downsampling_levels: vec![
                        DownsamplingLevelRecord { level: 1, available: true },
                        DownsamplingLevelRecord { level: 2, available: true },
                    ],
                    boxes: BTreeMap::new(),
                    time_info: TimeInfo::single(),
                },
            },
        );
        store.write_metadata(&metadata).await.unwrap();

        let table = SetTable::from_labels([4]);
        let grid = GridData::from(Array3::from_elem((2, 2, 2), 1u32));
        for ratio in [1, 2] {
            store
                .write_level(&family, ratio, 0, "0", &grid, Some(&table))
                .await
                .unwrap();
        }

        store.remove_level(&family, 1).await.unwrap();
        let metadata = store.entry_metadata().await.unwrap();
        assert_eq!(metadata.lattice("mask").unwrap().sampling.available_ratios(), vec![2]);
        assert_eq!(metadata.lattice("mask").unwrap().sampling.spatial_downsampling_levels.len(), 2);
        assert!(store.read_level(&family, 1, 0, "0").await.is_err());
        assert!(store.read_set_table(&family, 1, 0).await.is_err());
        assert!(store.read_level(&family, 2, 0, "0").await.is_ok());

        assert!(store.remove_level(&family, 16).await.is_err());
        assert!(store.remove_level(&GridFamily::Volume, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_incompatible_format_is_rejected() {
        let store = memory_store();
        let mut metadata = EntryMetadata::new("future");
        metadata.version = FormatVersion::new(2, 0);
        store.write_metadata(&metadata).await.unwrap();
        assert!(matches!(
            store.entry_metadata().await,
            Err(VolsegError::Integrity(_))
        ));
    }
}
