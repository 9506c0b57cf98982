//! Query service: slices of a built entry as BinaryCIF

use crate::encoding::{encode_slice, EncodingPolicy, VolumeInfo};
use crate::error::{Result, VolsegError};
use crate::grid::GridData;
use crate::metadata::{DescriptiveStatistics, EntryMetadata};
use crate::quantization::dequantize;
use crate::slice_box::{resolve_slice_box, SliceBox};
use crate::store::{GridFamily, PyramidStore, LATTICE_CHANNEL};
use crate::types::WorldBox;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument};

/// What part of an entry a client wants.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SliceRequest {
    /// World-space region; `None` means the whole entry
    pub region: Option<WorldBox>,
    /// Soft limit on the number of voxels returned
    pub max_points: Option<usize>,
    pub timeframe: u32,
}

impl SliceRequest {
    pub fn whole(max_points: Option<usize>) -> Self {
        Self {
            max_points,
            ..Default::default()
        }
    }

    pub fn region(region: WorldBox, max_points: Option<usize>) -> Self {
        Self {
            region: Some(region),
            max_points,
            timeframe: 0,
        }
    }

    pub fn at_time(mut self, timeframe: u32) -> Self {
        self.timeframe = timeframe;
        self
    }
}

/// Read-only access to one entry.
///
/// Metadata is loaded once and shared; call
/// [`refresh_metadata`](Self::refresh_metadata) after the entry changed.
pub struct QueryService<S: PyramidStore> {
    store: Arc<S>,
    metadata: Arc<RwLock<EntryMetadata>>,
    policy: EncodingPolicy,
}

impl<S: PyramidStore> QueryService<S> {
    pub async fn open(store: Arc<S>) -> Result<Self> {
        let metadata = store.entry_metadata().await?;
        Ok(Self {
            store,
            metadata: Arc::new(RwLock::new(metadata)),
            policy: EncodingPolicy::lossless(),
        })
    }

    /// Encode float values lossily with `policy`.
    pub fn with_policy(mut self, policy: EncodingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn metadata(&self) -> EntryMetadata {
        self.metadata.read().clone()
    }

    pub async fn refresh_metadata(&self) -> Result<()> {
        let fresh = self.store.entry_metadata().await?;
        *self.metadata.write() = fresh;
        Ok(())
    }

    /// Level and voxel range serving `request`, if any.
    pub fn resolve(&self, request: &SliceRequest, lattices: &[&str]) -> Result<Option<SliceBox>> {
        let metadata = self.metadata.read();
        resolve_slice_box(
            request.region.as_ref(),
            request.max_points,
            &metadata,
            lattices,
        )
    }

    /// Lattice voxels at `ratio` must coincide with the volume voxels the
    /// slice box was resolved for.
    fn check_lattice_alignment(&self, family: &GridFamily, ratio: u32) -> Result<()> {
        let metadata = self.metadata.read();
        let Some(volumes) = &metadata.volumes else {
            return Ok(());
        };
        let lattice = family.sampling(&metadata)?.box_at(ratio);
        match (volumes.sampling.box_at(ratio), lattice) {
            (Some(v), Some(l)) if v.is_aligned_with(l) => Ok(()),
            _ => Err(VolsegError::Integrity(format!(
                "{family} is not aligned with the volume at level {ratio}"
            ))),
        }
    }

    fn has_timeframe(&self, family: &GridFamily, timeframe: u32) -> Result<bool> {
        let metadata = self.metadata.read();
        let time = &family.sampling(&metadata)?.time_info;
        Ok(timeframe >= time.start && timeframe <= time.end)
    }

    fn volume_info(
        &self,
        family: &GridFamily,
        name: &str,
        slice: SliceBox,
        stats: (DescriptiveStatistics, DescriptiveStatistics),
    ) -> Result<VolumeInfo> {
        let metadata = self.metadata.read();
        let sampling = *family
            .sampling(&metadata)?
            .box_at(slice.downsampling_rate)
            .ok_or_else(|| {
                VolsegError::Integrity(format!(
                    "{family} has no sampling box at level {}",
                    slice.downsampling_rate
                ))
            })?;
        Ok(VolumeInfo {
            name: name.to_string(),
            slice,
            sampling,
            source_statistics: stats.0,
            sampled_statistics: stats.1,
        })
    }

    /// Source and level statistics of a volume channel.
    fn volume_statistics(
        &self,
        ratio: u32,
        timeframe: u32,
        channel: &str,
    ) -> Result<(DescriptiveStatistics, DescriptiveStatistics)> {
        let metadata = self.metadata.read();
        let volumes = metadata.volumes()?;
        let lookup = |r: u32| {
            volumes.statistics(r, timeframe, channel).copied().ok_or_else(|| {
                VolsegError::Integrity(format!(
                    "no statistics for level {r}, frame {timeframe}, channel {channel}"
                ))
            })
        };
        Ok((lookup(1)?, lookup(ratio)?))
    }

    /// Level data cut to `slice`, dequantized when stored quantized.
    async fn volume_grid(
        &self,
        level: GridData,
        slice: &SliceBox,
        timeframe: u32,
        channel: &str,
    ) -> Result<GridData> {
        let cut = level.cut(slice)?;
        match self
            .store
            .read_quantization(slice.downsampling_rate, timeframe, channel)
            .await?
        {
            Some(descriptor) => Ok(GridData::from(dequantize(&cut, &descriptor)?)),
            None => Ok(cut),
        }
    }

    /// One volume channel as a BinaryCIF slice.
    ///
    /// `None` when the region misses the data, the frame does not exist or
    /// the channel is unknown.
    #[instrument(level = "info", skip(self, request))]
    pub async fn volume_slice(&self, request: &SliceRequest, channel: &str) -> Result<Option<Bytes>> {
        let family = GridFamily::Volume;
        let known = self
            .metadata
            .read()
            .volumes()?
            .channel_ids
            .iter()
            .any(|c| c == channel);
        if !known || !self.has_timeframe(&family, request.timeframe)? {
            debug!(known, timeframe = request.timeframe, "nothing to serve");
            return Ok(None);
        }
        let Some(slice) = self.resolve(request, &[])? else {
            return Ok(None);
        };

        let ratio = slice.downsampling_rate;
        let level = self
            .store
            .read_level(&family, ratio, request.timeframe, channel)
            .await?;
        let grid = self
            .volume_grid(level, &slice, request.timeframe, channel)
            .await?;
        let stats = self.volume_statistics(ratio, request.timeframe, channel)?;
        let info = self.volume_info(&family, channel, slice, stats)?;
        debug!(ratio, voxels = slice.volume(), "encoding volume slice");
        encode_slice(&grid, None, &info, &self.policy).map(Some)
    }

    /// Every volume channel at the same level, one BinaryCIF file each.
    #[instrument(level = "info", skip(self, request))]
    pub async fn volume_slices(&self, request: &SliceRequest) -> Result<Vec<(String, Bytes)>> {
        let family = GridFamily::Volume;
        let channels = self.metadata.read().volumes()?.channel_ids.clone();
        if !self.has_timeframe(&family, request.timeframe)? {
            return Ok(Vec::new());
        }
        let Some(slice) = self.resolve(request, &[])? else {
            return Ok(Vec::new());
        };

        let ratio = slice.downsampling_rate;
        let levels = self
            .store
            .read_channels(&family, ratio, request.timeframe, &channels)
            .await?;
        let mut out = Vec::with_capacity(channels.len());
        for (channel, level) in channels.into_iter().zip(levels) {
            let grid = self
                .volume_grid(level, &slice, request.timeframe, &channel)
                .await?;
            let stats = self.volume_statistics(ratio, request.timeframe, &channel)?;
            let info = self.volume_info(&family, &channel, slice, stats)?;
            let bytes = encode_slice(&grid, None, &info, &self.policy)?;
            out.push((channel, bytes));
        }
        Ok(out)
    }

    /// One segmentation lattice as a BinaryCIF slice.
    ///
    /// The level is chosen so it is available for the volume (when the entry
    /// has one) and the lattice alike.
    #[instrument(level = "info", skip(self, request))]
    pub async fn segmentation_slice(
        &self,
        request: &SliceRequest,
        lattice_id: &str,
    ) -> Result<Option<Bytes>> {
        let family = GridFamily::segmentation(lattice_id);
        if !self.has_timeframe(&family, request.timeframe)? {
            return Ok(None);
        }
        let Some(slice) = self.resolve(request, &[lattice_id])? else {
            return Ok(None);
        };

        let ratio = slice.downsampling_rate;
        self.check_lattice_alignment(&family, ratio)?;
        let (level, table) = futures::try_join!(
            self.store
                .read_level(&family, ratio, request.timeframe, LATTICE_CHANNEL),
            self.store.read_set_table(&family, ratio, request.timeframe),
        )?;
        let grid = level.cut(&slice)?;
        let stats = grid.statistics();
        let info = self.volume_info(&family, lattice_id, slice, (stats, stats))?;
        debug!(ratio, sets = table.len(), "encoding segmentation slice");
        encode_slice(&grid, Some(&table), &info, &self.policy).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::StorageCompression;
    use crate::config::{BuildConfig, DownsamplingParams, QuantizationParams};
    use crate::encoding::{BinaryCifFile, ColumnData};
    use crate::io::InMemoryIOManager;
    use crate::metadata::{SamplingBox, TimeInfo};
    use crate::pyramid::{EntryBuilder, EntrySource, FamilySource, SourceGrid};
    use crate::quantization::QuantizationDtype;
    use crate::store::IoPyramidStore;
    use ndarray::Array3;
    use std::collections::BTreeMap;

    fn family(grid: GridData) -> FamilySource {
        FamilySource {
            sampling: SamplingBox {
                origin: [0.0, 0.0, 0.0],
                voxel_size: [1.0, 1.0, 1.0],
                grid_dimensions: grid.shape(),
            },
            time_info: TimeInfo::single(),
            grids: vec![SourceGrid {
                timeframe: 0,
                channel: "0".to_string(),
                grid,
            }],
        }
    }

    async fn built_entry(config: BuildConfig) -> Arc<IoPyramidStore> {
        let store = Arc::new(IoPyramidStore::new(
            Arc::new(InMemoryIOManager::new()),
            StorageCompression::Deflate,
        ));
        let density = Array3::from_shape_fn((16, 16, 16), |(x, y, z)| (x + y + z) as f32);
        let labels = Array3::from_shape_fn((16, 16, 16), |(x, _, _)| (x / 8) as u32 + 1);
        let builder = EntryBuilder::new(Arc::clone(&store), config).unwrap();
        let report = builder
            .build(EntrySource {
                entry_id: "emd-1832".to_string(),
                volume: Some(family(GridData::from(density))),
                lattices: BTreeMap::from([("0".to_string(), family(GridData::from(labels)))]),
            })
            .await
            .unwrap();
        assert!(report.is_complete());
        store
    }

    fn config() -> BuildConfig {
        BuildConfig {
            downsampling: DownsamplingParams {
                min_grid_size: 8,
                min_downsampled_file_size_bytes: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_budget_picks_coarser_level() {
        let store = built_entry(config()).await;
        let service = QueryService::open(store).await.unwrap();
        // 16^3 -> 8^3 -> 4^3 -> 2^3 stops at 8 voxels
        let slice = service
            .resolve(&SliceRequest::whole(Some(10)), &[])
            .unwrap()
            .unwrap();
        assert_eq!(slice.downsampling_rate, 8);

        let bytes = service
            .volume_slice(&SliceRequest::whole(Some(10)), "0")
            .await
            .unwrap()
            .unwrap();
        let file = BinaryCifFile::from_bytes(&bytes).unwrap();
        let block = file.block("0").unwrap();
        let values = block.category("volume_data_3d").unwrap().values("values").unwrap();
        assert_eq!(values.len(), 8);
        let info = block.category("volume_data_3d_info").unwrap();
        assert_eq!(info.values("sample_rate").unwrap(), ColumnData::from(vec![8i32]));
    }

    #[tokio::test]
    async fn test_region_slice_at_full_resolution() {
        let store = built_entry(config()).await;
        let service = QueryService::open(store).await.unwrap();
        let request = SliceRequest::region(WorldBox::new([2.0, 2.0, 2.0], [3.0, 4.0, 2.0]), None);
        let bytes = service.volume_slice(&request, "0").await.unwrap().unwrap();
        let file = BinaryCifFile::from_bytes(&bytes).unwrap();
        let values = file
            .block("0")
            .unwrap()
            .category("volume_data_3d")
            .unwrap()
            .values("values")
            .unwrap();
        // x fastest: (2,2,2) (3,2,2) (2,3,2) (3,3,2) (2,4,2) (3,4,2)
        assert_eq!(values, ColumnData::from(vec![6.0f32, 7.0, 7.0, 8.0, 8.0, 9.0]));
    }

    #[tokio::test]
    async fn test_requests_outside_the_entry_yield_none() {
        let store = built_entry(config()).await;
        let service = QueryService::open(store).await.unwrap();
        let far = SliceRequest::region(WorldBox::new([100.0; 3], [120.0; 3]), None);
        assert!(service.volume_slice(&far, "0").await.unwrap().is_none());
        let later = SliceRequest::whole(None).at_time(3);
        assert!(service.volume_slice(&later, "0").await.unwrap().is_none());
        let whole = SliceRequest::whole(None);
        assert!(service.volume_slice(&whole, "7").await.unwrap().is_none());
        assert!(service.volume_slices(&far).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_segmentation_slice() {
        let store = built_entry(config()).await;
        let service = QueryService::open(store).await.unwrap();
        let bytes = service
            .segmentation_slice(&SliceRequest::whole(Some(8)), "0")
            .await
            .unwrap()
            .unwrap();
        let file = BinaryCifFile::from_bytes(&bytes).unwrap();
        let block = file.block("0").unwrap();
        let ColumnData::Uint32(ids) = block
            .category("segmentation_data_3d")
            .unwrap()
            .values("values")
            .unwrap()
        else {
            panic!("expected Uint32 category ids");
        };
        assert_eq!(ids.len(), 8);

        let table = block.category("segmentation_data_table").unwrap();
        let ColumnData::Uint32(segments) = table.values("segment_id").unwrap() else {
            panic!("expected Uint32 segment ids");
        };
        let mut segments = segments;
        segments.sort_unstable();
        segments.dedup();
        assert_eq!(segments, vec![1, 2]);
    }

    fn segment_ids(bytes: &[u8]) -> Vec<u32> {
        let file = BinaryCifFile::from_bytes(bytes).unwrap();
        let table = file
            .block("0")
            .unwrap()
            .category("segmentation_data_table")
            .unwrap()
            .values("segment_id")
            .unwrap();
        let ColumnData::Uint32(mut segments) = table else {
            panic!("expected Uint32 segment ids");
        };
        segments.sort_unstable();
        segments.dedup();
        segments
    }

    #[tokio::test]
    async fn test_segmentation_region_reads_matching_voxels() {
        let store = built_entry(config()).await;
        let service = QueryService::open(store).await.unwrap();
        let left = SliceRequest::region(WorldBox::new([2.0, 0.0, 0.0], [3.0, 1.0, 1.0]), None);
        let bytes = service.segmentation_slice(&left, "0").await.unwrap().unwrap();
        assert_eq!(segment_ids(&bytes), vec![1]);

        let right = SliceRequest::region(WorldBox::new([9.0, 0.0, 0.0], [10.0, 1.0, 1.0]), None);
        let bytes = service.segmentation_slice(&right, "0").await.unwrap().unwrap();
        assert_eq!(segment_ids(&bytes), vec![2]);
    }

    #[tokio::test]
    async fn test_misaligned_lattice_metadata_is_an_integrity_error() {
        let store = built_entry(config()).await;
        let mut metadata = store.entry_metadata().await.unwrap();
        let lattice = metadata.segmentation_lattices.get_mut("0").unwrap();
        for sampling in lattice.sampling.boxes.values_mut() {
            sampling.origin[0] += 8.0;
        }
        store.write_metadata(&metadata).await.unwrap();

        let service = QueryService::open(store).await.unwrap();
        let request = SliceRequest::region(WorldBox::new([8.0, 0.0, 0.0], [9.0, 1.0, 1.0]), None);
        assert!(matches!(
            service.segmentation_slice(&request, "0").await,
            Err(VolsegError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_quantized_level_is_dequantized() {
        let config = BuildConfig {
            quantization: Some(QuantizationParams {
                dtype: QuantizationDtype::U16,
                levels: None,
            }),
            ..config()
        };
        let store = built_entry(config).await;
        let service = QueryService::open(store).await.unwrap();
        let request = SliceRequest::region(WorldBox::new([5.0; 3], [5.0; 3]), None);
        let bytes = service.volume_slice(&request, "0").await.unwrap().unwrap();
        let file = BinaryCifFile::from_bytes(&bytes).unwrap();
        let ColumnData::Float32(values) = file
            .block("0")
            .unwrap()
            .category("volume_data_3d")
            .unwrap()
            .values("values")
            .unwrap()
        else {
            panic!("expected Float32 values");
        };
        assert_eq!(values.len(), 1);
        assert!((values[0] - 15.0).abs() < 0.05);
    }

    #[tokio::test]
    async fn test_removed_level_is_skipped_after_refresh() {
        let store = built_entry(config()).await;
        let service = QueryService::open(Arc::clone(&store)).await.unwrap();
        store.remove_level(&GridFamily::Volume, 1).await.unwrap();
        service.refresh_metadata().await.unwrap();
        let slice = service
            .resolve(&SliceRequest::whole(None), &[])
            .unwrap()
            .unwrap();
        assert_eq!(slice.downsampling_rate, 2);

        let all = service.volume_slices(&SliceRequest::whole(None)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "0");
    }
}
