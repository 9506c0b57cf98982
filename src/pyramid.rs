//! Entry builder: from level-1 grids to a persisted multi-resolution pyramid
//!
//! Every `(family, timeframe, channel)` unit is computed on a rayon pool; the
//! levels of one unit are produced strictly in increasing ratio order, each
//! from the previous stored level. Results are written through a
//! [`PyramidStore`] and the metadata is published last, so readers never see a
//! level listed before its data exists.
//!
//! A failing unit aborts only its family (the volume or one lattice); the
//! other families are still written and the failure is listed in the
//! [`BuildReport`].

use crate::category_downsampling::{build_category_pyramid, halved_shape};
use crate::config::BuildConfig;
use crate::error::{Result, VolsegError};
use crate::grid::{GridData, GridShape};
use crate::magic_kernel::downsample_volume;
use crate::metadata::{
    DescriptiveStatistics, EntryMetadata, LatticeMetadata, SamplingBox, SamplingInfo,
    StatisticsTable, TimeInfo, VolumesMetadata,
};
use crate::plan::DownsamplingPlan;
use crate::quantization::{quantize, should_quantize, QuantizationDescriptor};
use crate::set_table::SetTable;
use crate::store::{GridFamily, PyramidStore, LATTICE_CHANNEL};
use crate::types::DataType;
use futures::future::join_all;
use num_traits::Float;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A level-1 grid handed over by ingestion.
#[derive(Debug, Clone)]
pub struct SourceGrid {
    pub timeframe: u32,
    pub channel: String,
    pub grid: GridData,
}

/// Level-1 grids of one family sharing a sampling box.
#[derive(Debug, Clone)]
pub struct FamilySource {
    pub sampling: SamplingBox,
    pub time_info: TimeInfo,
    pub grids: Vec<SourceGrid>,
}

/// Everything ingestion produced for an entry.
#[derive(Debug, Clone, Default)]
pub struct EntrySource {
    pub entry_id: String,
    pub volume: Option<FamilySource>,
    /// Segmentation lattices keyed by lattice id; grids hold `Uint32` labels
    pub lattices: BTreeMap<String, FamilySource>,
}

impl EntrySource {
    /// Every family with its source, the volume first.
    pub fn families(&self) -> impl Iterator<Item = (GridFamily, &FamilySource)> + '_ {
        self.volume
            .iter()
            .map(|v| (GridFamily::Volume, v))
            .chain(
                self.lattices
                    .iter()
                    .map(|(id, l)| (GridFamily::segmentation(id.as_str()), l)),
            )
    }
}

/// One level ready to be written.
#[derive(Debug, Clone)]
pub struct BuiltLevel {
    pub ratio: u32,
    pub grid: GridData,
    pub set_table: Option<SetTable>,
    pub quantization: Option<QuantizationDescriptor>,
}

/// Output of one `(family, timeframe, channel)` unit.
#[derive(Debug, Clone)]
pub struct BuiltUnit {
    pub family: GridFamily,
    pub timeframe: u32,
    pub channel: String,
    /// Kept levels only
    pub levels: Vec<BuiltLevel>,
    /// Statistics of every computed level, kept or not
    pub statistics: BTreeMap<u32, DescriptiveStatistics>,
}

/// A unit (or a whole family when `timeframe` is `None`) that failed.
#[derive(Debug)]
pub struct UnitFailure {
    pub family: GridFamily,
    pub timeframe: Option<u32>,
    pub channel: Option<String>,
    pub error: VolsegError,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub entry_id: String,
    /// Families whose every unit was written
    pub built: Vec<GridFamily>,
    pub levels_written: usize,
    pub failures: Vec<UnitFailure>,
}

impl BuildReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_families(&self) -> BTreeSet<&GridFamily> {
        self.failures.iter().map(|f| &f.family).collect()
    }
}

/// Shape of every level a plan computes, by ratio.
fn level_shapes(base: GridShape, plan: &DownsamplingPlan) -> BTreeMap<u32, GridShape> {
    let mut shapes = BTreeMap::new();
    let mut shape = base;
    for ratio in plan.ratios() {
        shapes.insert(ratio, shape);
        shape = halved_shape(shape);
    }
    shapes
}

fn sampling_info(source: &FamilySource, plan: &DownsamplingPlan) -> SamplingInfo {
    let boxes = level_shapes(source.sampling.grid_dimensions, plan)
        .into_iter()
        .map(|(ratio, shape)| (ratio, source.sampling.coarsened(ratio, shape)))
        .collect();
    SamplingInfo {
        spatial_downsampling_levels: plan.level_records(),
        boxes,
        time_info: source.time_info.clone(),
    }
}

/// Validate one family. Lattices are cut with the voxel ranges resolved for
/// the volume, so they must share its sampling box.
fn check_source(
    family: &GridFamily,
    source: &FamilySource,
    volume: Option<&SamplingBox>,
) -> Result<()> {
    if source.grids.is_empty() {
        return Err(VolsegError::InvalidDimensions(format!("{family} has no grids")));
    }
    let mut seen = BTreeSet::new();
    for g in &source.grids {
        if g.grid.shape() != source.sampling.grid_dimensions {
            return Err(VolsegError::InvalidDimensions(format!(
                "{family} frame {} channel {} has shape {:?}, expected {:?}",
                g.timeframe,
                g.channel,
                g.grid.shape(),
                source.sampling.grid_dimensions
            )));
        }
        if !source.time_info.frames().any(|t| t == g.timeframe) {
            return Err(VolsegError::InvalidDimensions(format!(
                "{family} frame {} lies outside {}..={}",
                g.timeframe, source.time_info.start, source.time_info.end
            )));
        }
        if !seen.insert((g.timeframe, g.channel.as_str())) {
            return Err(VolsegError::Integrity(format!(
                "{family} has two grids for frame {} channel {}",
                g.timeframe, g.channel
            )));
        }
    }
    // Set tables are stored per frame, so a lattice holds one channel
    if matches!(family, GridFamily::Segmentation(_)) {
        if let Some(volume) = volume.filter(|v| !v.is_aligned_with(&source.sampling)) {
            return Err(VolsegError::Configuration(format!(
                "{family} sampling {:?} is not aligned with the volume sampling {:?}",
                source.sampling, volume
            )));
        }
        if let Some(g) = source.grids.iter().find(|g| g.channel != LATTICE_CHANNEL) {
            return Err(VolsegError::Configuration(format!(
                "{family} has channel {}, segmentation lattices only hold channel {LATTICE_CHANNEL}",
                g.channel
            )));
        }
    }
    Ok(())
}

/// Storage type of volume levels.
fn volume_storage_type(config: &BuildConfig, source: DataType) -> DataType {
    config.volume_storage_dtype.unwrap_or(source)
}

/// Compute every level of one volume channel in the working float type `F`.
fn volume_levels<F: Float>(
    source: &GridData,
    storage: DataType,
    plan: &DownsamplingPlan,
    config: &BuildConfig,
) -> Result<(Vec<BuiltLevel>, BTreeMap<u32, DescriptiveStatistics>)> {
    let mut stored = if source.data_type() == storage {
        source.clone()
    } else {
        GridData::from_float_grid(&source.to_float::<F>(), storage)?
    };

    let mut levels = Vec::new();
    let mut statistics = BTreeMap::new();
    for ratio in plan.ratios() {
        if ratio > 1 {
            // Each level is computed from the previous stored level
            stored = downsample_volume(&stored.to_float::<F>(), storage)?;
        }
        statistics.insert(ratio, stored.statistics());
        if !plan.keeps(ratio) {
            continue;
        }

        let quantization = config
            .quantization
            .as_ref()
            .filter(|q| q.applies_to(ratio) && should_quantize(storage, q.dtype));
        let level = match quantization {
            Some(q) => {
                let (grid, descriptor) = quantize(&stored, q.dtype)?;
                BuiltLevel {
                    ratio,
                    grid,
                    set_table: None,
                    quantization: Some(descriptor),
                }
            }
            None => BuiltLevel {
                ratio,
                grid: stored.clone(),
                set_table: None,
                quantization: None,
            },
        };
        levels.push(level);
    }
    Ok((levels, statistics))
}

fn build_volume_unit(
    source: &SourceGrid,
    plan: &DownsamplingPlan,
    config: &BuildConfig,
) -> Result<BuiltUnit> {
    let storage = volume_storage_type(config, source.grid.data_type());
    let (levels, statistics) = if storage == DataType::Float64
        || source.grid.data_type() == DataType::Float64
    {
        volume_levels::<f64>(&source.grid, storage, plan, config)?
    } else {
        volume_levels::<f32>(&source.grid, storage, plan, config)?
    };
    Ok(BuiltUnit {
        family: GridFamily::Volume,
        timeframe: source.timeframe,
        channel: source.channel.clone(),
        levels,
        statistics,
    })
}

fn build_lattice_unit(
    family: &GridFamily,
    source: &SourceGrid,
    plan: &DownsamplingPlan,
) -> Result<BuiltUnit> {
    let grid = source.grid.as_categories()?.clone();
    let table = SetTable::from_labels(grid.iter().copied());
    let levels = build_category_pyramid(grid, table, plan.steps)?
        .into_iter()
        .filter(|level| plan.keeps(level.ratio))
        .map(|level| BuiltLevel {
            ratio: level.ratio,
            grid: GridData::from(level.grid),
            set_table: Some(level.table),
            quantization: None,
        })
        .collect();
    Ok(BuiltUnit {
        family: family.clone(),
        timeframe: source.timeframe,
        channel: source.channel.clone(),
        levels,
        statistics: BTreeMap::new(),
    })
}

struct Job<'a> {
    family: GridFamily,
    source: &'a SourceGrid,
    plan: &'a DownsamplingPlan,
}

fn thread_pool(workers: Option<usize>) -> Result<rayon::ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(workers) = workers {
        builder = builder.num_threads(workers);
    }
    builder
        .build()
        .map_err(|e| VolsegError::Configuration(format!("cannot start worker pool: {e}")))
}

type UnitOutcome = (GridFamily, u32, String, Result<BuiltUnit>);

/// Compute every unit of the planned families on a dedicated pool.
fn compute_units(
    source: &EntrySource,
    plans: &BTreeMap<GridFamily, DownsamplingPlan>,
    config: &BuildConfig,
) -> Result<Vec<UnitOutcome>> {
    let mut jobs = Vec::new();
    for (family, family_source) in source.families() {
        if let Some(plan) = plans.get(&family) {
            for grid in &family_source.grids {
                jobs.push(Job {
                    family: family.clone(),
                    source: grid,
                    plan,
                });
            }
        }
    }

    let pool = thread_pool(config.workers)?;
    let results = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let built = match &job.family {
                    GridFamily::Volume => build_volume_unit(job.source, job.plan, config),
                    family => build_lattice_unit(family, job.source, job.plan),
                };
                (
                    job.family.clone(),
                    job.source.timeframe,
                    job.source.channel.clone(),
                    built,
                )
            })
            .collect()
    });
    Ok(results)
}

/// Builds and publishes the pyramid of one entry.
pub struct EntryBuilder<S: PyramidStore> {
    store: Arc<S>,
    config: BuildConfig,
}

impl<S: PyramidStore> EntryBuilder<S> {
    /// Fails when `config` is invalid, before anything is computed.
    pub fn new(store: Arc<S>, config: BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    fn element_size(&self, family: &GridFamily, source: &FamilySource) -> usize {
        match family {
            GridFamily::Volume => source
                .grids
                .first()
                .map(|g| volume_storage_type(&self.config, g.grid.data_type()).size_in_bytes())
                .unwrap_or(4),
            GridFamily::Segmentation(_) => DataType::Uint32.size_in_bytes(),
        }
    }

    /// Build, write and publish the entry.
    #[instrument(level = "info", skip_all, fields(entry = %source.entry_id))]
    pub async fn build(&self, source: EntrySource) -> Result<BuildReport> {
        let mut report = BuildReport {
            entry_id: source.entry_id.clone(),
            ..Default::default()
        };

        // Plans are computed once per family, before any work starts
        let mut plans = BTreeMap::new();
        let volume_sampling = source.volume.as_ref().map(|v| &v.sampling);
        for (family, family_source) in source.families() {
            let planned = check_source(&family, family_source, volume_sampling).and_then(|_| {
                DownsamplingPlan::compute(
                    family_source.sampling.grid_dimensions,
                    self.element_size(&family, family_source),
                    &self.config.downsampling,
                )
            });
            match planned {
                Ok(plan) => {
                    plans.insert(family, plan);
                }
                Err(error) => {
                    warn!(family = %family, %error, "family rejected");
                    report.failures.push(UnitFailure {
                        family,
                        timeframe: None,
                        channel: None,
                        error,
                    });
                }
            }
        }

        let source = Arc::new(source);
        let plans = Arc::new(plans);
        let results = {
            let source = Arc::clone(&source);
            let plans = Arc::clone(&plans);
            let config = self.config.clone();
            tokio::task::spawn_blocking(move || compute_units(&source, &plans, &config))
                .await
                .map_err(|e| VolsegError::Integrity(format!("build worker panicked: {e}")))??
        };

        let mut units: BTreeMap<GridFamily, Vec<BuiltUnit>> = BTreeMap::new();
        for (family, timeframe, channel, built) in results {
            match built {
                Ok(unit) => units.entry(family).or_default().push(unit),
                Err(error) => {
                    warn!(family = %family, timeframe, channel = %channel, %error, "unit failed");
                    report.failures.push(UnitFailure {
                        family,
                        timeframe: Some(timeframe),
                        channel: Some(channel),
                        error,
                    });
                }
            }
        }

        let failed: BTreeSet<GridFamily> =
            report.failed_families().into_iter().cloned().collect();
        units.retain(|family, _| !failed.contains(family));

        // Write every surviving family
        let writes = units.iter().map(|(family, family_units)| async move {
            let mut written = 0usize;
            for unit in family_units {
                written += self.write_unit(unit).await?;
            }
            Ok::<_, VolsegError>(written)
        });
        let outcomes = join_all(writes).await;
        for (family, outcome) in units.keys().zip(outcomes) {
            match outcome {
                Ok(written) => {
                    report.levels_written += written;
                    report.built.push(family.clone());
                }
                Err(error) => {
                    warn!(family = %family, %error, "writing a family failed");
                    report.failures.push(UnitFailure {
                        family: family.clone(),
                        timeframe: None,
                        channel: None,
                        error,
                    });
                }
            }
        }

        let mut metadata = EntryMetadata::new(source.entry_id.clone());

        for family in &report.built {
            let (Some(plan), Some(family_units)) = (plans.get(family), units.get(family)) else {
                continue;
            };
            match family {
                GridFamily::Volume => {
                    let Some(volume) = source.volume.as_ref() else {
                        continue;
                    };
                    let mut channel_ids: Vec<String> =
                        volume.grids.iter().map(|g| g.channel.clone()).collect();
                    channel_ids.sort();
                    channel_ids.dedup();
                    let mut stats = StatisticsTable::new();
                    for unit in family_units {
                        for (&ratio, s) in &unit.statistics {
                            stats
                                .entry(ratio)
                                .or_default()
                                .entry(unit.timeframe)
                                .or_default()
                                .insert(unit.channel.clone(), *s);
                        }
                    }
                    metadata.volumes = Some(VolumesMetadata {
                        channel_ids,
                        sampling: sampling_info(volume, plan),
                        descriptive_statistics: stats,
                    });
                }
                GridFamily::Segmentation(id) => {
                    if let Some(lattice) = source.lattices.get(id) {
                        metadata.segmentation_lattices.insert(
                            id.clone(),
                            LatticeMetadata {
                                sampling: sampling_info(lattice, plan),
                            },
                        );
                    }
                }
            }
        }

        if !report.built.is_empty() {
            self.store.write_metadata(&metadata).await?;
        }
        info!(
            built = report.built.len(),
            levels = report.levels_written,
            failures = report.failures.len(),
            "entry build finished"
        );
        Ok(report)
    }

    async fn write_unit(&self, unit: &BuiltUnit) -> Result<usize> {
        for level in &unit.levels {
            self.store
                .write_level(
                    &unit.family,
                    level.ratio,
                    unit.timeframe,
                    &unit.channel,
                    &level.grid,
                    level.set_table.as_ref(),
                )
                .await?;
            if let Some(descriptor) = &level.quantization {
                self.store
                    .write_quantization(level.ratio, unit.timeframe, &unit.channel, descriptor)
                    .await?;
            }
            debug!(
                family = %unit.family,
                ratio = level.ratio,
                timeframe = unit.timeframe,
                channel = %unit.channel,
                "level written"
            );
        }
        Ok(unit.levels.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::StorageCompression;
    use crate::config::{DownsamplingParams, QuantizationParams};
    use crate::io::InMemoryIOManager;
    use crate::quantization::QuantizationDtype;
    use crate::store::IoPyramidStore;
    use ndarray::Array3;

    fn store() -> Arc<IoPyramidStore> {
        Arc::new(IoPyramidStore::new(
            Arc::new(InMemoryIOManager::new()),
            StorageCompression::Zstd,
        ))
    }

    fn config() -> BuildConfig {
        BuildConfig {
            downsampling: DownsamplingParams {
                min_grid_size: 1,
                min_downsampled_file_size_bytes: 1,
                max_downsampling_level: Some(4),
                ..Default::default()
            },
            workers: Some(2),
            ..Default::default()
        }
    }

    fn family(shape: GridShape, grids: Vec<SourceGrid>) -> FamilySource {
        FamilySource {
            sampling: SamplingBox {
                origin: [10.0, 20.0, 30.0],
                voxel_size: [1.5, 1.5, 1.5],
                grid_dimensions: shape,
            },
            time_info: TimeInfo::single(),
            grids,
        }
    }

    fn volume(value: impl Fn(usize, usize, usize) -> f32) -> FamilySource {
        let grid = Array3::from_shape_fn((8, 8, 8), |(x, y, z)| value(x, y, z));
        family(
            [8, 8, 8],
            vec![SourceGrid {
                timeframe: 0,
                channel: "0".to_string(),
                grid: GridData::from(grid),
            }],
        )
    }

    fn halves_lattice(size: usize) -> FamilySource {
        let grid = Array3::from_shape_fn((size, size, size), |(x, _, _)| {
            if x < size / 2 {
                1u32
            } else {
                2
            }
        });
        family(
            [size; 3],
            vec![SourceGrid {
                timeframe: 0,
                channel: "0".to_string(),
                grid: GridData::from(grid),
            }],
        )
    }

    #[tokio::test]
    async fn test_volume_pyramid() {
        let store = store();
        let builder = EntryBuilder::new(Arc::clone(&store), config()).unwrap();
        let report = builder
            .build(EntrySource {
                entry_id: "emd-1832".to_string(),
                volume: Some(volume(|_, _, _| 3.0)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.built, vec![GridFamily::Volume]);
        assert_eq!(report.levels_written, 3);

        let metadata = store.entry_metadata().await.unwrap();
        let volumes = metadata.volumes().unwrap();
        assert_eq!(volumes.channel_ids, vec!["0"]);
        assert_eq!(volumes.sampling.available_ratios(), vec![1, 2, 4]);
        let coarse = volumes.sampling.box_at(4).unwrap();
        assert_eq!(coarse.grid_dimensions, [2, 2, 2]);
        assert_eq!(coarse.voxel_size, [6.0, 6.0, 6.0]);
        assert_eq!(coarse.origin, [10.0, 20.0, 30.0]);

        let stats = volumes.statistics(4, 0, "0").unwrap();
        assert!((stats.mean - 3.0).abs() < 1e-6);
        assert!(stats.std.abs() < 1e-6);

        let level = store
            .read_level(&GridFamily::Volume, 4, 0, "0")
            .await
            .unwrap();
        assert_eq!(level.shape(), [2, 2, 2]);
        assert_eq!(level.data_type(), DataType::Float32);
    }

    #[tokio::test]
    async fn test_segmentation_pyramid_merges_sets() {
        let store = store();
        let builder = EntryBuilder::new(Arc::clone(&store), config()).unwrap();
        let report = builder
            .build(EntrySource {
                entry_id: "empiar-10070".to_string(),
                lattices: BTreeMap::from([("0".to_string(), halves_lattice(4))]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.is_complete());

        let family = GridFamily::segmentation("0");
        let metadata = store.entry_metadata().await.unwrap();
        assert!(metadata.volumes.is_none());
        assert_eq!(
            metadata.lattice("0").unwrap().sampling.available_ratios(),
            vec![1, 2, 4]
        );

        let level = store.read_level(&family, 2, 0, "0").await.unwrap();
        let table = store.read_set_table(&family, 2, 0).await.unwrap();
        let ids = level.as_categories().unwrap();
        assert_eq!(table.get(ids[[0, 0, 0]]), Some(&[1u32][..]));
        assert_eq!(table.get(ids[[1, 1, 1]]), Some(&[2u32][..]));

        let top = store.read_level(&family, 4, 0, "0").await.unwrap();
        let table = store.read_set_table(&family, 4, 0).await.unwrap();
        let id = top.as_categories().unwrap()[[0, 0, 0]];
        assert_eq!(table.get(id), Some(&[1u32, 2][..]));
    }

    #[tokio::test]
    async fn test_failed_lattice_does_not_block_volume() {
        let store = store();
        let builder = EntryBuilder::new(Arc::clone(&store), config()).unwrap();
        // Labels must be Uint32
        let bad = family(
            [8, 8, 8],
            vec![SourceGrid {
                timeframe: 0,
                channel: "0".to_string(),
                grid: GridData::from(Array3::<f32>::zeros((8, 8, 8))),
            }],
        );
        let report = builder
            .build(EntrySource {
                entry_id: "emd-1547".to_string(),
                volume: Some(volume(|x, y, z| (x + y + z) as f32)),
                lattices: BTreeMap::from([
                    ("bad".to_string(), bad),
                    ("good".to_string(), halves_lattice(8)),
                ]),
            })
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.family, GridFamily::segmentation("bad"));
        assert_eq!(failure.timeframe, Some(0));
        assert!(matches!(failure.error, VolsegError::InvalidDataType(_)));
        assert_eq!(
            report.built,
            vec![GridFamily::Volume, GridFamily::segmentation("good")]
        );

        let metadata = store.entry_metadata().await.unwrap();
        assert!(metadata.lattice("good").is_ok());
        assert!(metadata.lattice("bad").is_err());
        assert!(store
            .read_level(&GridFamily::segmentation("bad"), 1, 0, "0")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_quantized_levels() {
        let store = store();
        let config = BuildConfig {
            quantization: Some(QuantizationParams {
                dtype: QuantizationDtype::U8,
                levels: Some(vec![2]),
            }),
            ..config()
        };
        let builder = EntryBuilder::new(Arc::clone(&store), config).unwrap();
        builder
            .build(EntrySource {
                entry_id: "emd-99999".to_string(),
                volume: Some(volume(|x, y, z| (x * y + z) as f32 * 0.25)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.read_quantization(1, 0, "0").await.unwrap().is_none());
        assert!(store.read_quantization(2, 0, "0").await.unwrap().is_some());
        let quantized = store
            .read_level(&GridFamily::Volume, 2, 0, "0")
            .await
            .unwrap();
        assert_eq!(quantized.data_type(), DataType::Uint8);
        let raw = store
            .read_level(&GridFamily::Volume, 4, 0, "0")
            .await
            .unwrap();
        assert_eq!(raw.data_type(), DataType::Float32);
    }

    #[tokio::test]
    async fn test_original_resolution_removed() {
        let store = store();
        let mut config = config();
        config.downsampling.remove_original_resolution = true;
        let builder = EntryBuilder::new(Arc::clone(&store), config).unwrap();
        let report = builder
            .build(EntrySource {
                entry_id: "emd-1832".to_string(),
                volume: Some(volume(|x, _, _| x as f32)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.levels_written, 2);

        let metadata = store.entry_metadata().await.unwrap();
        let sampling = &metadata.volumes().unwrap().sampling;
        assert_eq!(sampling.spatial_downsampling_levels.len(), 3);
        assert!(!sampling.is_available(1));
        assert!(matches!(
            store.read_level(&GridFamily::Volume, 1, 0, "0").await,
            Err(VolsegError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mismatched_shape_rejects_family() {
        let store = store();
        let builder = EntryBuilder::new(Arc::clone(&store), config()).unwrap();
        let mut source = volume(|_, _, _| 1.0);
        source.sampling.grid_dimensions = [8, 8, 4];
        let report = builder
            .build(EntrySource {
                entry_id: "emd-1".to_string(),
                volume: Some(source),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.built.is_empty());
        assert_eq!(report.failures[0].timeframe, None);
        assert!(matches!(
            report.failures[0].error,
            VolsegError::InvalidDimensions(_)
        ));
        assert!(store.entry_metadata().await.is_err());
    }

    #[tokio::test]
    async fn test_misaligned_lattice_is_rejected() {
        let store = store();
        let builder = EntryBuilder::new(Arc::clone(&store), config()).unwrap();
        let mut shifted = halves_lattice(8);
        shifted.sampling.origin[0] += 8.0;
        let mut coarser = halves_lattice(8);
        coarser.sampling.voxel_size = [3.0, 3.0, 3.0];
        let report = builder
            .build(EntrySource {
                entry_id: "emd-1832".to_string(),
                volume: Some(volume(|x, _, _| x as f32)),
                lattices: BTreeMap::from([
                    ("aligned".to_string(), halves_lattice(8)),
                    ("coarser".to_string(), coarser),
                    ("shifted".to_string(), shifted),
                ]),
            })
            .await
            .unwrap();

        assert_eq!(
            report.built,
            vec![GridFamily::Volume, GridFamily::segmentation("aligned")]
        );
        assert_eq!(
            report.failed_families().into_iter().cloned().collect::<Vec<_>>(),
            vec![
                GridFamily::segmentation("coarser"),
                GridFamily::segmentation("shifted")
            ]
        );
        for failure in &report.failures {
            assert_eq!(failure.timeframe, None);
            assert!(matches!(failure.error, VolsegError::Configuration(_)));
        }
        let metadata = store.entry_metadata().await.unwrap();
        assert!(metadata.lattice("shifted").is_err());
    }

    #[tokio::test]
    async fn test_lattice_only_entry_keeps_its_own_sampling() {
        let store = store();
        let builder = EntryBuilder::new(Arc::clone(&store), config()).unwrap();
        let mut shifted = halves_lattice(4);
        shifted.sampling.origin = [100.0, 0.0, 0.0];
        let report = builder
            .build(EntrySource {
                entry_id: "empiar-10070".to_string(),
                lattices: BTreeMap::from([("0".to_string(), shifted)]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.is_complete());
        let metadata = store.entry_metadata().await.unwrap();
        let sampling = &metadata.lattice("0").unwrap().sampling;
        assert_eq!(sampling.box_at(1).unwrap().origin, [100.0, 0.0, 0.0]);
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let config = BuildConfig {
            workers: Some(0),
            ..config()
        };
        assert!(matches!(
            EntryBuilder::new(store(), config),
            Err(VolsegError::Configuration(_))
        ));
    }
}
