//! Example: Build a pyramid for a synthetic entry and query it
//!
//! Run with: cargo run --example build_and_query
//! Set RUST_LOG=debug to watch every level being written.

use anyhow::Context;
use ndarray::Array3;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use volseg::encoding::{BinaryCifFile, EncodingPolicy};
use volseg::utils::format_bytes;
use volseg::{
    BuildConfig, EntryBuilder, EntrySource, FamilySource, GridData, IoPyramidStore,
    QueryService, SamplingBox, SliceRequest, SourceGrid, TimeInfo, WorldBox,
};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,volseg=info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

/// A Gaussian blob with two spherical segments inside it.
fn synthetic_entry(size: usize) -> EntrySource {
    let c = size as f32 / 2.0;
    let density = Array3::from_shape_fn((size, size, size), |(x, y, z)| {
        let r2 = (x as f32 - c).powi(2) + (y as f32 - c).powi(2) + (z as f32 - c).powi(2);
        (-r2 / (size as f32 * 2.0)).exp()
    });
    let labels = Array3::from_shape_fn((size, size, size), |(x, y, z)| {
        let d = |cx: f32| {
            ((x as f32 - cx).powi(2) + (y as f32 - c).powi(2) + (z as f32 - c).powi(2)).sqrt()
        };
        if d(c * 0.6) < c * 0.3 {
            1u32
        } else if d(c * 1.4) < c * 0.3 {
            2
        } else {
            0
        }
    });

    let family = |grid: GridData| FamilySource {
        sampling: SamplingBox {
            origin: [0.0, 0.0, 0.0],
            voxel_size: [1.2, 1.2, 1.2],
            grid_dimensions: [size, size, size],
        },
        time_info: TimeInfo::single(),
        grids: vec![SourceGrid {
            timeframe: 0,
            channel: "0".to_string(),
            grid,
        }],
    };

    EntrySource {
        entry_id: "synthetic-1".to_string(),
        volume: Some(family(GridData::from(density))),
        lattices: BTreeMap::from([("0".to_string(), family(GridData::from(labels)))]),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = BuildConfig::from_json_str(
        r#"{
            "downsampling": {"min_grid_size": 4096, "min_downsampled_file_size_bytes": 1},
            "quantization": {"dtype": "u8", "levels": [4, 8]}
        }"#,
    )
    .context("parsing build configuration")?;

    let temp_dir = tempfile::tempdir()?;
    let url = format!("file://{}", temp_dir.path().join("synthetic-1").display());
    let store = Arc::new(IoPyramidStore::open(&url, config.compression).await?);

    let report = EntryBuilder::new(Arc::clone(&store), config)?
        .build(synthetic_entry(96))
        .await?;
    println!(
        "Built {} families, {} levels, {} failures",
        report.built.len(),
        report.levels_written,
        report.failures.len()
    );

    // Densities travel as 8-bit interval-quantized columns
    let service = QueryService::open(store)
        .await?
        .with_policy(EncodingPolicy::lossy(255));
    let metadata = service.metadata();
    let volumes = metadata.volumes()?;
    println!("Volume levels: {:?}", volumes.sampling.available_ratios());

    for budget in [1_000_000, 50_000, 1_000] {
        let request = SliceRequest::whole(Some(budget));
        let Some(bytes) = service.volume_slice(&request, "0").await? else {
            continue;
        };
        let file = BinaryCifFile::from_bytes(&bytes)?;
        let rate = file
            .block("0")
            .and_then(|b| b.category("volume_data_3d_info"))
            .context("slice has no info category")?
            .values("sample_rate")?;
        println!(
            "  budget {:>9}: {} ({:?})",
            budget,
            format_bytes(bytes.len()),
            rate
        );
    }

    let region = SliceRequest::region(
        WorldBox::new([20.0, 40.0, 40.0], [60.0, 80.0, 80.0]),
        Some(20_000),
    );
    if let Some(bytes) = service.segmentation_slice(&region, "0").await? {
        let file = BinaryCifFile::from_bytes(&bytes)?;
        let sets = file
            .block("0")
            .and_then(|b| b.category("segmentation_data_table"))
            .context("slice has no set table")?;
        println!(
            "Segmentation slice: {} with {} set/segment pairs",
            format_bytes(bytes.len()),
            sets.row_count
        );
    }
    Ok(())
}
