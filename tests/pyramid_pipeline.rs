//! End-to-end tests: build an entry on disk, reopen it and query slices

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;
use volseg::encoding::ColumnData;
use volseg::{
    BinaryCifFile, BuildConfig, DownsamplingParams, EntryBuilder, EntrySource, FamilySource,
    GridData, GridFamily, IoPyramidStore, PyramidStore, QueryService, SamplingBox, SliceRequest,
    SourceGrid, StorageCompression, TimeInfo, VolsegError,
};

fn family(grids: Vec<(u32, GridData)>, frames: u32) -> FamilySource {
    let shape = grids[0].1.shape();
    FamilySource {
        sampling: SamplingBox {
            origin: [-4.0, 0.0, 2.5],
            voxel_size: [0.5, 0.5, 0.5],
            grid_dimensions: shape,
        },
        time_info: TimeInfo {
            start: 0,
            end: frames - 1,
            units: "millisecond".to_string(),
        },
        grids: grids
            .into_iter()
            .map(|(timeframe, grid)| SourceGrid {
                timeframe,
                channel: "0".to_string(),
                grid,
            })
            .collect(),
    }
}

fn random_labels(rng: &mut StdRng, shape: (usize, usize, usize), labels: u32) -> Array3<u32> {
    Array3::from_shape_fn(shape, |_| rng.gen_range(0..=labels))
}

fn config() -> BuildConfig {
    BuildConfig {
        downsampling: DownsamplingParams {
            min_grid_size: 1,
            min_downsampled_file_size_bytes: 1,
            ..Default::default()
        },
        compression: StorageCompression::Zstd,
        workers: Some(3),
        ..Default::default()
    }
}

async fn open_store(dir: &TempDir) -> Arc<IoPyramidStore> {
    let url = format!("file://{}", dir.path().display());
    Arc::new(IoPyramidStore::open(&url, StorageCompression::Zstd).await.unwrap())
}

#[tokio::test]
async fn test_odd_lattice_pyramid_covers_every_label() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let mut rng = StdRng::seed_from_u64(1832);
    let labels = random_labels(&mut rng, (5, 5, 5), 6);
    let present: BTreeSet<u32> = labels.iter().copied().filter(|&l| l != 0).collect();

    let report = EntryBuilder::new(Arc::clone(&store), config())
        .unwrap()
        .build(EntrySource {
            entry_id: "odd".to_string(),
            lattices: BTreeMap::from([(
                "0".to_string(),
                family(vec![(0, GridData::from(labels))], 1),
            )]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(report.is_complete());

    // 5 -> 3 -> 2 -> 1
    let lattice = GridFamily::segmentation("0");
    let metadata = store.entry_metadata().await.unwrap();
    let sampling = &metadata.lattice("0").unwrap().sampling;
    assert_eq!(sampling.available_ratios(), vec![1, 2, 4, 8]);
    assert_eq!(sampling.box_at(2).unwrap().grid_dimensions, [3, 3, 3]);

    let top = store.read_level(&lattice, 8, 0, "0").await.unwrap();
    let table = store.read_set_table(&lattice, 8, 0).await.unwrap();
    let id = top.as_categories().unwrap()[[0, 0, 0]];
    let covered: BTreeSet<u32> = table.get(id).unwrap().iter().copied().collect();
    assert_eq!(covered, present);
}

#[tokio::test]
async fn test_reopened_entry_serves_frames_independently() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir).await;
        let frames = (0..3)
            .map(|t| {
                let grid = Array3::from_shape_fn((6, 6, 6), |(x, _, _)| (x as u32 * 10 + t) as f32);
                (t, GridData::from(grid))
            })
            .collect();
        let report = EntryBuilder::new(store, config())
            .unwrap()
            .build(EntrySource {
                entry_id: "movie".to_string(),
                volume: Some(family(frames, 3)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.built, vec![GridFamily::Volume]);
    }

    let service = QueryService::open(open_store(&dir).await).await.unwrap();
    for t in 0..3u32 {
        // World x = -4.0 + 0.5 * i, so -3.0 is voxel 2
        let request = SliceRequest::region(
            volseg::WorldBox::new([-3.0, 0.0, 2.5], [-3.0, 0.0, 2.5]),
            None,
        )
        .at_time(t);
        let bytes = service.volume_slice(&request, "0").await.unwrap().unwrap();
        let file = BinaryCifFile::from_bytes(&bytes).unwrap();
        let values = file
            .block("0")
            .unwrap()
            .category("volume_data_3d")
            .unwrap()
            .values("values")
            .unwrap();
        assert_eq!(values, ColumnData::from(vec![(20 + t) as f32]));
    }
    let missing = SliceRequest::whole(None).at_time(3);
    assert!(service.volume_slice(&missing, "0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_removed_level_is_gone_from_disk() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let grid = Array3::from_shape_fn((8, 8, 8), |(x, y, z)| (x * y * z) as f32);
    EntryBuilder::new(Arc::clone(&store), config())
        .unwrap()
        .build(EntrySource {
            entry_id: "trim".to_string(),
            volume: Some(family(vec![(0, GridData::from(grid))], 1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(dir.path().join("volume/2/0/0/grid.bin").exists());

    store.remove_level(&GridFamily::Volume, 2).await.unwrap();
    assert!(!dir.path().join("volume/2/0/0/grid.bin").exists());
    assert!(matches!(
        store.read_level(&GridFamily::Volume, 2, 0, "0").await,
        Err(VolsegError::NotFound(_))
    ));

    let service = QueryService::open(Arc::clone(&store)).await.unwrap();
    // 512 voxels at ratio 1, 64 at ratio 2 (removed), 8 at ratio 4
    let slice = service
        .resolve(&SliceRequest::whole(Some(100)), &[])
        .unwrap()
        .unwrap();
    assert_eq!(slice.downsampling_rate, 4);
}
