//! volseg - multi-resolution volume and segmentation data engine
//!
//! Builds resolution pyramids for cryo-EM style entries and serves slices of
//! them to visualization clients.
//!
//! # Features
//!
//! - Category-set downsampling of segmentation lattices: a coarse voxel
//!   carries the set of every label beneath it, interned in a per-level set
//!   table
//! - Magic-kernel downsampling of continuous volumes
//! - Log-domain quantization of volume levels to `u8`/`u16`
//! - Level selection under a point budget for world-space requests
//! - BinaryCIF encoding (delta, run-length, integer packing, interval
//!   quantization, fixed point, string arrays) of slices and meshes
//! - Async storage (local filesystem or in-memory; implement `IOManager`
//!   for anything else) with Deflate/Zstd compressed levels
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use volseg::{BuildConfig, EntryBuilder, IoPyramidStore, QueryService, SliceRequest};
//!
//! # async fn example(source: volseg::EntrySource) -> volseg::Result<()> {
//! let store = Arc::new(IoPyramidStore::open("file:///data/emd-1832", Default::default()).await?);
//! EntryBuilder::new(Arc::clone(&store), BuildConfig::default())?
//!     .build(source)
//!     .await?;
//!
//! let service = QueryService::open(store).await?;
//! let bcif = service.volume_slice(&SliceRequest::whole(Some(100_000)), "0").await?;
//! # Ok(())
//! # }
//! ```

pub mod category_downsampling;
pub mod compression;
pub mod config;
pub mod encoding;
pub mod error;
pub mod grid;
pub mod io;
pub mod magic_kernel;
pub mod mesh;
pub mod metadata;
pub mod plan;
pub mod pyramid;
pub mod quantization;
pub mod query;
pub mod set_table;
pub mod slice_box;
pub mod store;
pub mod types;
pub mod utils;

// Re-exports
pub use category_downsampling::{build_category_pyramid, downsample_categories, CategoryLevel};
pub use compression::StorageCompression;
pub use config::{BuildConfig, DownsamplingParams, QuantizationParams};
pub use encoding::{encode_slice, BinaryCifFile, ColumnData, EncodingPolicy, VolumeInfo};
pub use error::{Result, VolsegError};
pub use grid::{GridData, GridShape};
pub use io::{IOManager, StorageBackend};
pub use magic_kernel::{downsample_magic_kernel, downsample_volume};
pub use mesh::{encode_meshes, Mesh, MeshBatch};
pub use metadata::{EntryMetadata, SamplingBox, SamplingInfo, TimeInfo};
pub use plan::DownsamplingPlan;
pub use pyramid::{BuildReport, EntryBuilder, EntrySource, FamilySource, SourceGrid};
pub use quantization::{dequantize, quantize, QuantizationDescriptor, QuantizationDtype};
pub use query::{QueryService, SliceRequest};
pub use set_table::{CategoryId, Label, SetTable};
pub use slice_box::{resolve_slice_box, SliceBox};
pub use store::{GridFamily, IoPyramidStore, PyramidStore};
pub use types::{DataType, WorldBox};

/// Version of the volseg implementation
pub const VOLSEG_VERSION: &str = env!("CARGO_PKG_VERSION");
