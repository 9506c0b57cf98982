//! Binary columnar encoding (BinaryCIF)
//!
//! Query results are written as categories of typed columns. Each column is
//! passed through a short pipeline of invertible encodings (delta, run-length,
//! integer packing, interval quantization, fixed point) and ends as a
//! little-endian byte array. The applied encodings are recorded in the column
//! header, so a reader needs nothing but the file to decode it.
//!
//! ```text
//! ColumnData --Delta--> Int32 --RunLength--> Int32 pairs --IntegerPacking--> Uint8
//!            --ByteArray--> bytes
//! ```

pub mod categories;
pub mod data;
pub mod decoder;
pub mod encoders;
pub mod pipeline;
pub mod writer;

pub use categories::{encode_slice, flatten_x_fastest, VolumeInfo};
pub use data::ColumnData;
pub use decoder::{decode, decode_strings};
pub use encoders::{EncodedData, Encoding, EncodingStep};
pub use pipeline::{choose_pipeline, encode_column, ColumnStats, EncodingPolicy, Pipeline};
pub use writer::{
    encode_strings, BinaryCifFile, Category, CategoryBuilder, CifWriter, Column, DataBlock,
    BINARY_CIF_VERSION,
};
