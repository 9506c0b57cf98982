//! Segment meshes and their BinaryCIF encoding

use crate::encoding::{CategoryBuilder, CifWriter, ColumnData, EncodingPolicy};
use crate::encoding::writer::default_encoder_name;
use crate::error::{Result, VolsegError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// A triangle mesh in world coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub id: u32,
    pub vertices: Vec<[f32; 3]>,
    /// Vertex indices, counter-clockwise
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    /// Every triangle refers to an existing vertex.
    pub fn validate(&self) -> Result<()> {
        let n = self.vertices.len();
        if let Some(bad) = self
            .triangles
            .iter()
            .flatten()
            .find(|&&v| v as usize >= n)
        {
            return Err(VolsegError::Integrity(format!(
                "mesh {} references vertex {bad} but has {n} vertices",
                self.id
            )));
        }
        Ok(())
    }
}

/// Meshes of one segment at one detail level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshBatch {
    pub segment_id: u32,
    pub detail_level: u32,
    pub meshes: Vec<Mesh>,
}

/// Encode a batch into `mesh`, `mesh_vertex` and `mesh_triangle` categories.
///
/// Each `mesh` row also carries the batch's segment and detail level.
#[instrument(level = "debug", skip_all, fields(segment = batch.segment_id, detail = batch.detail_level))]
pub fn encode_meshes(batch: &MeshBatch, policy: &EncodingPolicy) -> Result<Bytes> {
    let mut ids = Vec::with_capacity(batch.meshes.len());
    let mut vertex_mesh = Vec::new();
    let mut vertex_id = Vec::new();
    let (mut xs, mut ys, mut zs) = (Vec::new(), Vec::new(), Vec::new());
    let mut triangle_mesh = Vec::new();
    let mut triangle_vertex = Vec::new();

    for mesh in &batch.meshes {
        mesh.validate()?;
        ids.push(mesh.id);
        for (i, v) in mesh.vertices.iter().enumerate() {
            vertex_mesh.push(mesh.id);
            vertex_id.push(u32::try_from(i).map_err(|_| {
                VolsegError::EncoderRange(format!("mesh {} has too many vertices", mesh.id))
            })?);
            xs.push(v[0]);
            ys.push(v[1]);
            zs.push(v[2]);
        }
        for &corner in mesh.triangles.iter().flatten() {
            triangle_mesh.push(mesh.id);
            triangle_vertex.push(corner);
        }
    }

    let mut writer = CifWriter::new(default_encoder_name());
    writer.start_data_block("meshes");
    let rows = ids.len();
    writer.write_category(
        CategoryBuilder::new("mesh", *policy)
            .column("id", ColumnData::from(ids))?
            .column("segment_id", ColumnData::from(vec![batch.segment_id; rows]))?
            .column("detail_level", ColumnData::from(vec![batch.detail_level; rows]))?
            .build(),
    )?;
    writer.write_category(
        CategoryBuilder::new("mesh_vertex", *policy)
            .column("mesh_id", ColumnData::from(vertex_mesh))?
            .column("vertex_id", ColumnData::from(vertex_id))?
            .column("x", ColumnData::from(xs))?
            .column("y", ColumnData::from(ys))?
            .column("z", ColumnData::from(zs))?
            .build(),
    )?;
    writer.write_category(
        CategoryBuilder::new("mesh_triangle", *policy)
            .column("mesh_id", ColumnData::from(triangle_mesh))?
            .column("vertex_id", ColumnData::from(triangle_vertex))?
            .build(),
    )?;
    writer.encode()
}
