//! Ray tracing vertex format and CPU mesh data.

use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Vertex layout consumed by bottom-level builds and hit shaders (44 bytes).
///
/// The position sits at offset 0 so the build input can read it as
/// `R32G32B32_SFLOAT` with the full struct size as stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AsVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coord: [f32; 2],
    pub tangent: [f32; 3],
}

impl AsVertex {
    /// Size of one vertex in bytes, the default vertex stride.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    /// Create a vertex with a position and normal, other attributes zeroed.
    pub fn new(position: Vec3, normal: Vec3) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            ..Self::default()
        }
    }

    /// Position as a vector.
    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// Indexed triangle list held on the CPU.
///
/// Index buffers are always 32-bit and a complete list of triangles.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    vertices: Vec<AsVertex>,
    indices: Vec<u32>,
}

impl MeshData {
    /// Create mesh data, validating the index list.
    pub fn new(vertices: Vec<AsVertex>, indices: Vec<u32>) -> Result<Self> {
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::OutOfBounds(format!(
                "index {bad} exceeds vertex count {}",
                vertices.len()
            )));
        }
        Ok(Self { vertices, indices })
    }

    /// A single triangle in the XY plane, counter-clockwise seen from +Z.
    pub fn triangle() -> Self {
        let normal = Vec3::Z;
        Self {
            vertices: vec![
                AsVertex::new(Vec3::new(-1.0, -1.0, 0.0), normal),
                AsVertex::new(Vec3::new(1.0, -1.0, 0.0), normal),
                AsVertex::new(Vec3::new(0.0, 1.0, 0.0), normal),
            ],
            indices: vec![0, 1, 2],
        }
    }

    /// A square of the given half extent in the XZ plane, facing +Y.
    pub fn quad(half_extent: f32) -> Self {
        let h = half_extent;
        let normal = Vec3::Y;
        Self {
            vertices: vec![
                AsVertex::new(Vec3::new(-h, 0.0, -h), normal),
                AsVertex::new(Vec3::new(-h, 0.0, h), normal),
                AsVertex::new(Vec3::new(h, 0.0, h), normal),
                AsVertex::new(Vec3::new(h, 0.0, -h), normal),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    pub fn vertices(&self) -> &[AsVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Number of triangles.
    pub fn primitive_count(&self) -> u32 {
        self.index_count() / 3
    }

    /// Vertex bytes ready for upload.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index bytes ready for upload.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Iterate over triangle corner positions.
    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        self.indices.chunks_exact(3).map(|tri| {
            [
                self.vertices[tri[0] as usize].position(),
                self.vertices[tri[1] as usize].position(),
                self.vertices[tri[2] as usize].position(),
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_size() {
        assert_eq!(std::mem::size_of::<AsVertex>(), 44);
        assert_eq!(AsVertex::STRIDE, 44);
    }

    #[test]
    fn builtin_meshes() {
        let tri = MeshData::triangle();
        assert_eq!(tri.vertex_count(), 3);
        assert_eq!(tri.primitive_count(), 1);
        assert_eq!(tri.vertex_bytes().len(), 3 * 44);

        let quad = MeshData::quad(2.0);
        assert_eq!(quad.primitive_count(), 2);
        assert_eq!(quad.index_bytes().len(), 24);
        assert_eq!(quad.triangles().count(), 2);
    }

    #[test]
    fn rejects_partial_triangle() {
        let err = MeshData::new(MeshData::triangle().vertices().to_vec(), vec![0, 1]);
        assert!(matches!(err, Err(Error::InvalidData(_))));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let err = MeshData::new(MeshData::triangle().vertices().to_vec(), vec![0, 1, 3]);
        assert!(matches!(err, Err(Error::OutOfBounds(_))));
    }
}
