//! Per-instance shader data.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Per-instance record read by hit shaders, indexed by custom index.
///
/// Laid out for std430: the model index is padded to 16 bytes so both
/// matrices start on a 16-byte boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneDescription {
    /// Index of the mesh the instance draws.
    pub model_index: u32,
    pub _pad: [u32; 3],
    /// Object-to-world transform.
    pub transform: Mat4,
    /// Inverse transpose of `transform`, for normals.
    pub transform_inverse_transpose: Mat4,
}

impl SceneDescription {
    pub fn new(model_index: u32, transform: Mat4) -> Self {
        Self {
            model_index,
            _pad: [0; 3],
            transform,
            transform_inverse_transpose: transform.inverse().transpose(),
        }
    }

    /// Replace the transform, keeping the normal matrix in sync.
    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
        self.transform_inverse_transpose = transform.inverse().transpose();
    }
}
