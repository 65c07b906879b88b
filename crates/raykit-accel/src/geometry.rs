//! Per-mesh build input for bottom-level acceleration structures.

use crate::error::{AccelError, Result};
use ash::vk;
use raykit_core::AsVertex;

/// Vertex position format read by triangle builds.
pub const VERTEX_FORMAT: vk::Format = vk::Format::R32G32B32_SFLOAT;

/// Index type read by triangle builds.
pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;

/// Raw geometry of one mesh, used to build one bottom-level structure.
///
/// The vertex and index buffers are owned by the caller and must have been
/// created with `SHADER_DEVICE_ADDRESS` and
/// `ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR` usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryRecord {
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    vertex_count: u32,
    index_count: u32,
    primitive_count: u32,
    vertex_stride: u32,
}

impl GeometryRecord {
    /// Create a record for an indexed triangle list.
    ///
    /// The primitive count is `ceil(index_count / 3)`; index counts that
    /// leave a partial triangle are rejected.
    pub fn new(
        vertex_buffer: vk::Buffer,
        index_buffer: vk::Buffer,
        vertex_count: u32,
        index_count: u32,
        vertex_stride: u32,
    ) -> Result<Self> {
        let record = Self {
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
            primitive_count: index_count.div_ceil(3),
            vertex_stride,
        };
        record.validate()?;
        Ok(record)
    }

    /// Create a record for vertices laid out as [`AsVertex`].
    pub fn with_default_stride(
        vertex_buffer: vk::Buffer,
        index_buffer: vk::Buffer,
        vertex_count: u32,
        index_count: u32,
    ) -> Result<Self> {
        Self::new(
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
            AsVertex::STRIDE,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.vertex_stride == 0 {
            return Err(AccelError::InvalidGeometry(
                "vertex stride must be non-zero".to_string(),
            ));
        }
        if u64::from(self.primitive_count) * 3 > u64::from(self.index_count) {
            return Err(AccelError::InvalidGeometry(format!(
                "{} indices do not form whole triangles",
                self.index_count
            )));
        }
        if self.primitive_count > 0 && self.vertex_count == 0 {
            return Err(AccelError::InvalidGeometry(
                "indexed geometry without vertices".to_string(),
            ));
        }
        if self.vertex_buffer == vk::Buffer::null() || self.index_buffer == vk::Buffer::null() {
            return Err(AccelError::InvalidGeometry(
                "vertex and index buffers must be valid handles".to_string(),
            ));
        }
        Ok(())
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.index_buffer
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }

    /// Highest vertex index the build may read.
    pub fn max_vertex(&self) -> u32 {
        self.vertex_count.saturating_sub(1)
    }

    /// Triangle geometry descriptor reading from the given buffer addresses.
    pub fn triangles_geometry(
        &self,
        vertex_address: vk::DeviceAddress,
        index_address: vk::DeviceAddress,
        flags: vk::GeometryFlagsKHR,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(VERTEX_FORMAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_address,
            })
            .vertex_stride(u64::from(self.vertex_stride))
            .max_vertex(self.max_vertex())
            .index_type(INDEX_TYPE)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_address,
            });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
    }

    /// Build range covering every primitive of the record.
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }
}
