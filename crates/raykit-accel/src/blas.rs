//! Bottom-level acceleration structures over triangle meshes.

use crate::device::RayTracingDevice;
use crate::error::{AccelError, Result};
use crate::geometry::GeometryRecord;
use ash::vk;
use gpu_allocator::MemoryLocation;
use raykit_gpu::{GpuAllocator, GpuBuffer, GpuError, MemoryBarrierSet};

/// Device-reported memory requirements of one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl BuildSizes {
    /// Scratch size that serves both build and update modes.
    pub fn max_scratch_size(&self) -> u64 {
        self.build_scratch_size.max(self.update_scratch_size)
    }
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR<'_>> for BuildSizes {
    fn from(sizes: vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }
}

/// A built spatial index over one [`GeometryRecord`].
pub struct BottomLevelStructure {
    acceleration_structure: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    device_address: vk::DeviceAddress,
    primitive_count: u32,
    sizes: BuildSizes,
}

impl BottomLevelStructure {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure
    }

    /// Device address referenced by instances.
    ///
    /// Resolved once after the build is recorded and assumed stable for the
    /// lifetime of the structure.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    pub fn sizes(&self) -> BuildSizes {
        self.sizes
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Destroy the structure and free its storage.
    ///
    /// # Safety
    /// No pending GPU work may reference the structure.
    pub unsafe fn destroy(
        mut self,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
    ) -> raykit_gpu::Result<()> {
        rt.acceleration_structure()
            .destroy_acceleration_structure(self.acceleration_structure, None);
        allocator.free_buffer(&mut self.buffer)
    }
}

/// Structures built by one batch and the scratch buffer they share.
///
/// The scratch buffer must stay alive until the recorded builds have
/// executed; free it with [`BottomLevelBatch::free_scratch`] afterwards.
pub struct BottomLevelBatch {
    pub structures: Vec<BottomLevelStructure>,
    scratch: Option<GpuBuffer>,
}

impl BottomLevelBatch {
    /// Device addresses of the structures, in build order.
    pub fn device_addresses(&self) -> Vec<vk::DeviceAddress> {
        self.structures
            .iter()
            .map(BottomLevelStructure::device_address)
            .collect()
    }

    pub fn scratch_size(&self) -> u64 {
        self.scratch.as_ref().map_or(0, |s| s.size)
    }

    /// Release the shared scratch buffer.
    ///
    /// # Safety
    /// The command buffer the builds were recorded into must have completed.
    pub unsafe fn free_scratch(&mut self, allocator: &mut GpuAllocator) -> raykit_gpu::Result<()> {
        if let Some(mut scratch) = self.scratch.take() {
            allocator.free_buffer(&mut scratch)?;
        }
        Ok(())
    }
}

/// Builds one bottom-level structure per [`GeometryRecord`].
pub struct BottomLevelBuilder<'a> {
    rt: &'a RayTracingDevice,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometry_flags: vk::GeometryFlagsKHR,
}

impl<'a> BottomLevelBuilder<'a> {
    pub fn new(
        rt: &'a RayTracingDevice,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometry_flags: vk::GeometryFlagsKHR,
    ) -> Self {
        Self {
            rt,
            flags,
            geometry_flags,
        }
    }

    /// Query storage and scratch requirements for one geometry.
    ///
    /// # Safety
    /// The geometry's buffers must be valid handles on this device.
    pub unsafe fn query_sizes(&self, geometry: &GeometryRecord) -> BuildSizes {
        let descriptor = self.descriptor(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&descriptor));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.rt
            .acceleration_structure()
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[geometry.primitive_count()],
                &mut sizes,
            );
        sizes.into()
    }

    /// Allocate storage and create an empty structure of the given size.
    ///
    /// # Safety
    /// The device and allocator must be valid.
    pub unsafe fn create(
        &self,
        allocator: &mut GpuAllocator,
        geometry: &GeometryRecord,
        sizes: BuildSizes,
        name: &str,
    ) -> raykit_gpu::Result<BottomLevelStructure> {
        let mut buffer = allocator.create_buffer(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let acceleration_structure = match self
            .rt
            .acceleration_structure()
            .create_acceleration_structure(&create_info, None)
        {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(free_err) = allocator.free_buffer(&mut buffer) {
                    tracing::warn!("Failed to release BLAS storage {name}: {free_err}");
                }
                return Err(GpuError::from(e));
            }
        };

        Ok(BottomLevelStructure {
            acceleration_structure,
            buffer,
            device_address: 0,
            primitive_count: geometry.primitive_count(),
            sizes,
        })
    }

    /// Record the build of `blas` from `geometry` and resolve its address.
    ///
    /// # Safety
    /// The command buffer must be recording and the scratch address must
    /// point at a buffer of at least `blas.sizes().build_scratch_size` bytes
    /// aligned to `min_scratch_offset_alignment`.
    pub unsafe fn record_build(
        &self,
        cmd: vk::CommandBuffer,
        geometry: &GeometryRecord,
        blas: &mut BottomLevelStructure,
        scratch_address: vk::DeviceAddress,
    ) {
        let descriptor = self.descriptor(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(blas.acceleration_structure)
            .geometries(std::slice::from_ref(&descriptor))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        let build_range = geometry.build_range();

        self.rt.acceleration_structure().cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&build_range)],
        );

        blas.device_address = self
            .rt
            .acceleration_structure_address(blas.acceleration_structure);
    }

    /// Build one structure with its own scratch buffer.
    ///
    /// Returns the structure and the scratch buffer, which the caller frees
    /// once `cmd` has executed.
    ///
    /// # Safety
    /// The command buffer must be recording and the geometry's buffers must
    /// hold their final contents by the time it executes.
    pub unsafe fn build(
        &self,
        allocator: &mut GpuAllocator,
        cmd: vk::CommandBuffer,
        geometry: &GeometryRecord,
    ) -> Result<(BottomLevelStructure, GpuBuffer)> {
        let wrap = |source| AccelError::BottomLevelBuild { index: 0, source };
        self.check_limits(0, geometry)?;

        let sizes = self.query_sizes(geometry);
        let mut blas = self.create(allocator, geometry, sizes, "blas").map_err(wrap)?;
        let scratch = match self.create_scratch(allocator, sizes.build_scratch_size, "blas_scratch") {
            Ok(scratch) => scratch,
            Err(e) => {
                if let Err(free_err) = blas.destroy(self.rt, allocator) {
                    tracing::warn!("Failed to release BLAS: {free_err}");
                }
                return Err(wrap(e));
            }
        };

        let scratch_address = self.rt.buffer_address(scratch.buffer);
        self.record_build(cmd, geometry, &mut blas, scratch_address);

        Ok((blas, scratch))
    }

    /// Build every geometry, sharing one scratch buffer sized to the largest
    /// requirement. A barrier separates consecutive builds.
    ///
    /// # Safety
    /// Same requirements as [`build`](Self::build) for every geometry.
    pub unsafe fn build_batch(
        &self,
        allocator: &mut GpuAllocator,
        cmd: vk::CommandBuffer,
        geometries: &[GeometryRecord],
    ) -> Result<BottomLevelBatch> {
        let mut structures: Vec<BottomLevelStructure> = Vec::with_capacity(geometries.len());
        let mut scratch_size = 0u64;

        for (index, geometry) in geometries.iter().enumerate() {
            let created = self.check_limits(index, geometry).and_then(|()| {
                let sizes = self.query_sizes(geometry);
                tracing::debug!(
                    "BLAS {index}: {} primitives, storage {} bytes, scratch {} bytes",
                    geometry.primitive_count(),
                    sizes.acceleration_structure_size,
                    sizes.build_scratch_size
                );
                scratch_size = scratch_size.max(sizes.build_scratch_size);
                self.create(allocator, geometry, sizes, &format!("blas_{index}"))
                    .map_err(|source| AccelError::BottomLevelBuild { index, source })
            });
            match created {
                Ok(blas) => structures.push(blas),
                Err(e) => {
                    destroy_all(self.rt, allocator, structures);
                    return Err(e);
                }
            }
        }

        if structures.is_empty() {
            return Ok(BottomLevelBatch {
                structures,
                scratch: None,
            });
        }

        let scratch = match self.create_scratch(allocator, scratch_size, "blas_shared_scratch") {
            Ok(scratch) => scratch,
            Err(source) => {
                destroy_all(self.rt, allocator, structures);
                return Err(AccelError::BottomLevelBuild { index: 0, source });
            }
        };
        let scratch_address = self.rt.buffer_address(scratch.buffer);

        let between_builds = MemoryBarrierSet::build_to_build();
        for (index, (geometry, blas)) in geometries.iter().zip(structures.iter_mut()).enumerate() {
            if index > 0 {
                between_builds.record(self.rt.device(), cmd);
            }
            self.record_build(cmd, geometry, blas, scratch_address);
        }

        tracing::info!(
            "Recorded {} BLAS builds sharing {} bytes of scratch",
            structures.len(),
            scratch.size
        );

        Ok(BottomLevelBatch {
            structures,
            scratch: Some(scratch),
        })
    }

    fn descriptor(&self, geometry: &GeometryRecord) -> vk::AccelerationStructureGeometryKHR<'static> {
        // SAFETY: both buffers are valid handles per GeometryRecord's contract.
        let (vertex_address, index_address) = unsafe {
            (
                self.rt.buffer_address(geometry.vertex_buffer()),
                self.rt.buffer_address(geometry.index_buffer()),
            )
        };
        geometry.triangles_geometry(vertex_address, index_address, self.geometry_flags)
    }

    fn check_limits(&self, index: usize, geometry: &GeometryRecord) -> Result<()> {
        let max = self.rt.capabilities().max_primitive_count;
        if max > 0 && u64::from(geometry.primitive_count()) > max {
            return Err(AccelError::InvalidGeometry(format!(
                "geometry {index} has {} primitives, device limit is {max}",
                geometry.primitive_count()
            )));
        }
        Ok(())
    }

    unsafe fn create_scratch(
        &self,
        allocator: &mut GpuAllocator,
        size: u64,
        name: &str,
    ) -> raykit_gpu::Result<GpuBuffer> {
        allocator.create_buffer_aligned(
            size.max(1),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
            u64::from(self.rt.capabilities().min_scratch_offset_alignment.max(1)),
        )
    }
}

unsafe fn destroy_all(
    rt: &RayTracingDevice,
    allocator: &mut GpuAllocator,
    structures: Vec<BottomLevelStructure>,
) {
    for blas in structures {
        if let Err(e) = blas.destroy(rt, allocator) {
            tracing::warn!("Failed to release BLAS after aborted build: {e}");
        }
    }
}
