//! The top-level acceleration structure and its per-frame rebuild.

use crate::blas::BuildSizes;
use crate::device::RayTracingDevice;
use crate::error::{AccelError, Result};
use crate::instance::InstanceTable;
use ash::vk;
use gpu_allocator::MemoryLocation;
use raykit_gpu::{GpuAllocator, GpuBuffer, GpuError, MemoryBarrierSet};

const INSTANCE_SIZE: u64 = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64;

/// Instance data must start on a 16-byte boundary.
const INSTANCE_BUFFER_ALIGNMENT: u64 = 16;

/// The single scene-wide structure over all instances.
pub struct TopLevelStructure {
    acceleration_structure: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    instance_buffer: GpuBuffer,
    scratch_buffer: GpuBuffer,
    device_address: vk::DeviceAddress,
    sizes: BuildSizes,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    instance_count: usize,
    build_count: u64,
}

impl TopLevelStructure {
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.acceleration_structure
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    pub fn allows_update(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    pub fn sizes(&self) -> BuildSizes {
        self.sizes
    }

    /// Host-visible buffer holding the instances of the last recorded build.
    pub fn instance_buffer(&self) -> &GpuBuffer {
        &self.instance_buffer
    }

    /// Number of builds and updates recorded so far.
    pub fn build_count(&self) -> u64 {
        self.build_count
    }

    /// Destroy the structure and its buffers.
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
        allocator.free_buffer(&mut self.buffer)?;
        allocator.free_buffer(&mut self.instance_buffer)?;
        allocator.free_buffer(&mut self.scratch_buffer)?;
        Ok(())
    }
}

/// Mode of one top-level build, given the state of the existing structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopLevelBuildMode {
    /// First build of a freshly created structure.
    Create,
    /// Full rebuild into the existing structure.
    Rebuild,
    /// In-place refit of the existing structure.
    Update,
}

impl TopLevelBuildMode {
    fn vk_mode(self) -> vk::BuildAccelerationStructureModeKHR {
        match self {
            Self::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
            Self::Create | Self::Rebuild => vk::BuildAccelerationStructureModeKHR::BUILD,
        }
    }
}

/// Decide how a build should proceed, rejecting misuse.
///
/// `existing` is `(creation flags, instance count)` of the current
/// structure, if one exists.
pub fn select_build_mode(
    existing: Option<(vk::BuildAccelerationStructureFlagsKHR, usize)>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    instance_count: usize,
    is_update: bool,
) -> Result<TopLevelBuildMode> {
    let Some((created, expected)) = existing else {
        return if is_update {
            Err(AccelError::NotBuilt)
        } else {
            Ok(TopLevelBuildMode::Create)
        };
    };

    if created != flags {
        return Err(AccelError::FlagsChanged {
            created,
            requested: flags,
        });
    }
    if expected != instance_count {
        return Err(AccelError::InstanceCountChanged {
            expected,
            actual: instance_count,
        });
    }
    if !is_update {
        return Ok(TopLevelBuildMode::Rebuild);
    }
    if created.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE) {
        Ok(TopLevelBuildMode::Update)
    } else {
        Err(AccelError::UpdateNotAllowed)
    }
}

/// Packs instances and builds or updates the top-level structure.
pub struct TopLevelBuilder<'a> {
    rt: &'a RayTracingDevice,
    flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl<'a> TopLevelBuilder<'a> {
    pub fn new(rt: &'a RayTracingDevice, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        Self { rt, flags }
    }

    /// Query requirements for `instance_count` instances.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn query_sizes(&self, instance_count: u32) -> BuildSizes {
        let geometry = instances_geometry(0);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.rt
            .acceleration_structure()
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut sizes,
            );
        sizes.into()
    }

    /// Allocate buffers and create an empty structure for `instance_count`
    /// instances. The scratch buffer serves both build and update.
    ///
    /// # Safety
    /// The device and allocator must be valid.
    pub unsafe fn create(
        &self,
        allocator: &mut GpuAllocator,
        instance_count: usize,
    ) -> Result<TopLevelStructure> {
        let count = u32::try_from(instance_count).map_err(|_| {
            AccelError::TopLevelBuild(GpuError::InvalidState(format!(
                "{instance_count} instances exceed the device instance count"
            )))
        })?;
        let max = self.rt.capabilities().max_instance_count;
        if max > 0 && u64::from(count) > max {
            return Err(AccelError::TopLevelBuild(GpuError::InvalidState(format!(
                "{count} instances exceed the device limit of {max}"
            ))));
        }

        let sizes = self.query_sizes(count);
        let mut created: Vec<GpuBuffer> = Vec::with_capacity(3);
        let result = self.allocate(allocator, count, sizes, &mut created);

        match result {
            Ok(tlas) => {
                tracing::info!(
                    "Created TLAS for {count} instances: storage {} bytes, scratch {} bytes",
                    sizes.acceleration_structure_size,
                    sizes.max_scratch_size()
                );
                Ok(tlas)
            }
            Err(e) => {
                for mut buffer in created {
                    if let Err(free_err) = allocator.free_buffer(&mut buffer) {
                        tracing::warn!("Failed to release TLAS buffer: {free_err}");
                    }
                }
                Err(AccelError::TopLevelBuild(e))
            }
        }
    }

    unsafe fn allocate(
        &self,
        allocator: &mut GpuAllocator,
        count: u32,
        sizes: BuildSizes,
        created: &mut Vec<GpuBuffer>,
    ) -> raykit_gpu::Result<TopLevelStructure> {
        let buffer = allocator.create_buffer(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "tlas_buffer",
        )?;
        created.push(buffer);

        let instance_buffer = allocator.create_buffer_aligned(
            INSTANCE_SIZE * u64::from(count.max(1)),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "tlas_instance_buffer",
            INSTANCE_BUFFER_ALIGNMENT,
        )?;
        created.push(instance_buffer);

        let scratch_buffer = allocator.create_buffer_aligned(
            sizes.max_scratch_size().max(1),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "tlas_scratch_buffer",
            u64::from(self.rt.capabilities().min_scratch_offset_alignment.max(1)),
        )?;
        created.push(scratch_buffer);

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(created[0].buffer)
            .offset(0)
            .size(sizes.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        let acceleration_structure = self
            .rt
            .acceleration_structure()
            .create_acceleration_structure(&create_info, None)?;
        let device_address = self.rt.acceleration_structure_address(acceleration_structure);

        let scratch_buffer = created.pop().ok_or_else(missing_buffer)?;
        let instance_buffer = created.pop().ok_or_else(missing_buffer)?;
        let buffer = created.pop().ok_or_else(missing_buffer)?;

        Ok(TopLevelStructure {
            acceleration_structure,
            buffer,
            instance_buffer,
            scratch_buffer,
            device_address,
            sizes,
            flags: self.flags,
            instance_count: count as usize,
            build_count: 0,
        })
    }

    /// Pack `instances`, upload them and record a build or update of `tlas`.
    ///
    /// The structure is created on the first call, which must not be an
    /// update. Later calls reuse its buffers; instance count and build flags
    /// are fixed from then on. Commands are recorded into `cmd` only:
    /// upload barrier, build, then a barrier making the result visible to
    /// ray tracing shaders.
    ///
    /// # Safety
    /// The command buffer must be recording, every address in
    /// `blas_addresses` must belong to a built structure, and no pending
    /// GPU work may still read the previous contents of `tlas`.
    pub unsafe fn build_or_update(
        &self,
        allocator: &mut GpuAllocator,
        cmd: vk::CommandBuffer,
        tlas: &mut Option<TopLevelStructure>,
        instances: &InstanceTable,
        blas_addresses: &[vk::DeviceAddress],
        is_update: bool,
    ) -> Result<TopLevelBuildMode> {
        let mode = select_build_mode(
            tlas.as_ref().map(|t| (t.flags, t.instance_count)),
            self.flags,
            instances.len(),
            is_update,
        )?;
        let packed = instances.flatten(blas_addresses)?;

        if tlas.is_none() {
            *tlas = Some(self.create(allocator, packed.len())?);
        }
        let structure = tlas.as_mut().ok_or(AccelError::NotBuilt)?;

        if !packed.is_empty() {
            structure
                .instance_buffer
                .write(&packed)
                .map_err(AccelError::TopLevelBuild)?;
        }

        self.record(cmd, structure, mode);
        structure.build_count += 1;

        tracing::trace!(
            "Recorded TLAS {:?} #{} over {} instances",
            mode,
            structure.build_count,
            packed.len()
        );

        Ok(mode)
    }

    unsafe fn record(&self, cmd: vk::CommandBuffer, tlas: &TopLevelStructure, mode: TopLevelBuildMode) {
        let device = self.rt.device();
        MemoryBarrierSet::upload_to_build().record(device, cmd);

        let geometry = instances_geometry(self.rt.buffer_address(tlas.instance_buffer.buffer));
        let source = match mode {
            TopLevelBuildMode::Update => tlas.acceleration_structure,
            TopLevelBuildMode::Create | TopLevelBuildMode::Rebuild => {
                vk::AccelerationStructureKHR::null()
            }
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(tlas.flags)
            .mode(mode.vk_mode())
            .src_acceleration_structure(source)
            .dst_acceleration_structure(tlas.acceleration_structure)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.rt.buffer_address(tlas.scratch_buffer.buffer),
            });

        #[allow(clippy::cast_possible_truncation)]
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(tlas.instance_count as u32)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        self.rt.acceleration_structure().cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&build_range)],
        );

        MemoryBarrierSet::build_to_trace().record(device, cmd);
    }
}

fn instances_geometry(instance_address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                }),
        })
}

fn missing_buffer() -> GpuError {
    GpuError::InvalidState("TLAS buffer list out of order".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flags = vk::BuildAccelerationStructureFlagsKHR;

    fn updatable() -> Flags {
        Flags::PREFER_FAST_TRACE | Flags::ALLOW_UPDATE
    }

    #[test]
    fn first_build_creates() {
        assert_eq!(
            select_build_mode(None, updatable(), 4, false).unwrap(),
            TopLevelBuildMode::Create
        );
    }

    #[test]
    fn update_before_build_is_rejected() {
        assert!(matches!(
            select_build_mode(None, updatable(), 4, true),
            Err(AccelError::NotBuilt)
        ));
    }

    #[test]
    fn update_and_rebuild() {
        let existing = Some((updatable(), 4));
        assert_eq!(
            select_build_mode(existing, updatable(), 4, true).unwrap(),
            TopLevelBuildMode::Update
        );
        assert_eq!(
            select_build_mode(existing, updatable(), 4, false).unwrap(),
            TopLevelBuildMode::Rebuild
        );
    }

    #[test]
    fn update_needs_allow_update() {
        let existing = Some((Flags::PREFER_FAST_TRACE, 1));
        assert!(matches!(
            select_build_mode(existing, Flags::PREFER_FAST_TRACE, 1, true),
            Err(AccelError::UpdateNotAllowed)
        ));
    }

    #[test]
    fn fixed_after_creation() {
        let existing = Some((updatable(), 4));
        assert!(matches!(
            select_build_mode(existing, updatable(), 5, true),
            Err(AccelError::InstanceCountChanged { expected: 4, actual: 5 })
        ));
        assert!(matches!(
            select_build_mode(existing, Flags::PREFER_FAST_BUILD, 4, false),
            Err(AccelError::FlagsChanged { .. })
        ));
    }

    #[test]
    fn vk_modes() {
        assert_eq!(
            TopLevelBuildMode::Update.vk_mode(),
            vk::BuildAccelerationStructureModeKHR::UPDATE
        );
        assert_eq!(
            TopLevelBuildMode::Create.vk_mode(),
            vk::BuildAccelerationStructureModeKHR::BUILD
        );
    }

    #[test]
    fn instance_geometry_points_at_buffer() {
        let geometry = instances_geometry(0x4000);
        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::INSTANCES);
        let instances = unsafe { geometry.geometry.instances };
        assert_eq!(instances.array_of_pointers, vk::FALSE);
        assert_eq!(unsafe { instances.data.device_address }, 0x4000);
    }
}
