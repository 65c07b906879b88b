//! Composition root owning every acceleration structure of a scene.

use crate::blas::{BottomLevelBuilder, BottomLevelStructure};
use crate::config::AccelBuildConfig;
use crate::device::RayTracingDevice;
use crate::error::{AccelError, Result};
use crate::geometry::GeometryRecord;
use crate::instance::{InstanceRecord, InstanceTable};
use crate::sbt::ShaderBindingTable;
use crate::scene::SceneDescription;
use crate::tlas::{TopLevelBuildMode, TopLevelBuilder, TopLevelStructure};
use ash::vk;
use glam::Mat4;
use raykit_gpu::command::{begin_command_buffer, end_command_buffer, submit_and_wait};
use raykit_gpu::{GpuAllocator, MemoryBarrierSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapperState {
    /// Geometry and instances may still be added.
    Describing,
    /// Bottom-level structures exist; only transforms may change.
    Built,
}

/// Owns the geometry records, bottom-level structures and the top-level
/// structure of one scene.
///
/// Describe the scene, call [`build_as`](Self::build_as) once, then update
/// transforms and call
/// [`build_top_level_as_and_instances`](Self::build_top_level_as_and_instances)
/// every animated frame.
pub struct AccelerationStructureWrapper {
    config: AccelBuildConfig,
    geometries: Vec<GeometryRecord>,
    instances: InstanceTable,
    scene_descriptions: Vec<SceneDescription>,
    bottom_level: Vec<BottomLevelStructure>,
    blas_addresses: Vec<vk::DeviceAddress>,
    top_level: Option<TopLevelStructure>,
    state: WrapperState,
}

impl Default for AccelerationStructureWrapper {
    fn default() -> Self {
        Self::new(AccelBuildConfig::default())
    }
}

impl AccelerationStructureWrapper {
    pub fn new(config: AccelBuildConfig) -> Self {
        Self {
            config,
            geometries: Vec::new(),
            instances: InstanceTable::new(),
            scene_descriptions: Vec::new(),
            bottom_level: Vec::new(),
            blas_addresses: Vec::new(),
            top_level: None,
            state: WrapperState::Describing,
        }
    }

    pub fn config(&self) -> &AccelBuildConfig {
        &self.config
    }

    /// Describe one mesh per entry and one instance of each, with vertices
    /// laid out as [`raykit_core::AsVertex`].
    pub fn build_as_model_description(
        &mut self,
        vertex_buffers: &[vk::Buffer],
        index_buffers: &[vk::Buffer],
        vertex_counts: &[u32],
        index_counts: &[u32],
        transforms: &[Mat4],
    ) -> Result<()> {
        let count = vertex_buffers.len();
        for (what, actual) in [
            ("index buffers", index_buffers.len()),
            ("vertex counts", vertex_counts.len()),
            ("index counts", index_counts.len()),
            ("instance transforms", transforms.len()),
        ] {
            if actual != count {
                return Err(AccelError::LengthMismatch {
                    what,
                    expected: count,
                    actual,
                });
            }
        }

        let records = (0..count)
            .map(|i| {
                GeometryRecord::with_default_stride(
                    vertex_buffers[i],
                    index_buffers[i],
                    vertex_counts[i],
                    index_counts[i],
                )
            })
            .collect::<Result<Vec<_>>>()?;

        for (record, transform) in records.into_iter().zip(transforms) {
            let blas_index = self.add_geometry(record)?;
            self.add_instance(
                InstanceRecord::new(blas_index, *transform)
                    .with_mask(self.config.instance_mask)
                    .with_flags(self.config.instance_flags),
            )?;
        }
        Ok(())
    }

    /// Add a mesh and return its bottom-level index.
    pub fn add_geometry(&mut self, record: GeometryRecord) -> Result<u32> {
        self.ensure_describing()?;
        let index = u32::try_from(self.geometries.len()).map_err(|_| {
            AccelError::InvalidGeometry("too many geometry records".to_string())
        })?;
        self.geometries.push(record);
        Ok(index)
    }

    /// Add an instance and return its slot.
    pub fn add_instance(&mut self, record: InstanceRecord) -> Result<usize> {
        if self.state == WrapperState::Built {
            return Err(AccelError::InstanceCountChanged {
                expected: self.instances.len(),
                actual: self.instances.len() + 1,
            });
        }
        self.scene_descriptions
            .push(SceneDescription::new(record.blas_index, record.transform));
        Ok(self.instances.push(record))
    }

    /// Drop every geometry, instance and scene description record.
    pub fn clear_as_model_description_data(&mut self) -> Result<()> {
        self.ensure_describing()?;
        self.geometries.clear();
        self.instances.clear();
        self.scene_descriptions.clear();
        Ok(())
    }

    fn ensure_describing(&self) -> Result<()> {
        match self.state {
            WrapperState::Describing => Ok(()),
            WrapperState::Built => Err(AccelError::AlreadyBuilt),
        }
    }

    /// Checks run before the initial build touches the device.
    fn check_initial_build(&self) -> Result<()> {
        self.ensure_describing()?;
        self.instances.validate(self.geometries.len(), None)
    }

    /// Build every bottom-level structure and the top-level structure, then
    /// submit and wait.
    ///
    /// `cmd` is begun and ended here. Its pool must allow resetting
    /// individual command buffers and it must not be pending.
    ///
    /// # Safety
    /// All handles must be valid and every geometry buffer must hold its
    /// final contents.
    pub unsafe fn build_as(
        &mut self,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<()> {
        self.check_initial_build()?;
        let device = rt.device();

        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .map_err(AccelError::Submit)?;

        let blas_builder = BottomLevelBuilder::new(
            rt,
            self.config.bottom_level_flags,
            self.config.geometry_flags,
        );
        let mut batch = match blas_builder.build_batch(allocator, cmd, &self.geometries) {
            Ok(batch) => batch,
            Err(e) => {
                if let Err(end_err) = end_command_buffer(device, cmd) {
                    tracing::warn!("Failed to end command buffer after BLAS error: {end_err}");
                }
                return Err(e);
            }
        };
        let blas_addresses = batch.device_addresses();

        MemoryBarrierSet::build_to_build().record(device, cmd);

        let mut top_level = None;
        let recorded = TopLevelBuilder::new(rt, flags)
            .build_or_update(
                allocator,
                cmd,
                &mut top_level,
                &self.instances,
                &blas_addresses,
                false,
            )
            .and_then(|_| end_command_buffer(device, cmd).map_err(AccelError::Submit))
            .and_then(|()| submit_and_wait(device, queue, cmd).map_err(AccelError::Submit));

        if let Err(e) = recorded {
            if let Err(wait_err) = device.device_wait_idle() {
                tracing::warn!("Device wait before cleanup failed: {wait_err}");
            }
            if let Err(free_err) = batch.free_scratch(allocator) {
                tracing::warn!("Failed to release BLAS scratch: {free_err}");
            }
            for blas in batch.structures {
                if let Err(free_err) = blas.destroy(rt, allocator) {
                    tracing::warn!("Failed to release BLAS: {free_err}");
                }
            }
            if let Some(tlas) = top_level {
                if let Err(free_err) = tlas.destroy(rt, allocator) {
                    tracing::warn!("Failed to release TLAS: {free_err}");
                }
            }
            return Err(e);
        }

        if let Err(e) = batch.free_scratch(allocator) {
            tracing::warn!("Failed to release BLAS scratch: {e}");
        }

        tracing::info!(
            "Built {} bottom level structures and a top level structure over {} instances",
            batch.structures.len(),
            self.instances.len()
        );

        self.bottom_level = batch.structures;
        self.blas_addresses = blas_addresses;
        self.top_level = top_level;
        self.state = WrapperState::Built;
        Ok(())
    }

    /// Overwrite every instance transform. Host-side only; call
    /// [`build_top_level_as_and_instances`](Self::build_top_level_as_and_instances)
    /// to apply it.
    pub fn update_instance_transform_data(&mut self, transforms: &[Mat4]) -> Result<()> {
        self.instances.update_transforms(transforms)?;
        for (description, transform) in self.scene_descriptions.iter_mut().zip(transforms) {
            description.set_transform(*transform);
        }
        Ok(())
    }

    /// Record a rebuild or update of the top-level structure into `cmd`.
    ///
    /// Nothing is submitted. An update of a structure created without
    /// `ALLOW_UPDATE` falls back to a full rebuild.
    ///
    /// # Safety
    /// `cmd` must be recording, and GPU work from earlier frames that reads
    /// the top-level structure must have completed.
    pub unsafe fn build_top_level_as_and_instances(
        &mut self,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        cmd: vk::CommandBuffer,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        is_update: bool,
    ) -> Result<TopLevelBuildMode> {
        let update = self.effective_update(is_update)?;
        TopLevelBuilder::new(rt, flags).build_or_update(
            allocator,
            cmd,
            &mut self.top_level,
            &self.instances,
            &self.blas_addresses,
            update,
        )
    }

    fn effective_update(&self, is_update: bool) -> Result<bool> {
        let tlas = match (&self.state, &self.top_level) {
            (WrapperState::Built, Some(tlas)) => tlas,
            _ => return Err(AccelError::NotBuilt),
        };
        if is_update && !tlas.allows_update() {
            tracing::debug!("TLAS was created without ALLOW_UPDATE, rebuilding instead");
            return Ok(false);
        }
        Ok(is_update)
    }

    /// Top-level handle for descriptor writes, once built.
    pub fn top_level_acceleration_structure(&self) -> Option<vk::AccelerationStructureKHR> {
        self.top_level.as_ref().map(TopLevelStructure::handle)
    }

    pub fn top_level(&self) -> Option<&TopLevelStructure> {
        self.top_level.as_ref()
    }

    pub fn bottom_level(&self) -> &[BottomLevelStructure] {
        &self.bottom_level
    }

    pub fn blas_addresses(&self) -> &[vk::DeviceAddress] {
        &self.blas_addresses
    }

    pub fn geometries(&self) -> &[GeometryRecord] {
        &self.geometries
    }

    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// Per-instance shader data, in instance slot order.
    pub fn scene_descriptions(&self) -> &[SceneDescription] {
        &self.scene_descriptions
    }

    pub fn is_built(&self) -> bool {
        self.state == WrapperState::Built
    }

    /// Check every instance's hit group offset against a shader binding table.
    pub fn validate_against_sbt(&self, sbt: &ShaderBindingTable) -> Result<()> {
        self.validate_hit_groups(sbt.hit_group_count())
    }

    pub fn validate_hit_groups(&self, hit_group_count: u32) -> Result<()> {
        self.instances
            .validate(self.geometries.len(), Some(hit_group_count))
    }

    /// Destroy every structure.
    ///
    /// # Safety
    /// No pending GPU work may reference any of the structures.
    pub unsafe fn destroy(
        self,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
    ) -> raykit_gpu::Result<()> {
        if let Some(tlas) = self.top_level {
            tlas.destroy(rt, allocator)?;
        }
        for blas in self.bottom_level {
            blas.destroy(rt, allocator)?;
        }
        Ok(())
    }
}
