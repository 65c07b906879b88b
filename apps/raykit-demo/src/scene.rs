//! Demo scene: a few meshes, instanced on a grid and spun every frame.

use anyhow::Context;
use ash::vk;
use glam::{Mat4, Quat, Vec3};
use gpu_allocator::MemoryLocation;
use raykit_accel::{
    AccelBuildConfig, AccelerationStructureWrapper, GeometryRecord, InstanceRecord,
    RayTracingDevice, TopLevelBuildMode,
};
use raykit_core::MeshData;
use raykit_gpu::{GpuAllocator, GpuBuffer, GpuContext};

/// Spacing between grid cells in world units.
const GRID_SPACING: f32 = 3.0;
/// Rotation speed in radians per frame.
const SPIN_PER_FRAME: f32 = 0.02;

pub struct DemoScene {
    pub wrapper: AccelerationStructureWrapper,
    base_transforms: Vec<Mat4>,
    buffers: Vec<GpuBuffer>,
    rebuild: bool,
}

impl DemoScene {
    /// Upload the meshes, describe `instances` copies of each and build both
    /// levels.
    ///
    /// # Safety
    /// `cmd` must belong to a pool allowing resets and must not be pending.
    pub unsafe fn load(
        context: &GpuContext,
        rt: &RayTracingDevice,
        cmd: vk::CommandBuffer,
        instances: u32,
        rebuild: bool,
    ) -> anyhow::Result<Self> {
        let meshes = [MeshData::triangle(), MeshData::quad(1.0)];
        let config = AccelBuildConfig::default();
        let mut wrapper = AccelerationStructureWrapper::new(config);
        let mut buffers = Vec::new();
        let mut allocator = context.allocator().lock();

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            let vertices = upload(&mut allocator, mesh.vertex_bytes(), "demo_vertices")?;
            let indices = upload(&mut allocator, mesh.index_bytes(), "demo_indices")?;
            let record = GeometryRecord::with_default_stride(
                vertices.buffer,
                indices.buffer,
                mesh.vertex_count(),
                mesh.index_count(),
            )?;
            buffers.push(vertices);
            buffers.push(indices);

            let blas_index = wrapper.add_geometry(record)?;
            for i in 0..instances {
                let transform = grid_transform(mesh_index as u32, i);
                wrapper.add_instance(
                    InstanceRecord::new(blas_index, transform)
                        .with_mask(config.instance_mask)
                        .with_flags(config.instance_flags),
                )?;
            }
        }

        let base_transforms = wrapper.instances().iter().map(|r| r.transform).collect();

        let flags = if rebuild {
            config.top_level_flags & !vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
        } else {
            config.top_level_flags
        };
        wrapper
            .build_as(rt, &mut allocator, context.queue(), cmd, flags)
            .context("Initial acceleration structure build failed")?;

        Ok(Self {
            wrapper,
            base_transforms,
            buffers,
            rebuild,
        })
    }

    /// Advance the animation and record the top-level refresh for `frame`.
    ///
    /// # Safety
    /// `cmd` must be recording and the previous frame must have completed.
    pub unsafe fn record_frame(
        &mut self,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
        cmd: vk::CommandBuffer,
        frame: u32,
    ) -> anyhow::Result<TopLevelBuildMode> {
        let transforms = animated_transforms(&self.base_transforms, frame);
        self.wrapper.update_instance_transform_data(&transforms)?;

        let flags = self
            .wrapper
            .top_level()
            .map(raykit_accel::TopLevelStructure::flags)
            .unwrap_or_default();
        let mode = self.wrapper.build_top_level_as_and_instances(
            rt,
            allocator,
            cmd,
            flags,
            !self.rebuild,
        )?;
        Ok(mode)
    }

    /// # Safety
    /// No pending GPU work may use the scene.
    pub unsafe fn destroy(
        mut self,
        rt: &RayTracingDevice,
        allocator: &mut GpuAllocator,
    ) -> anyhow::Result<()> {
        self.wrapper.destroy(rt, allocator)?;
        for buffer in &mut self.buffers {
            allocator.free_buffer(buffer)?;
        }
        Ok(())
    }
}

fn upload(allocator: &mut GpuAllocator, bytes: &[u8], name: &str) -> anyhow::Result<GpuBuffer> {
    let buffer = allocator.create_buffer(
        bytes.len() as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::CpuToGpu,
        name,
    )?;
    buffer.write_bytes(0, bytes)?;
    Ok(buffer)
}

/// Place instance `index` of mesh `row` on the grid in front of the camera.
fn grid_transform(row: u32, index: u32) -> Mat4 {
    Mat4::from_translation(Vec3::new(
        index as f32 * GRID_SPACING,
        row as f32 * GRID_SPACING,
        5.0,
    ))
}

/// Spin every instance about its own Y axis, each with a different phase.
pub fn animated_transforms(base: &[Mat4], frame: u32) -> Vec<Mat4> {
    base.iter()
        .enumerate()
        .map(|(i, transform)| {
            let angle = (frame as f32).mul_add(SPIN_PER_FRAME, i as f32 * 0.3);
            *transform * Mat4::from_quat(Quat::from_rotation_y(angle))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn animation_keeps_translation() {
        let base = vec![grid_transform(0, 0), grid_transform(1, 2)];
        let moved = animated_transforms(&base, 17);
        assert_eq!(moved.len(), 2);
        for (before, after) in base.iter().zip(&moved) {
            assert_eq!(before.w_axis, after.w_axis);
        }
    }

    #[test]
    fn instances_start_at_different_phases() {
        let base = vec![Mat4::IDENTITY; 2];
        let moved = animated_transforms(&base, 0);
        assert_eq!(moved[0], Mat4::IDENTITY);
        assert_ne!(moved[1], Mat4::IDENTITY);
    }
}
