//! Optional ray dispatch over the demo scene, using SPIR-V loaded at runtime.

use std::path::Path;

use anyhow::Context;
use ash::vk;
use gpu_allocator::MemoryLocation;
use raykit_accel::{
    create_shader_module, RayTracingDevice, RayTracingPipeline, RayTracingPipelineBuilder,
    SceneDescription, ShaderBindingTable, ShaderBindingTableBuilder, ShaderGroupCounts,
    ShaderGroupDecl,
};
use raykit_gpu::{
    write_acceleration_structure, write_storage_buffer, DescriptorPool,
    DescriptorSetLayoutBuilder, GpuAllocator, GpuBuffer, GpuContext, MemoryBarrierSet,
};

use crate::scene::DemoScene;

const RAYGEN_FILE: &str = "raygen.rgen.spv";
const MISS_FILE: &str = "miss.rmiss.spv";
const HIT_FILE: &str = "hit.rchit.spv";

/// Pipeline, binding table and descriptors for one raygen, one miss and one
/// triangle hit group.
///
/// Bindings: 0 = top-level structure, 1 = `u32` per pixel output,
/// 2 = [`SceneDescription`] per instance.
pub struct Tracer {
    pipeline: RayTracingPipeline,
    sbt: ShaderBindingTable,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    output: GpuBuffer,
    scene_buffer: GpuBuffer,
    width: u32,
    height: u32,
}

impl Tracer {
    /// # Safety
    /// The scene must be built and outlive the tracer.
    pub unsafe fn new(
        context: &GpuContext,
        rt: &RayTracingDevice,
        scene: &DemoScene,
        shader_dir: &Path,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Self> {
        let device = context.device();

        let set_layout = DescriptorSetLayoutBuilder::new()
            .acceleration_structure(
                0,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .storage_buffer(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .storage_buffer(2, vk::ShaderStageFlags::CLOSEST_HIT_KHR)
            .build(device)?;
        let pipeline_layout = device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo::default()
                .set_layouts(std::slice::from_ref(&set_layout)),
            None,
        )?;

        let modules = [RAYGEN_FILE, MISS_FILE, HIT_FILE]
            .iter()
            .map(|name| load_module(device, &shader_dir.join(name)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let built = RayTracingPipelineBuilder::new()
            .stage(vk::ShaderStageFlags::RAYGEN_KHR, modules[0])
            .stage(vk::ShaderStageFlags::MISS_KHR, modules[1])
            .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, modules[2])
            .group(ShaderGroupDecl::raygen(0))
            .group(ShaderGroupDecl::miss(1))
            .group(ShaderGroupDecl::triangles_hit(Some(2), None))
            .max_recursion_depth(1)
            .build(rt, pipeline_layout);
        for module in modules {
            device.destroy_shader_module(module, None);
        }
        let pipeline = built.context("Failed to create ray tracing pipeline")?;

        let mut allocator = context.allocator().lock();
        let sbt = ShaderBindingTableBuilder::new(rt).build(
            &mut allocator,
            &pipeline,
            ShaderGroupCounts::new(1, 1, 1),
        )?;
        scene.wrapper.validate_against_sbt(&sbt)?;

        let output = allocator.create_buffer(
            u64::from(width) * u64::from(height) * 4,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuToCpu,
            "demo_output",
        )?;
        let description_count = scene.wrapper.scene_descriptions().len().max(1);
        let scene_buffer = allocator.create_buffer(
            (description_count * std::mem::size_of::<SceneDescription>()) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
            "demo_scene_descriptions",
        )?;
        drop(allocator);

        let descriptor_pool = DescriptorPool::new(
            device,
            1,
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    descriptor_count: 1,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 2,
                },
            ],
        )?;
        let descriptor_set = descriptor_pool.allocate(device, &[set_layout])?[0];

        let tlas = scene
            .wrapper
            .top_level_acceleration_structure()
            .context("Scene has no top level structure")?;
        write_acceleration_structure(device, descriptor_set, 0, tlas);
        write_storage_buffer(device, descriptor_set, 1, output.buffer, 0, output.size);
        write_storage_buffer(
            device,
            descriptor_set,
            2,
            scene_buffer.buffer,
            0,
            scene_buffer.size,
        );

        tracing::info!(
            "Tracing {width}x{height} with a {} byte shader binding table",
            sbt.layout().total_size
        );

        Ok(Self {
            pipeline,
            sbt,
            set_layout,
            descriptor_pool,
            descriptor_set,
            output,
            scene_buffer,
            width,
            height,
        })
    }

    /// Upload the scene descriptions and record the dispatch after the
    /// frame's top-level refresh.
    ///
    /// # Safety
    /// `cmd` must be recording and no earlier dispatch may be pending.
    pub unsafe fn record(
        &self,
        rt: &RayTracingDevice,
        cmd: vk::CommandBuffer,
        scene: &DemoScene,
    ) -> anyhow::Result<()> {
        let device = rt.device();
        let descriptions = scene.wrapper.scene_descriptions();
        if !descriptions.is_empty() {
            self.scene_buffer.write(descriptions)?;
        }

        device.cmd_bind_pipeline(
            cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.pipeline.handle(),
        );
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.pipeline.layout(),
            0,
            &[self.descriptor_set],
            &[],
        );
        self.sbt
            .record_trace_rays(rt, cmd, self.width, self.height, 1);

        MemoryBarrierSet::new()
            .with(
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::HOST,
                vk::AccessFlags2::HOST_READ,
            )
            .record(device, cmd);
        Ok(())
    }

    /// Pixels the last dispatch wrote a non-zero value to.
    pub fn lit_pixels(&self) -> anyhow::Result<usize> {
        let pixels: Vec<u32> = self.output.read((self.width * self.height) as usize)?;
        Ok(pixels.iter().filter(|&&p| p != 0).count())
    }

    /// # Safety
    /// No pending GPU work may use the tracer.
    pub unsafe fn destroy(
        mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
    ) -> anyhow::Result<()> {
        self.sbt.destroy(allocator)?;
        allocator.free_buffer(&mut self.output)?;
        allocator.free_buffer(&mut self.scene_buffer)?;
        self.descriptor_pool.destroy(device);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        self.pipeline.destroy(device);
        Ok(())
    }
}

unsafe fn load_module(device: &ash::Device, path: &Path) -> anyhow::Result<vk::ShaderModule> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open shader {}", path.display()))?;
    let code = ash::util::read_spv(&mut file)
        .with_context(|| format!("Invalid SPIR-V in {}", path.display()))?;
    Ok(create_shader_module(device, &code)?)
}
