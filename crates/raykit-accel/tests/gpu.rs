//! Device tests. They need a GPU with ray tracing support:
//! `cargo test -p raykit-accel -- --ignored`

use ash::vk;
use glam::{Mat4, Vec3, Vec4};
use gpu_allocator::MemoryLocation;
use raykit_accel::{
    AccelBuildConfig, AccelError, AccelerationStructureWrapper, BottomLevelBuilder, GeometryRecord,
    HostHit, HostRay, HostScene, RayTracingDevice, TopLevelBuildMode,
};
use raykit_core::MeshData;
use raykit_gpu::command::{begin_command_buffer, end_command_buffer, submit_and_wait};
use raykit_gpu::descriptors::{write_acceleration_structure, write_storage_buffer};
use raykit_gpu::{
    CommandPool, DescriptorPool, DescriptorSetLayoutBuilder, GpuAllocator, GpuBuffer, GpuContext,
    GpuContextBuilder, MemoryBarrierSet,
};

/// Traces one ray per invocation with `rayQuery` and stores
/// `(hit, t, instance, front_face)` per ray.
const TRAVERSAL_SHADER: &str = r#"
@group(0) @binding(0) var scene: acceleration_structure;
@group(0) @binding(1) var<storage, read> rays: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read_write> hits: array<vec4<f32>>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let origin = rays[id.x * 2u];
    let direction = rays[id.x * 2u + 1u];
    var query: ray_query;
    // flags 1 forces opaque traversal
    rayQueryInitialize(&query, scene, RayDesc(1u, 0xFFu, origin.w, direction.w, origin.xyz, direction.xyz));
    while (rayQueryProceed(&query)) {}
    let hit = rayQueryGetCommittedIntersection(&query);
    if (hit.kind == 0u) {
        hits[id.x] = vec4<f32>(0.0);
    } else {
        hits[id.x] = vec4<f32>(1.0, hit.t, f32(hit.instance_id), select(0.0, 1.0, hit.front_face));
    }
}
"#;

const T_MAX: f32 = 1000.0;

struct Fixture {
    context: GpuContext,
    rt: RayTracingDevice,
    pool: CommandPool,
    cmd: vk::CommandBuffer,
    buffers: Vec<GpuBuffer>,
}

impl Fixture {
    fn new() -> Self {
        let context = GpuContextBuilder::new()
            .app_name("raykit-accel-tests")
            .validation(true)
            .build()
            .unwrap();
        let rt = RayTracingDevice::from_context(&context);
        let pool = unsafe {
            CommandPool::new(
                context.device(),
                context.queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }
        .unwrap();
        let cmd = unsafe { pool.allocate_command_buffer(context.device()) }.unwrap();
        Self {
            context,
            rt,
            pool,
            cmd,
            buffers: Vec::new(),
        }
    }

    fn upload(&mut self, bytes: &[u8], name: &str) -> vk::Buffer {
        let buffer = self
            .context
            .allocator()
            .lock()
            .create_buffer(
                bytes.len() as u64,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                name,
            )
            .unwrap();
        buffer.write_bytes(0, bytes).unwrap();
        let handle = buffer.buffer;
        self.buffers.push(buffer);
        handle
    }

    fn describe(&mut self, wrapper: &mut AccelerationStructureWrapper, mesh: &MeshData, transform: Mat4) {
        let vertices = self.upload(mesh.vertex_bytes(), "test_vertices");
        let indices = self.upload(mesh.index_bytes(), "test_indices");
        wrapper
            .build_as_model_description(
                &[vertices],
                &[indices],
                &[mesh.vertex_count()],
                &[mesh.index_count()],
                &[transform],
            )
            .unwrap();
    }

    fn build(&self, wrapper: &mut AccelerationStructureWrapper, flags: vk::BuildAccelerationStructureFlagsKHR) -> Result<(), AccelError> {
        let mut allocator = self.context.allocator().lock();
        unsafe {
            wrapper.build_as(
                &self.rt,
                &mut allocator,
                self.context.queue(),
                self.cmd,
                flags,
            )
        }
    }

    fn frame(
        &self,
        wrapper: &mut AccelerationStructureWrapper,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        is_update: bool,
    ) -> TopLevelBuildMode {
        let device = self.context.device();
        let mut allocator = self.context.allocator().lock();
        unsafe {
            begin_command_buffer(device, self.cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
            let mode = wrapper
                .build_top_level_as_and_instances(&self.rt, &mut allocator, self.cmd, flags, is_update)
                .unwrap();
            end_command_buffer(device, self.cmd).unwrap();
            submit_and_wait(device, self.context.queue(), self.cmd).unwrap();
            mode
        }
    }

    fn finish(mut self, wrapper: AccelerationStructureWrapper) {
        self.context.wait_idle().unwrap();
        let mut allocator = self.context.allocator().lock();
        unsafe {
            wrapper.destroy(&self.rt, &mut allocator).unwrap();
            free_all(&mut allocator, &mut self.buffers);
            self.pool.destroy(self.context.device());
        }
    }
}

fn free_all(allocator: &mut GpuAllocator, buffers: &mut Vec<GpuBuffer>) {
    for mut buffer in buffers.drain(..) {
        allocator.free_buffer(&mut buffer).unwrap();
    }
}

/// Instances as last uploaded for the top-level build.
fn uploaded_instances(wrapper: &AccelerationStructureWrapper) -> Vec<vk::AccelerationStructureInstanceKHR> {
    let tlas = wrapper.top_level().unwrap();
    let size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
    let bytes = tlas
        .instance_buffer()
        .read_bytes(0, (tlas.instance_count() * size) as u64)
        .unwrap();
    bytes
        .chunks_exact(size)
        .map(|chunk| unsafe {
            std::ptr::read_unaligned(chunk.as_ptr().cast::<vk::AccelerationStructureInstanceKHR>())
        })
        .collect()
}

fn compile_traversal_shader() -> Vec<u32> {
    let module = naga::front::wgsl::parse_str(TRAVERSAL_SHADER).unwrap();
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::RAY_QUERY,
    )
    .validate(&module)
    .unwrap();
    let options = naga::back::spv::Options {
        lang_version: (1, 4),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga::ShaderStage::Compute,
        entry_point: "main".to_string(),
    };
    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).unwrap()
}

/// Result of one device traversal, comparable with [`HostHit`].
#[derive(Debug, Clone, Copy, PartialEq)]
struct DeviceHit {
    t: f32,
    instance: usize,
    front_face: bool,
}

/// Dispatch the traversal shader against the wrapper's top-level structure.
fn trace_on_device(fixture: &Fixture, wrapper: &AccelerationStructureWrapper, rays: &[HostRay]) -> Vec<Option<DeviceHit>> {
    let device = fixture.context.device();
    let tlas = wrapper.top_level_acceleration_structure().unwrap();

    let mut packed = Vec::with_capacity(rays.len() * 2);
    for ray in rays {
        packed.push(ray.ray.origin.extend(ray.t_min).to_array());
        packed.push(ray.ray.direction.extend(ray.t_max).to_array());
    }
    let (mut ray_buffer, mut hit_buffer) = {
        let mut allocator = fixture.context.allocator().lock();
        let ray_buffer = allocator
            .create_buffer(
                (packed.len() * 16) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                "traversal_rays",
            )
            .unwrap();
        let hit_buffer = allocator
            .create_buffer(
                (rays.len() * 16) as u64,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuToCpu,
                "traversal_hits",
            )
            .unwrap();
        (ray_buffer, hit_buffer)
    };
    ray_buffer.write(&packed).unwrap();

    let hits = unsafe {
        let code = compile_traversal_shader();
        let module = device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&code), None)
            .unwrap();
        let set_layout = DescriptorSetLayoutBuilder::new()
            .acceleration_structure(0, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(1, vk::ShaderStageFlags::COMPUTE)
            .storage_buffer(2, vk::ShaderStageFlags::COMPUTE)
            .build(device)
            .unwrap();
        let pipeline_layout = device
            .create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(std::slice::from_ref(&set_layout)),
                None,
            )
            .unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let pipeline = device
            .create_compute_pipelines(
                vk::PipelineCache::null(),
                &[vk::ComputePipelineCreateInfo::default()
                    .stage(stage)
                    .layout(pipeline_layout)],
                None,
            )
            .map_err(|(_, e)| e)
            .unwrap()[0];

        let pool = DescriptorPool::new(
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
        )
        .unwrap();
        let set = pool.allocate(device, &[set_layout]).unwrap()[0];
        write_acceleration_structure(device, set, 0, tlas);
        write_storage_buffer(device, set, 1, ray_buffer.buffer, 0, vk::WHOLE_SIZE);
        write_storage_buffer(device, set, 2, hit_buffer.buffer, 0, vk::WHOLE_SIZE);

        begin_command_buffer(device, fixture.cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        device.cmd_bind_pipeline(fixture.cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
        device.cmd_bind_descriptor_sets(
            fixture.cmd,
            vk::PipelineBindPoint::COMPUTE,
            pipeline_layout,
            0,
            &[set],
            &[],
        );
        device.cmd_dispatch(fixture.cmd, rays.len() as u32, 1, 1);
        MemoryBarrierSet::new()
            .with(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::HOST,
                vk::AccessFlags2::HOST_READ,
            )
            .record(device, fixture.cmd);
        end_command_buffer(device, fixture.cmd).unwrap();
        submit_and_wait(device, fixture.context.queue(), fixture.cmd).unwrap();

        let hits = hit_buffer.read::<[f32; 4]>(rays.len()).unwrap();

        pool.destroy(device);
        device.destroy_pipeline(pipeline, None);
        device.destroy_pipeline_layout(pipeline_layout, None);
        device.destroy_descriptor_set_layout(set_layout, None);
        device.destroy_shader_module(module, None);
        hits
    };

    let mut allocator = fixture.context.allocator().lock();
    allocator.free_buffer(&mut ray_buffer).unwrap();
    allocator.free_buffer(&mut hit_buffer).unwrap();

    hits.into_iter()
        .map(|[hit, t, instance, front_face]| {
            (hit > 0.5).then_some(DeviceHit {
                t,
                instance: instance as usize,
                front_face: front_face > 0.5,
            })
        })
        .collect()
}

fn assert_matches_host(device: &[Option<DeviceHit>], host: &[Option<HostHit>]) {
    assert_eq!(device.len(), host.len());
    for (ray, (device, host)) in device.iter().zip(host).enumerate() {
        match (device, host) {
            (None, None) => {}
            (Some(device), Some(host)) => {
                approx::assert_relative_eq!(device.t, host.t, epsilon = 1e-4);
                assert_eq!(device.instance, host.instance, "ray {ray}");
                assert_eq!(device.front_face, host.front_face, "ray {ray}");
            }
            _ => panic!("ray {ray}: device {device:?}, host {host:?}"),
        }
    }
}

fn traversal_rays() -> Vec<HostRay> {
    [
        (Vec3::new(0.0, 0.0, -1.0), Vec3::Z),
        (Vec3::new(0.25, -0.5, -1.0), Vec3::Z),
        (Vec3::new(-0.9, 0.9, -1.0), Vec3::Z),
        (Vec3::new(5.0, 0.0, -1.0), Vec3::Z),
        (Vec3::new(0.0, 0.0, 1.0), Vec3::NEG_Z),
        (Vec3::new(-1.0, 0.0, 0.0), Vec3::X),
    ]
    .into_iter()
    .map(|(origin, direction)| HostRay::new(origin, direction).with_interval(0.0, T_MAX))
    .collect()
}

fn trace_on_host(scene: &HostScene, wrapper: &AccelerationStructureWrapper, rays: &[HostRay]) -> Vec<Option<HostHit>> {
    let instances = uploaded_instances(wrapper);
    rays.iter().map(|ray| scene.trace(&instances, ray)).collect()
}

fn rotation_y_90() -> Mat4 {
    Mat4::from_cols(
        Vec4::new(0.0, 0.0, -1.0, 0.0),
        Vec4::Y,
        Vec4::new(1.0, 0.0, 0.0, 0.0),
        Vec4::W,
    )
}

fn updatable() -> vk::BuildAccelerationStructureFlagsKHR {
    AccelBuildConfig::default().top_level_flags
}

#[test]
#[ignore = "Requires GPU hardware"]
fn single_triangle_builds_and_is_hit() {
    let mut fixture = Fixture::new();
    let mut wrapper = AccelerationStructureWrapper::default();
    let mesh = MeshData::triangle();
    fixture.describe(&mut wrapper, &mesh, Mat4::IDENTITY);

    fixture.build(&mut wrapper, updatable()).unwrap();

    let tlas = wrapper.top_level_acceleration_structure().unwrap();
    assert_ne!(tlas, vk::AccelerationStructureKHR::null());
    assert_eq!(wrapper.blas_addresses().len(), 1);
    assert_ne!(wrapper.blas_addresses()[0], 0);

    let uploaded = uploaded_instances(&wrapper);
    let decoded = raykit_accel::decode_instance(&uploaded[0]);
    assert_eq!(decoded.blas_address, wrapper.blas_addresses()[0]);
    assert_eq!(decoded.mask, 0xFF);
    assert_eq!(decoded.custom_index, 0);

    let scene = HostScene::with_addresses(vec![mesh], wrapper.blas_addresses().to_vec()).unwrap();
    let ray = HostRay::new(Vec3::new(0.0, 0.0, -1.0), Vec3::Z);
    assert!(scene.trace(&uploaded, &ray).is_some());

    fixture.finish(wrapper);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn rotated_triangle_is_missed_after_update() {
    let mut fixture = Fixture::new();
    let mut wrapper = AccelerationStructureWrapper::default();
    let mesh = MeshData::triangle();
    fixture.describe(&mut wrapper, &mesh, Mat4::IDENTITY);
    fixture.build(&mut wrapper, updatable()).unwrap();

    let scene = HostScene::with_addresses(vec![mesh], wrapper.blas_addresses().to_vec()).unwrap();
    let ray = HostRay::new(Vec3::new(0.0, 0.0, -1.0), Vec3::Z);
    assert!(scene.trace(&uploaded_instances(&wrapper), &ray).is_some());

    wrapper
        .update_instance_transform_data(&[rotation_y_90()])
        .unwrap();
    let mode = fixture.frame(&mut wrapper, updatable(), true);
    assert_eq!(mode, TopLevelBuildMode::Update);
    assert!(scene.trace(&uploaded_instances(&wrapper), &ray).is_none());

    fixture.finish(wrapper);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn initial_build_runs_once() {
    let mut fixture = Fixture::new();
    let mut wrapper = AccelerationStructureWrapper::default();
    fixture.describe(&mut wrapper, &MeshData::quad(1.0), Mat4::IDENTITY);
    fixture.build(&mut wrapper, updatable()).unwrap();

    let handle = wrapper.top_level_acceleration_structure();
    assert!(matches!(
        fixture.build(&mut wrapper, updatable()),
        Err(AccelError::AlreadyBuilt)
    ));
    assert_eq!(wrapper.top_level_acceleration_structure(), handle);

    fixture.finish(wrapper);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn static_scene_rebuilds_instead_of_updating() {
    let mut fixture = Fixture::new();
    let mut wrapper = AccelerationStructureWrapper::default();
    fixture.describe(&mut wrapper, &MeshData::triangle(), Mat4::IDENTITY);
    let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    fixture.build(&mut wrapper, flags).unwrap();

    let mode = fixture.frame(&mut wrapper, flags, true);
    assert_eq!(mode, TopLevelBuildMode::Rebuild);
    assert_eq!(wrapper.top_level().unwrap().build_count(), 2);

    fixture.finish(wrapper);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn empty_scene_builds() {
    let fixture = Fixture::new();
    let mut wrapper = AccelerationStructureWrapper::default();
    fixture.build(&mut wrapper, updatable()).unwrap();
    assert!(wrapper.top_level_acceleration_structure().is_some());
    assert!(wrapper.bottom_level().is_empty());
    fixture.finish(wrapper);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn device_traversal_matches_host_tracer() {
    let mut fixture = Fixture::new();
    if !fixture.context.ray_query_enabled() {
        eprintln!("skipping: device lacks VK_KHR_ray_query");
        return;
    }
    let mut wrapper = AccelerationStructureWrapper::default();
    let mesh = MeshData::triangle();
    fixture.describe(&mut wrapper, &mesh, Mat4::IDENTITY);
    fixture.build(&mut wrapper, updatable()).unwrap();

    let scene = HostScene::with_addresses(vec![mesh.clone()], wrapper.blas_addresses().to_vec()).unwrap();
    let rays = traversal_rays();

    let device = trace_on_device(&fixture, &wrapper, &rays);
    assert_matches_host(&device, &trace_on_host(&scene, &wrapper, &rays));
    let centre = device[0].unwrap();
    approx::assert_relative_eq!(centre.t, 1.0, epsilon = 1e-4);
    assert_eq!(centre.instance, 0);
    assert!(device[3].is_none());

    wrapper
        .update_instance_transform_data(&[rotation_y_90()])
        .unwrap();
    assert_eq!(fixture.frame(&mut wrapper, updatable(), true), TopLevelBuildMode::Update);

    // Rays 0, 1 and 4 now lie in the triangle's plane; compare the others.
    let updated = trace_on_device(&fixture, &wrapper, &rays);
    let host = trace_on_host(&scene, &wrapper, &rays);
    let off_plane = [2, 3, 5];
    assert_matches_host(
        &off_plane.map(|ray| updated[ray]),
        &off_plane.map(|ray| host[ray]),
    );
    assert!(updated[0].is_none());
    assert!(updated[1].is_none());
    let side = updated[5].unwrap();
    approx::assert_relative_eq!(side.t, 1.0, epsilon = 1e-4);

    // A structure built directly with the rotated transform traverses the same.
    let mut rebuilt = AccelerationStructureWrapper::default();
    fixture.describe(&mut rebuilt, &mesh, rotation_y_90());
    fixture.build(&mut rebuilt, updatable()).unwrap();
    let direct = trace_on_device(&fixture, &rebuilt, &rays);
    assert_eq!(direct.len(), updated.len());
    for ray in [0, 1, 2, 3, 5] {
        let (direct, updated) = (&direct[ray], &updated[ray]);
        assert_eq!(direct.is_some(), updated.is_some());
        if let (Some(direct), Some(updated)) = (direct, updated) {
            approx::assert_relative_eq!(direct.t, updated.t, epsilon = 1e-4);
            assert_eq!(direct.front_face, updated.front_face);
        }
    }

    fixture.context.wait_idle().unwrap();
    {
        let mut allocator = fixture.context.allocator().lock();
        unsafe { rebuilt.destroy(&fixture.rt, &mut allocator) }.unwrap();
    }
    fixture.finish(wrapper);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn single_blas_build_resolves_address() {
    let mut fixture = Fixture::new();
    let mesh = MeshData::triangle();
    let vertices = fixture.upload(mesh.vertex_bytes(), "blas_vertices");
    let indices = fixture.upload(mesh.index_bytes(), "blas_indices");
    let geometry =
        GeometryRecord::with_default_stride(vertices, indices, mesh.vertex_count(), mesh.index_count()).unwrap();

    let config = AccelBuildConfig::default();
    let builder = BottomLevelBuilder::new(&fixture.rt, config.bottom_level_flags, config.geometry_flags);
    let device = fixture.context.device();
    let (blas, mut scratch) = {
        let mut allocator = fixture.context.allocator().lock();
        unsafe {
            begin_command_buffer(device, fixture.cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
            let built = builder.build(&mut allocator, fixture.cmd, &geometry).unwrap();
            end_command_buffer(device, fixture.cmd).unwrap();
            submit_and_wait(device, fixture.context.queue(), fixture.cmd).unwrap();
            built
        }
    };

    assert_ne!(blas.handle(), vk::AccelerationStructureKHR::null());
    assert_ne!(blas.device_address(), 0);
    assert_eq!(blas.primitive_count(), 1);
    assert!(blas.sizes().acceleration_structure_size > 0);
    assert!(scratch.size >= blas.sizes().build_scratch_size);

    {
        let mut allocator = fixture.context.allocator().lock();
        allocator.free_buffer(&mut scratch).unwrap();
        unsafe { blas.destroy(&fixture.rt, &mut allocator) }.unwrap();
    }
    fixture.finish(AccelerationStructureWrapper::default());
}
