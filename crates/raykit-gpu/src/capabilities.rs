//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device limits that govern acceleration structures and shader binding tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RayTracingCapabilities {
    /// Size of one shader group handle in bytes.
    pub shader_group_handle_size: u32,
    /// Alignment of every handle slot inside a shader binding table region.
    pub shader_group_handle_alignment: u32,
    /// Alignment of the start of every shader binding table region.
    pub shader_group_base_alignment: u32,
    /// Largest stride allowed between shader binding table records.
    pub max_shader_group_stride: u32,
    /// Maximum ray recursion depth.
    pub max_ray_recursion_depth: u32,
    /// Maximum number of instances in a top-level structure.
    pub max_instance_count: u64,
    /// Maximum number of primitives in a bottom-level structure.
    pub max_primitive_count: u64,
    /// Maximum number of geometries in a bottom-level structure.
    pub max_geometry_count: u64,
    /// Required alignment of scratch buffer device addresses.
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingCapabilities {
    /// Collect the limits from the two extension property structs.
    pub fn from_properties(
        pipeline: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>,
        acceleration_structure: &vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'_>,
    ) -> Self {
        Self {
            shader_group_handle_size: pipeline.shader_group_handle_size,
            shader_group_handle_alignment: pipeline.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline.shader_group_base_alignment,
            max_shader_group_stride: pipeline.max_shader_group_stride,
            max_ray_recursion_depth: pipeline.max_ray_recursion_depth,
            max_instance_count: acceleration_structure.max_instance_count,
            max_primitive_count: acceleration_structure.max_primitive_count,
            max_geometry_count: acceleration_structure.max_geometry_count,
            min_scratch_offset_alignment: acceleration_structure
                .min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Query the limits from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut acceleration_structure =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut pipeline)
                .push_next(&mut acceleration_structure);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
        }
        Self::from_properties(&pipeline, &acceleration_structure)
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// `VK_KHR_acceleration_structure` support
    pub supports_acceleration_structure: bool,
    /// `VK_KHR_ray_tracing_pipeline` support
    pub supports_ray_tracing_pipeline: bool,
    /// `VK_KHR_ray_query` support, enabled on the device when present
    pub supports_ray_query: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Ray tracing limits, present when both ray tracing extensions are.
    pub ray_tracing: Option<RayTracingCapabilities>,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 2;

        let supports_acceleration_structure =
            available_extensions.contains(extension_name(ash::khr::acceleration_structure::NAME));
        let supports_ray_tracing_pipeline =
            available_extensions.contains(extension_name(ash::khr::ray_tracing_pipeline::NAME));

        let supports_ray_query =
            available_extensions.contains(extension_name(ash::khr::ray_query::NAME));

        let ray_tracing = (supports_acceleration_structure && supports_ray_tracing_pipeline)
            .then(|| RayTracingCapabilities::query(instance, physical_device));

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_buffer_device_address: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_acceleration_structure,
            supports_ray_tracing_pipeline,
            supports_ray_query,

            device_local_memory_mb,
            ray_tracing,
            available_extensions,
        }
    }

    /// Check if the GPU can build acceleration structures and run ray tracing pipelines.
    pub fn meets_requirements(&self) -> bool {
        // Require Vulkan 1.3 for synchronization2
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        self.supports_buffer_device_address && self.ray_tracing.is_some()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.is_some() { "yes" } else { "no" },
        )
    }
}

fn extension_name(name: &'static CStr) -> &'static str {
    name.to_str().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(api_version: u32, ray_tracing: bool) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "test".to_string(),
            api_version,
            driver_version: 0,
            supports_buffer_device_address: true,
            supports_acceleration_structure: ray_tracing,
            supports_ray_tracing_pipeline: ray_tracing,
            supports_ray_query: false,
            device_local_memory_mb: 4096,
            ray_tracing: ray_tracing.then(RayTracingCapabilities::default),
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements() {
        assert!(capabilities(vk::API_VERSION_1_3, true).meets_requirements());
        assert!(!capabilities(vk::API_VERSION_1_3, false).meets_requirements());
        assert!(!capabilities(vk::API_VERSION_1_2, true).meets_requirements());
    }

    #[test]
    fn ray_tracing_limits_from_properties() {
        let pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default()
            .shader_group_handle_size(32)
            .shader_group_handle_alignment(32)
            .shader_group_base_alignment(64)
            .max_ray_recursion_depth(31);
        let acceleration_structure = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default()
            .max_instance_count(1 << 24)
            .min_acceleration_structure_scratch_offset_alignment(128);

        let caps = RayTracingCapabilities::from_properties(&pipeline, &acceleration_structure);
        assert_eq!(caps.shader_group_handle_size, 32);
        assert_eq!(caps.shader_group_base_alignment, 64);
        assert_eq!(caps.max_ray_recursion_depth, 31);
        assert_eq!(caps.max_instance_count, 1 << 24);
        assert_eq!(caps.min_scratch_offset_alignment, 128);
    }
}
