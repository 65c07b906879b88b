//! Ray tracing extension loaders bundled with the device they were loaded for.

use ash::vk;
use raykit_gpu::{GpuContext, RayTracingCapabilities};

/// Device handle plus the `VK_KHR_acceleration_structure` and
/// `VK_KHR_ray_tracing_pipeline` function tables.
pub struct RayTracingDevice {
    device: ash::Device,
    acceleration_structure: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
    capabilities: RayTracingCapabilities,
}

impl RayTracingDevice {
    /// Load the extension function tables.
    ///
    /// The device must have been created with both extensions enabled.
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        capabilities: RayTracingCapabilities,
    ) -> Self {
        Self {
            device: device.clone(),
            acceleration_structure: ash::khr::acceleration_structure::Device::new(instance, device),
            ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device::new(instance, device),
            capabilities,
        }
    }

    /// Load the extension function tables for a context's device.
    pub fn from_context(context: &GpuContext) -> Self {
        Self::new(
            context.instance(),
            context.device(),
            *context.ray_tracing_capabilities(),
        )
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn acceleration_structure(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure
    }

    pub fn ray_tracing_pipeline(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_pipeline
    }

    pub fn capabilities(&self) -> &RayTracingCapabilities {
        &self.capabilities
    }

    /// Device address of an acceleration structure.
    ///
    /// # Safety
    /// The acceleration structure must be a valid handle created on this device.
    pub unsafe fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(acceleration_structure);
        self.acceleration_structure
            .get_acceleration_structure_device_address(&info)
    }

    /// Device address of a buffer created with `SHADER_DEVICE_ADDRESS` usage.
    ///
    /// # Safety
    /// The buffer must be a valid handle created on this device.
    pub unsafe fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        self.device.get_buffer_device_address(&info)
    }
}
