//! Vulkan device layer for raykit.
//!
//! This crate provides:
//! - Headless Vulkan instance and device management with the ray tracing
//!   extensions enabled
//! - GPU and ray tracing capability detection
//! - Memory allocation via gpu-allocator, with device addresses
//! - Command buffer and fence helpers
//! - Inline-first memory barrier sets
//! - Descriptor helpers for binding acceleration structures

pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;

pub use barrier::MemoryBarrierSet;
pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::CommandPool;
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_acceleration_structure, write_storage_buffer, DescriptorPool,
    DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer};
pub use sync::{create_fence, FrameSync};
