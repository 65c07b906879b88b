//! Acceleration structures and shader binding tables for Vulkan ray tracing.
//!
//! This crate provides:
//! - Bottom-level structures over triangle meshes, built once per mesh
//! - The top-level structure over all instances, rebuilt or updated per frame
//! - [`AccelerationStructureWrapper`], which owns both levels for a scene
//! - Ray tracing pipelines that record their shader group order
//! - Shader binding table layout and construction
//! - A CPU reference tracer over the packed instance data

pub mod blas;
pub mod config;
pub mod device;
pub mod error;
pub mod geometry;
pub mod host_trace;
pub mod instance;
pub mod pipeline;
pub mod sbt;
pub mod scene;
pub mod tlas;
pub mod wrapper;

pub use blas::{BottomLevelBatch, BottomLevelBuilder, BottomLevelStructure, BuildSizes};
pub use config::AccelBuildConfig;
pub use device::RayTracingDevice;
pub use error::{AccelError, Result};
pub use geometry::GeometryRecord;
pub use host_trace::{HostHit, HostRay, HostScene};
pub use instance::{decode_instance, DecodedInstance, InstanceRecord, InstanceTable};
pub use pipeline::{
    create_shader_module, RayTracingPipeline, RayTracingPipelineBuilder, ShaderGroupDecl,
    ShaderGroupKind,
};
pub use sbt::{
    assemble_table, DeviceRegions, GroupRegion, SbtBuildStage, ShaderBindingTable,
    ShaderBindingTableBuilder, ShaderGroupCounts, ShaderGroupLayout,
};
pub use scene::SceneDescription;
pub use tlas::{TopLevelBuildMode, TopLevelBuilder, TopLevelStructure};
pub use wrapper::AccelerationStructureWrapper;
