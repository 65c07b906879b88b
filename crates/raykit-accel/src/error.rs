//! Acceleration structure error types.

use crate::pipeline::ShaderGroupKind;
use raykit_gpu::GpuError;
use thiserror::Error;

/// Errors raised while building acceleration structures or shader binding tables.
///
/// Device failures are wrapped with the step that failed. Everything else is
/// caller misuse that would otherwise corrupt GPU execution silently.
#[derive(Error, Debug)]
pub enum AccelError {
    /// A bottom-level build step failed on the device.
    #[error("failed to build bottom level acceleration structure {index}: {source}")]
    BottomLevelBuild {
        index: usize,
        #[source]
        source: GpuError,
    },

    /// A top-level build or update step failed on the device.
    #[error("failed to build top level acceleration structure: {0}")]
    TopLevelBuild(#[source] GpuError),

    /// Shader binding table allocation or handle retrieval failed.
    #[error("failed to build shader binding table: {0}")]
    ShaderBindingTable(#[source] GpuError),

    /// Ray tracing pipeline creation failed.
    #[error("failed to create ray tracing pipeline: {0}")]
    Pipeline(#[source] GpuError),

    /// Submitting or waiting for the initial build failed.
    #[error("failed to submit acceleration structure build: {0}")]
    Submit(#[source] GpuError),

    /// Geometry record violates its invariants.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The initial build was requested on an already built scene.
    #[error("acceleration structures are already built")]
    AlreadyBuilt,

    /// An update or top-level rebuild was requested before the initial build.
    #[error("acceleration structures have not been built yet")]
    NotBuilt,

    /// An update was requested on a structure built without `ALLOW_UPDATE`.
    #[error("top level acceleration structure was not built with ALLOW_UPDATE")]
    UpdateNotAllowed,

    /// Build flags differ from the ones the structure was created with.
    #[error("build flags {requested:?} differ from creation flags {created:?}")]
    FlagsChanged {
        created: ash::vk::BuildAccelerationStructureFlagsKHR,
        requested: ash::vk::BuildAccelerationStructureFlagsKHR,
    },

    /// Instance count changed after the top-level structure was created.
    #[error("instance count changed from {expected} to {actual} after load")]
    InstanceCountChanged { expected: usize, actual: usize },

    /// A slice argument did not match the number of records it describes.
    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// An instance references a bottom-level structure that does not exist.
    #[error("instance {instance} references bottom level structure {blas} of {count}")]
    InvalidBlasReference {
        instance: usize,
        blas: u32,
        count: usize,
    },

    /// An instance selects a hit group past the end of the hit region.
    #[error("instance {instance} uses hit group offset {offset} but only {count} hit groups exist")]
    HitGroupOutOfRange {
        instance: usize,
        offset: u32,
        count: u32,
    },

    /// A packed instance field does not fit its 24-bit slot.
    #[error("instance {instance}: {field} {value} does not fit in 24 bits")]
    InstanceFieldOverflow {
        instance: usize,
        field: &'static str,
        value: u32,
    },

    /// Instance flags set bits outside the 8-bit device field.
    #[error("instance {instance}: flags {flags:#x} do not fit in 8 bits")]
    InvalidInstanceFlags { instance: usize, flags: u32 },

    /// Requested group counts disagree with the pipeline's declared groups.
    #[error("{kind:?} groups: pipeline declares {declared}, table requested {requested}")]
    ShaderGroupMismatch {
        kind: ShaderGroupKind,
        declared: u32,
        requested: u32,
    },

    /// A shader group declaration is inconsistent with the pipeline's stages.
    #[error("shader group {group}: {reason}")]
    InvalidShaderGroup { group: usize, reason: String },

    /// The table has no ray generation group.
    #[error("shader binding table needs at least one ray generation group")]
    MissingRaygen,

    /// A device-reported alignment is not a power of two.
    #[error("{what} alignment {value} is not a power of two")]
    InvalidAlignment { what: &'static str, value: u32 },

    /// A ray generation slot past the end of the raygen region was requested.
    #[error("ray generation slot {slot} out of range ({count} declared)")]
    RaygenSlotOutOfRange { slot: u32, count: u32 },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, AccelError>;
