//! Memory barrier batching.
//!
//! Barriers are collected per call into a [`MemoryBarrierSet`] and recorded
//! with a single `vkCmdPipelineBarrier2`. The set stores its first few
//! barriers inline and only allocates when a call site needs more.

use ash::vk;
use smallvec::SmallVec;

/// Barriers stored inline before the set spills to the heap.
pub const INLINE_BARRIERS: usize = 4;

/// A batch of global memory barriers recorded together.
#[derive(Clone, Default)]
pub struct MemoryBarrierSet {
    barriers: SmallVec<[vk::MemoryBarrier2<'static>; INLINE_BARRIERS]>,
}

impl MemoryBarrierSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a barrier between two stage/access scopes.
    pub fn add(
        &mut self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> &mut Self {
        self.barriers.push(
            vk::MemoryBarrier2::default()
                .src_stage_mask(src_stage)
                .src_access_mask(src_access)
                .dst_stage_mask(dst_stage)
                .dst_access_mask(dst_access),
        );
        self
    }

    /// Builder-style variant of [`add`](Self::add).
    #[must_use]
    pub fn with(
        mut self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> Self {
        self.add(src_stage, src_access, dst_stage, dst_access);
        self
    }

    /// One acceleration structure build must finish before the next reads or
    /// reuses its output or scratch memory.
    pub fn build_to_build() -> Self {
        Self::new().with(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        )
    }

    /// Host or transfer writes of build inputs must land before a build reads them.
    pub fn upload_to_build() -> Self {
        Self::new().with(
            vk::PipelineStageFlags2::HOST | vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::HOST_WRITE | vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::SHADER_READ,
        )
    }

    /// A finished build must be visible to ray tracing shaders that traverse it.
    pub fn build_to_trace() -> Self {
        Self::new().with(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        )
    }

    /// Merge the barriers of another set into this one.
    pub fn extend(&mut self, other: &Self) -> &mut Self {
        self.barriers.extend(other.barriers.iter().copied());
        self
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    /// Whether the set outgrew its inline storage.
    pub fn spilled(&self) -> bool {
        self.barriers.spilled()
    }

    pub fn barriers(&self) -> &[vk::MemoryBarrier2<'static>] {
        &self.barriers
    }

    /// Record all barriers as one pipeline barrier. Empty sets record nothing.
    ///
    /// # Safety
    /// The device must have synchronization2 enabled and the command buffer
    /// must be in recording state.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.barriers.is_empty() {
            return;
        }
        let dependency_info = vk::DependencyInfo::default().memory_barriers(&self.barriers);
        device.cmd_pipeline_barrier2(cmd, &dependency_info);
    }
}
