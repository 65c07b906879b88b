//! Ray tracing pipelines with an explicit shader group declaration order.
//!
//! Shader group handles come back from the driver in declaration order, so
//! the pipeline remembers the kind of every group it was created with. The
//! shader binding table reads that list instead of assuming an order.

use crate::device::RayTracingDevice;
use crate::error::{AccelError, Result};
use ash::vk;
use raykit_gpu::GpuError;

/// Region of the shader binding table a group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderGroupKind {
    Raygen,
    Miss,
    Hit,
    Callable,
}

impl ShaderGroupKind {
    /// All kinds in table order.
    pub const ALL: [Self; 4] = [Self::Raygen, Self::Miss, Self::Hit, Self::Callable];

    /// Stage a general group of this kind must reference.
    fn general_stage(self) -> Option<vk::ShaderStageFlags> {
        match self {
            Self::Raygen => Some(vk::ShaderStageFlags::RAYGEN_KHR),
            Self::Miss => Some(vk::ShaderStageFlags::MISS_KHR),
            Self::Callable => Some(vk::ShaderStageFlags::CALLABLE_KHR),
            Self::Hit => None,
        }
    }
}

/// One shader group, referencing stages by their index in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupDecl {
    pub kind: ShaderGroupKind,
    pub general: Option<u32>,
    pub closest_hit: Option<u32>,
    pub any_hit: Option<u32>,
    pub intersection: Option<u32>,
}

impl ShaderGroupDecl {
    fn general(kind: ShaderGroupKind, stage: u32) -> Self {
        Self {
            kind,
            general: Some(stage),
            closest_hit: None,
            any_hit: None,
            intersection: None,
        }
    }

    pub fn raygen(stage: u32) -> Self {
        Self::general(ShaderGroupKind::Raygen, stage)
    }

    pub fn miss(stage: u32) -> Self {
        Self::general(ShaderGroupKind::Miss, stage)
    }

    pub fn callable(stage: u32) -> Self {
        Self::general(ShaderGroupKind::Callable, stage)
    }

    /// Triangle hit group.
    pub fn triangles_hit(closest_hit: Option<u32>, any_hit: Option<u32>) -> Self {
        Self {
            kind: ShaderGroupKind::Hit,
            general: None,
            closest_hit,
            any_hit,
            intersection: None,
        }
    }

    /// Procedural hit group with a custom intersection shader.
    pub fn procedural_hit(intersection: u32, closest_hit: Option<u32>, any_hit: Option<u32>) -> Self {
        Self {
            kind: ShaderGroupKind::Hit,
            general: None,
            closest_hit,
            any_hit,
            intersection: Some(intersection),
        }
    }

    /// Vulkan group type for this declaration.
    pub fn group_type(&self) -> vk::RayTracingShaderGroupTypeKHR {
        match (self.kind, self.intersection) {
            (ShaderGroupKind::Hit, Some(_)) => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            (ShaderGroupKind::Hit, None) => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            _ => vk::RayTracingShaderGroupTypeKHR::GENERAL,
        }
    }

    /// Check the referenced stages exist and have the stage type the group
    /// kind requires.
    pub fn validate(&self, group: usize, stages: &[vk::ShaderStageFlags]) -> Result<()> {
        let invalid = |reason: String| AccelError::InvalidShaderGroup { group, reason };
        let check = |index: Option<u32>, expected: vk::ShaderStageFlags| -> Result<()> {
            let Some(index) = index else {
                return Ok(());
            };
            match stages.get(index as usize) {
                Some(stage) if *stage == expected => Ok(()),
                Some(stage) => Err(invalid(format!(
                    "stage {index} is {stage:?}, expected {expected:?}"
                ))),
                None => Err(invalid(format!(
                    "stage {index} does not exist ({} stages)",
                    stages.len()
                ))),
            }
        };

        match self.kind.general_stage() {
            Some(expected) => {
                if self.general.is_none() {
                    return Err(invalid(format!("{:?} group needs a general shader", self.kind)));
                }
                if self.closest_hit.is_some() || self.any_hit.is_some() || self.intersection.is_some() {
                    return Err(invalid(format!(
                        "{:?} group cannot reference hit shaders",
                        self.kind
                    )));
                }
                check(self.general, expected)
            }
            None => {
                if self.general.is_some() {
                    return Err(invalid("hit group cannot reference a general shader".to_string()));
                }
                if self.closest_hit.is_none() && self.any_hit.is_none() && self.intersection.is_none() {
                    return Err(invalid("hit group references no shaders".to_string()));
                }
                check(self.closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                check(self.any_hit, vk::ShaderStageFlags::ANY_HIT_KHR)?;
                check(self.intersection, vk::ShaderStageFlags::INTERSECTION_KHR)
            }
        }
    }

    fn to_vk(self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        let or_unused = |index: Option<u32>| index.unwrap_or(vk::SHADER_UNUSED_KHR);
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(self.group_type())
            .general_shader(or_unused(self.general))
            .closest_hit_shader(or_unused(self.closest_hit))
            .any_hit_shader(or_unused(self.any_hit))
            .intersection_shader(or_unused(self.intersection))
    }
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(
    device: &ash::Device,
    code: &[u32],
) -> raykit_gpu::Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&create_info, None)
        .map_err(|e| GpuError::ShaderModule(format!("Failed to create shader module: {e}")))
}

/// Builder for a ray tracing pipeline.
///
/// Stages are indexed in the order they are added.
pub struct RayTracingPipelineBuilder {
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    groups: Vec<ShaderGroupDecl>,
    max_recursion_depth: u32,
}

impl Default for RayTracingPipelineBuilder {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            groups: Vec::new(),
            max_recursion_depth: 1,
        }
    }
}

impl RayTracingPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shader stage. Its index is the number of stages added before it.
    #[must_use]
    pub fn stage(mut self, stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        self.stages.push((stage, module));
        self
    }

    /// Declare the next shader group.
    #[must_use]
    pub fn group(mut self, group: ShaderGroupDecl) -> Self {
        self.groups.push(group);
        self
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Check the group declarations against the stages.
    pub fn validate(&self) -> Result<()> {
        let stage_flags: Vec<vk::ShaderStageFlags> =
            self.stages.iter().map(|(flags, _)| *flags).collect();
        for (index, group) in self.groups.iter().enumerate() {
            group.validate(index, &stage_flags)?;
        }
        if !self
            .groups
            .iter()
            .any(|group| group.kind == ShaderGroupKind::Raygen)
        {
            return Err(AccelError::MissingRaygen);
        }
        Ok(())
    }

    /// Create the pipeline. It takes ownership of `layout`.
    ///
    /// # Safety
    /// The modules and layout must be valid on the device. Modules may be
    /// destroyed once this returns.
    pub unsafe fn build(
        self,
        rt: &RayTracingDevice,
        layout: vk::PipelineLayout,
    ) -> Result<RayTracingPipeline> {
        self.validate()?;

        let max_depth = rt.capabilities().max_ray_recursion_depth;
        let depth = if max_depth > 0 && self.max_recursion_depth > max_depth {
            tracing::warn!(
                "Clamping ray recursion depth {} to device limit {max_depth}",
                self.max_recursion_depth
            );
            max_depth
        } else {
            self.max_recursion_depth
        };

        let entry_point = c"main";
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .stages
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(*module)
                    .name(entry_point)
            })
            .collect();
        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> =
            self.groups.iter().map(|group| group.to_vk()).collect();

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(depth)
            .layout(layout);

        let pipelines = rt
            .ray_tracing_pipeline()
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
            .map_err(|(_, e)| {
                AccelError::Pipeline(GpuError::PipelineCreation(format!(
                    "Ray tracing pipeline: {e:?}"
                )))
            })?;
        let pipeline = pipelines.first().copied().ok_or_else(|| {
            AccelError::Pipeline(GpuError::PipelineCreation(
                "driver returned no pipeline".to_string(),
            ))
        })?;

        tracing::info!(
            "Created ray tracing pipeline: {} stages, {} groups, recursion depth {depth}",
            stages.len(),
            groups.len()
        );

        Ok(RayTracingPipeline {
            pipeline,
            layout,
            groups: self.groups.iter().map(|group| group.kind).collect(),
        })
    }
}

/// A ray tracing pipeline and the kinds of its groups in declaration order.
pub struct RayTracingPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    groups: Vec<ShaderGroupKind>,
}

impl RayTracingPipeline {
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Group kinds in the order the groups were declared.
    pub fn group_kinds(&self) -> &[ShaderGroupKind] {
        &self.groups
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    /// Destroy the pipeline and its layout.
    ///
    /// # Safety
    /// No pending GPU work may use the pipeline.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages() -> Vec<vk::ShaderStageFlags> {
        vec![
            vk::ShaderStageFlags::RAYGEN_KHR,
            vk::ShaderStageFlags::MISS_KHR,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            vk::ShaderStageFlags::INTERSECTION_KHR,
        ]
    }

    #[test]
    fn group_types() {
        assert_eq!(
            ShaderGroupDecl::raygen(0).group_type(),
            vk::RayTracingShaderGroupTypeKHR::GENERAL
        );
        assert_eq!(
            ShaderGroupDecl::triangles_hit(Some(2), None).group_type(),
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        );
        assert_eq!(
            ShaderGroupDecl::procedural_hit(3, Some(2), None).group_type(),
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        );
    }

    #[test]
    fn valid_groups() {
        let stages = stages();
        assert!(ShaderGroupDecl::raygen(0).validate(0, &stages).is_ok());
        assert!(ShaderGroupDecl::miss(1).validate(1, &stages).is_ok());
        assert!(ShaderGroupDecl::triangles_hit(Some(2), None)
            .validate(2, &stages)
            .is_ok());
        assert!(ShaderGroupDecl::procedural_hit(3, Some(2), None)
            .validate(3, &stages)
            .is_ok());
    }

    #[test]
    fn stage_kind_mismatch() {
        let err = ShaderGroupDecl::miss(0).validate(1, &stages()).unwrap_err();
        assert!(matches!(err, AccelError::InvalidShaderGroup { group: 1, .. }));
    }

    #[test]
    fn missing_stage() {
        assert!(ShaderGroupDecl::raygen(9).validate(0, &stages()).is_err());
    }

    #[test]
    fn empty_hit_group() {
        assert!(ShaderGroupDecl::triangles_hit(None, None)
            .validate(0, &stages())
            .is_err());
    }

    #[test]
    fn builder_requires_raygen() {
        let builder = RayTracingPipelineBuilder::new()
            .stage(vk::ShaderStageFlags::MISS_KHR, vk::ShaderModule::null())
            .group(ShaderGroupDecl::miss(0));
        assert!(matches!(builder.validate(), Err(AccelError::MissingRaygen)));
    }

    #[test]
    fn builder_accepts_interleaved_groups() {
        let builder = RayTracingPipelineBuilder::new()
            .stage(vk::ShaderStageFlags::RAYGEN_KHR, vk::ShaderModule::null())
            .stage(vk::ShaderStageFlags::MISS_KHR, vk::ShaderModule::null())
            .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, vk::ShaderModule::null())
            .group(ShaderGroupDecl::miss(1))
            .group(ShaderGroupDecl::triangles_hit(Some(2), None))
            .group(ShaderGroupDecl::raygen(0));
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn unused_slots() {
        let info = ShaderGroupDecl::raygen(4).to_vk();
        assert_eq!(info.general_shader, 4);
        assert_eq!(info.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.intersection_shader, vk::SHADER_UNUSED_KHR);
    }
}
