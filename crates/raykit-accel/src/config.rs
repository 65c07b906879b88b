//! Build configuration.

use ash::vk;

/// Flags and per-instance defaults used when building a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelBuildConfig {
    /// Flags for every bottom-level build.
    pub bottom_level_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Flags for the top-level structure, fixed at creation.
    pub top_level_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Flags attached to every triangle geometry.
    pub geometry_flags: vk::GeometryFlagsKHR,
    /// Instance flags given to instances created from a model description.
    pub instance_flags: vk::GeometryInstanceFlagsKHR,
    /// Visibility mask given to instances created from a model description.
    pub instance_mask: u8,
}

impl Default for AccelBuildConfig {
    fn default() -> Self {
        Self {
            bottom_level_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            top_level_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            instance_flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            instance_mask: 0xFF,
        }
    }
}

impl AccelBuildConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bottom-level build flags.
    pub fn with_bottom_level_flags(mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        self.bottom_level_flags = flags;
        self
    }

    /// Set the top-level build flags.
    pub fn with_top_level_flags(mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        self.top_level_flags = flags;
        self
    }

    /// Set the geometry flags.
    pub fn with_geometry_flags(mut self, flags: vk::GeometryFlagsKHR) -> Self {
        self.geometry_flags = flags;
        self
    }

    /// Set the default instance flags.
    pub fn with_instance_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_flags = flags;
        self
    }

    /// Set the default instance mask.
    pub fn with_instance_mask(mut self, mask: u8) -> Self {
        self.instance_mask = mask;
        self
    }

    /// Whether the top-level structure can be updated in place.
    pub fn allows_update(&self) -> bool {
        self.top_level_flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AccelBuildConfig::default();
        assert!(config.allows_update());
        assert_eq!(config.instance_mask, 0xFF);
        assert_eq!(config.geometry_flags, vk::GeometryFlagsKHR::OPAQUE);
    }

    #[test]
    fn static_scene() {
        let config = AccelBuildConfig::new()
            .with_top_level_flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE);
        assert!(!config.allows_update());
    }
}
