//! CPU reference traversal over the packed instance data.
//!
//! Reads the same `vk::AccelerationStructureInstanceKHR` array that is
//! uploaded for top-level builds, so its answers check the instance packing
//! as well as the scene. Facing follows the device rules: a triangle is
//! front facing when it appears clockwise from the ray origin in object
//! space, unless the instance flips facing.

use crate::error::{AccelError, Result};
use crate::instance::{decode_instance, InstanceTable};
use ash::vk;
use glam::{Vec2, Vec3};
use raykit_core::{intersect_triangle, MeshData, Ray};

/// A query ray with its interval, mask and culling mode.
#[derive(Debug, Clone, Copy)]
pub struct HostRay {
    pub ray: Ray,
    pub t_min: f32,
    pub t_max: f32,
    /// Instances whose mask shares no bit with this are skipped.
    pub mask: u8,
    /// Skip back faces on instances that do not disable culling.
    pub cull_back_faces: bool,
}

impl HostRay {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            ray: Ray::new(origin, direction),
            t_min: 0.0,
            t_max: f32::INFINITY,
            mask: 0xFF,
            cull_back_faces: false,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, t_min: f32, t_max: f32) -> Self {
        self.t_min = t_min;
        self.t_max = t_max;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn cull_back_faces(mut self) -> Self {
        self.cull_back_faces = true;
        self
    }
}

/// Nearest intersection found by [`HostScene::trace`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostHit {
    /// Position of the instance in the traced array.
    pub instance: usize,
    pub custom_index: u32,
    pub hit_group_offset: u32,
    pub primitive: u32,
    pub t: f32,
    pub barycentrics: Vec2,
    pub front_face: bool,
}

/// Meshes of a scene, each standing in for one bottom-level structure.
pub struct HostScene {
    meshes: Vec<MeshData>,
    addresses: Vec<vk::DeviceAddress>,
}

impl HostScene {
    /// Scene with placeholder addresses, one per mesh.
    pub fn new(meshes: Vec<MeshData>) -> Self {
        let addresses = (1..=meshes.len() as u64).map(|i| i << 16).collect();
        Self { meshes, addresses }
    }

    /// Scene whose meshes are identified by real bottom-level addresses.
    pub fn with_addresses(meshes: Vec<MeshData>, addresses: Vec<vk::DeviceAddress>) -> Result<Self> {
        if meshes.len() != addresses.len() {
            return Err(AccelError::LengthMismatch {
                what: "bottom level addresses",
                expected: meshes.len(),
                actual: addresses.len(),
            });
        }
        Ok(Self { meshes, addresses })
    }

    /// Address standing in for each mesh, in mesh order.
    pub fn blas_addresses(&self) -> &[vk::DeviceAddress] {
        &self.addresses
    }

    pub fn meshes(&self) -> &[MeshData] {
        &self.meshes
    }

    /// Trace against packed instances. Instances referencing an unknown
    /// address are skipped.
    pub fn trace(
        &self,
        instances: &[vk::AccelerationStructureInstanceKHR],
        query: &HostRay,
    ) -> Option<HostHit> {
        let mut nearest: Option<HostHit> = None;

        for (index, packed) in instances.iter().enumerate() {
            let instance = decode_instance(packed);
            if instance.mask & query.mask == 0 {
                continue;
            }
            let Some(mesh) = self
                .addresses
                .iter()
                .position(|address| *address == instance.blas_address)
                .map(|mesh| &self.meshes[mesh])
            else {
                continue;
            };

            let flip = instance
                .flags
                .contains(vk::GeometryInstanceFlagsKHR::TRIANGLE_FLIP_FACING);
            let cull = query.cull_back_faces
                && !instance
                    .flags
                    .contains(vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
            let object_ray = query.ray.transform(instance.transform.inverse());

            for (primitive, triangle) in mesh.triangles().enumerate() {
                let t_max = nearest.map_or(query.t_max, |hit| hit.t);
                let Some(hit) = intersect_triangle(&object_ray, triangle, query.t_min, t_max)
                else {
                    continue;
                };
                if nearest.is_some_and(|nearest| hit.t >= nearest.t) {
                    continue;
                }
                let front_face = hit.clockwise != flip;
                if cull && !front_face {
                    continue;
                }
                nearest = Some(HostHit {
                    instance: index,
                    custom_index: instance.custom_index,
                    hit_group_offset: instance.hit_group_offset,
                    primitive: u32::try_from(primitive).unwrap_or(u32::MAX),
                    t: hit.t,
                    barycentrics: Vec2::new(hit.u, hit.v),
                    front_face,
                });
            }
        }

        nearest
    }

    /// Pack `table` against this scene's addresses and trace it.
    pub fn trace_table(&self, table: &InstanceTable, query: &HostRay) -> Result<Option<HostHit>> {
        let packed = table.flatten(&self.addresses)?;
        Ok(self.trace(&packed, query))
    }
}
