//! Scene instances and their device layout.

use crate::error::{AccelError, Result};
use ash::vk;
use glam::Mat4;

/// Largest value a 24-bit packed instance field can hold.
pub const MAX_PACKED_24: u32 = (1 << 24) - 1;

/// One occurrence of a bottom-level structure in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    /// Index of the referenced bottom-level structure.
    pub blas_index: u32,
    /// Object-to-world transform. Only the top three rows are used.
    pub transform: Mat4,
    /// Value reported as the custom index in shaders. Defaults to the
    /// instance's slot in its table.
    pub custom_index: Option<u32>,
    pub mask: u8,
    /// Offset into the hit region selecting this instance's hit group.
    pub hit_group_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl InstanceRecord {
    pub fn new(blas_index: u32, transform: Mat4) -> Self {
        Self {
            blas_index,
            transform,
            custom_index: None,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }

    #[must_use]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_hit_group_offset(mut self, offset: u32) -> Self {
        self.hit_group_offset = offset;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = Some(custom_index);
        self
    }
}

/// Row-major 3x4 matrix as stored in the device instance layout.
pub fn to_transform_matrix(transform: Mat4) -> vk::TransformMatrixKHR {
    let rows = transform.transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&rows[..12]);
    vk::TransformMatrixKHR { matrix }
}

/// Affine matrix stored in a device instance; the bottom row is `(0, 0, 0, 1)`.
pub fn from_transform_matrix(transform: &vk::TransformMatrixKHR) -> Mat4 {
    let m = &transform.matrix;
    Mat4::from_cols_array(&[
        m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8], m[9], m[10], m[11], 0.0, 0.0, 0.0,
        1.0,
    ])
    .transpose()
}

/// Fields unpacked from a device instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedInstance {
    pub transform: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub hit_group_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

/// Unpack a device instance produced by [`InstanceTable::flatten`].
pub fn decode_instance(instance: &vk::AccelerationStructureInstanceKHR) -> DecodedInstance {
    // SAFETY: instances built by this crate always store a device address.
    let blas_address = unsafe { instance.acceleration_structure_reference.device_handle };
    DecodedInstance {
        transform: from_transform_matrix(&instance.transform),
        custom_index: instance.instance_custom_index_and_mask.low_24(),
        mask: instance.instance_custom_index_and_mask.high_8(),
        hit_group_offset: instance
            .instance_shader_binding_table_record_offset_and_flags
            .low_24(),
        flags: vk::GeometryInstanceFlagsKHR::from_raw(u32::from(
            instance
                .instance_shader_binding_table_record_offset_and_flags
                .high_8(),
        )),
        blas_address,
    }
}

/// Every instance of a scene, indexed by slot.
///
/// Instance count and BLAS references are fixed once the top-level
/// structure exists; transforms may change every frame.
#[derive(Debug, Clone, Default)]
pub struct InstanceTable {
    records: Vec<InstanceRecord>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    /// Append an instance and return its slot.
    pub fn push(&mut self, record: InstanceRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&InstanceRecord> {
        self.records.get(slot)
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InstanceRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Replace the transform of one instance.
    pub fn set_transform(&mut self, slot: usize, transform: Mat4) -> Result<()> {
        let count = self.records.len();
        let record = self
            .records
            .get_mut(slot)
            .ok_or(AccelError::LengthMismatch {
                what: "instance slot",
                expected: count,
                actual: slot + 1,
            })?;
        record.transform = transform;
        Ok(())
    }

    /// Replace every transform, one per instance in slot order.
    pub fn update_transforms(&mut self, transforms: &[Mat4]) -> Result<()> {
        if transforms.len() != self.records.len() {
            return Err(AccelError::LengthMismatch {
                what: "instance transforms",
                expected: self.records.len(),
                actual: transforms.len(),
            });
        }
        for (record, transform) in self.records.iter_mut().zip(transforms) {
            record.transform = *transform;
        }
        Ok(())
    }

    /// Check BLAS references and packed field ranges. When `hit_group_count`
    /// is given, every hit group offset must fall inside it.
    pub fn validate(&self, blas_count: usize, hit_group_count: Option<u32>) -> Result<()> {
        for (slot, record) in self.records.iter().enumerate() {
            if record.blas_index as usize >= blas_count {
                return Err(AccelError::InvalidBlasReference {
                    instance: slot,
                    blas: record.blas_index,
                    count: blas_count,
                });
            }
            let custom_index = custom_index_of(slot, record)?;
            if custom_index > MAX_PACKED_24 {
                return Err(AccelError::InstanceFieldOverflow {
                    instance: slot,
                    field: "custom index",
                    value: custom_index,
                });
            }
            if record.hit_group_offset > MAX_PACKED_24 {
                return Err(AccelError::InstanceFieldOverflow {
                    instance: slot,
                    field: "hit group offset",
                    value: record.hit_group_offset,
                });
            }
            packed_flags(slot, record)?;
            if let Some(count) = hit_group_count {
                if record.hit_group_offset >= count {
                    return Err(AccelError::HitGroupOutOfRange {
                        instance: slot,
                        offset: record.hit_group_offset,
                        count,
                    });
                }
            }
        }
        Ok(())
    }

    /// Device layout of every instance, resolving BLAS references through
    /// `blas_addresses`.
    pub fn flatten(
        &self,
        blas_addresses: &[vk::DeviceAddress],
    ) -> Result<Vec<vk::AccelerationStructureInstanceKHR>> {
        self.validate(blas_addresses.len(), None)?;

        self.records
            .iter()
            .enumerate()
            .map(|(slot, record)| {
                let flags = packed_flags(slot, record)?;
                Ok(vk::AccelerationStructureInstanceKHR {
                    transform: to_transform_matrix(record.transform),
                    instance_custom_index_and_mask: vk::Packed24_8::new(
                        custom_index_of(slot, record)?,
                        record.mask,
                    ),
                    instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                        record.hit_group_offset,
                        flags,
                    ),
                    acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                        device_handle: blas_addresses[record.blas_index as usize],
                    },
                })
            })
            .collect()
    }

}

fn packed_flags(slot: usize, record: &InstanceRecord) -> Result<u8> {
    u8::try_from(record.flags.as_raw()).map_err(|_| AccelError::InvalidInstanceFlags {
        instance: slot,
        flags: record.flags.as_raw(),
    })
}

fn custom_index_of(slot: usize, record: &InstanceRecord) -> Result<u32> {
    match record.custom_index {
        Some(index) => Ok(index),
        None => u32::try_from(slot).map_err(|_| AccelError::InstanceFieldOverflow {
            instance: slot,
            field: "custom index",
            value: u32::MAX,
        }),
    }
}
