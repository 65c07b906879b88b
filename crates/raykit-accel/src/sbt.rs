//! Shader binding table layout and construction.
//!
//! The table is one buffer holding the raygen, miss, hit and callable
//! regions in that order. Every handle slot is the handle size rounded up
//! to the handle alignment and then to the shader group base alignment, so
//! every region and every slot starts on a base-aligned offset. A raygen
//! region passed to a dispatch describes a single slot, so its stride equals
//! its size.

use crate::device::RayTracingDevice;
use crate::error::{AccelError, Result};
use crate::pipeline::{RayTracingPipeline, ShaderGroupKind};
use ash::vk;
use gpu_allocator::MemoryLocation;
use raykit_gpu::{GpuAllocator, GpuBuffer, GpuError, RayTracingCapabilities};

/// Round `value` up to a power-of-two `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of shader groups of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderGroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl ShaderGroupCounts {
    pub fn new(raygen: u32, miss: u32, hit: u32) -> Self {
        Self {
            raygen,
            miss,
            hit,
            callable: 0,
        }
    }

    #[must_use]
    pub fn with_callable(mut self, callable: u32) -> Self {
        self.callable = callable;
        self
    }

    /// Count the kinds of a declaration list.
    pub fn from_kinds(kinds: &[ShaderGroupKind]) -> Self {
        kinds.iter().fold(Self::default(), |mut counts, kind| {
            *counts.get_mut(*kind) += 1;
            counts
        })
    }

    pub fn get(&self, kind: ShaderGroupKind) -> u32 {
        match kind {
            ShaderGroupKind::Raygen => self.raygen,
            ShaderGroupKind::Miss => self.miss,
            ShaderGroupKind::Hit => self.hit,
            ShaderGroupKind::Callable => self.callable,
        }
    }

    fn get_mut(&mut self, kind: ShaderGroupKind) -> &mut u32 {
        match kind {
            ShaderGroupKind::Raygen => &mut self.raygen,
            ShaderGroupKind::Miss => &mut self.miss,
            ShaderGroupKind::Hit => &mut self.hit,
            ShaderGroupKind::Callable => &mut self.callable,
        }
    }

    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.callable
    }

    /// Check these counts against a pipeline's declared groups.
    pub fn check_against(&self, kinds: &[ShaderGroupKind]) -> Result<()> {
        let declared = Self::from_kinds(kinds);
        for kind in ShaderGroupKind::ALL {
            if declared.get(kind) != self.get(kind) {
                return Err(AccelError::ShaderGroupMismatch {
                    kind,
                    declared: declared.get(kind),
                    requested: self.get(kind),
                });
            }
        }
        Ok(())
    }
}

/// Placement of one region inside the table buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupRegion {
    pub offset: u64,
    /// Distance between consecutive slots.
    pub stride: u64,
    /// Bytes reserved for the region, `stride * count`.
    pub size: u64,
    pub count: u32,
}

impl GroupRegion {
    /// Offset of a slot inside the table buffer.
    pub fn slot_offset(&self, slot: u32) -> Option<u64> {
        (slot < self.count).then(|| self.offset + u64::from(slot) * self.stride)
    }
}

/// Physical layout of a shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupLayout {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
    /// Handle size rounded up to the handle alignment.
    pub aligned_handle_size: u64,
    pub raygen: GroupRegion,
    pub miss: GroupRegion,
    pub hit: GroupRegion,
    pub callable: GroupRegion,
    pub total_size: u64,
}

impl ShaderGroupLayout {
    /// Lay out a table for `counts` groups on a device with the given limits.
    ///
    /// Slots of every kind are spaced at the base alignment, which also
    /// lets each raygen slot be selected as its own single-slot region.
    pub fn compute(caps: &RayTracingCapabilities, counts: ShaderGroupCounts) -> Result<Self> {
        if counts.raygen == 0 {
            return Err(AccelError::MissingRaygen);
        }
        let handle_alignment = checked_alignment("shader group handle", caps.shader_group_handle_alignment)?;
        let base_alignment = checked_alignment("shader group base", caps.shader_group_base_alignment)?;

        let aligned_handle_size = align_up(u64::from(caps.shader_group_handle_size), handle_alignment);
        let stride = align_up(aligned_handle_size, base_alignment);

        let mut offset = 0;
        let mut place = |count: u32| {
            let size = stride * u64::from(count);
            let region = GroupRegion {
                offset,
                stride,
                size,
                count,
            };
            offset += size;
            region
        };

        let raygen = place(counts.raygen);
        let miss = place(counts.miss);
        let hit = place(counts.hit);
        let callable = place(counts.callable);

        Ok(Self {
            handle_size: caps.shader_group_handle_size,
            handle_alignment: caps.shader_group_handle_alignment,
            base_alignment: caps.shader_group_base_alignment,
            aligned_handle_size,
            raygen,
            miss,
            hit,
            callable,
            total_size: offset,
        })
    }

    pub fn region(&self, kind: ShaderGroupKind) -> &GroupRegion {
        match kind {
            ShaderGroupKind::Raygen => &self.raygen,
            ShaderGroupKind::Miss => &self.miss,
            ShaderGroupKind::Hit => &self.hit,
            ShaderGroupKind::Callable => &self.callable,
        }
    }

    pub fn counts(&self) -> ShaderGroupCounts {
        ShaderGroupCounts {
            raygen: self.raygen.count,
            miss: self.miss.count,
            hit: self.hit.count,
            callable: self.callable.count,
        }
    }

    /// Destination offset of every group of `kind`, paired with the group's
    /// index in declaration order.
    pub fn placements<'a>(
        &'a self,
        kinds: &'a [ShaderGroupKind],
        kind: ShaderGroupKind,
    ) -> impl Iterator<Item = (usize, u64)> + 'a {
        let region = self.region(kind);
        kinds
            .iter()
            .enumerate()
            .filter(move |(_, k)| **k == kind)
            .enumerate()
            .filter_map(move |(slot, (group, _))| {
                u32::try_from(slot)
                    .ok()
                    .and_then(|slot| region.slot_offset(slot))
                    .map(|offset| (group, offset))
            })
    }

    /// Device regions for a table stored at `base_address`. The raygen
    /// region covers slot 0 only.
    pub fn device_regions(&self, base_address: vk::DeviceAddress) -> DeviceRegions {
        let strided = |region: &GroupRegion| {
            if region.count == 0 {
                vk::StridedDeviceAddressRegionKHR::default()
            } else {
                vk::StridedDeviceAddressRegionKHR {
                    device_address: base_address + region.offset,
                    stride: region.stride,
                    size: region.size,
                }
            }
        };
        DeviceRegions {
            raygen: vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.raygen.offset,
                stride: self.raygen.stride,
                size: self.raygen.stride,
            },
            miss: strided(&self.miss),
            hit: strided(&self.hit),
            callable: strided(&self.callable),
        }
    }
}

fn checked_alignment(what: &'static str, value: u32) -> Result<u64> {
    if value.is_power_of_two() {
        Ok(u64::from(value))
    } else {
        Err(AccelError::InvalidAlignment { what, value })
    }
}

/// The four address regions consumed by a trace rays call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Copy `handles` (as returned by the driver, in declaration order) into a
/// table image following `layout`. Padding bytes are zero.
pub fn assemble_table(
    layout: &ShaderGroupLayout,
    kinds: &[ShaderGroupKind],
    handles: &[u8],
) -> Result<Vec<u8>> {
    let handle_size = layout.handle_size as usize;
    check_handle_data(layout, kinds, handles)?;

    let mut table = vec![0u8; layout.total_size as usize];
    for kind in ShaderGroupKind::ALL {
        for (group, offset) in layout.placements(kinds, kind) {
            let src = &handles[group * handle_size..(group + 1) * handle_size];
            let dst = offset as usize;
            table[dst..dst + handle_size].copy_from_slice(src);
        }
    }
    Ok(table)
}

fn check_handle_data(
    layout: &ShaderGroupLayout,
    kinds: &[ShaderGroupKind],
    handles: &[u8],
) -> Result<()> {
    layout.counts().check_against(kinds)?;
    let expected = kinds.len() * layout.handle_size as usize;
    if handles.len() < expected {
        return Err(AccelError::LengthMismatch {
            what: "shader group handle bytes",
            expected,
            actual: handles.len(),
        });
    }
    Ok(())
}

/// Steps of table construction, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtBuildStage {
    Uninitialized,
    QuerySizes,
    AllocateBuffer,
    WriteRaygenGroup,
    WriteMissGroup,
    WriteHitGroup,
    WriteCallableGroup,
    Ready,
}

impl SbtBuildStage {
    /// The step that follows this one. `Ready` is terminal.
    pub fn next(self) -> Self {
        match self {
            Self::Uninitialized => Self::QuerySizes,
            Self::QuerySizes => Self::AllocateBuffer,
            Self::AllocateBuffer => Self::WriteRaygenGroup,
            Self::WriteRaygenGroup => Self::WriteMissGroup,
            Self::WriteMissGroup => Self::WriteHitGroup,
            Self::WriteHitGroup => Self::WriteCallableGroup,
            Self::WriteCallableGroup | Self::Ready => Self::Ready,
        }
    }

    fn group_kind(self) -> Option<ShaderGroupKind> {
        match self {
            Self::WriteRaygenGroup => Some(ShaderGroupKind::Raygen),
            Self::WriteMissGroup => Some(ShaderGroupKind::Miss),
            Self::WriteHitGroup => Some(ShaderGroupKind::Hit),
            Self::WriteCallableGroup => Some(ShaderGroupKind::Callable),
            _ => None,
        }
    }
}

/// Builds a [`ShaderBindingTable`] for a pipeline.
pub struct ShaderBindingTableBuilder<'a> {
    rt: &'a RayTracingDevice,
    stage: SbtBuildStage,
}

impl<'a> ShaderBindingTableBuilder<'a> {
    pub fn new(rt: &'a RayTracingDevice) -> Self {
        Self {
            rt,
            stage: SbtBuildStage::Uninitialized,
        }
    }

    /// Step reached by the last build. `Ready` after a successful build.
    pub fn stage(&self) -> SbtBuildStage {
        self.stage
    }

    fn advance(&mut self) {
        self.stage = self.stage.next();
        tracing::trace!("SBT build stage: {:?}", self.stage);
    }

    /// Lay out, allocate and fill a table for `pipeline`.
    ///
    /// `counts` must match the pipeline's declared groups.
    ///
    /// # Safety
    /// The pipeline must be a valid ray tracing pipeline on this device.
    pub unsafe fn build(
        &mut self,
        allocator: &mut GpuAllocator,
        pipeline: &RayTracingPipeline,
        counts: ShaderGroupCounts,
    ) -> Result<ShaderBindingTable> {
        self.stage = SbtBuildStage::Uninitialized;
        counts.check_against(pipeline.group_kinds())?;

        self.advance();
        let layout = ShaderGroupLayout::compute(self.rt.capabilities(), counts)?;
        let handle_bytes = layout.handle_size as usize * pipeline.group_kinds().len();
        let handles = self
            .rt
            .ray_tracing_pipeline()
            .get_ray_tracing_shader_group_handles(
                pipeline.handle(),
                0,
                pipeline.group_count(),
                handle_bytes,
            )
            .map_err(|e| AccelError::ShaderBindingTable(e.into()))?;
        check_handle_data(&layout, pipeline.group_kinds(), &handles)?;

        self.advance();
        let mut buffer = allocator
            .create_buffer_aligned(
                layout.total_size,
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::CpuToGpu,
                "shader_binding_table",
                u64::from(layout.base_alignment),
            )
            .map_err(AccelError::ShaderBindingTable)?;

        loop {
            self.advance();
            let Some(kind) = self.stage.group_kind() else {
                break;
            };
            if let Err(e) = write_group(&buffer, &layout, pipeline.group_kinds(), &handles, kind) {
                if let Err(free_err) = allocator.free_buffer(&mut buffer) {
                    tracing::warn!("Failed to release shader binding table buffer: {free_err}");
                }
                return Err(AccelError::ShaderBindingTable(e));
            }
        }

        let regions = layout.device_regions(self.rt.buffer_address(buffer.buffer));
        tracing::info!(
            "Created shader binding table: {} bytes (raygen {}, miss {}, hit {}, callable {})",
            layout.total_size,
            layout.raygen.size,
            layout.miss.size,
            layout.hit.size,
            layout.callable.size
        );

        Ok(ShaderBindingTable {
            buffer,
            layout,
            regions,
        })
    }
}

fn write_group(
    buffer: &GpuBuffer,
    layout: &ShaderGroupLayout,
    kinds: &[ShaderGroupKind],
    handles: &[u8],
    kind: ShaderGroupKind,
) -> raykit_gpu::Result<()> {
    let handle_size = layout.handle_size as usize;
    for (group, offset) in layout.placements(kinds, kind) {
        let src = handles
            .get(group * handle_size..(group + 1) * handle_size)
            .ok_or_else(|| GpuError::InvalidState(format!("no handle for group {group}")))?;
        buffer.write_bytes(offset, src)?;
    }
    Ok(())
}

/// A filled shader binding table and the regions describing it.
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    layout: ShaderGroupLayout,
    regions: DeviceRegions,
}

impl ShaderBindingTable {
    pub fn layout(&self) -> &ShaderGroupLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn regions(&self) -> &DeviceRegions {
        &self.regions
    }

    pub fn hit_group_count(&self) -> u32 {
        self.layout.hit.count
    }

    /// Raygen region selecting one raygen slot.
    pub fn raygen_region_for(&self, slot: u32) -> Result<vk::StridedDeviceAddressRegionKHR> {
        let offset = self
            .layout
            .raygen
            .slot_offset(slot)
            .ok_or(AccelError::RaygenSlotOutOfRange {
                slot,
                count: self.layout.raygen.count,
            })?;
        let base = self.regions.raygen.device_address - self.layout.raygen.offset;
        Ok(vk::StridedDeviceAddressRegionKHR {
            device_address: base + offset,
            stride: self.layout.raygen.stride,
            size: self.layout.raygen.stride,
        })
    }

    /// Record a dispatch using raygen slot 0.
    ///
    /// # Safety
    /// The command buffer must be recording with the table's pipeline and
    /// its descriptor sets bound.
    pub unsafe fn record_trace_rays(
        &self,
        rt: &RayTracingDevice,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        rt.ray_tracing_pipeline().cmd_trace_rays(
            cmd,
            &self.regions.raygen,
            &self.regions.miss,
            &self.regions.hit,
            &self.regions.callable,
            width,
            height,
            depth,
        );
    }

    /// Free the table buffer.
    ///
    /// # Safety
    /// No pending GPU work may read the table.
    pub unsafe fn destroy(mut self, allocator: &mut GpuAllocator) -> raykit_gpu::Result<()> {
        allocator.free_buffer(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ShaderGroupKind::{Callable, Hit, Miss, Raygen};

    fn caps(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingCapabilities {
        RayTracingCapabilities {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            ..Default::default()
        }
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(0, 16), 0);
    }

    #[test]
    fn one_raygen_two_miss_two_hit() {
        let layout =
            ShaderGroupLayout::compute(&caps(32, 32, 64), ShaderGroupCounts::new(1, 2, 2)).unwrap();

        assert_eq!(layout.raygen.size, 64);
        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.size, 128);
        assert_eq!(layout.callable.size, 0);
        assert_eq!(layout.total_size, 320);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 192);

        let regions = layout.device_regions(0x10_0000);
        assert_eq!(regions.raygen.stride, 64);
        assert_eq!(regions.raygen.size, 64);
        assert_eq!(regions.miss.device_address, 0x10_0000 + 64);
        assert_eq!(regions.miss.stride, 64);
        assert_eq!(regions.miss.size, 128);
        assert_eq!(regions.hit.device_address, 0x10_0000 + 192);
        assert_eq!(regions.hit.stride, 64);
        assert_eq!(regions.hit.size, 128);
        assert_eq!(regions.callable.size, 0);
        assert_eq!(regions.callable.device_address, 0);
    }

    #[test]
    fn alignment_holds_for_device_limits() {
        for handle_size in [8u32, 16, 24, 32, 48, 64] {
            for handle_alignment in [1u32, 4, 8, 16, 32, 64] {
                for base_alignment in [16u32, 32, 64, 128, 256] {
                    for counts in [
                        ShaderGroupCounts::new(1, 1, 1),
                        ShaderGroupCounts::new(1, 2, 2),
                        ShaderGroupCounts::new(3, 5, 7).with_callable(2),
                        ShaderGroupCounts::new(2, 0, 0),
                    ] {
                        let layout = ShaderGroupLayout::compute(
                            &caps(handle_size, handle_alignment, base_alignment),
                            counts,
                        )
                        .unwrap();
                        let base = u64::from(base_alignment);
                        let slot_alignment = u64::from(handle_alignment);

                        for kind in ShaderGroupKind::ALL {
                            let region = layout.region(kind);
                            assert_eq!(region.offset % base, 0);
                            assert_eq!(region.size % base, 0);
                            for slot in 0..region.count {
                                let offset = region.slot_offset(slot).unwrap();
                                assert_eq!(offset % slot_alignment, 0);
                                assert_eq!(offset % base, 0);
                                assert!(
                                    offset + u64::from(handle_size) <= region.offset + region.size
                                );
                            }
                        }

                        let regions = layout.device_regions(0);
                        assert_eq!(regions.raygen.stride, regions.raygen.size);
                        assert_eq!(regions.raygen.stride % base, 0);
                        assert_eq!(
                            layout.total_size,
                            ShaderGroupKind::ALL
                                .iter()
                                .map(|kind| layout.region(*kind).size)
                                .sum::<u64>()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn rejects_bad_alignment() {
        let err = ShaderGroupLayout::compute(&caps(32, 24, 64), ShaderGroupCounts::new(1, 1, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            AccelError::InvalidAlignment {
                value: 24,
                ..
            }
        ));
        assert!(ShaderGroupLayout::compute(&caps(32, 32, 0), ShaderGroupCounts::new(1, 1, 1)).is_err());
    }

    #[test]
    fn rejects_missing_raygen() {
        assert!(matches!(
            ShaderGroupLayout::compute(&caps(32, 32, 64), ShaderGroupCounts::new(0, 1, 1)),
            Err(AccelError::MissingRaygen)
        ));
    }

    #[test]
    fn counts_must_match_declarations() {
        let kinds = [Raygen, Miss, Hit, Hit];
        assert!(ShaderGroupCounts::new(1, 1, 2).check_against(&kinds).is_ok());
        assert!(matches!(
            ShaderGroupCounts::new(1, 2, 1).check_against(&kinds),
            Err(AccelError::ShaderGroupMismatch {
                kind: Miss,
                declared: 1,
                requested: 2
            })
        ));
    }

    #[test]
    fn handles_follow_declaration_order() {
        let kinds = [Hit, Raygen, Miss, Hit, Miss, Callable];
        let layout = ShaderGroupLayout::compute(
            &caps(4, 8, 16),
            ShaderGroupCounts::from_kinds(&kinds),
        )
        .unwrap();

        // Handle of group i is four bytes of value i + 1.
        let handles: Vec<u8> = (0..kinds.len() as u8)
            .flat_map(|group| [group + 1; 4])
            .collect();
        let table = assemble_table(&layout, &kinds, &handles).unwrap();
        assert_eq!(table.len() as u64, layout.total_size);

        let read = |offset: u64| table[offset as usize..offset as usize + 4].to_vec();
        assert_eq!(read(layout.raygen.slot_offset(0).unwrap()), vec![2; 4]);
        assert_eq!(read(layout.miss.slot_offset(0).unwrap()), vec![3; 4]);
        assert_eq!(read(layout.miss.slot_offset(1).unwrap()), vec![5; 4]);
        assert_eq!(read(layout.hit.slot_offset(0).unwrap()), vec![1; 4]);
        assert_eq!(read(layout.hit.slot_offset(1).unwrap()), vec![4; 4]);
        assert_eq!(read(layout.callable.slot_offset(0).unwrap()), vec![6; 4]);

        // Padding between the handle and the next slot stays zero.
        let hit0 = layout.hit.slot_offset(0).unwrap() as usize;
        assert_eq!(&table[hit0 + 4..hit0 + 8], &[0; 4]);
    }

    #[test]
    fn short_handle_data_is_rejected() {
        let kinds = [Raygen, Miss];
        let layout =
            ShaderGroupLayout::compute(&caps(32, 32, 64), ShaderGroupCounts::new(1, 1, 0)).unwrap();
        assert!(matches!(
            assemble_table(&layout, &kinds, &[0; 40]),
            Err(AccelError::LengthMismatch { expected: 64, actual: 40, .. })
        ));
    }

    #[test]
    fn raygen_slots_are_individually_addressable() {
        let layout =
            ShaderGroupLayout::compute(&caps(32, 32, 64), ShaderGroupCounts::new(3, 1, 1)).unwrap();
        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.raygen.size, 192);
        assert_eq!(layout.raygen.slot_offset(2), Some(128));
        assert_eq!(layout.raygen.slot_offset(3), None);
    }

    #[test]
    fn raygen_region_selects_one_slot() {
        let layout =
            ShaderGroupLayout::compute(&caps(32, 32, 64), ShaderGroupCounts::new(2, 1, 1)).unwrap();
        let table = ShaderBindingTable {
            buffer: GpuBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
                size: layout.total_size,
            },
            layout,
            regions: layout.device_regions(0x2000),
        };

        let second = table.raygen_region_for(1).unwrap();
        assert_eq!(second.device_address, 0x2000 + 64);
        assert_eq!(second.stride, 64);
        assert_eq!(second.size, 64);
        assert_eq!(table.raygen_region_for(0).unwrap().device_address, table.regions().raygen.device_address);
        assert!(matches!(
            table.raygen_region_for(2),
            Err(AccelError::RaygenSlotOutOfRange { slot: 2, count: 2 })
        ));
    }

    #[test]
    fn stage_machine_is_linear() {
        let mut stage = SbtBuildStage::Uninitialized;
        let mut visited = vec![stage];
        while stage != SbtBuildStage::Ready {
            stage = stage.next();
            visited.push(stage);
        }
        assert_eq!(
            visited,
            vec![
                SbtBuildStage::Uninitialized,
                SbtBuildStage::QuerySizes,
                SbtBuildStage::AllocateBuffer,
                SbtBuildStage::WriteRaygenGroup,
                SbtBuildStage::WriteMissGroup,
                SbtBuildStage::WriteHitGroup,
                SbtBuildStage::WriteCallableGroup,
                SbtBuildStage::Ready,
            ]
        );
        assert_eq!(SbtBuildStage::Ready.next(), SbtBuildStage::Ready);
        assert_eq!(
            SbtBuildStage::WriteHitGroup.group_kind(),
            Some(ShaderGroupKind::Hit)
        );
        assert_eq!(SbtBuildStage::Ready.group_kind(), None);
    }
}
