// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::mem::{size_of, ManuallyDrop};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::prelude::FileExt;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian};
use log::{debug, warn};
use vfio_bindings::bindings::vfio::{
    vfio_device_gfx_plane_info, vfio_device_info, vfio_irq_info, vfio_irq_set, vfio_region_info,
    VFIO_DEVICE_FLAGS_PCI, VFIO_DEVICE_FLAGS_RESET, VFIO_GFX_PLANE_TYPE_PROBE,
    VFIO_GFX_PLANE_TYPE_REGION, VFIO_IRQ_INFO_EVENTFD, VFIO_IRQ_SET_ACTION_TRIGGER,
    VFIO_IRQ_SET_DATA_EVENTFD, VFIO_PCI_BAR0_REGION_INDEX, VFIO_PCI_CONFIG_REGION_INDEX,
    VFIO_PCI_MSIX_IRQ_INDEX, VFIO_PCI_MSI_IRQ_INDEX, VFIO_PCI_VGA_REGION_INDEX,
    VFIO_REGION_INFO_CAP_SPARSE_MMAP, VFIO_REGION_INFO_CAP_TYPE, VFIO_REGION_INFO_FLAG_CAPS,
    VFIO_REGION_INFO_FLAG_WRITE,
};
use vmm_sys_util::eventfd::EventFd;

use crate::container::VfioContainer;
use crate::fam::vec_with_array_field;
use crate::group::VfioGroup;
use crate::vfio_syscall::{self, query_with_growable_argsz};
use crate::{cap_at, CapabilityIter, Result, VfioError};

/// A sub-range of a region that is safe to mmap directly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VfioRegionSparseMmapArea {
    /// Byte offset of the area within the region.
    pub offset: u64,
    /// Size of the area in bytes.
    pub size: u64,
}

/// The sparse-mmap capability of a region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfioRegionInfoCapSparseMmap {
    /// The mmappable areas, in ascending offset order.
    pub areas: Vec<VfioRegionSparseMmapArea>,
}

/// The type/subtype capability of a region.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VfioRegionInfoCapType {
    pub type_: u32,
    pub subtype: u32,
}

/// Capabilities attached to a region by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VfioRegionInfoCap {
    SparseMmap(VfioRegionInfoCapSparseMmap),
    Type(VfioRegionInfoCapType),
}

/// One entry of the device region table. Built once at attach, immutable
/// afterwards. Absent region indexes keep a zero-sized entry so the table
/// stays index-addressable.
#[derive(Clone, Debug, Default)]
pub struct VfioRegion {
    pub flags: u32,
    pub size: u64,
    pub offset: u64,
    pub caps: Vec<VfioRegionInfoCap>,
}

/// Information about one VFIO interrupt index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VfioIrq {
    pub flags: u32,
    pub index: u32,
    pub count: u32,
}

/// Graphics plane information reported by a display-capable mediated
/// device.
#[derive(Clone, Copy, Debug, Default)]
pub struct VfioGfxPlaneInfo {
    pub drm_format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u32,
}

/// A safe wrapper over a VFIO device descriptor.
///
/// Region contents are reached with positioned reads and writes at the
/// per-region file offsets the kernel reports; interrupts are programmed
/// with `VFIO_DEVICE_SET_IRQS`.
#[derive(Debug)]
pub struct VfioDevice {
    // Closed explicitly in drop() so the descriptor goes away before the
    // group is released; releasing the group first returns EBUSY.
    device: ManuallyDrop<File>,
    flags: u32,
    regions: Vec<VfioRegion>,
    irqs: HashMap<u32, VfioIrq>,
    group: Option<Arc<VfioGroup>>,
    container: Arc<VfioContainer>,
}

impl VfioDevice {
    /// Opens the device named by `sysfspath` through its IOMMU group and
    /// builds its region and interrupt tables.
    pub fn new<P: AsRef<Path>>(sysfspath: P, container: Arc<VfioContainer>) -> Result<Self> {
        let group_id = Self::get_group_id_from_path(sysfspath.as_ref())?;
        let group = container.get_group(group_id)?;

        let name = sysfspath
            .as_ref()
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or(VfioError::InvalidPath)?;
        let name = CString::new(name).map_err(|_| VfioError::InvalidPath)?;

        match Self::probe(&group, &name) {
            Ok((device, flags, regions, irqs)) => Ok(VfioDevice {
                device: ManuallyDrop::new(device),
                flags,
                regions,
                irqs,
                group: Some(group),
                container,
            }),
            Err(e) => {
                container.put_group(group);
                Err(e)
            }
        }
    }

    #[cfg(not(test))]
    fn get_group_id_from_path(sysfspath: &Path) -> Result<u32> {
        VfioGroup::find_group_id(sysfspath)
    }

    fn probe(
        group: &VfioGroup,
        name: &CString,
    ) -> Result<(File, u32, Vec<VfioRegion>, HashMap<u32, VfioIrq>)> {
        let device =
            vfio_syscall::get_group_device_fd(group, name).map_err(VfioError::GroupGetDeviceFd)?;

        let mut dev_info = vfio_device_info {
            argsz: size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };
        vfio_syscall::get_device_info(&device, &mut dev_info)
            .map_err(VfioError::VfioDeviceGetInfo)?;

        if dev_info.flags & (VFIO_DEVICE_FLAGS_PCI | VFIO_DEVICE_FLAGS_RESET)
            != VFIO_DEVICE_FLAGS_PCI | VFIO_DEVICE_FLAGS_RESET
            || dev_info.num_regions <= VFIO_PCI_CONFIG_REGION_INDEX
            || dev_info.num_irqs <= VFIO_PCI_MSIX_IRQ_INDEX
        {
            return Err(VfioError::VfioDeviceNotPci);
        }

        let regions = Self::get_regions(&device, dev_info.num_regions)?;
        let irqs = Self::get_irqs(&device, dev_info.num_irqs);

        Ok((device, dev_info.flags, regions, irqs))
    }

    fn get_regions(device: &File, num_regions: u32) -> Result<Vec<VfioRegion>> {
        let mut regions = Vec::with_capacity(num_regions as usize);

        for index in VFIO_PCI_BAR0_REGION_INDEX..num_regions {
            let info = match query_with_growable_argsz::<vfio_region_info, _, _>(
                |info| info.index = index,
                |info| vfio_syscall::get_device_region_info(device, info),
            ) {
                Ok(info) => info,
                // Devices without a VGA window report EINVAL there; a
                // zero-sized entry keeps the table index-addressable.
                Err(e) if e.errno() == libc::EINVAL && index == VFIO_PCI_VGA_REGION_INDEX => {
                    regions.push(VfioRegion::default());
                    continue;
                }
                Err(e) => return Err(VfioError::VfioDeviceGetRegionInfo(e)),
            };

            let mut region = VfioRegion {
                flags: info[0].flags,
                size: info[0].size,
                offset: info[0].offset,
                caps: Vec::new(),
            };
            if info[0].flags & VFIO_REGION_INFO_FLAG_CAPS != 0
                && info[0].cap_offset as usize >= size_of::<vfio_region_info>()
            {
                // SAFETY: the buffer is argsz bytes of plain kernel data.
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        info.as_ptr().cast::<u8>(),
                        info.len() * size_of::<vfio_region_info>(),
                    )
                };
                Self::parse_region_caps(&mut region, bytes, info[0].cap_offset as usize);
            }

            debug!(
                "vfio: region {} flags 0x{:x} size 0x{:x} offset 0x{:x} caps {}",
                index,
                region.flags,
                region.size,
                region.offset,
                region.caps.len()
            );
            regions.push(region);
        }

        Ok(regions)
    }

    fn parse_region_caps(region: &mut VfioRegion, bytes: &[u8], cap_offset: usize) {
        for (id, offset) in CapabilityIter::new(bytes, cap_offset) {
            match u32::from(id) {
                VFIO_REGION_INFO_CAP_SPARSE_MMAP => {
                    let Some(nr_areas) = cap_at::<u32>(bytes, offset + 8) else {
                        break;
                    };
                    let mut areas = Vec::with_capacity(nr_areas as usize);
                    for i in 0..nr_areas as usize {
                        let Some(area) = cap_at::<VfioRegionSparseMmapArea>(
                            bytes,
                            offset + 16 + i * size_of::<VfioRegionSparseMmapArea>(),
                        ) else {
                            break;
                        };
                        areas.push(area);
                    }
                    region
                        .caps
                        .push(VfioRegionInfoCap::SparseMmap(VfioRegionInfoCapSparseMmap {
                            areas,
                        }));
                }
                VFIO_REGION_INFO_CAP_TYPE => {
                    if let Some(cap) = cap_at::<VfioRegionInfoCapType>(bytes, offset + 8) {
                        region.caps.push(VfioRegionInfoCap::Type(cap));
                    }
                }
                _ => {}
            }
        }
    }

    fn get_irqs(device: &File, num_irqs: u32) -> HashMap<u32, VfioIrq> {
        let mut irqs = HashMap::new();

        for index in 0..num_irqs {
            let mut irq_info = vfio_irq_info {
                argsz: size_of::<vfio_irq_info>() as u32,
                flags: 0,
                index,
                count: 0,
            };
            if vfio_syscall::get_device_irq_info(device, &mut irq_info).is_err() {
                warn!("vfio: failed to query irq info for index {index}");
                continue;
            }
            debug!(
                "vfio: irq {} flags 0x{:x} count {}",
                index, irq_info.flags, irq_info.count
            );
            irqs.insert(
                index,
                VfioIrq {
                    flags: irq_info.flags,
                    index,
                    count: irq_info.count,
                },
            );
        }

        irqs
    }

    /// Returns the interrupt description for `index`.
    pub fn get_irq_info(&self, index: u32) -> Option<&VfioIrq> {
        self.irqs.get(&index)
    }

    /// Binds `trigger` as the MSI eventfd: the kernel signals it on every
    /// device interrupt until the route is torn down.
    pub fn enable_msi(&self, trigger: &EventFd) -> Result<()> {
        self.set_msi_trigger(Some(trigger))
    }

    /// Unbinds the MSI eventfd.
    pub fn disable_msi(&self) -> Result<()> {
        self.set_msi_trigger(None)
    }

    fn set_msi_trigger(&self, trigger: Option<&EventFd>) -> Result<()> {
        let irq = self
            .irqs
            .get(&VFIO_PCI_MSI_IRQ_INDEX)
            .ok_or(VfioError::VfioDeviceInvalidIrq(VFIO_PCI_MSI_IRQ_INDEX))?;
        if irq.count == 0 || irq.flags & VFIO_IRQ_INFO_EVENTFD == 0 {
            return Err(VfioError::VfioDeviceInvalidIrq(VFIO_PCI_MSI_IRQ_INDEX));
        }

        let mut irq_set = vec_with_array_field::<vfio_irq_set, u32>(1);
        irq_set[0].argsz = (size_of::<vfio_irq_set>() + size_of::<u32>()) as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER;
        irq_set[0].index = VFIO_PCI_MSI_IRQ_INDEX;
        irq_set[0].start = 0;
        irq_set[0].count = 1;
        {
            // A descriptor of -1 de-assigns the vector.
            let fd = trigger.map_or(-1i32, |evt| evt.as_raw_fd());
            // SAFETY: vec_with_array_field reserved one u32 of payload.
            let data = unsafe { irq_set[0].data.as_mut_slice(size_of::<u32>()) };
            NativeEndian::write_i32(data, fd);
        }

        vfio_syscall::set_device_irqs(&self.device, &irq_set).map_err(VfioError::VfioDeviceSetIrqs)
    }

    /// Resets the device, when it advertises reset support.
    pub fn reset(&self) -> Result<()> {
        if self.flags & VFIO_DEVICE_FLAGS_RESET != 0 {
            vfio_syscall::reset_device(&self.device).map_err(VfioError::VfioDeviceReset)?;
        }
        Ok(())
    }

    /// Probes for a region-backed graphics plane. Devices without one fail
    /// the query, which callers treat as "no plane".
    pub fn query_gfx_plane(&self) -> Result<VfioGfxPlaneInfo> {
        let mut info = vfio_device_gfx_plane_info {
            argsz: size_of::<vfio_device_gfx_plane_info>() as u32,
            flags: VFIO_GFX_PLANE_TYPE_PROBE | VFIO_GFX_PLANE_TYPE_REGION,
            ..Default::default()
        };
        vfio_syscall::query_gfx_plane(&self.device, &mut info)
            .map_err(|_| VfioError::VfioDeviceNoGfxPlane)?;

        Ok(VfioGfxPlaneInfo {
            drm_format: info.drm_format,
            width: info.width,
            height: info.height,
            stride: info.stride,
            size: info.size,
        })
    }

    /// Get a region's flags.
    pub fn get_region_flags(&self, index: u32) -> u32 {
        self.regions.get(index as usize).map_or(0, |r| r.flags)
    }

    /// Get a region's offset on the device descriptor.
    pub fn get_region_offset(&self, index: u32) -> u64 {
        self.regions.get(index as usize).map_or(0, |r| r.offset)
    }

    /// Get a region's size.
    pub fn get_region_size(&self, index: u32) -> u64 {
        self.regions.get(index as usize).map_or(0, |r| r.size)
    }

    /// Get a region's capability list.
    pub fn get_region_caps(&self, index: u32) -> &[VfioRegionInfoCap] {
        self.regions
            .get(index as usize)
            .map_or(&[], |r| r.caps.as_slice())
    }

    /// Reads `buf.len()` bytes from region `index` at `addr`. Failures are
    /// logged and leave `buf` untouched; the guest observes stale bytes
    /// rather than the VM going down.
    pub fn region_read(&self, index: u32, buf: &mut [u8], addr: u64) {
        let Some(region) = self.regions.get(index as usize) else {
            warn!("vfio: region read with invalid index {index}");
            return;
        };

        let size = buf.len() as u64;
        if size > region.size || addr > region.size - size {
            warn!("vfio: region {index} read out of range, addr 0x{addr:x} size 0x{size:x}");
            return;
        }

        if let Err(e) = self.device.read_exact_at(buf, region.offset + addr) {
            warn!("vfio: failed to read region {index} at 0x{addr:x}: {e}");
        }
    }

    /// Writes `buf` into region `index` at `addr`. Failures are logged and
    /// swallowed.
    pub fn region_write(&self, index: u32, buf: &[u8], addr: u64) {
        let Some(region) = self.regions.get(index as usize) else {
            warn!("vfio: region write with invalid index {index}");
            return;
        };

        let size = buf.len() as u64;
        if size > region.size
            || addr > region.size - size
            || region.flags & VFIO_REGION_INFO_FLAG_WRITE == 0
        {
            warn!("vfio: region {index} write out of range, addr 0x{addr:x} size 0x{size:x}");
            return;
        }

        if let Err(e) = self.device.write_all_at(buf, region.offset + addr) {
            warn!("vfio: failed to write region {index} at 0x{addr:x}: {e}");
        }
    }

    /// The backing file of the device descriptor, used to mmap regions.
    pub fn device_file(&self) -> &File {
        &self.device
    }
}

impl AsRawFd for VfioDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

impl Drop for VfioDevice {
    fn drop(&mut self) {
        // SAFETY: the File is dropped exactly once, here, and not used
        // afterwards.
        unsafe {
            ManuallyDrop::drop(&mut self.device);
        }
        if let Some(group) = self.group.take() {
            self.container.put_group(group);
        }
    }
}
