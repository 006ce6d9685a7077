// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single funnel for every VFIO ioctl.
//!
//! The unit-test build replaces the kernel with a deterministic fake so the
//! attach paths (group viability, argsz grow-and-retry, IRQ programming)
//! can run without `/dev/vfio`.

use std::fs::File;
use std::mem::size_of;

use vfio_bindings::bindings::vfio::{
    vfio_device_gfx_plane_info, vfio_device_info, vfio_group_status, vfio_iommu_type1_dma_map,
    vfio_iommu_type1_dma_unmap, vfio_iommu_type1_info, vfio_irq_info, vfio_irq_set,
    vfio_region_info,
};
use vmm_sys_util::errno::Error as SysError;

use crate::container::VfioContainer;
use crate::fam::vec_with_array_field;
use crate::group::VfioGroup;

type Result<T> = std::result::Result<T, SysError>;

/// Structures following the variable-length ioctl convention: a leading
/// `argsz` member the kernel overwrites with the size it actually needs.
pub(crate) trait WithArgsz: Copy + Default {
    fn argsz(&self) -> u32;
    fn set_argsz(&mut self, argsz: u32);
}

impl WithArgsz for vfio_region_info {
    fn argsz(&self) -> u32 {
        self.argsz
    }
    fn set_argsz(&mut self, argsz: u32) {
        self.argsz = argsz;
    }
}

impl WithArgsz for vfio_iommu_type1_info {
    fn argsz(&self) -> u32 {
        self.argsz
    }
    fn set_argsz(&mut self, argsz: u32) {
        self.argsz = argsz;
    }
}

/// Issues a variable-length ioctl, growing the buffer when the kernel
/// writes back a larger required `argsz` and reissuing once.
///
/// `seed` fills the request fields (e.g. the region index) and runs again
/// after the buffer is reallocated; `issue` performs the ioctl against a
/// buffer whose first element is the request structure.
pub(crate) fn query_with_growable_argsz<T, S, I>(mut seed: S, mut issue: I) -> Result<Vec<T>>
where
    T: WithArgsz,
    S: FnMut(&mut T),
    I: FnMut(&mut [T]) -> Result<()>,
{
    let mut info = vec![T::default()];
    info[0].set_argsz(size_of::<T>() as u32);
    seed(&mut info[0]);
    issue(&mut info)?;

    let argsz = info[0].argsz();
    if argsz as usize <= size_of::<T>() {
        return Ok(info);
    }

    let mut info = vec_with_array_field::<T, u8>(argsz as usize - size_of::<T>());
    info[0].set_argsz(argsz);
    seed(&mut info[0]);
    issue(&mut info)?;
    Ok(info)
}

#[cfg(not(test))]
mod syscall {
    use std::ffi::CStr;
    use std::os::unix::io::{AsRawFd, FromRawFd};

    use vmm_sys_util::ioctl::{
        ioctl, ioctl_with_mut_ptr, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref,
        ioctl_with_val,
    };

    use super::*;
    use crate::vfio_ioctls::*;

    fn check_ret(ret: i32) -> Result<()> {
        if ret < 0 {
            return Err(SysError::last());
        }
        Ok(())
    }

    pub(crate) fn check_api_version(container: &VfioContainer) -> i32 {
        // SAFETY: file is a valid VFIO container descriptor and the ioctl
        // takes no argument.
        unsafe { ioctl(container, VFIO_GET_API_VERSION()) }
    }

    pub(crate) fn check_extension(container: &VfioContainer, val: u32) -> Result<u32> {
        // SAFETY: file is a valid VFIO container descriptor and `val` is a
        // plain scalar.
        let ret = unsafe {
            ioctl_with_val(container, VFIO_CHECK_EXTENSION(), val as std::os::raw::c_ulong)
        };
        check_ret(ret)?;
        Ok(ret as u32)
    }

    pub(crate) fn set_iommu(container: &VfioContainer, val: u32) -> Result<()> {
        // SAFETY: file is a valid VFIO container descriptor and `val` is a
        // plain scalar.
        let ret =
            unsafe { ioctl_with_val(container, VFIO_SET_IOMMU(), val as std::os::raw::c_ulong) };
        check_ret(ret)
    }

    pub(crate) fn get_iommu_info(
        container: &VfioContainer,
        info: &mut [vfio_iommu_type1_info],
    ) -> Result<()> {
        // SAFETY: file is a valid VFIO container descriptor; the buffer is
        // argsz bytes long and outlives the call.
        let ret =
            unsafe { ioctl_with_mut_ptr(container, VFIO_IOMMU_GET_INFO(), info.as_mut_ptr()) };
        check_ret(ret)
    }

    pub(crate) fn map_dma(
        container: &VfioContainer,
        dma_map: &vfio_iommu_type1_dma_map,
    ) -> Result<()> {
        // SAFETY: file is a valid VFIO container descriptor and dma_map is
        // a valid request structure.
        let ret = unsafe { ioctl_with_ref(container, VFIO_IOMMU_MAP_DMA(), dma_map) };
        check_ret(ret)
    }

    pub(crate) fn unmap_dma(
        container: &VfioContainer,
        dma_unmap: &mut vfio_iommu_type1_dma_unmap,
    ) -> Result<()> {
        // SAFETY: file is a valid VFIO container descriptor and dma_unmap
        // is a valid request structure the kernel writes the unmapped size
        // back into.
        let ret = unsafe { ioctl_with_mut_ref(container, VFIO_IOMMU_UNMAP_DMA(), dma_unmap) };
        check_ret(ret)
    }

    pub(crate) fn get_group_status(
        group: &VfioGroup,
        status: &mut vfio_group_status,
    ) -> Result<()> {
        // SAFETY: file is a valid VFIO group descriptor and status is a
        // valid structure the kernel fills in.
        let ret = unsafe { ioctl_with_mut_ref(group, VFIO_GROUP_GET_STATUS(), status) };
        check_ret(ret)
    }

    pub(crate) fn set_group_container(group: &VfioGroup, container: &VfioContainer) -> Result<()> {
        let container_raw_fd = container.as_raw_fd();
        // SAFETY: both descriptors are valid and the kernel only reads the
        // container fd value.
        let ret = unsafe { ioctl_with_ref(group, VFIO_GROUP_SET_CONTAINER(), &container_raw_fd) };
        check_ret(ret)
    }

    pub(crate) fn unset_group_container(
        group: &VfioGroup,
        container: &VfioContainer,
    ) -> Result<()> {
        let container_raw_fd = container.as_raw_fd();
        // SAFETY: both descriptors are valid and the kernel only reads the
        // container fd value.
        let ret = unsafe { ioctl_with_ref(group, VFIO_GROUP_UNSET_CONTAINER(), &container_raw_fd) };
        check_ret(ret)
    }

    pub(crate) fn get_group_device_fd(group: &VfioGroup, name: &CStr) -> Result<File> {
        // SAFETY: file is a valid VFIO group descriptor and name is a valid
        // C string.
        let ret = unsafe { ioctl_with_ptr(group, VFIO_GROUP_GET_DEVICE_FD(), name.as_ptr()) };
        check_ret(ret)?;
        // SAFETY: the kernel returned a fresh descriptor we now own.
        Ok(unsafe { File::from_raw_fd(ret) })
    }

    pub(crate) fn get_device_info(device: &File, info: &mut vfio_device_info) -> Result<()> {
        // SAFETY: file is a valid VFIO device descriptor and info is a
        // valid structure the kernel fills in.
        let ret = unsafe { ioctl_with_mut_ref(device, VFIO_DEVICE_GET_INFO(), info) };
        check_ret(ret)
    }

    pub(crate) fn get_device_region_info(
        device: &File,
        info: &mut [vfio_region_info],
    ) -> Result<()> {
        // SAFETY: file is a valid VFIO device descriptor; the buffer is
        // argsz bytes long and outlives the call.
        let ret =
            unsafe { ioctl_with_mut_ptr(device, VFIO_DEVICE_GET_REGION_INFO(), info.as_mut_ptr()) };
        check_ret(ret)
    }

    pub(crate) fn get_device_irq_info(device: &File, info: &mut vfio_irq_info) -> Result<()> {
        // SAFETY: file is a valid VFIO device descriptor and info is a
        // valid structure the kernel fills in.
        let ret = unsafe { ioctl_with_mut_ref(device, VFIO_DEVICE_GET_IRQ_INFO(), info) };
        check_ret(ret)
    }

    pub(crate) fn set_device_irqs(device: &File, irq_set: &[vfio_irq_set]) -> Result<()> {
        // SAFETY: file is a valid VFIO device descriptor and the first
        // element heads an argsz-byte request buffer.
        let ret = unsafe { ioctl_with_ref(device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        check_ret(ret)
    }

    pub(crate) fn reset_device(device: &File) -> Result<()> {
        // SAFETY: file is a valid VFIO device descriptor and the ioctl
        // takes no argument.
        let ret = unsafe { ioctl(device, VFIO_DEVICE_RESET()) };
        check_ret(ret)
    }

    pub(crate) fn query_gfx_plane(
        device: &File,
        info: &mut vfio_device_gfx_plane_info,
    ) -> Result<()> {
        // SAFETY: file is a valid VFIO device descriptor and info is a
        // valid probe structure.
        let ret = unsafe { ioctl_with_mut_ref(device, VFIO_DEVICE_QUERY_GFX_PLANE(), info) };
        check_ret(ret)
    }
}

#[cfg(test)]
mod syscall {
    use std::ffi::CStr;
    use std::mem::size_of;

    use vfio_bindings::bindings::vfio::{
        vfio_info_cap_header, vfio_region_sparse_mmap_area, VFIO_DEVICE_FLAGS_PCI,
        VFIO_DEVICE_FLAGS_RESET, VFIO_GROUP_FLAGS_VIABLE, VFIO_IOMMU_INFO_CAPS,
        VFIO_IOMMU_INFO_PGSIZES, VFIO_IRQ_INFO_EVENTFD, VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_IRQ_SET_DATA_EVENTFD, VFIO_PCI_MSIX_IRQ_INDEX, VFIO_PCI_MSI_IRQ_INDEX,
        VFIO_REGION_INFO_CAP_SPARSE_MMAP, VFIO_REGION_INFO_CAP_TYPE, VFIO_REGION_INFO_FLAG_CAPS,
        VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ, VFIO_REGION_INFO_FLAG_WRITE,
        VFIO_TYPE1v2_IOMMU,
    };
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::container::{
        vfio_iommu_type1_info_cap_migration, VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION,
    };

    // Fake device topology: BAR0 is a 16 MiB sparse-mappable region, BAR1 a
    // small I/O region, index 7 the config space; the VGA index is absent.
    pub(crate) const FAKE_BAR0_SIZE: u64 = 0x100_0000;
    pub(crate) const FAKE_BAR0_OFFSET: u64 = 0x2_0000;
    pub(crate) const FAKE_SPARSE_AREAS: [(u64, u64); 2] = [(0x0, 0x10_0000), (0x80_0000, 0x20_0000)];
    pub(crate) const FAKE_CONFIG_OFFSET: u64 = 0x7_0000;
    pub(crate) const FAKE_REGION_TYPE: (u32, u32) = (0x3, 0x1);
    // Group ids the fake kernel rejects as non-viable.
    pub(crate) const NON_VIABLE_GROUP_ID: u32 = 2;
    // IOVAs the fake kernel fails DMA requests for.
    pub(crate) const BAD_IOVA: u64 = 0xdead_0000;

    fn write_obj<T: Copy>(bytes: &mut [u8], offset: usize, val: T) {
        assert!(offset + size_of::<T>() <= bytes.len());
        // SAFETY: bounds asserted above; T is a plain kernel struct.
        unsafe { std::ptr::write_unaligned(bytes.as_mut_ptr().add(offset).cast::<T>(), val) }
    }

    fn as_bytes_mut<T>(slice: &mut [T]) -> &mut [u8] {
        // SAFETY: any slice of plain kernel structs can be viewed as bytes.
        unsafe {
            std::slice::from_raw_parts_mut(
                slice.as_mut_ptr().cast::<u8>(),
                std::mem::size_of_val(slice),
            )
        }
    }

    pub(crate) fn check_api_version(_container: &VfioContainer) -> i32 {
        vfio_bindings::bindings::vfio::VFIO_API_VERSION as i32
    }

    pub(crate) fn check_extension(_container: &VfioContainer, val: u32) -> Result<u32> {
        if val == VFIO_TYPE1v2_IOMMU {
            Ok(1)
        } else {
            Ok(0)
        }
    }

    pub(crate) fn set_iommu(_container: &VfioContainer, val: u32) -> Result<()> {
        if val == VFIO_TYPE1v2_IOMMU {
            Ok(())
        } else {
            Err(SysError::new(libc::EINVAL))
        }
    }

    pub(crate) fn get_iommu_info(
        _container: &VfioContainer,
        info: &mut [vfio_iommu_type1_info],
    ) -> Result<()> {
        let base = size_of::<vfio_iommu_type1_info>() as u32;
        let cap_len = size_of::<vfio_iommu_type1_info_cap_migration>() as u32;
        let required = base + cap_len;

        info[0].flags = VFIO_IOMMU_INFO_PGSIZES | VFIO_IOMMU_INFO_CAPS;
        info[0].iova_pgsizes = 0x1000 | 0x20_0000;
        if info[0].argsz < required {
            info[0].argsz = required;
            return Ok(());
        }

        info[0].cap_offset = base;
        let migration = vfio_iommu_type1_info_cap_migration {
            header: vfio_info_cap_header {
                id: VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION,
                version: 1,
                next: 0,
            },
            flags: 0,
            pgsize_bitmap: 0x1000 | 0x20_0000,
            max_dirty_bitmap_size: 0x1000_0000,
        };
        write_obj(as_bytes_mut(info), base as usize, migration);
        Ok(())
    }

    pub(crate) fn map_dma(
        _container: &VfioContainer,
        dma_map: &vfio_iommu_type1_dma_map,
    ) -> Result<()> {
        if dma_map.iova == BAD_IOVA {
            return Err(SysError::new(libc::ENOMEM));
        }
        Ok(())
    }

    pub(crate) fn unmap_dma(
        _container: &VfioContainer,
        dma_unmap: &mut vfio_iommu_type1_dma_unmap,
    ) -> Result<()> {
        if dma_unmap.iova == BAD_IOVA {
            return Err(SysError::new(libc::EINVAL));
        }
        Ok(())
    }

    pub(crate) fn get_group_status(
        group: &VfioGroup,
        status: &mut vfio_group_status,
    ) -> Result<()> {
        status.flags = if group.id() == NON_VIABLE_GROUP_ID {
            0
        } else {
            VFIO_GROUP_FLAGS_VIABLE
        };
        Ok(())
    }

    pub(crate) fn set_group_container(
        _group: &VfioGroup,
        _container: &VfioContainer,
    ) -> Result<()> {
        Ok(())
    }

    pub(crate) fn unset_group_container(
        _group: &VfioGroup,
        _container: &VfioContainer,
    ) -> Result<()> {
        Ok(())
    }

    pub(crate) fn get_group_device_fd(_group: &VfioGroup, _name: &CStr) -> Result<File> {
        let temp = TempFile::new().map_err(|_| SysError::new(libc::ENOENT))?;
        Ok(temp.into_file())
    }

    pub(crate) fn get_device_info(_device: &File, info: &mut vfio_device_info) -> Result<()> {
        info.flags = VFIO_DEVICE_FLAGS_PCI | VFIO_DEVICE_FLAGS_RESET;
        info.num_regions = 9;
        info.num_irqs = 5;
        Ok(())
    }

    pub(crate) fn get_device_region_info(
        _device: &File,
        info: &mut [vfio_region_info],
    ) -> Result<()> {
        let base = size_of::<vfio_region_info>() as u32;
        match info[0].index {
            0 => {
                // Sparse-mappable BAR, reported through the capability
                // chain with the argsz grow-and-retry dance.
                let sparse_len = (16 + FAKE_SPARSE_AREAS.len() * 16) as u32;
                let type_len = 16;
                let required = base + sparse_len + type_len;

                info[0].flags = VFIO_REGION_INFO_FLAG_READ
                    | VFIO_REGION_INFO_FLAG_WRITE
                    | VFIO_REGION_INFO_FLAG_MMAP
                    | VFIO_REGION_INFO_FLAG_CAPS;
                info[0].size = FAKE_BAR0_SIZE;
                info[0].offset = FAKE_BAR0_OFFSET;
                if info[0].argsz < required {
                    info[0].argsz = required;
                    return Ok(());
                }

                info[0].cap_offset = base;
                let sparse_offset = base as usize;
                let type_offset = sparse_offset + sparse_len as usize;
                let bytes = as_bytes_mut(info);
                write_obj(
                    bytes,
                    sparse_offset,
                    vfio_info_cap_header {
                        id: VFIO_REGION_INFO_CAP_SPARSE_MMAP as u16,
                        version: 1,
                        next: type_offset as u32,
                    },
                );
                write_obj(bytes, sparse_offset + 8, FAKE_SPARSE_AREAS.len() as u32);
                for (i, (offset, size)) in FAKE_SPARSE_AREAS.iter().enumerate() {
                    write_obj(
                        bytes,
                        sparse_offset + 16 + i * 16,
                        vfio_region_sparse_mmap_area {
                            offset: *offset,
                            size: *size,
                        },
                    );
                }
                write_obj(
                    bytes,
                    type_offset,
                    vfio_info_cap_header {
                        id: VFIO_REGION_INFO_CAP_TYPE as u16,
                        version: 1,
                        next: 0,
                    },
                );
                write_obj(bytes, type_offset + 8, FAKE_REGION_TYPE.0);
                write_obj(bytes, type_offset + 12, FAKE_REGION_TYPE.1);
                Ok(())
            }
            1 => {
                info[0].flags = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;
                info[0].size = 0x100;
                info[0].offset = 0x1_0000;
                Ok(())
            }
            2..=6 => {
                info[0].size = 0;
                Ok(())
            }
            7 => {
                info[0].flags = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;
                info[0].size = 0x100;
                info[0].offset = FAKE_CONFIG_OFFSET;
                Ok(())
            }
            // The VGA region of a non-VGA device.
            8 => Err(SysError::new(libc::EINVAL)),
            _ => Err(SysError::new(libc::EINVAL)),
        }
    }

    pub(crate) fn get_device_irq_info(_device: &File, info: &mut vfio_irq_info) -> Result<()> {
        match info.index {
            i if i == VFIO_PCI_MSI_IRQ_INDEX => {
                info.flags = VFIO_IRQ_INFO_EVENTFD;
                info.count = 1;
            }
            i if i == VFIO_PCI_MSIX_IRQ_INDEX => {
                info.flags = VFIO_IRQ_INFO_EVENTFD;
                info.count = 0;
            }
            0..=4 => {
                info.flags = 0;
                info.count = 0;
            }
            _ => return Err(SysError::new(libc::EINVAL)),
        }
        Ok(())
    }

    pub(crate) fn set_device_irqs(_device: &File, irq_set: &[vfio_irq_set]) -> Result<()> {
        let expected_argsz = (size_of::<vfio_irq_set>() + size_of::<u32>()) as u32;
        if irq_set[0].index != VFIO_PCI_MSI_IRQ_INDEX
            || irq_set[0].flags != VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER
            || irq_set[0].count != 1
            || irq_set[0].argsz != expected_argsz
        {
            return Err(SysError::new(libc::EINVAL));
        }
        Ok(())
    }

    pub(crate) fn reset_device(_device: &File) -> Result<()> {
        Ok(())
    }

    pub(crate) fn query_gfx_plane(
        _device: &File,
        info: &mut vfio_device_gfx_plane_info,
    ) -> Result<()> {
        info.width = 1024;
        info.height = 768;
        info.stride = 4096;
        info.drm_format = 0x3432_5258; // XR24
        Ok(())
    }
}

pub(crate) use syscall::*;
