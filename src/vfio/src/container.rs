// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use vfio_bindings::bindings::vfio::{
    vfio_info_cap_header, vfio_iommu_type1_dma_map, vfio_iommu_type1_dma_unmap,
    vfio_iommu_type1_info, VFIO_API_VERSION, VFIO_DMA_MAP_FLAG_READ, VFIO_DMA_MAP_FLAG_WRITE,
    VFIO_IOMMU_INFO_CAPS, VFIO_TYPE1v2_IOMMU,
};

use crate::group::VfioGroup;
use crate::vfio_syscall::{self, query_with_growable_argsz};
use crate::{cap_at, host_page_size, CapabilityIter, Result, VfioError};

// Appeared in Linux 5.8, after the generated bindings were produced.
pub(crate) const VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION: u16 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
#[allow(non_camel_case_types)]
pub(crate) struct vfio_iommu_type1_info_cap_migration {
    pub header: vfio_info_cap_header,
    pub flags: u32,
    pub pgsize_bitmap: u64,
    pub max_dirty_bitmap_size: u64,
}

/// A safe wrapper over a VFIO container.
///
/// The container owns one IOMMU address space. Groups bound to it share the
/// same set of DMA translations, and the first group bound selects the
/// Type1v2 IOMMU backend.
#[derive(Debug)]
pub struct VfioContainer {
    pub(crate) container: File,
    pub(crate) groups: Mutex<HashMap<u32, Arc<VfioGroup>>>,
}

impl VfioContainer {
    /// Opens `/dev/vfio/vfio` and verifies the kernel speaks the VFIO API
    /// version this crate was compiled against.
    pub fn new() -> Result<Self> {
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(VfioError::OpenContainer)?;

        let container = VfioContainer {
            container,
            groups: Mutex::new(HashMap::new()),
        };
        if vfio_syscall::check_api_version(&container) != VFIO_API_VERSION as i32 {
            return Err(VfioError::VfioApiVersion);
        }

        Ok(container)
    }

    /// Returns the group wrapper for `group_id`, opening and binding the
    /// group on first use. Binding the first group also selects the IOMMU
    /// backend and validates the IOMMU info the kernel reports.
    pub(crate) fn get_group(&self, group_id: u32) -> Result<Arc<VfioGroup>> {
        // The lock is held across the ioctls below so a concurrent caller
        // cannot observe a group bound to a container with no IOMMU set.
        let mut groups = self.groups.lock().expect("poisoned lock");
        if let Some(group) = groups.get(&group_id) {
            return Ok(group.clone());
        }

        let group = Arc::new(VfioGroup::new(group_id)?);
        vfio_syscall::set_group_container(&group, self)
            .map_err(VfioError::GroupSetContainer)?;

        // The IOMMU backend can only be set once at least one group is
        // bound, and must be set exactly once per container.
        if groups.is_empty() {
            if let Err(e) = self.init_iommu() {
                let _ = vfio_syscall::unset_group_container(&group, self);
                return Err(e);
            }
        }

        groups.insert(group_id, group.clone());
        Ok(group)
    }

    /// Releases a group obtained from [`VfioContainer::get_group`],
    /// unbinding it from the container once the last user is gone.
    pub(crate) fn put_group(&self, group: Arc<VfioGroup>) {
        let mut groups = self.groups.lock().expect("poisoned lock");
        // The registry and the caller hold the remaining references.
        if Arc::strong_count(&group) == 2 {
            if let Err(e) = vfio_syscall::unset_group_container(&group, self) {
                warn!("vfio: failed to unbind group {}: {}", group.id(), e);
                return;
            }
            groups.remove(&group.id());
        }
    }

    fn init_iommu(&self) -> Result<()> {
        if vfio_syscall::check_extension(self, VFIO_TYPE1v2_IOMMU)
            .map_err(VfioError::ContainerSetIommu)?
            != 1
        {
            return Err(VfioError::VfioType1V2);
        }
        vfio_syscall::set_iommu(self, VFIO_TYPE1v2_IOMMU)
            .map_err(VfioError::ContainerSetIommu)?;
        self.check_iommu_info()
    }

    /// Queries IOMMU info and walks its capability chain. The migration
    /// capability is advisory here, but a page-size bitmap that cannot
    /// express the host page size would break every later DMA map, so it
    /// fails the attach instead.
    fn check_iommu_info(&self) -> Result<()> {
        let info = query_with_growable_argsz::<vfio_iommu_type1_info, _, _>(
            |_| {},
            |info| vfio_syscall::get_iommu_info(self, info),
        )
        .map_err(VfioError::IommuGetInfo)?;

        if info[0].flags & VFIO_IOMMU_INFO_CAPS == 0 || info[0].cap_offset == 0 {
            return Ok(());
        }

        // SAFETY: the buffer is argsz bytes of plain kernel data.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                info.as_ptr().cast::<u8>(),
                info.len() * size_of::<vfio_iommu_type1_info>(),
            )
        };
        for (id, offset) in CapabilityIter::new(bytes, info[0].cap_offset as usize) {
            if id == VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION {
                let migration = cap_at::<vfio_iommu_type1_info_cap_migration>(bytes, offset)
                    .ok_or(VfioError::IommuPageSize)?;
                debug!(
                    "vfio: iommu migration cap, pgsize_bitmap 0x{:x}",
                    migration.pgsize_bitmap
                );
                if migration.pgsize_bitmap & host_page_size() == 0 {
                    return Err(VfioError::IommuPageSize);
                }
            }
        }

        Ok(())
    }

    /// Adds an `iova -> user_addr` translation of `size` bytes, readable
    /// and writable by the device.
    pub fn vfio_dma_map(&self, iova: u64, size: u64, user_addr: u64) -> Result<()> {
        let dma_map = vfio_iommu_type1_dma_map {
            argsz: size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: user_addr,
            iova,
            size,
        };

        vfio_syscall::map_dma(self, &dma_map).map_err(VfioError::IommuDmaMap)
    }

    /// Removes the translation previously installed at `iova`.
    pub fn vfio_dma_unmap(&self, iova: u64, size: u64) -> Result<()> {
        let mut dma_unmap = vfio_iommu_type1_dma_unmap {
            argsz: size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            flags: 0,
            iova,
            size,
            ..Default::default()
        };

        vfio_syscall::unmap_dma(self, &mut dma_unmap).map_err(VfioError::IommuDmaUnmap)?;
        if dma_unmap.size != size {
            warn!(
                "vfio: partial dma unmap at iova 0x{:x}: asked 0x{:x}, got 0x{:x}",
                iova, size, dma_unmap.size
            );
        }
        Ok(())
    }
}

impl AsRawFd for VfioContainer {
    fn as_raw_fd(&self) -> RawFd {
        self.container.as_raw_fd()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    pub(crate) fn create_container() -> VfioContainer {
        let temp = TempFile::new().unwrap();
        VfioContainer {
            container: temp.into_file(),
            groups: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn first_group_initializes_the_iommu() {
        let container = create_container();

        let group = container.get_group(1).unwrap();
        assert_eq!(group.id(), 1);
        assert_eq!(container.groups.lock().unwrap().len(), 1);

        // A second lookup reuses the bound group.
        let again = container.get_group(1).unwrap();
        assert_eq!(Arc::strong_count(&group), 3);

        container.put_group(again);
        assert_eq!(container.groups.lock().unwrap().len(), 1);
        container.put_group(group);
        assert_eq!(container.groups.lock().unwrap().len(), 0);
    }

    #[test]
    fn non_viable_group_fails_and_leaves_no_state() {
        let container = create_container();

        let err = container
            .get_group(vfio_syscall::NON_VIABLE_GROUP_ID)
            .unwrap_err();
        assert!(matches!(err, VfioError::GroupViable));
        assert!(container.groups.lock().unwrap().is_empty());
    }

    #[test]
    fn dma_map_and_unmap() {
        let container = create_container();

        container.vfio_dma_map(0x4000_0000, 0x4000_0000, 0x7f00_0000_0000).unwrap();
        container.vfio_dma_unmap(0x4000_0000, 0x4000_0000).unwrap();

        let err = container
            .vfio_dma_map(vfio_syscall::BAD_IOVA, 0x1000, 0x8000)
            .unwrap_err();
        assert!(matches!(err, VfioError::IommuDmaMap(_)));
        let err = container
            .vfio_dma_unmap(vfio_syscall::BAD_IOVA, 0x1000)
            .unwrap_err();
        assert!(matches!(err, VfioError::IommuDmaUnmap(_)));
    }

    #[test]
    fn iommu_info_migration_cap_accepts_host_page_size() {
        let container = create_container();
        // The fake kernel reports a migration capability whose bitmap
        // includes 4K pages; the walk must accept it.
        container.check_iommu_info().unwrap();
    }
}
