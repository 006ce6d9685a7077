// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Safe wrappers over the VFIO kernel uAPI.
//!
//! VFIO exposes host PCI devices (physical or mediated) to userspace with
//! IOMMU-enforced isolation. The kernel objects come in three layers, and
//! so do the wrappers here:
//!
//! * [`VfioContainer`] owns an IOMMU address space shared by one or more
//!   groups and carries the DMA map/unmap interface.
//! * [`VfioGroup`] is the smallest set of devices the hardware can isolate;
//!   it is resolved from the device's sysfs path and bound to a container.
//! * [`VfioDevice`] is a single device descriptor with its region table and
//!   interrupt capabilities.
//!
//! All ioctls funnel through the `vfio_syscall` module so the attach paths
//! can be exercised in unit tests against a faked kernel.

use std::mem::size_of;

use vfio_bindings::bindings::vfio::vfio_info_cap_header;
use vmm_sys_util::errno::Error as SysError;

mod container;
mod device;
mod fam;
mod group;
mod vfio_ioctls;
mod vfio_syscall;

pub use crate::container::VfioContainer;
pub use crate::device::{
    VfioDevice, VfioGfxPlaneInfo, VfioIrq, VfioRegion, VfioRegionInfoCap,
    VfioRegionInfoCapSparseMmap, VfioRegionInfoCapType, VfioRegionSparseMmapArea,
};
pub use crate::fam::vec_with_array_field;
pub use crate::group::VfioGroup;

/// Errors raised while driving the VFIO kernel interface.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VfioError {
    /// failed to open /dev/vfio/vfio container: {0}
    OpenContainer(#[source] std::io::Error),
    /// kernel VFIO API version doesn't match the compiled VFIO_API_VERSION
    VfioApiVersion,
    /// container doesn't support the Type1v2 IOMMU driver
    VfioType1V2,
    /// failed to set the container IOMMU driver: {0}
    ContainerSetIommu(#[source] SysError),
    /// failed to query IOMMU info: {0}
    IommuGetInfo(#[source] SysError),
    /// IOMMU page-size bitmap doesn't cover the host page size
    IommuPageSize,
    /// failed to map guest memory for DMA: {0}
    IommuDmaMap(#[source] SysError),
    /// failed to unmap guest memory from DMA: {0}
    IommuDmaUnmap(#[source] SysError),
    /// failed to open the VFIO group {1}: {0}
    OpenGroup(#[source] std::io::Error, String),
    /// failed to query the VFIO group status: {0}
    GetGroupStatus(#[source] SysError),
    /// the VFIO group is not viable
    GroupViable,
    /// failed to bind the VFIO group to the container: {0}
    GroupSetContainer(#[source] SysError),
    /// invalid sysfs path for a VFIO device
    InvalidPath,
    /// failed to get a device descriptor from the VFIO group: {0}
    GroupGetDeviceFd(#[source] SysError),
    /// failed to query VFIO device info: {0}
    VfioDeviceGetInfo(#[source] SysError),
    /// device is not a resettable VFIO PCI device
    VfioDeviceNotPci,
    /// failed to query VFIO region info: {0}
    VfioDeviceGetRegionInfo(#[source] SysError),
    /// invalid VFIO irq index {0}
    VfioDeviceInvalidIrq(u32),
    /// failed to program VFIO device irqs: {0}
    VfioDeviceSetIrqs(#[source] SysError),
    /// failed to reset the VFIO device: {0}
    VfioDeviceReset(#[source] SysError),
    /// the VFIO device does not expose a graphics plane
    VfioDeviceNoGfxPlane,
}

pub type Result<T> = std::result::Result<T, VfioError>;

/// Iterator over a VFIO info capability chain.
///
/// Every capability starts with a `vfio_info_cap_header` carrying the id and
/// the byte offset of the next capability, zero-terminated. The iterator
/// yields `(id, offset)` pairs; callers extract the concrete capability
/// structure at `offset` themselves.
pub(crate) struct CapabilityIter<'a> {
    bytes: &'a [u8],
    next: usize,
}

impl<'a> CapabilityIter<'a> {
    pub(crate) fn new(bytes: &'a [u8], cap_offset: usize) -> Self {
        CapabilityIter {
            bytes,
            next: cap_offset,
        }
    }
}

impl Iterator for CapabilityIter<'_> {
    type Item = (u16, usize);

    fn next(&mut self) -> Option<(u16, usize)> {
        let offset = self.next;
        if offset == 0 {
            return None;
        }
        let header = cap_at::<vfio_info_cap_header>(self.bytes, offset)?;
        self.next = header.next as usize;
        Some((header.id, offset))
    }
}

/// Reads a capability structure out of an info buffer returned by the
/// kernel. Returns `None` when the buffer is too short, which terminates
/// the capability walk instead of reading past the allocation.
pub(crate) fn cap_at<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    if offset.checked_add(size_of::<T>())? > bytes.len() {
        return None;
    }
    // SAFETY: the range [offset, offset + size_of::<T>()) is within `bytes`
    // and T is a plain kernel struct valid for any bit pattern.
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset).cast::<T>()) })
}

pub(crate) fn host_page_size() -> u64 {
    // SAFETY: trivially safe libc call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

#[cfg(test)]
mod tests {
    use vfio_bindings::bindings::vfio::vfio_info_cap_header;

    use super::*;

    #[test]
    fn capability_iter_walks_chain() {
        let mut bytes = vec![0u8; 64];
        let first = vfio_info_cap_header {
            id: 1,
            version: 1,
            next: 32,
        };
        let second = vfio_info_cap_header {
            id: 3,
            version: 1,
            next: 0,
        };
        // SAFETY: the buffer is large enough for both headers.
        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(16).cast(), first);
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(32).cast(), second);
        }

        let caps: Vec<(u16, usize)> = CapabilityIter::new(&bytes, 16).collect();
        assert_eq!(caps, vec![(1, 16), (3, 32)]);
    }

    #[test]
    fn capability_iter_stops_on_truncated_buffer() {
        let mut bytes = vec![0u8; 24];
        let header = vfio_info_cap_header {
            id: 1,
            version: 1,
            next: 1024,
        };
        // SAFETY: the buffer is large enough for one header.
        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(16).cast(), header);
        }

        let caps: Vec<(u16, usize)> = CapabilityIter::new(&bytes, 16).collect();
        assert_eq!(caps, vec![(1, 16)]);
    }
}
