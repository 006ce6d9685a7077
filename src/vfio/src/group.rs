// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use vfio_bindings::bindings::vfio::{vfio_group_status, VFIO_GROUP_FLAGS_VIABLE};

use crate::vfio_syscall;
use crate::{Result, VfioError};

/// A safe wrapper over a VFIO group.
///
/// A group is the smallest set of devices the host IOMMU can isolate from
/// the rest of the system. A group whose member devices are not all bound
/// to VFIO drivers is not viable and cannot be used.
#[derive(Debug)]
pub struct VfioGroup {
    pub(crate) id: u32,
    pub(crate) group: File,
}

impl VfioGroup {
    /// Opens `/dev/vfio/<id>` and verifies the group is viable.
    pub(crate) fn new(id: u32) -> Result<Self> {
        let group = VfioGroup {
            id,
            group: Self::open_group_file(id)?,
        };

        let mut status = vfio_group_status {
            argsz: size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        vfio_syscall::get_group_status(&group, &mut status)
            .map_err(VfioError::GetGroupStatus)?;
        if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(VfioError::GroupViable);
        }

        Ok(group)
    }

    #[cfg(not(test))]
    fn open_group_file(id: u32) -> Result<File> {
        let path = format!("/dev/vfio/{id}");
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| VfioError::OpenGroup(e, path))
    }

    /// Resolves the IOMMU group id of a device from its sysfs path: the
    /// `iommu_group` entry is a symlink whose basename is the decimal id.
    pub fn find_group_id<P: AsRef<Path>>(sysfspath: P) -> Result<u32> {
        let uuid_path = sysfspath.as_ref().join("iommu_group");
        let group_path = uuid_path.read_link().map_err(|_| VfioError::InvalidPath)?;
        group_path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<u32>().ok())
            .ok_or(VfioError::InvalidPath)
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsRawFd for VfioGroup {
    fn as_raw_fd(&self) -> RawFd {
        self.group.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    impl VfioGroup {
        pub(super) fn open_group_file(id: u32) -> Result<File> {
            let temp = TempFile::new().map_err(|e| {
                VfioError::OpenGroup(
                    std::io::Error::from_raw_os_error(e.errno()),
                    id.to_string(),
                )
            })?;
            Ok(temp.into_file())
        }
    }

    #[test]
    fn viable_group_opens() {
        let group = VfioGroup::new(1).unwrap();
        assert_eq!(group.id(), 1);
        assert!(group.as_raw_fd() >= 0);
    }

    #[test]
    fn non_viable_group_is_rejected() {
        let err = VfioGroup::new(crate::vfio_syscall::NON_VIABLE_GROUP_ID).unwrap_err();
        assert!(matches!(err, VfioError::GroupViable));
    }
}
