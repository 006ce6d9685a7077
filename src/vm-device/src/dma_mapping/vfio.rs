// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io;
use std::sync::Arc;

use vfio::VfioContainer;

use crate::dma_mapping::ExternalDmaMapping;

/// This structure implements the ExternalDmaMapping trait. It is meant to
/// be used when the caller tries to provide a way to update the mappings
/// associated with a specific VFIO container.
pub struct VfioDmaMapping {
    container: Arc<VfioContainer>,
}

impl VfioDmaMapping {
    /// Create a DmaMapping object.
    ///
    /// # Parameters
    /// * `container`: VFIO container object.
    pub fn new(container: Arc<VfioContainer>) -> Self {
        VfioDmaMapping { container }
    }
}

impl ExternalDmaMapping for VfioDmaMapping {
    fn map(&self, iova: u64, size: u64, user_addr: u64) -> std::result::Result<(), io::Error> {
        self.container
            .vfio_dma_map(iova, size, user_addr)
            .map_err(|e| {
                io::Error::other(format!(
                    "failed to map memory for VFIO container, \
                     iova 0x{iova:x}, user_addr 0x{user_addr:x}, size 0x{size:x}: {e}"
                ))
            })
    }

    fn unmap(&self, iova: u64, size: u64) -> std::result::Result<(), io::Error> {
        self.container.vfio_dma_unmap(iova, size).map_err(|e| {
            io::Error::other(format!(
                "failed to unmap memory for VFIO container, \
                 iova 0x{iova:x}, size 0x{size:x}: {e}"
            ))
        })
    }
}
