// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

pub mod vfio;

/// Trait meant for triggering the DMA mapping update related to an external
/// device not managed fully through virtio. The caller resolves guest
/// addresses to host user-space addresses; implementations install or
/// remove the `iova -> user_addr` translation in the IOMMU backend.
pub trait ExternalDmaMapping: Send + Sync {
    /// Map a memory range
    fn map(&self, iova: u64, size: u64, user_addr: u64) -> std::result::Result<(), std::io::Error>;

    /// Unmap a memory range
    fn unmap(&self, iova: u64, size: u64) -> std::result::Result<(), std::io::Error>;
}
