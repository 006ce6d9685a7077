// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Interfaces between device models and the rest of the VMM: interrupt
//! delivery, external DMA mapping, memory-topology subscription and
//! guest I/O resource registration.

use std::io;

use serde::{Deserialize, Serialize};

pub mod dma_mapping;
pub mod interrupt;
pub mod memory;

/// A guest-visible resource a device publishes while it is active.
///
/// `Ram` resources are host-memory windows the guest accesses directly;
/// `Pio` and `Mmio` windows trap into the device's read/write handlers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoResource {
    /// IO port address range.
    Pio { base: u16, size: u16 },
    /// Memory mapped IO address range, trap-dispatched.
    Mmio { base: u64, size: u64 },
    /// Host memory mapped into the guest at `base`.
    Ram { base: u64, size: u64, host_addr: u64 },
}

impl IoResource {
    /// The guest base address of the resource.
    pub fn base(&self) -> u64 {
        match self {
            IoResource::Pio { base, .. } => u64::from(*base),
            IoResource::Mmio { base, .. } => *base,
            IoResource::Ram { base, .. } => *base,
        }
    }
}

/// Registration surface the enclosing device manager exposes to devices.
///
/// Implementations route `Mmio`/`Pio` windows to the dispatch buses and
/// `Ram` windows to the hypervisor's guest memory tables. Devices must
/// remove exactly what they added, in insertion order.
pub trait IoResourceRegistry: Send + Sync {
    /// Publishes a resource into the guest address space.
    fn add_resource(&self, resource: &IoResource) -> io::Result<()>;

    /// Removes a previously published resource.
    fn remove_resource(&self, resource: &IoResource) -> io::Result<()>;
}
