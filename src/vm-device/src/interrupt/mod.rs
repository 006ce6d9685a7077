// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright (C) 2019 Alibaba Cloud. All rights reserved.
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Traits to manage interrupt sources for devices.
//!
//! A device may drive one or more interrupt sources of the same type (a
//! single legacy pin, a block of MSI vectors). Each set is managed through
//! an [`InterruptSourceGroup`] handed to the device by the VMM's interrupt
//! controller; the device only knows vector indexes relative to the group.

use vmm_sys_util::eventfd::EventFd;

/// Reuse std::io::Result to simplify interoperability among crates.
pub type Result<T> = std::io::Result<T>;

/// Data type to store an interrupt source identifier.
pub type InterruptIndex = u32;

/// Configuration data for MSI interrupts.
///
/// On x86 platforms, these interrupts are vectors delivered directly to the
/// LAPIC through a memory write.
#[derive(Copy, Clone, Debug, Default)]
pub struct MsiIrqSourceConfig {
    /// High address to deliver the message signaled interrupt.
    pub high_addr: u32,
    /// Low address to deliver the message signaled interrupt.
    pub low_addr: u32,
    /// Data to write to deliver the message signaled interrupt.
    pub data: u32,
}

/// Configuration data for an interrupt source.
#[derive(Copy, Clone, Debug)]
pub enum InterruptSourceConfig {
    /// Configuration data for MSI interrupts.
    MsiIrq(MsiIrqSourceConfig),
}

/// A set of interrupt sources of the same type, owned by the interrupt
/// controller and driven by one device.
pub trait InterruptSourceGroup: Send + Sync {
    /// Inject an interrupt from this interrupt source into the guest.
    fn trigger(&self, index: InterruptIndex) -> Result<()>;

    /// Returns an interrupt notifier from this interrupt.
    ///
    /// An interrupt notifier allows for external components and processes
    /// to inject interrupts into a guest by writing to the file returned
    /// by this method.
    fn notifier(&self, index: InterruptIndex) -> Option<&EventFd>;

    /// Update the message address and payload for one interrupt source.
    fn update(&self, index: InterruptIndex, config: InterruptSourceConfig) -> Result<()>;

    /// Number of interrupt sources in the group.
    fn len(&self) -> InterruptIndex;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
