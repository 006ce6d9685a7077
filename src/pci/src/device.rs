// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::any::Any;
use std::io;

use crate::configuration::PciBarRegionType;

#[derive(Clone, Copy, Debug)]
pub struct BarReprogrammingParams {
    pub old_base: u64,
    pub new_base: u64,
    pub len: u64,
    pub region_type: PciBarRegionType,
}

/// Operations the device manager drives on a PCI device.
///
/// Configuration accesses arrive at register granularity: the bus model
/// splits byte-level guest accesses into `(reg_idx, offset, data)` tuples.
/// BAR accesses arrive as `(base, offset)` pairs where `base` is the guest
/// address the BAR window was published at.
pub trait PciDevice: Send {
    /// Attaches the device to its host backend and brings it to a state
    /// where the guest can enumerate it.
    fn connect(&mut self) -> io::Result<()>;

    /// Tears the device down, releasing every host resource acquired by
    /// `connect`. The caller must stop delivering events to the device
    /// before disconnecting it.
    fn disconnect(&mut self);

    /// Resets the device to its power-on state.
    fn reset(&mut self) -> io::Result<()>;

    /// Sets a register in the configuration space.
    /// * `reg_idx` - The index of the config register to modify.
    /// * `offset` - Offset into the register.
    fn write_config_register(&mut self, reg_idx: usize, offset: u64, data: &[u8]);

    /// Gets a register from the configuration space.
    /// * `reg_idx` - The index of the config register to read.
    fn read_config_register(&mut self, reg_idx: usize) -> u32;

    /// Detects if a BAR is being reprogrammed.
    fn detect_bar_reprogramming(
        &mut self,
        _reg_idx: usize,
        _data: &[u8],
    ) -> Option<BarReprogrammingParams> {
        None
    }

    /// Reads from a BAR region mapped into the device.
    /// * `base` - The guest address of the BAR window.
    /// * `offset` - Offset into the window.
    /// * `data` - Filled with the data from `base + offset`.
    fn read_bar(&mut self, _base: u64, _offset: u64, _data: &mut [u8]) {}

    /// Writes to a BAR region mapped into the device.
    /// * `base` - The guest address of the BAR window.
    /// * `offset` - Offset into the window.
    /// * `data` - The data to write.
    fn write_bar(&mut self, _base: u64, _offset: u64, _data: &[u8]) {}

    /// Publishes the guest resources backing BAR `bar_index`.
    fn activate_bar(&mut self, _bar_index: usize) -> io::Result<()> {
        Ok(())
    }

    /// Removes the guest resources backing BAR `bar_index`.
    fn deactivate_bar(&mut self, _bar_index: usize) -> io::Result<()> {
        Ok(())
    }

    /// Provides a mutable reference to the Any trait. This is useful to let
    /// the caller have access to the underlying type behind the trait.
    fn as_any(&mut self) -> &mut dyn Any;

    /// Optionally returns a unique identifier.
    fn id(&self) -> Option<String>;
}
