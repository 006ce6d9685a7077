// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! PCI device model and the VFIO passthrough device.
//!
//! [`configuration`] carries the emulated Type-0 configuration space used
//! for BAR programming, [`msi`] the MSI capability model, [`device`] the
//! trait the device manager drives, and [`vfio`] the passthrough device
//! binding a host-assigned VFIO device to all of them.

pub mod configuration;
pub mod device;
pub mod msi;
pub mod vfio;

pub use self::configuration::{
    PciBarConfiguration, PciBarPrefetchable, PciBarRegionType, PciCapabilityId, PciClassCode,
    PciConfiguration, PciDisplaySubclass, PciProgrammingInterface, PciSubclass,
};
pub use self::device::{BarReprogrammingParams, PciDevice};
pub use self::msi::{msi_num_enabled_vectors, MsiCap, MsiConfig};
pub use self::vfio::{VfioPciDevice, VfioPciDeviceConfig, VfioPciError};

/// Size of the standard PCI configuration space of one function.
pub const PCI_CONFIGURATION_SPACE_SIZE: usize = 256;
