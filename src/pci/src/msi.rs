// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

// MSI control masks
const MSI_CTL_ENABLE: u16 = 0x1;
const MSI_CTL_MULTI_MSG_CAPABLE: u16 = 0xe;
const MSI_CTL_MULTI_MSG_ENABLE: u16 = 0x70;
const MSI_CTL_64_BITS: u16 = 0x80;
const MSI_CTL_PER_VECTOR: u16 = 0x100;

// MSI message offsets
const MSI_MSG_CTL_OFFSET: u64 = 0x2;
const MSI_MSG_ADDR_LO_OFFSET: u64 = 0x4;
const MSI_MSG_ADDR_HI_OFFSET: u64 = 0x8;
const MSI_MSG_DATA_OFFSET: u64 = 0xc;

// MSI message masks
const MSI_MSG_ADDR_LO_MASK: u32 = 0xffff_fffc;

/// Number of vectors enabled through the multiple-message-enable field of
/// the control register.
pub fn msi_num_enabled_vectors(msg_ctl: u16) -> usize {
    let field = (msg_ctl >> 4) & 0x7;

    if field > 5 {
        return 0;
    }

    1 << field
}

/// The MSI capability registers of a 64-bit, non-masking function.
///
/// Message Control Register layout:
///   0:     MSI enable.
///   3-1:   Multiple message capable.
///   6-4:   Multiple message enable.
///   7:     64 bits address capable.
///   8:     Per-vector masking capable.
///   15-9:  Reserved.
#[derive(Clone, Copy, Default, Debug)]
pub struct MsiCap {
    pub msg_ctl: u16,
    pub msg_addr_lo: u32,
    pub msg_addr_hi: u32,
    pub msg_data: u16,
}

impl MsiCap {
    pub fn addr_64_bits(&self) -> bool {
        self.msg_ctl & MSI_CTL_64_BITS == MSI_CTL_64_BITS
    }

    pub fn per_vector_mask(&self) -> bool {
        self.msg_ctl & MSI_CTL_PER_VECTOR == MSI_CTL_PER_VECTOR
    }

    pub fn multi_message_capable(&self) -> bool {
        self.msg_ctl & MSI_CTL_MULTI_MSG_CAPABLE != 0
    }

    pub fn enabled(&self) -> bool {
        self.msg_ctl & MSI_CTL_ENABLE == MSI_CTL_ENABLE
    }

    pub fn num_enabled_vectors(&self) -> usize {
        msi_num_enabled_vectors(self.msg_ctl)
    }

    /// Byte length of the capability structure, including the two-byte
    /// header.
    pub fn size(&self) -> u64 {
        if self.addr_64_bits() {
            0xe
        } else {
            0xa
        }
    }

    /// Applies a guest write at `offset` within the capability to the
    /// cached registers, preserving the read-only bits.
    fn update(&mut self, offset: u64, data: &[u8]) {
        match data.len() {
            2 => {
                let value = LittleEndian::read_u16(data);
                match offset {
                    MSI_MSG_CTL_OFFSET => {
                        self.msg_ctl = (self.msg_ctl & !(MSI_CTL_ENABLE | MSI_CTL_MULTI_MSG_ENABLE))
                            | (value & (MSI_CTL_ENABLE | MSI_CTL_MULTI_MSG_ENABLE))
                    }
                    MSI_MSG_DATA_OFFSET => self.msg_data = value,
                    _ => warn!("invalid MSI cap write offset 0x{offset:x}"),
                }
            }
            4 => {
                let value = LittleEndian::read_u32(data);
                match offset {
                    0x0 => {
                        self.msg_ctl = (self.msg_ctl & !(MSI_CTL_ENABLE | MSI_CTL_MULTI_MSG_ENABLE))
                            | ((value >> 16) as u16 & (MSI_CTL_ENABLE | MSI_CTL_MULTI_MSG_ENABLE))
                    }
                    MSI_MSG_ADDR_LO_OFFSET => self.msg_addr_lo = value & MSI_MSG_ADDR_LO_MASK,
                    MSI_MSG_ADDR_HI_OFFSET => self.msg_addr_hi = value,
                    MSI_MSG_DATA_OFFSET => self.msg_data = value as u16,
                    _ => warn!("invalid MSI cap write offset 0x{offset:x}"),
                }
            }
            _ => warn!("invalid MSI cap write length {}", data.len()),
        }
    }
}

/// An MSI capability bound to its location in the configuration space.
#[derive(Debug)]
pub struct MsiConfig {
    pub cap: MsiCap,
    cap_offset: u32,
}

impl MsiConfig {
    pub fn new(msg_ctl: u16, cap_offset: u32) -> Self {
        MsiConfig {
            cap: MsiCap {
                msg_ctl,
                ..Default::default()
            },
            cap_offset,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cap.enabled()
    }

    pub fn size(&self) -> u64 {
        self.cap.size()
    }

    pub fn cap_offset(&self) -> u32 {
        self.cap_offset
    }

    pub fn num_enabled_vectors(&self) -> usize {
        self.cap.num_enabled_vectors()
    }

    /// Whether the byte range `[offset, offset + len)` of the config space
    /// touches this capability.
    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        let cap_start = u64::from(self.cap_offset);
        offset < cap_start + self.size() && offset + len > cap_start
    }

    /// Applies a guest config write, `offset` relative to the start of the
    /// configuration space.
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        let cap_offset = offset - u64::from(self.cap_offset);
        self.cap.update(cap_offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_vector_count() {
        assert_eq!(msi_num_enabled_vectors(0x0000), 1);
        assert_eq!(msi_num_enabled_vectors(0x0010), 2);
        assert_eq!(msi_num_enabled_vectors(0x0050), 32);
        // Reserved encodings enable nothing.
        assert_eq!(msi_num_enabled_vectors(0x0060), 0);
    }

    #[test]
    fn control_word_update_preserves_read_only_bits() {
        let mut config = MsiConfig::new(MSI_CTL_64_BITS, 0x60);
        assert!(!config.enabled());
        assert!(config.cap.addr_64_bits());

        // Setting the enable bit must not clobber the capability bits.
        config.update(0x62, &0x0001u16.to_le_bytes());
        assert!(config.enabled());
        assert!(config.cap.addr_64_bits());

        config.update(0x62, &0x0000u16.to_le_bytes());
        assert!(!config.enabled());
    }

    #[test]
    fn message_registers_update() {
        let mut config = MsiConfig::new(MSI_CTL_64_BITS, 0x60);

        // The low two address bits are reserved and read as zero.
        config.update(0x64, &0xfee0_1007u32.to_le_bytes());
        assert_eq!(config.cap.msg_addr_lo, 0xfee0_1004);
        config.update(0x68, &0x0000_00ffu32.to_le_bytes());
        assert_eq!(config.cap.msg_addr_hi, 0xff);
        config.update(0x6c, &0x00a5u16.to_le_bytes());
        assert_eq!(config.cap.msg_data, 0x00a5);
    }

    #[test]
    fn capability_overlap() {
        let config = MsiConfig::new(MSI_CTL_64_BITS, 0x60);
        assert_eq!(config.size(), 0xe);

        assert!(config.overlaps(0x62, 1));
        assert!(config.overlaps(0x60, 4));
        assert!(config.overlaps(0x5c, 8));
        assert!(config.overlaps(0x6d, 1));
        assert!(!config.overlaps(0x6e, 4));
        assert!(!config.overlaps(0x5c, 4));
    }
}
