// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! VFIO PCI passthrough device.
//!
//! Binds a host-assigned PCI device (physical or mediated) to the guest:
//! the configuration space is proxied with a few fields rewritten, BARs are
//! mmap'd into guest memory where the kernel allows it and trap-dispatched
//! everywhere else, guest RAM is mirrored into the host IOMMU so device DMA
//! stays coherent, and MSI interrupts travel from the kernel to the guest
//! interrupt controller over an eventfd.

use std::any::Any;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::prelude::FileExt;
use std::path::PathBuf;
use std::ptr::null_mut;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use event_manager::{EventOps, Events, MutEventSubscriber};
use log::{debug, error, info, warn};
use serde::Deserialize;
use vfio_bindings::bindings::vfio::{
    VFIO_IRQ_INFO_EVENTFD, VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_MSI_IRQ_INDEX,
    VFIO_PCI_ROM_REGION_INDEX, VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ,
    VFIO_REGION_INFO_FLAG_WRITE,
};
use vm_device::dma_mapping::vfio::VfioDmaMapping;
use vm_device::dma_mapping::ExternalDmaMapping;
use vm_device::interrupt::{
    InterruptIndex, InterruptSourceConfig, InterruptSourceGroup, MsiIrqSourceConfig,
};
use vm_device::memory::{MemoryListener, MemoryManager, MemorySlot, MemorySlotKind, SubscriptionId};
use vm_device::{IoResource, IoResourceRegistry};
use vm_memory::{Address, GuestAddress, GuestUsize};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

use crate::configuration::{COMMAND_IO_SPACE, COMMAND_MEMORY_SPACE};
use crate::msi::MsiConfig;
use crate::{
    configuration, PciBarConfiguration, PciBarPrefetchable, PciBarRegionType, PciCapabilityId,
    PciClassCode, PciConfiguration, PciDevice, PciDisplaySubclass, PCI_CONFIGURATION_SPACE_SIZE,
};

use ::vfio::{
    VfioContainer, VfioDevice, VfioGfxPlaneInfo, VfioRegionInfoCap, VfioRegionSparseMmapArea,
};

// Command register index in the PCI config space.
const COMMAND_REG_INDEX: usize = 1;
// PCI Header Type register index.
const PCI_HEADER_TYPE_REG_INDEX: usize = 3;
// First BAR register index.
const PCI_CONFIG_BAR0_INDEX: usize = 4;
// Number of BARs for a PCI device.
const BAR_NUMS: usize = 6;
// Revision ID offset in the PCI config space.
const PCI_REVISION_ID_OFFSET: usize = 0x08;
// Class code bytes (prog-if, subclass, class) in the PCI config space.
const PCI_CLASS_CODE_OFFSET: usize = 0x09;
// Header Type offset in the PCI config space.
const PCI_HEADER_TYPE_OFFSET: usize = 0x0e;
// First BAR offset in the PCI config space.
const PCI_CONFIG_BAR_OFFSET: usize = 0x10;
// Status register offset in the PCI config space.
const PCI_STATUS_OFFSET: usize = 0x06;
// Subsystem identifiers in the PCI config space.
const PCI_SUBSYSTEM_VENDOR_ID_OFFSET: usize = 0x2c;
const PCI_SUBSYSTEM_ID_OFFSET: usize = 0x2e;
// Capability list head offset in the PCI config space.
const PCI_CONFIG_CAPABILITY_OFFSET: usize = 0x34;
// Interrupt pin offset in the PCI config space.
const PCI_INTERRUPT_PIN_OFFSET: usize = 0x3d;
// Capability list present bit of the status register.
const PCI_STATUS_CAP_LIST: u16 = 0x10;
// Multi-function bit of the Header Type register.
const PCI_HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;
// IO BAR when first BAR bit is 1.
const PCI_CONFIG_IO_BAR: u32 = 0x1;
// 64-bit memory bar flag.
const PCI_CONFIG_MEMORY_BAR_64BIT: u32 = 0x4;
// Prefetchable memory bar flag.
const PCI_CONFIG_BAR_PREFETCHABLE: u32 = 0x8;
// The advertised class code: a display controller without VGA compatibility.
const PCI_CLASS_CODE_3D_CONTROLLER: [u8; 3] = [0x00, 0x02, 0x03];

/// Declaration of one passthrough device, as it appears in the VM
/// configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VfioPciDeviceConfig {
    /// Absolute sysfs path of the host device, e.g.
    /// `/sys/bus/mdev/devices/<uuid>`.
    pub sysfs: PathBuf,
    /// Log every DMA, interrupt and region event.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VfioPciError {
    /// VFIO backend error: {0}
    Vfio(#[from] ::vfio::VfioError),
    /// failed to access the device config space: {0}
    ConfigSpaceAccess(#[source] io::Error),
    /// device reports a non-normal PCI header type {0:#x}
    UnsupportedHeaderType(u8),
    /// device config space has no MSI capability
    MissingMsiCapability,
    /// MSI-X devices are not supported
    MsixNotSupported,
    /// only 64-bit MSI without per-vector masking is supported
    UnsupportedMsiLayout,
    /// multi-vector MSI is not supported
    UnsupportedMsiVectorCount,
    /// device does not expose an eventfd-capable MSI interrupt
    MsiIrqUnavailable,
    /// failed to create an MSI eventfd: {0}
    EventFd(#[source] io::Error),
    /// failed to register BAR {0} with the PCI configuration: {1}
    CreateBar(usize, #[source] configuration::Error),
    /// failed to mmap a BAR region: {0}
    MmapBar(#[source] io::Error),
    /// failed to publish a guest I/O resource: {0}
    AddIoResource(#[source] io::Error),
    /// failed to seed the IOMMU with guest memory: {0}
    DmaMap(#[source] io::Error),
    /// device is not connected
    NotConnected,
}
type Result<T> = std::result::Result<T, VfioPciError>;

enum InterruptUpdateAction {
    EnableMsi,
    DisableMsi,
}

struct MsiVector {
    event_fd: EventFd,
}

/// MSI routing state: the capability cache, one eventfd per vector and
/// whether those eventfds are currently bound as VFIO triggers.
struct VfioMsi {
    cfg: MsiConfig,
    vectors: Vec<MsiVector>,
    vfio_bound: bool,
}

impl VfioMsi {
    fn update(&mut self, offset: u64, data: &[u8]) -> Option<InterruptUpdateAction> {
        let old_enabled = self.cfg.enabled();

        self.cfg.update(offset, data);

        let new_enabled = self.cfg.enabled();

        if !old_enabled && new_enabled {
            return Some(InterruptUpdateAction::EnableMsi);
        }

        if old_enabled && !new_enabled {
            return Some(InterruptUpdateAction::DisableMsi);
        }

        None
    }

    /// Forwards one interrupt from the host to the guest. The counter is
    /// drained with exactly one read; a second read could block another
    /// edge-triggered wakeup.
    fn service_vector(&self, vector: InterruptIndex, intr_group: &Arc<dyn InterruptSourceGroup>) {
        let Some(msi_vector) = self.vectors.get(vector as usize) else {
            warn!("vfio-pci: event for unknown MSI vector {vector}");
            return;
        };

        match msi_vector.event_fd.read() {
            Ok(_) => {
                if let Err(e) = intr_group.trigger(vector) {
                    error!("vfio-pci: failed to signal MSI vector {vector}: {e}");
                }
            }
            Err(e) => warn!("vfio-pci: spurious wakeup on MSI vector {vector}: {e}"),
        }
    }
}

/// An mmap'd window of a device region. Unmapped on drop so deactivation
/// and teardown cannot leak device mappings.
#[derive(Debug)]
struct MappedRegion {
    host_addr: u64,
    size: usize,
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: this exact range was returned by mmap.
        let ret = unsafe { libc::munmap(self.host_addr as *mut libc::c_void, self.size) };
        if ret != 0 {
            error!(
                "vfio-pci: failed to munmap BAR window: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Guest-side state of one BAR.
struct MmioRegion {
    start: GuestAddress,
    length: GuestUsize,
    type_: PciBarRegionType,
    index: u32,
    active: bool,
    resources: Vec<IoResource>,
    mappings: Vec<MappedRegion>,
}

/// Keeps the IOMMU translations equal to the set of guest RAM slots.
///
/// Map failures propagate to the memory manager, which owns the abort
/// policy; unmap failures are swallowed because the range is gone from the
/// guest either way.
struct DmaMirror {
    mapping: Arc<dyn ExternalDmaMapping>,
    debug: bool,
}

impl MemoryListener for DmaMirror {
    fn update(&self, slot: &MemorySlot, unmap: bool) -> io::Result<()> {
        if slot.kind != MemorySlotKind::Ram {
            return Ok(());
        }

        if unmap {
            if self.debug {
                debug!("vfio-pci: unmap dma 0x{:x}-0x{:x}", slot.base, slot.end());
            }
            if let Err(e) = self.mapping.unmap(slot.base, slot.size) {
                warn!(
                    "vfio-pci: failed to unmap dma 0x{:x}-0x{:x}: {e}",
                    slot.base,
                    slot.end()
                );
            }
            return Ok(());
        }

        if self.debug {
            debug!("vfio-pci: map dma 0x{:x}-0x{:x}", slot.base, slot.end());
        }
        self.mapping.map(slot.base, slot.size, slot.host_addr)
    }
}

/// Clears the fields of a raw config header the guest must not see as the
/// device reports them: no legacy interrupt pin, no multi-function bit,
/// and the display-controller class code this VMM advertises.
fn sanitize_header(header: &mut [u8; PCI_CONFIGURATION_SPACE_SIZE]) -> Result<()> {
    header[PCI_INTERRUPT_PIN_OFFSET] = 0;
    header[PCI_HEADER_TYPE_OFFSET] &= !PCI_HEADER_TYPE_MULTI_FUNCTION;
    if header[PCI_HEADER_TYPE_OFFSET] != 0 {
        return Err(VfioPciError::UnsupportedHeaderType(
            header[PCI_HEADER_TYPE_OFFSET],
        ));
    }
    header[PCI_CLASS_CODE_OFFSET..PCI_CLASS_CODE_OFFSET + 3]
        .copy_from_slice(&PCI_CLASS_CODE_3D_CONTROLLER);
    Ok(())
}

/// Walks the capability list of a sanitized config header and returns the
/// MSI capability. The device must carry 64-bit MSI without per-vector
/// masking and with a single message; MSI-X devices are rejected.
fn parse_capabilities(header: &[u8; PCI_CONFIGURATION_SPACE_SIZE]) -> Result<MsiConfig> {
    let mut msi = None;

    let status = LittleEndian::read_u16(&header[PCI_STATUS_OFFSET..PCI_STATUS_OFFSET + 2]);
    if status & PCI_STATUS_CAP_LIST != 0 {
        let mut cap_next = usize::from(header[PCI_CONFIG_CAPABILITY_OFFSET]) & !0x3;
        // A malformed list could loop; the chain cannot hold more
        // capabilities than dwords in the config space.
        let mut ttl = PCI_CONFIGURATION_SPACE_SIZE / 4;
        while cap_next != 0 && ttl > 0 {
            ttl -= 1;
            if cap_next + 3 >= PCI_CONFIGURATION_SPACE_SIZE {
                warn!("vfio-pci: capability pointer 0x{cap_next:x} out of range");
                break;
            }
            let cap_id = header[cap_next];
            match PciCapabilityId::from(cap_id) {
                PciCapabilityId::MessageSignalledInterrupts => {
                    let msg_ctl =
                        LittleEndian::read_u16(&header[cap_next + 2..cap_next + 4]);
                    let cfg = MsiConfig::new(msg_ctl, cap_next as u32);
                    if !cfg.cap.addr_64_bits() || cfg.cap.per_vector_mask() {
                        return Err(VfioPciError::UnsupportedMsiLayout);
                    }
                    if cfg.cap.multi_message_capable() {
                        return Err(VfioPciError::UnsupportedMsiVectorCount);
                    }
                    msi = Some(cfg);
                }
                PciCapabilityId::MsiX => return Err(VfioPciError::MsixNotSupported),
                PciCapabilityId::VendorSpecific => {}
                other => {
                    debug!("vfio-pci: skipping capability {other:?} (0x{cap_id:x})");
                }
            }
            cap_next = usize::from(header[cap_next + 1]) & !0x3;
        }
    }

    msi.ok_or(VfioPciError::MissingMsiCapability)
}

fn mmap_region(file: &File, offset: u64, size: u64, prot: i32) -> io::Result<u64> {
    // SAFETY: mapping a device-owned window; the kernel validates the
    // offset and length against the region layout.
    let host_addr = unsafe {
        libc::mmap(
            null_mut(),
            size as usize,
            prot,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            offset as libc::off_t,
        )
    };
    if host_addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(host_addr as u64)
}

/// Maps a BAR's region into host memory and publishes the result to the
/// guest.
///
/// With no sparse areas the whole region becomes one guest RAM window.
/// With sparse areas the full BAR span is published as a trap MMIO window
/// and each area is overlaid as guest RAM, so the gaps keep trapping while
/// the hot windows run at native speed. On failure everything published or
/// mapped so far is rolled back.
fn map_bar_region(
    file: &File,
    region_offset: u64,
    region_flags: u32,
    areas: &[VfioRegionSparseMmapArea],
    bar_base: u64,
    bar_size: u64,
    registry: &dyn IoResourceRegistry,
) -> Result<(Vec<IoResource>, Vec<MappedRegion>)> {
    let mut prot = 0;
    if region_flags & VFIO_REGION_INFO_FLAG_READ != 0 {
        prot |= libc::PROT_READ;
    }
    if region_flags & VFIO_REGION_INFO_FLAG_WRITE != 0 {
        prot |= libc::PROT_WRITE;
    }

    let mut published: Vec<IoResource> = Vec::new();
    let mut mappings: Vec<MappedRegion> = Vec::new();

    let result = map_bar_region_inner(
        file,
        region_offset,
        prot,
        areas,
        bar_base,
        bar_size,
        registry,
        &mut published,
        &mut mappings,
    );

    if let Err(e) = result {
        for resource in &published {
            if let Err(e) = registry.remove_resource(resource) {
                warn!("vfio-pci: failed to roll back a BAR resource: {e}");
            }
        }
        return Err(e);
    }

    Ok((published, mappings))
}

#[allow(clippy::too_many_arguments)]
fn map_bar_region_inner(
    file: &File,
    region_offset: u64,
    prot: i32,
    areas: &[VfioRegionSparseMmapArea],
    bar_base: u64,
    bar_size: u64,
    registry: &dyn IoResourceRegistry,
    published: &mut Vec<IoResource>,
    mappings: &mut Vec<MappedRegion>,
) -> Result<()> {
    let mut publish = |resource: IoResource, published: &mut Vec<IoResource>| -> Result<()> {
        registry
            .add_resource(&resource)
            .map_err(VfioPciError::AddIoResource)?;
        published.push(resource);
        Ok(())
    };

    if areas.is_empty() {
        let host_addr =
            mmap_region(file, region_offset, bar_size, prot).map_err(VfioPciError::MmapBar)?;
        mappings.push(MappedRegion {
            host_addr,
            size: bar_size as usize,
        });
        publish(
            IoResource::Ram {
                base: bar_base,
                size: bar_size,
                host_addr,
            },
            published,
        )?;
    } else {
        publish(
            IoResource::Mmio {
                base: bar_base,
                size: bar_size,
            },
            published,
        )?;
        for area in areas {
            let host_addr = mmap_region(file, region_offset + area.offset, area.size, prot)
                .map_err(VfioPciError::MmapBar)?;
            mappings.push(MappedRegion {
                host_addr,
                size: area.size as usize,
            });
            publish(
                IoResource::Ram {
                    base: bar_base + area.offset,
                    size: area.size,
                    host_addr,
                },
                published,
            )?;
        }
    }

    Ok(())
}

/// A VFIO PCI device bound into the guest.
///
/// The device is constructed inert; [`VfioPciDevice::connect`] attaches it
/// to the host and [`VfioPciDevice::disconnect`] releases every host
/// resource again. While connected the VMM must run the device on its
/// event loop (it is a [`MutEventSubscriber`]) and must remove it from the
/// loop before disconnecting.
pub struct VfioPciDevice {
    config: VfioPciDeviceConfig,
    registry: Arc<dyn IoResourceRegistry>,
    memory_manager: Arc<dyn MemoryManager>,
    intr_group: Arc<dyn InterruptSourceGroup>,

    configuration: PciConfiguration,
    container: Option<Arc<VfioContainer>>,
    device: Option<Arc<VfioDevice>>,
    interrupt: Option<VfioMsi>,
    mmio_regions: Vec<MmioRegion>,
    dma_subscription: Option<SubscriptionId>,
    gfx_plane: Option<VfioGfxPlaneInfo>,
}

impl std::fmt::Debug for VfioPciDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioPciDevice")
            .field("sysfs", &self.config.sysfs)
            .field("connected", &self.device.is_some())
            .finish()
    }
}

impl VfioPciDevice {
    /// Creates an inert passthrough device from its declaration and the
    /// collaborator handles it needs at runtime.
    pub fn new(
        config: VfioPciDeviceConfig,
        registry: Arc<dyn IoResourceRegistry>,
        memory_manager: Arc<dyn MemoryManager>,
        intr_group: Arc<dyn InterruptSourceGroup>,
    ) -> Self {
        VfioPciDevice {
            config,
            registry,
            memory_manager,
            intr_group,
            configuration: Self::placeholder_configuration(),
            container: None,
            device: None,
            interrupt: None,
            mmio_regions: Vec::new(),
            dma_subscription: None,
            gfx_plane: None,
        }
    }

    fn placeholder_configuration() -> PciConfiguration {
        PciConfiguration::new(
            0,
            0,
            0,
            PciClassCode::DisplayController,
            &PciDisplaySubclass::ThreeDController,
            None,
            0,
            0,
        )
    }

    /// Attaches the device: opens the VFIO container and device, builds the
    /// guest-visible configuration, arms the MSI router and seeds the DMA
    /// mirror. Any failure unwinds in reverse by dropping the partially
    /// built state.
    pub fn connect(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let container = Arc::new(VfioContainer::new()?);
        let device = Arc::new(VfioDevice::new(&self.config.sysfs, Arc::clone(&container))?);

        let mut header = Self::read_config_space(&device)?;
        sanitize_header(&mut header)?;
        let msi_cfg = parse_capabilities(&header)?;
        let (configuration, mmio_regions) = Self::build_bar_model(&mut header, &device)?;
        // Commit the sanitized header back so the device and the guest
        // agree on irq_pin, header type and class code.
        Self::write_config_space(&device, &header)?;

        let interrupt = Self::setup_interrupts(&device, msi_cfg)?;

        let gfx_plane = device.query_gfx_plane().ok();
        if let Some(plane) = &gfx_plane {
            info!(
                "vfio-pci {}: display plane {}x{} stride {}",
                self.config.sysfs.display(),
                plane.width,
                plane.height,
                plane.stride
            );
        }

        let mirror = Arc::new(DmaMirror {
            mapping: Arc::new(VfioDmaMapping::new(Arc::clone(&container))),
            debug: self.config.debug,
        });
        for slot in self.memory_manager.flat_view() {
            mirror.update(&slot, false).map_err(VfioPciError::DmaMap)?;
        }
        let subscription = self
            .memory_manager
            .register_listener(Arc::clone(&mirror) as Arc<dyn MemoryListener>);

        self.configuration = configuration;
        self.mmio_regions = mmio_regions;
        self.interrupt = Some(interrupt);
        self.dma_subscription = Some(subscription);
        self.gfx_plane = gfx_plane;
        self.container = Some(container);
        self.device = Some(device);

        Ok(())
    }

    /// Detaches the device, reversing `connect`: the memory listener goes
    /// first, then the MSI routing and eventfds, then the descriptors.
    pub fn disconnect(&mut self) {
        if let Some(id) = self.dma_subscription.take() {
            self.memory_manager.unregister_listener(id);
        }

        for bar_index in 0..BAR_NUMS {
            let _ = self.deactivate_bar(bar_index);
        }

        if let (Some(device), Some(msi)) = (self.device.as_ref(), self.interrupt.as_mut()) {
            if msi.vfio_bound {
                if let Err(e) = device.disable_msi() {
                    warn!("vfio-pci: failed to unbind MSI at disconnect: {e}");
                }
                msi.vfio_bound = false;
            }
        }
        self.interrupt = None;

        self.mmio_regions.clear();
        self.device = None;
        self.container = None;
    }

    /// Resets the host device and the guest-visible PCI state. The MSI
    /// routing stays armed; the guest disables it explicitly if it wants
    /// it gone.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(device) = &self.device {
            device.reset()?;
        }
        for bar_index in 0..BAR_NUMS {
            let _ = self.deactivate_bar(bar_index);
        }
        Ok(())
    }

    /// The graphics plane the device reported at attach, if any.
    pub fn gfx_plane(&self) -> Option<&VfioGfxPlaneInfo> {
        self.gfx_plane.as_ref()
    }

    fn read_config_space(device: &VfioDevice) -> Result<[u8; PCI_CONFIGURATION_SPACE_SIZE]> {
        let mut header = [0u8; PCI_CONFIGURATION_SPACE_SIZE];
        let offset = device.get_region_offset(VFIO_PCI_CONFIG_REGION_INDEX);
        device
            .device_file()
            .read_exact_at(&mut header, offset)
            .map_err(VfioPciError::ConfigSpaceAccess)?;
        Ok(header)
    }

    fn write_config_space(
        device: &VfioDevice,
        header: &[u8; PCI_CONFIGURATION_SPACE_SIZE],
    ) -> Result<()> {
        let offset = device.get_region_offset(VFIO_PCI_CONFIG_REGION_INDEX);
        device
            .device_file()
            .write_all_at(header, offset)
            .map_err(VfioPciError::ConfigSpaceAccess)
    }

    /// Registers one emulated BAR per populated BAR region, at the address
    /// the device currently reports. 64-bit memory BARs are demoted to
    /// 32-bit in the header handed to the guest.
    fn build_bar_model(
        header: &mut [u8; PCI_CONFIGURATION_SPACE_SIZE],
        device: &VfioDevice,
    ) -> Result<(PciConfiguration, Vec<MmioRegion>)> {
        let vendor_id = LittleEndian::read_u16(&header[0..2]);
        let device_id = LittleEndian::read_u16(&header[2..4]);
        let revision_id = header[PCI_REVISION_ID_OFFSET];
        let subsystem_vendor_id = LittleEndian::read_u16(
            &header[PCI_SUBSYSTEM_VENDOR_ID_OFFSET..PCI_SUBSYSTEM_VENDOR_ID_OFFSET + 2],
        );
        let subsystem_id =
            LittleEndian::read_u16(&header[PCI_SUBSYSTEM_ID_OFFSET..PCI_SUBSYSTEM_ID_OFFSET + 2]);

        let mut pci_configuration = PciConfiguration::new(
            vendor_id,
            device_id,
            revision_id,
            PciClassCode::DisplayController,
            &PciDisplaySubclass::ThreeDController,
            None,
            subsystem_vendor_id,
            subsystem_id,
        );

        let mut mmio_regions = Vec::new();
        for bar_index in 0..VFIO_PCI_ROM_REGION_INDEX as usize {
            let size = device.get_region_size(bar_index as u32);
            if size == 0 {
                continue;
            }

            let bar_offset = PCI_CONFIG_BAR_OFFSET + bar_index * 4;
            let bar = LittleEndian::read_u32(&header[bar_offset..bar_offset + 4]);

            let (region_type, addr, prefetchable) = if bar & PCI_CONFIG_IO_BAR != 0 {
                (
                    PciBarRegionType::IoRegion,
                    u64::from(bar & 0xffff_fffc),
                    PciBarPrefetchable::NotPrefetchable,
                )
            } else {
                if bar & PCI_CONFIG_MEMORY_BAR_64BIT != 0 {
                    header[bar_offset] &= !(PCI_CONFIG_MEMORY_BAR_64BIT as u8);
                }
                let prefetchable = if bar & PCI_CONFIG_BAR_PREFETCHABLE != 0 {
                    PciBarPrefetchable::Prefetchable
                } else {
                    PciBarPrefetchable::NotPrefetchable
                };
                (
                    PciBarRegionType::Memory32BitRegion,
                    u64::from(bar & 0xffff_fff0),
                    prefetchable,
                )
            };

            pci_configuration
                .add_pci_bar(&PciBarConfiguration {
                    idx: bar_index,
                    addr,
                    size,
                    region_type,
                    prefetchable,
                })
                .map_err(|e| VfioPciError::CreateBar(bar_index, e))?;

            mmio_regions.push(MmioRegion {
                start: GuestAddress(addr),
                length: size,
                type_: region_type,
                index: bar_index as u32,
                active: false,
                resources: Vec::new(),
                mappings: Vec::new(),
            });
        }

        Ok((pci_configuration, mmio_regions))
    }

    /// Allocates the vector eventfds. They are handed to the event loop
    /// through `init()` and bound to VFIO only when the guest sets the MSI
    /// enable bit.
    fn setup_interrupts(device: &VfioDevice, cfg: MsiConfig) -> Result<VfioMsi> {
        let irq = device
            .get_irq_info(VFIO_PCI_MSI_IRQ_INDEX)
            .ok_or(VfioPciError::MsiIrqUnavailable)?;
        if irq.flags & VFIO_IRQ_INFO_EVENTFD == 0 {
            return Err(VfioPciError::MsiIrqUnavailable);
        }
        if irq.count != 1 {
            return Err(VfioPciError::UnsupportedMsiVectorCount);
        }

        let event_fd = EventFd::new(libc::EFD_NONBLOCK).map_err(VfioPciError::EventFd)?;
        Ok(VfioMsi {
            cfg,
            vectors: vec![MsiVector { event_fd }],
            vfio_bound: false,
        })
    }

    fn bar_active(&self, bar_index: usize) -> bool {
        self.mmio_regions
            .iter()
            .any(|region| region.index == bar_index as u32 && region.active)
    }

    /// Publishes BAR `bar_index` into the guest at the address currently
    /// programmed in the configuration space. Already-active BARs are left
    /// untouched.
    pub fn activate_bar(&mut self, bar_index: usize) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .map(Arc::clone)
            .ok_or(VfioPciError::NotConnected)?;
        let bar_addr = self.configuration.get_bar_addr(bar_index);

        let Some(region) = self
            .mmio_regions
            .iter_mut()
            .find(|region| region.index == bar_index as u32)
        else {
            return Ok(());
        };
        if region.active {
            return Ok(());
        }
        region.start = GuestAddress(bar_addr);

        let flags = device.get_region_flags(region.index);
        if region.type_ == PciBarRegionType::IoRegion || flags & VFIO_REGION_INFO_FLAG_MMAP == 0 {
            // Trap-dispatched window; accesses land in read_bar/write_bar.
            let resource = match region.type_ {
                PciBarRegionType::IoRegion => IoResource::Pio {
                    base: bar_addr as u16,
                    size: region.length as u16,
                },
                PciBarRegionType::Memory32BitRegion => IoResource::Mmio {
                    base: bar_addr,
                    size: region.length,
                },
            };
            self.registry
                .add_resource(&resource)
                .map_err(VfioPciError::AddIoResource)?;
            region.resources.push(resource);
        } else {
            let sparse_areas = device
                .get_region_caps(region.index)
                .iter()
                .find_map(|cap| match cap {
                    VfioRegionInfoCap::SparseMmap(sparse) => Some(sparse.areas.clone()),
                    _ => None,
                })
                .unwrap_or_default();

            let (resources, mappings) = map_bar_region(
                device.device_file(),
                device.get_region_offset(region.index),
                flags,
                &sparse_areas,
                bar_addr,
                region.length,
                self.registry.as_ref(),
            )?;
            region.resources = resources;
            region.mappings = mappings;
        }

        let resource_count = region.resources.len();
        region.active = true;
        if self.config.debug {
            debug!(
                "vfio-pci: activated BAR {bar_index} at 0x{bar_addr:x}, \
                 {resource_count} resource(s)"
            );
        }
        Ok(())
    }

    /// Removes the guest resources backing BAR `bar_index`, in insertion
    /// order, and unmaps its windows.
    pub fn deactivate_bar(&mut self, bar_index: usize) -> Result<()> {
        let Some(region) = self
            .mmio_regions
            .iter_mut()
            .find(|region| region.index == bar_index as u32)
        else {
            return Ok(());
        };
        if !region.active {
            return Ok(());
        }

        for resource in region.resources.drain(..) {
            if let Err(e) = self.registry.remove_resource(&resource) {
                warn!("vfio-pci: failed to remove a BAR {bar_index} resource: {e}");
            }
        }
        region.mappings.clear();
        region.active = false;

        if self.config.debug {
            debug!("vfio-pci: deactivated BAR {bar_index}");
        }
        Ok(())
    }

    /// Re-evaluates which BARs should be live after a command-register
    /// write: memory BARs follow the memory-space bit, IO BARs the
    /// IO-space bit.
    fn sync_bar_enables(&mut self) {
        let command = self.configuration.command();
        for i in 0..self.mmio_regions.len() {
            let (bar_index, type_, active) = {
                let region = &self.mmio_regions[i];
                (region.index as usize, region.type_, region.active)
            };
            let enable_bit = match type_ {
                PciBarRegionType::IoRegion => COMMAND_IO_SPACE,
                PciBarRegionType::Memory32BitRegion => COMMAND_MEMORY_SPACE,
            };
            let should_be_active =
                command & enable_bit != 0 && self.configuration.get_bar_addr(bar_index) != 0;

            if should_be_active && !active {
                if let Err(e) = self.activate_bar(bar_index) {
                    error!("vfio-pci: failed to activate BAR {bar_index}: {e}");
                }
            } else if !should_be_active && active {
                let _ = self.deactivate_bar(bar_index);
            }
        }
    }

    fn update_msi_capability(&mut self, offset: u64, data: &[u8]) {
        let Some(msi) = self.interrupt.as_mut() else {
            return;
        };
        let action = msi.update(offset, data);
        let cap = msi.cfg.cap;

        // Keep the interrupt controller's view of the message current so a
        // trigger synthesizes the address/data pair the guest programmed.
        let msg = MsiIrqSourceConfig {
            high_addr: cap.msg_addr_hi,
            low_addr: cap.msg_addr_lo,
            data: u32::from(cap.msg_data),
        };
        if let Err(e) = self
            .intr_group
            .update(0, InterruptSourceConfig::MsiIrq(msg))
        {
            error!("vfio-pci: failed to update the MSI route: {e}");
        }

        match action {
            Some(InterruptUpdateAction::EnableMsi) => self.enable_msi_routes(),
            Some(InterruptUpdateAction::DisableMsi) => self.disable_msi_routes(),
            None => {}
        }
    }

    fn enable_msi_routes(&mut self) {
        let Some(device) = self.device.as_ref().map(Arc::clone) else {
            return;
        };
        let Some(msi) = self.interrupt.as_mut() else {
            return;
        };

        let enabled_vectors = msi.cfg.num_enabled_vectors();
        if enabled_vectors != msi.vectors.len() {
            warn!(
                "vfio-pci: guest enabled {} MSI vectors, device carries {}",
                enabled_vectors,
                msi.vectors.len()
            );
        }

        match device.enable_msi(&msi.vectors[0].event_fd) {
            Ok(()) => {
                msi.vfio_bound = true;
                if self.config.debug {
                    debug!("vfio-pci: MSI eventfd bound");
                }
            }
            // The device keeps running but its interrupts are lost until
            // the guest toggles the enable bit again.
            Err(e) => error!("vfio-pci: failed to bind the MSI eventfd: {e}"),
        }
    }

    fn disable_msi_routes(&mut self) {
        let Some(device) = self.device.as_ref().map(Arc::clone) else {
            return;
        };
        let Some(msi) = self.interrupt.as_mut() else {
            return;
        };

        if let Err(e) = device.disable_msi() {
            warn!("vfio-pci: failed to unbind the MSI eventfd: {e}");
        }
        msi.vfio_bound = false;
        if self.config.debug {
            debug!("vfio-pci: MSI eventfd unbound");
        }
    }

    fn find_region(&self, addr: u64) -> Option<&MmioRegion> {
        self.mmio_regions.iter().find(|region| {
            addr >= region.start.raw_value()
                && addr < region.start.unchecked_add(region.length).raw_value()
        })
    }
}

impl PciDevice for VfioPciDevice {
    fn connect(&mut self) -> io::Result<()> {
        VfioPciDevice::connect(self).map_err(io::Error::other)
    }

    fn disconnect(&mut self) {
        VfioPciDevice::disconnect(self)
    }

    fn reset(&mut self) -> io::Result<()> {
        VfioPciDevice::reset(self).map_err(io::Error::other)
    }

    fn write_config_register(&mut self, reg_idx: usize, offset: u64, data: &[u8]) {
        if offset as usize + data.len() > 4 {
            return;
        }

        let byte_offset = (reg_idx * 4) as u64 + offset;

        // Pass-through semantics: the device sees every config write, and
        // sees it before the MSI routing is touched. The kernel clears the
        // in-device MSI enable bit while programming VFIO triggers, so the
        // ordering write-then-rearm keeps both sides consistent.
        if let Some(device) = &self.device {
            device.region_write(VFIO_PCI_CONFIG_REGION_INDEX, data, byte_offset);
        }

        if (PCI_CONFIG_BAR0_INDEX..PCI_CONFIG_BAR0_INDEX + BAR_NUMS).contains(&reg_idx) {
            let bar_index = reg_idx - PCI_CONFIG_BAR0_INDEX;
            if let Some(params) = self.configuration.detect_bar_reprogramming(reg_idx, data) {
                let was_active = self.bar_active(bar_index);
                if was_active {
                    let _ = self.deactivate_bar(bar_index);
                }
                self.configuration.write_config_register(reg_idx, offset, data);
                if was_active && params.new_base != 0 {
                    if let Err(e) = self.activate_bar(bar_index) {
                        error!(
                            "vfio-pci: failed to activate BAR {bar_index} at 0x{:x}: {e}",
                            params.new_base
                        );
                    }
                }
            } else {
                self.configuration.write_config_register(reg_idx, offset, data);
            }
            return;
        }

        self.configuration.write_config_register(reg_idx, offset, data);

        if reg_idx == COMMAND_REG_INDEX {
            self.sync_bar_enables();
        }

        let msi_overlap = match &self.interrupt {
            Some(msi) if msi.cfg.overlaps(byte_offset, data.len() as u64) => {
                Some(byte_offset >= u64::from(msi.cfg.cap_offset()))
            }
            _ => None,
        };
        match msi_overlap {
            Some(true) => self.update_msi_capability(byte_offset, data),
            Some(false) => warn!("vfio-pci: unaligned write across the MSI capability ignored"),
            None => {}
        }
    }

    fn read_config_register(&mut self, reg_idx: usize) -> u32 {
        // BAR values live in the emulated configuration: the guest
        // programs addresses in its own address space and expects sizing
        // reads to work, neither of which the device can serve.
        if (PCI_CONFIG_BAR0_INDEX..PCI_CONFIG_BAR0_INDEX + BAR_NUMS).contains(&reg_idx) {
            return self.configuration.read_reg(reg_idx);
        }

        let Some(device) = &self.device else {
            return 0xffff_ffff;
        };

        let mask = if reg_idx == PCI_HEADER_TYPE_REG_INDEX {
            // We don't support passing multi-functions devices.
            0xff7f_ffff
        } else {
            0xffff_ffff
        };

        let mut data = [0u8; 4];
        device.region_read(VFIO_PCI_CONFIG_REGION_INDEX, &mut data, (reg_idx * 4) as u64);
        LittleEndian::read_u32(&data) & mask
    }

    fn read_bar(&mut self, base: u64, offset: u64, data: &mut [u8]) {
        let addr = base + offset;
        let Some(device) = self.device.as_ref().map(Arc::clone) else {
            return;
        };
        if let Some(region) = self.find_region(addr) {
            device.region_read(region.index, data, addr - region.start.raw_value());
        }
    }

    fn write_bar(&mut self, base: u64, offset: u64, data: &[u8]) {
        let addr = base + offset;
        let Some(device) = self.device.as_ref().map(Arc::clone) else {
            return;
        };
        if let Some(region) = self.find_region(addr) {
            device.region_write(region.index, data, addr - region.start.raw_value());
        }
    }

    fn activate_bar(&mut self, bar_index: usize) -> io::Result<()> {
        VfioPciDevice::activate_bar(self, bar_index).map_err(io::Error::other)
    }

    fn deactivate_bar(&mut self, bar_index: usize) -> io::Result<()> {
        VfioPciDevice::deactivate_bar(self, bar_index).map_err(io::Error::other)
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn id(&self) -> Option<String> {
        self.config
            .sysfs
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

impl MutEventSubscriber for VfioPciDevice {
    fn init(&mut self, ops: &mut EventOps) {
        if let Some(msi) = &self.interrupt {
            for (vector, msi_vector) in msi.vectors.iter().enumerate() {
                if let Err(e) = ops.add(Events::with_data(
                    &msi_vector.event_fd,
                    vector as u32,
                    EventSet::IN,
                )) {
                    error!("vfio-pci: failed to register MSI vector {vector} for polling: {e}");
                }
            }
        }
    }

    fn process(&mut self, events: Events, _ops: &mut EventOps) {
        if !events.event_set().contains(EventSet::IN) {
            warn!("vfio-pci: unexpected event set {:?}", events.event_set());
            return;
        }

        let Some(msi) = &self.interrupt else {
            warn!("vfio-pci: event delivered to a detached device");
            return;
        };
        msi.service_vector(events.data(), &self.intr_group);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn test_header() -> [u8; PCI_CONFIGURATION_SPACE_SIZE] {
        let mut header = [0u8; PCI_CONFIGURATION_SPACE_SIZE];
        // Vendor/device/revision.
        header[0..2].copy_from_slice(&0x10deu16.to_le_bytes());
        header[2..4].copy_from_slice(&0x1db6u16.to_le_bytes());
        header[PCI_REVISION_ID_OFFSET] = 0xa1;
        // Capability list present.
        header[PCI_STATUS_OFFSET..PCI_STATUS_OFFSET + 2]
            .copy_from_slice(&PCI_STATUS_CAP_LIST.to_le_bytes());
        header[PCI_CONFIG_CAPABILITY_OFFSET] = 0x60;
        // 64-bit MSI capability, single message, no masking.
        header[0x60] = PciCapabilityId::MessageSignalledInterrupts as u8;
        header[0x61] = 0;
        header[0x62..0x64].copy_from_slice(&0x0080u16.to_le_bytes());
        header
    }

    #[test]
    fn header_sanitization() {
        let mut header = test_header();
        header[PCI_INTERRUPT_PIN_OFFSET] = 0x01;
        header[PCI_HEADER_TYPE_OFFSET] = PCI_HEADER_TYPE_MULTI_FUNCTION;
        header[PCI_CLASS_CODE_OFFSET..PCI_CLASS_CODE_OFFSET + 3].copy_from_slice(&[1, 2, 0xff]);

        sanitize_header(&mut header).unwrap();

        assert_eq!(header[PCI_INTERRUPT_PIN_OFFSET], 0);
        assert_eq!(header[PCI_HEADER_TYPE_OFFSET], 0);
        assert_eq!(
            &header[PCI_CLASS_CODE_OFFSET..PCI_CLASS_CODE_OFFSET + 3],
            &PCI_CLASS_CODE_3D_CONTROLLER
        );
    }

    #[test]
    fn bridge_header_is_rejected() {
        let mut header = test_header();
        header[PCI_HEADER_TYPE_OFFSET] = 0x81;
        let err = sanitize_header(&mut header).unwrap_err();
        assert!(matches!(err, VfioPciError::UnsupportedHeaderType(0x01)));
    }

    #[test]
    fn msi_capability_is_parsed() {
        let header = test_header();
        let msi = parse_capabilities(&header).unwrap();
        assert_eq!(msi.cap_offset(), 0x60);
        assert!(msi.cap.addr_64_bits());
        assert!(!msi.enabled());
    }

    #[test]
    fn msix_capability_fails_attach() {
        let mut header = test_header();
        // Chain an MSI-X capability after the MSI one.
        header[0x61] = 0x70;
        header[0x70] = PciCapabilityId::MsiX as u8;
        header[0x71] = 0;

        let err = parse_capabilities(&header).unwrap_err();
        assert!(matches!(err, VfioPciError::MsixNotSupported));
    }

    #[test]
    fn msi_without_64bit_support_fails_attach() {
        let mut header = test_header();
        header[0x62..0x64].copy_from_slice(&0x0000u16.to_le_bytes());
        let err = parse_capabilities(&header).unwrap_err();
        assert!(matches!(err, VfioPciError::UnsupportedMsiLayout));
    }

    #[test]
    fn msi_with_vector_masking_fails_attach() {
        let mut header = test_header();
        header[0x62..0x64].copy_from_slice(&0x0180u16.to_le_bytes());
        let err = parse_capabilities(&header).unwrap_err();
        assert!(matches!(err, VfioPciError::UnsupportedMsiLayout));
    }

    #[test]
    fn multi_message_msi_fails_attach() {
        let mut header = test_header();
        // Multiple-message-capable field advertising 4 vectors.
        header[0x62..0x64].copy_from_slice(&0x0084u16.to_le_bytes());
        let err = parse_capabilities(&header).unwrap_err();
        assert!(matches!(err, VfioPciError::UnsupportedMsiVectorCount));
    }

    #[test]
    fn missing_msi_capability_fails_attach() {
        let mut header = test_header();
        header[PCI_STATUS_OFFSET] = 0;
        let err = parse_capabilities(&header).unwrap_err();
        assert!(matches!(err, VfioPciError::MissingMsiCapability));

        // A capability list without MSI fails the same way.
        let mut header = test_header();
        header[0x60] = PciCapabilityId::VendorSpecific as u8;
        let err = parse_capabilities(&header).unwrap_err();
        assert!(matches!(err, VfioPciError::MissingMsiCapability));
    }

    #[test]
    fn msi_enable_transitions() {
        let mut msi = VfioMsi {
            cfg: MsiConfig::new(0x0080, 0x60),
            vectors: Vec::new(),
            vfio_bound: false,
        };

        assert!(matches!(
            msi.update(0x62, &0x0001u16.to_le_bytes()),
            Some(InterruptUpdateAction::EnableMsi)
        ));
        // Re-writing the same value is not a transition.
        assert!(msi.update(0x62, &0x0001u16.to_le_bytes()).is_none());
        assert!(matches!(
            msi.update(0x62, &0x0000u16.to_le_bytes()),
            Some(InterruptUpdateAction::DisableMsi)
        ));
        assert!(msi.update(0x62, &0x0000u16.to_le_bytes()).is_none());
    }

    #[derive(Default)]
    struct MockIntrGroup {
        triggered: AtomicUsize,
    }

    impl InterruptSourceGroup for MockIntrGroup {
        fn trigger(&self, _index: InterruptIndex) -> std::io::Result<()> {
            self.triggered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn notifier(&self, _index: InterruptIndex) -> Option<&EventFd> {
            None
        }

        fn update(
            &self,
            _index: InterruptIndex,
            _config: InterruptSourceConfig,
        ) -> std::io::Result<()> {
            Ok(())
        }

        fn len(&self) -> InterruptIndex {
            1
        }
    }

    #[test]
    fn eventfd_drain_forwards_one_interrupt() {
        let msi = VfioMsi {
            cfg: MsiConfig::new(0x0080, 0x60),
            vectors: vec![MsiVector {
                event_fd: EventFd::new(libc::EFD_NONBLOCK).unwrap(),
            }],
            vfio_bound: true,
        };
        let mock = Arc::new(MockIntrGroup::default());
        let group: Arc<dyn InterruptSourceGroup> = mock.clone();

        // The kernel may accumulate several interrupts into the counter;
        // one drain forwards one guest interrupt.
        msi.vectors[0].event_fd.write(3).unwrap();
        msi.service_vector(0, &group);
        assert_eq!(mock.triggered.load(Ordering::SeqCst), 1);

        // The counter is drained; a spurious wakeup forwards nothing.
        msi.service_vector(0, &group);
        assert_eq!(mock.triggered.load(Ordering::SeqCst), 1);

        // An unknown vector forwards nothing.
        msi.service_vector(7, &group);
        assert_eq!(mock.triggered.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct MockDmaMapping {
        maps: Mutex<Vec<(u64, u64, u64)>>,
        unmaps: Mutex<Vec<(u64, u64)>>,
        fail_map: bool,
        fail_unmap: bool,
    }

    impl ExternalDmaMapping for MockDmaMapping {
        fn map(&self, iova: u64, size: u64, user_addr: u64) -> std::io::Result<()> {
            if self.fail_map {
                return Err(std::io::Error::other("map failed"));
            }
            self.maps.lock().unwrap().push((iova, size, user_addr));
            Ok(())
        }

        fn unmap(&self, iova: u64, size: u64) -> std::io::Result<()> {
            if self.fail_unmap {
                return Err(std::io::Error::other("unmap failed"));
            }
            self.unmaps.lock().unwrap().push((iova, size));
            Ok(())
        }
    }

    fn ram_slot(base: u64, size: u64, host_addr: u64) -> MemorySlot {
        MemorySlot {
            base,
            size,
            host_addr,
            kind: MemorySlotKind::Ram,
        }
    }

    #[test]
    fn dma_mirror_maps_ram_slots() {
        let mapping = Arc::new(MockDmaMapping::default());
        let mirror = DmaMirror {
            mapping: mapping.clone(),
            debug: false,
        };

        let slot = ram_slot(0x4000_0000, 0x4000_0000, 0x7f00_0000_0000);
        mirror.update(&slot, false).unwrap();
        assert_eq!(
            mapping.maps.lock().unwrap().as_slice(),
            &[(0x4000_0000, 0x4000_0000, 0x7f00_0000_0000)]
        );

        mirror.update(&slot, true).unwrap();
        assert_eq!(
            mapping.unmaps.lock().unwrap().as_slice(),
            &[(0x4000_0000, 0x4000_0000)]
        );
    }

    #[test]
    fn dma_mirror_ignores_device_memory() {
        let mapping = Arc::new(MockDmaMapping::default());
        let mirror = DmaMirror {
            mapping: mapping.clone(),
            debug: false,
        };

        let slot = MemorySlot {
            base: 0xe000_0000,
            size: 0x100_0000,
            host_addr: 0x7f00_0000_0000,
            kind: MemorySlotKind::DeviceMemory,
        };
        mirror.update(&slot, false).unwrap();
        mirror.update(&slot, true).unwrap();
        assert!(mapping.maps.lock().unwrap().is_empty());
        assert!(mapping.unmaps.lock().unwrap().is_empty());
    }

    #[test]
    fn dma_mirror_error_policy() {
        let mapping = Arc::new(MockDmaMapping {
            fail_map: true,
            fail_unmap: true,
            ..Default::default()
        });
        let mirror = DmaMirror {
            mapping: mapping.clone(),
            debug: false,
        };
        let slot = ram_slot(0x0, 0x8000_0000, 0x7f00_0000_0000);

        // A failed map must surface; a failed unmap must not.
        mirror.update(&slot, false).unwrap_err();
        mirror.update(&slot, true).unwrap();
    }

    #[derive(Default)]
    struct MockRegistry {
        added: Mutex<Vec<IoResource>>,
        removed: Mutex<Vec<IoResource>>,
        fail_after: Option<usize>,
    }

    impl IoResourceRegistry for MockRegistry {
        fn add_resource(&self, resource: &IoResource) -> std::io::Result<()> {
            let mut added = self.added.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if added.len() >= limit {
                    return Err(std::io::Error::other("registry full"));
                }
            }
            added.push(*resource);
            Ok(())
        }

        fn remove_resource(&self, resource: &IoResource) -> std::io::Result<()> {
            self.removed.lock().unwrap().push(*resource);
            Ok(())
        }
    }

    const TEST_REGION_OFFSET: u64 = 0x2_0000;
    const TEST_BAR_SIZE: u64 = 0x100_0000;

    fn region_file() -> File {
        let file = TempFile::new().unwrap().into_file();
        file.set_len(TEST_REGION_OFFSET + TEST_BAR_SIZE).unwrap();
        file
    }

    #[test]
    fn whole_region_mapping_publishes_one_ram_window() {
        let file = region_file();
        let registry = MockRegistry::default();

        let (resources, mappings) = map_bar_region(
            &file,
            TEST_REGION_OFFSET,
            VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
            &[],
            0xe000_0000,
            TEST_BAR_SIZE,
            &registry,
        )
        .unwrap();

        assert_eq!(mappings.len(), 1);
        assert_eq!(resources.len(), 1);
        let IoResource::Ram {
            base,
            size,
            host_addr,
        } = resources[0]
        else {
            panic!("expected a RAM window");
        };
        assert_eq!(base, 0xe000_0000);
        assert_eq!(size, TEST_BAR_SIZE);
        assert_eq!(host_addr, mappings[0].host_addr);
        assert_eq!(registry.added.lock().unwrap().len(), 1);
    }

    #[test]
    fn sparse_region_mapping_overlays_ram_windows() {
        let file = region_file();
        let registry = MockRegistry::default();
        let areas = [
            VfioRegionSparseMmapArea {
                offset: 0x0,
                size: 0x10_0000,
            },
            VfioRegionSparseMmapArea {
                offset: 0x80_0000,
                size: 0x20_0000,
            },
        ];

        let (resources, mappings) = map_bar_region(
            &file,
            TEST_REGION_OFFSET,
            VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
            &areas,
            0xe000_0000,
            TEST_BAR_SIZE,
            &registry,
        )
        .unwrap();

        assert_eq!(mappings.len(), 2);
        assert_eq!(resources.len(), 3);
        assert_eq!(
            resources[0],
            IoResource::Mmio {
                base: 0xe000_0000,
                size: TEST_BAR_SIZE
            }
        );
        assert_eq!(
            resources[1],
            IoResource::Ram {
                base: 0xe000_0000,
                size: 0x10_0000,
                host_addr: mappings[0].host_addr,
            }
        );
        assert_eq!(
            resources[2],
            IoResource::Ram {
                base: 0xe080_0000,
                size: 0x20_0000,
                host_addr: mappings[1].host_addr,
            }
        );
    }

    #[test]
    fn failed_mapping_rolls_back_published_resources() {
        let file = region_file();
        let registry = MockRegistry {
            fail_after: Some(2),
            ..Default::default()
        };
        let areas = [
            VfioRegionSparseMmapArea {
                offset: 0x0,
                size: 0x10_0000,
            },
            VfioRegionSparseMmapArea {
                offset: 0x80_0000,
                size: 0x20_0000,
            },
        ];

        let err = map_bar_region(
            &file,
            TEST_REGION_OFFSET,
            VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE,
            &areas,
            0xe000_0000,
            TEST_BAR_SIZE,
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, VfioPciError::AddIoResource(_)));

        // Both successfully published resources were removed again.
        assert_eq!(registry.added.lock().unwrap().len(), 2);
        assert_eq!(registry.removed.lock().unwrap().len(), 2);
    }

    #[test]
    fn remapping_after_unmap_is_identical() {
        let file = region_file();
        let registry = MockRegistry::default();
        let flags = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;

        let (first_resources, first_mappings) = map_bar_region(
            &file,
            TEST_REGION_OFFSET,
            flags,
            &[],
            0xe000_0000,
            TEST_BAR_SIZE,
            &registry,
        )
        .unwrap();
        let first: Vec<u64> = first_resources.iter().map(|r| r.base()).collect();
        drop(first_mappings);

        let (second_resources, _second_mappings) = map_bar_region(
            &file,
            TEST_REGION_OFFSET,
            flags,
            &[],
            0xe000_0000,
            TEST_BAR_SIZE,
            &registry,
        )
        .unwrap();
        let second: Vec<u64> = second_resources.iter().map(|r| r.base()).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn device_config_requires_sysfs_path() {
        let config: VfioPciDeviceConfig =
            serde_json::from_str(r#"{"sysfs": "/sys/bus/mdev/devices/x", "debug": true}"#).unwrap();
        assert!(config.debug);

        serde_json::from_str::<VfioPciDeviceConfig>(r#"{"debug": true}"#).unwrap_err();
    }
}
