// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Consuming-side model of the VM memory manager.
//!
//! The memory manager publishes a flat view of the guest physical address
//! space as a list of slots and notifies registered listeners on every
//! topology mutation. Within one transition, unmaps for removed slots are
//! delivered before maps for new slots covering the same range, and
//! delivery is serialized per listener.

use std::io;
use std::sync::Arc;

/// What a slot of guest physical address space is backed by.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemorySlotKind {
    /// Guest RAM, backed by host-process memory and eligible for DMA.
    Ram,
    /// Device-owned memory (mmap'd BARs, ROMs); never DMA-mapped.
    DeviceMemory,
}

/// One slot of the memory manager's flat view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemorySlot {
    /// First guest physical address of the slot.
    pub base: u64,
    /// Size of the slot in bytes.
    pub size: u64,
    /// Host virtual address backing `base`.
    pub host_addr: u64,
    pub kind: MemorySlotKind,
}

impl MemorySlot {
    /// First guest physical address past the slot.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// Opaque handle for a registered listener, used to unregister it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionId(pub u64);

/// Callback interface invoked by the memory manager on topology changes.
pub trait MemoryListener: Send + Sync {
    /// Called once per affected slot: `unmap` is false when the slot was
    /// added to the flat view and true when it was removed.
    ///
    /// An error return tells the memory manager the listener could not
    /// bring its downstream state in sync; the manager owns the abort
    /// policy for that.
    fn update(&self, slot: &MemorySlot, unmap: bool) -> io::Result<()>;
}

/// Subscription surface of the VM memory manager.
pub trait MemoryManager: Send + Sync {
    /// Returns the current flat view of guest physical memory.
    fn flat_view(&self) -> Vec<MemorySlot>;

    /// Registers `listener` for topology-change callbacks.
    fn register_listener(&self, listener: Arc<dyn MemoryListener>) -> SubscriptionId;

    /// Removes a previously registered listener. After this returns, no
    /// further callbacks are delivered for the subscription.
    fn unregister_listener(&self, id: SubscriptionId);
}
