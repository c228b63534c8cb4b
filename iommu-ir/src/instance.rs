// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;
use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

use crate::command::Command;
use crate::error::*;

// Capability bits of an IOMMU; see https://github.com/riscv-non-isa/riscv-iommu.
register_bitfields![u64,
    pub Capabilities [
        Version OFFSET(0) NUMBITS(8),
        Sv39x4 OFFSET(17) NUMBITS(1),
        Sv48x4 OFFSET(18) NUMBITS(1),
        Sv57x4 OFFSET(19) NUMBITS(1),
        MsiFlat OFFSET(22) NUMBITS(1),
        MsiMrif OFFSET(23) NUMBITS(1),
    ],
];

/// A snapshot of an IOMMU's capabilities register.
pub type IommuCapabilities = LocalRegisterCopy<u64, Capabilities::Register>;

// Maximum number of device ID bits used by the IOMMU.
const DEVICE_ID_BITS: u32 = 24;

/// The device ID. Used to index into the device directory table. For PCI devices behind an IOMMU
/// this is equivalent to the requester ID of the PCI device (i.e. the bits of the B/D/F), plus
/// the segment in the upper 8 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Creates a new `DeviceId` from the raw `val`.
    pub fn new(val: u32) -> Result<DeviceId> {
        if (val & !((1 << DEVICE_ID_BITS) - 1)) == 0 {
            Ok(Self(val))
        } else {
            Err(Error::InvalidDeviceId(val))
        }
    }

    /// Returns the raw bits of this `DeviceId`.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.0 >> 16,
            (self.0 >> 8) & 0xff,
            (self.0 >> 3) & 0x1f,
            self.0 & 0x7
        )
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

/// Identifies one physical IOMMU instance in the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Creates an `InstanceId` from the raw `id`.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw bits of this `InstanceId`.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// A token for a command submitted to an IOMMU's command queue, used to wait for its completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHandle(u64);

impl CommandHandle {
    /// Creates a `CommandHandle` from a queue-specific sequence number.
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the sequence number of the command.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

/// The IOMMU didn't report completion of a command before the timeout expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionTimeout;

/// The interface a physical IOMMU presents to interrupt remapping: its capabilities and its
/// command queue.
pub trait IommuInstance: Send + Sync {
    /// Returns the identifier of this instance.
    fn id(&self) -> InstanceId;

    /// Returns the capabilities register of this instance.
    fn capabilities(&self) -> IommuCapabilities;

    /// Enqueues `cmd` on the command queue. Doesn't wait for the IOMMU to consume it.
    fn submit(&self, cmd: Command) -> CommandHandle;

    /// Waits up to `timeout` for the command identified by `handle` to complete.
    fn await_completion(
        &self,
        handle: CommandHandle,
        timeout: Duration,
    ) -> core::result::Result<(), CompletionTimeout>;
}

/// Maps devices to the IOMMU instance translating for them.
pub trait DeviceDirectory: Send + Sync {
    /// Returns the IOMMU instance that owns `device`, if any.
    fn owning_instance(&self, device: DeviceId) -> Option<Arc<dyn IommuInstance>>;
}
