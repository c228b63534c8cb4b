// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::addr::GuestPhysAddr;
use crate::gscid::GscId;
use crate::instance::{DeviceId, InstanceId};
use crate::msi_page_table::MsiPteValue;

/// Reasons a set of MSI addressing parameters is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressingError {
    /// The group index field starts below the page offset bits.
    GroupShiftBelowPage(u8),
    /// The group index field extends past the last bit of a physical address.
    GroupFieldOverflow(u8, u8),
    /// The address mask or pattern has bits set beyond the last bit of a physical page number.
    AddressTooWide(u64),
    /// No index bits remain once the group index field is removed from the mask.
    EmptyIndexMask,
    /// The index bits remaining once the group index field is removed aren't contiguous from
    /// bit 0, so the table index wouldn't be dense.
    NonContiguousIndexMask(u64),
    /// The address pattern has bits set within the address window.
    PatternOverlapsMask(u64),
}

/// Errors resulting from managing interrupt remapping for a protection domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The addressing parameters are inconsistent.
    InvalidAddressing(AddressingError),
    /// Attempt to change the addressing parameters of a domain whose MSI page table is active.
    AddressingMismatch,
    /// The first affinity request for a domain didn't specify addressing parameters.
    MissingAddressing,
    /// An MSI page table with this many entries exceeds the table size cap.
    MsiTableTooLarge(u64),
    /// The page allocator couldn't satisfy the table allocation.
    OutOfPages,
    /// The pages backing the MSI page table aren't aligned to the table size.
    MisalignedMsiTablePages,
    /// The index is beyond the end of the MSI page table.
    MsiIndexOutOfRange(usize),
    /// The target page can't be encoded in an MSI page-table entry.
    InvalidTargetPage(u64),
    /// The address isn't within the domain's MSI address window.
    AddressOutsideWindow(GuestPhysAddr),
    /// Delivery through a memory-resident interrupt file notifier was requested.
    NotifierUnsupported,
    /// The hardware instance didn't complete an invalidation within the timeout.
    InvalidationTimeout(InstanceId),
    /// The MSI page-table entry was written, but not every hardware instance acknowledged the
    /// invalidation. Some may keep delivering to the previous target until their cached copy of
    /// the entry is evicted.
    UnconfirmedInvalidation {
        /// The instance that timed out.
        instance: InstanceId,
        /// The entry value that was written.
        entry: MsiPteValue,
    },
    /// The device is already bound to the domain.
    DeviceAlreadyBound(DeviceId),
    /// The device isn't bound to the domain.
    DeviceNotBound(DeviceId),
    /// The binding ID doesn't refer to a live binding.
    StaleBinding,
    /// No hardware instance owns the device.
    UnknownDevice(DeviceId),
    /// The raw value is too large to be a device ID.
    InvalidDeviceId(u32),
    /// The hardware instance doesn't support flat MSI page tables.
    MissingMsiSupport(InstanceId),
    /// The domain's remapping context has been torn down.
    DomainDestroyed,
    /// No more GSCIDs are available.
    OutOfGscIds,
    /// The GSCID is out of range.
    InvalidGscId(GscId),
    /// The GSCID is not allocated.
    GscIdAlreadyFree(GscId),
}

/// Broad classes of `Error`, for callers that decide policy by class rather than by cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inconsistent or changed addressing parameters. A caller bug; not retryable.
    InvalidConfig,
    /// A malformed request. A caller bug; not retryable.
    InvalidArgument,
    /// Allocation failed or would exceed the table size cap.
    OutOfMemory,
    /// The address or device isn't known to the domain.
    NotFound,
    /// The requested delivery mode isn't implemented.
    NotImplemented,
    /// Hardware didn't acknowledge an invalidation in time.
    Timeout,
    /// The device or ID is already bound or allocated.
    AlreadyBound,
    /// The device or ID isn't bound or allocated.
    NotBound,
    /// The domain has been torn down.
    Destroyed,
}

impl Error {
    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            InvalidAddressing(_) | AddressingMismatch => ErrorKind::InvalidConfig,
            MissingAddressing
            | MisalignedMsiTablePages
            | MsiIndexOutOfRange(_)
            | InvalidTargetPage(_)
            | InvalidDeviceId(_)
            | InvalidGscId(_) => ErrorKind::InvalidArgument,
            MsiTableTooLarge(_) | OutOfPages | OutOfGscIds => ErrorKind::OutOfMemory,
            AddressOutsideWindow(_) | UnknownDevice(_) => ErrorKind::NotFound,
            NotifierUnsupported | MissingMsiSupport(_) => ErrorKind::NotImplemented,
            InvalidationTimeout(_) | UnconfirmedInvalidation { .. } => ErrorKind::Timeout,
            DeviceAlreadyBound(_) => ErrorKind::AlreadyBound,
            DeviceNotBound(_) | StaleBinding | GscIdAlreadyFree(_) => ErrorKind::NotBound,
            DomainDestroyed => ErrorKind::Destroyed,
        }
    }

    /// Returns if the operation may succeed when retried. The core never retries by itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::OutOfMemory | ErrorKind::Timeout)
    }

    /// Returns if the failed operation nonetheless wrote a new MSI page-table entry.
    pub fn entry_written(&self) -> bool {
        matches!(self, Error::UnconfirmedInvalidation { .. })
    }
}

impl From<AddressingError> for Error {
    fn from(e: AddressingError) -> Self {
        Error::InvalidAddressing(e)
    }
}

/// Holds results for interrupt remapping operations.
pub type Result<T> = core::result::Result<T, Error>;
