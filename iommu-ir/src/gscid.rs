// SPDX-FileCopyrightText: 2025 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use sync::Mutex;

use crate::error::*;

/// Global Soft-Context ID. The equivalent of hgatp.VMID, but always 16 bits. Tags the cached
/// translations, including MSI page-table entries, of one protection domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GscId(u16);

impl GscId {
    /// Creates a `GscId` from the raw `id`.
    pub(crate) fn new(id: u16) -> Self {
        GscId(id)
    }

    /// Returns the raw bits of this `GscId`.
    pub fn bits(&self) -> u16 {
        self.0
    }
}

// We use a fixed-sized array to track available GSCIDs. We can't use a versioning scheme like we
// would for CPU VMIDs since reassigning GSCIDs on overflow would require us to temporarily disable
// DMA from all devices, which is extremely disruptive. Set a max of 64 allocated GSCIDs for now
// since it's unlikely we'll have more than that number of active VMs with assigned devices for
// the time being.
const MAX_GSCIDS: usize = 64;

/// Tracks which GSCIDs are handed out to protection domains. One allocator is shared by all the
/// IOMMU instances of a system, since a domain's devices may sit behind any of them.
pub struct GscIdAllocator {
    in_use: Mutex<[bool; MAX_GSCIDS]>,
}

impl GscIdAllocator {
    /// Creates an allocator with every GSCID free.
    pub const fn new() -> Self {
        Self {
            in_use: Mutex::new([false; MAX_GSCIDS]),
        }
    }

    /// Allocates a new GSCID.
    pub fn alloc(&self) -> Result<GscId> {
        let mut in_use = self.in_use.lock();
        let next = in_use
            .iter()
            .position(|used| !used)
            .ok_or(Error::OutOfGscIds)?;
        in_use[next] = true;
        Ok(GscId::new(next as u16))
    }

    /// Releases `gscid`, which must not be in use by any live protection domain.
    pub fn free(&self, gscid: GscId) -> Result<()> {
        let mut in_use = self.in_use.lock();
        let used = in_use
            .get_mut(gscid.bits() as usize)
            .ok_or(Error::InvalidGscId(gscid))?;
        if !*used {
            return Err(Error::GscIdAlreadyFree(gscid));
        }
        *used = false;
        Ok(())
    }
}

impl Default for GscIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
