// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

/// How long to wait for each IOMMU to complete an invalidation before giving up.
pub const IOTINVAL_TIMEOUT: Duration = Duration::from_secs(90);

/// Largest MSI page table, in 4kB pages. Two pages hold 512 entries, i.e. enough for one
/// interrupt file per vCPU of a 512-vCPU VM.
pub const MSI_TABLE_MAX_PAGES: usize = 2;

/// Tunables for the interrupt remapping of a protection domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemapConfig {
    /// Per-IOMMU bound on waiting for an invalidation to complete.
    pub invalidation_timeout: Duration,
    /// Cap on the size of the MSI page table.
    pub max_table_pages: usize,
    /// NUMA node to allocate the MSI page table from, if any.
    pub numa_node: Option<u32>,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            invalidation_timeout: IOTINVAL_TIMEOUT,
            max_table_pages: MSI_TABLE_MAX_PAGES,
            numa_node: None,
        }
    }
}
