// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # IOMMU interrupt remapping
//!
//! Translates MSI writes from devices assigned to a VM through a flat MSI page table owned by the
//! device's protection domain, as described by the RISC-V IOMMU specification. Each entry of the
//! table retargets one guest interrupt file page to a host interrupt file page.
//!
//! `ProtectionDomain` drives the lifecycle: the table is allocated on the first vCPU affinity
//! change, entries are rewritten as vCPUs move, and every rewrite is followed by an invalidation
//! broadcast to each IOMMU instance that has one of the domain's devices behind it. Lookups by the
//! interrupt delivery path run concurrently with all of this.
//!
//! The hardware is reached through the `IommuInstance`, `DeviceDirectory` and `MsiPageAllocator`
//! traits, which the embedding system implements.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

/// Typed guest and host physical addresses.
pub mod addr;
/// The set of devices bound to a domain and the IOMMUs that own them.
pub mod bindings;
/// IOMMU command queue entries used for invalidation.
pub mod command;
/// Tunables and their defaults.
pub mod config;
/// Protection domains and their vCPU affinity state machine.
pub mod domain;
mod error;
/// Mapping of guest MSI addresses onto MSI page table indices.
pub mod geometry;
/// Global soft-context IDs.
pub mod gscid;
/// Interfaces to IOMMU hardware instances and the device directory.
pub mod instance;
/// Invalidation of cached MSI page table entries.
pub mod invalidate;
/// The MSI page table itself.
pub mod msi_page_table;

#[cfg(test)]
mod test_stubs;

pub use addr::{GuestPhysAddr, Pfn, RawAddr, SupervisorPhysAddr};
pub use config::RemapConfig;
pub use domain::{
    AffinityRequest, AffinityUpdate, ProtectionDomain, RemapContextHandle, RemapState,
};
pub use error::{AddressingError, Error, ErrorKind, Result};
pub use geometry::{MsiAddressing, ReservedWindow};
pub use gscid::{GscId, GscIdAllocator};
pub use instance::{DeviceDirectory, DeviceId, IommuInstance, InstanceId};
pub use msi_page_table::{MsiPageAllocator, MsiPageTable, MsiPteValue, TablePages};
