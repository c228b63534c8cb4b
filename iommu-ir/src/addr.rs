// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use core::marker::PhantomData;

/// Number of bits of the page offset within a 4kB page.
pub const PFN_SHIFT: u64 = 12;
/// Size of a 4kB page in bytes.
pub const PAGE_SIZE_4K: u64 = 1 << PFN_SHIFT;
/// Width of a physical address.
pub const PHYS_ADDR_BITS: u32 = 56;
/// Width of a physical page frame number.
pub const PFN_BITS: u32 = PHYS_ADDR_BITS - PFN_SHIFT as u32;

/// Marker trait for the address spaces an address or page frame number can belong to.
pub trait AddressSpace:
    Clone + Copy + fmt::Debug + PartialEq + Eq + PartialOrd + Ord + core::hash::Hash
{
}

/// The guest physical address space of a VM, as seen by its assigned devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestPhys;
impl AddressSpace for GuestPhys {}

/// The supervisor (host) physical address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SupervisorPhys;
impl AddressSpace for SupervisorPhys {}

/// A raw byte address in the address space `AS`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawAddr<AS: AddressSpace> {
    bits: u64,
    _space: PhantomData<AS>,
}

/// A guest physical address.
pub type GuestPhysAddr = RawAddr<GuestPhys>;
/// A supervisor physical address.
pub type SupervisorPhysAddr = RawAddr<SupervisorPhys>;

impl<AS: AddressSpace> RawAddr<AS> {
    /// Returns the raw bits of the address.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Returns the frame number of the 4kB page containing this address.
    pub fn pfn(&self) -> Pfn<AS> {
        Pfn {
            bits: self.bits >> PFN_SHIFT,
            _space: PhantomData,
        }
    }

    /// Returns the offset of this address within its 4kB page.
    pub fn page_offset(&self) -> u64 {
        self.bits & (PAGE_SIZE_4K - 1)
    }

    /// Returns if the address is aligned to `alignment`, which must be a power of two.
    pub fn is_aligned(&self, alignment: u64) -> bool {
        self.bits & (alignment - 1) == 0
    }
}

impl RawAddr<GuestPhys> {
    /// Creates a guest physical address from `bits`.
    pub fn guest(bits: u64) -> Self {
        Self {
            bits,
            _space: PhantomData,
        }
    }
}

impl RawAddr<SupervisorPhys> {
    /// Creates a supervisor physical address from `bits`.
    pub fn supervisor(bits: u64) -> Self {
        Self {
            bits,
            _space: PhantomData,
        }
    }
}

impl<AS: AddressSpace> fmt::Debug for RawAddr<AS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.bits)
    }
}

/// A 4kB page frame number in the address space `AS`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn<AS: AddressSpace> {
    bits: u64,
    _space: PhantomData<AS>,
}

/// A guest physical page frame number.
pub type GuestPfn = Pfn<GuestPhys>;
/// A supervisor physical page frame number.
pub type SupervisorPfn = Pfn<SupervisorPhys>;

impl<AS: AddressSpace> Pfn<AS> {
    /// Returns the raw frame number.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Returns the address of the first byte of this page.
    pub fn addr(&self) -> RawAddr<AS> {
        RawAddr {
            bits: self.bits << PFN_SHIFT,
            _space: PhantomData,
        }
    }
}

impl Pfn<GuestPhys> {
    /// Creates a guest frame number from `bits`.
    pub fn guest(bits: u64) -> Self {
        Self {
            bits,
            _space: PhantomData,
        }
    }
}

impl Pfn<SupervisorPhys> {
    /// Creates a supervisor frame number from `bits`.
    pub fn supervisor(bits: u64) -> Self {
        Self {
            bits,
            _space: PhantomData,
        }
    }
}

impl<AS: AddressSpace> fmt::Debug for Pfn<AS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.bits)
    }
}
