// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::addr::*;
use crate::error::*;

/// An index within an MSI page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MsiPageTableIndex(usize);

impl MsiPageTableIndex {
    /// Returns the raw index.
    pub fn bits(&self) -> usize {
        self.0
    }
}

/// A guest physical address range reserved for MSI delivery. Ordinary DMA mappings must not be
/// created within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservedWindow {
    /// First byte of the window.
    pub base: GuestPhysAddr,
    /// Length of the window in bytes.
    pub len: u64,
}

/// Describes how guest MSI addresses are mapped onto the entries of a domain's MSI page table.
///
/// `addr_mask` and `addr_pattern` are in page-number terms, like the `msi_addr_mask` and
/// `msi_addr_pattern` fields of a device context: a guest page belongs to the domain's MSI window
/// if its bits outside the mask match the pattern. The optional group index is a `group_bits`-wide
/// field at byte-address bit `group_shift` selecting one replica of the interrupt file layout
/// (e.g. one socket). Its value is packed immediately above the remaining index bits so that the
/// table is dense.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiAddressing {
    addr_mask: u64,
    addr_pattern: u64,
    group_index_bits: u8,
    group_index_shift: u8,
}

impl MsiAddressing {
    /// Creates a new `MsiAddressing` after checking that the parameters describe a dense index
    /// space.
    pub fn new(
        addr_mask: u64,
        addr_pattern: u64,
        group_index_bits: u8,
        group_index_shift: u8,
    ) -> Result<Self> {
        if group_index_bits > 0 {
            if (group_index_shift as u64) < PFN_SHIFT {
                return Err(AddressingError::GroupShiftBelowPage(group_index_shift).into());
            }
            if group_index_shift as u32 + group_index_bits as u32 > PHYS_ADDR_BITS {
                return Err(
                    AddressingError::GroupFieldOverflow(group_index_bits, group_index_shift).into(),
                );
            }
        }
        let too_wide = (addr_mask | addr_pattern) >> PFN_BITS;
        if too_wide != 0 {
            return Err(AddressingError::AddressTooWide(too_wide << PFN_BITS).into());
        }
        let addressing = Self {
            addr_mask,
            addr_pattern,
            group_index_bits,
            group_index_shift,
        };
        let residual = addressing.residual_mask();
        if residual == 0 {
            return Err(AddressingError::EmptyIndexMask.into());
        }
        if residual & residual.wrapping_add(1) != 0 {
            return Err(AddressingError::NonContiguousIndexMask(residual).into());
        }
        if addr_pattern & addressing.window_mask() != 0 {
            return Err(AddressingError::PatternOverlapsMask(addr_pattern).into());
        }
        Ok(addressing)
    }

    /// Creates a new `MsiAddressing` without a group index.
    pub fn flat(addr_mask: u64, addr_pattern: u64) -> Result<Self> {
        Self::new(addr_mask, addr_pattern, 0, 0)
    }

    /// Returns the address mask, in page-number terms.
    pub fn addr_mask(&self) -> u64 {
        self.addr_mask
    }

    /// Returns the address pattern, in page-number terms.
    pub fn addr_pattern(&self) -> u64 {
        self.addr_pattern
    }

    /// Returns the width of the group index field.
    pub fn group_index_bits(&self) -> u8 {
        self.group_index_bits
    }

    /// Returns the byte-address bit position of the group index field.
    pub fn group_index_shift(&self) -> u8 {
        self.group_index_shift
    }

    fn group_mask(&self) -> u64 {
        if self.group_index_bits == 0 {
            0
        } else {
            u64::MAX >> (u64::BITS - self.group_index_bits as u32)
        }
    }

    // Shift of the group index field within a page number.
    fn group_pfn_shift(&self) -> u64 {
        if self.group_index_bits == 0 {
            0
        } else {
            self.group_index_shift as u64 - PFN_SHIFT
        }
    }

    // Page-number bits holding the group index.
    fn group_field_mask(&self) -> u64 {
        self.group_mask() << self.group_pfn_shift()
    }

    // Page-number bits which vary within the domain's MSI window.
    pub(crate) fn window_mask(&self) -> u64 {
        self.addr_mask | self.group_field_mask()
    }

    // Page-number bits which index directly into the table.
    fn residual_mask(&self) -> u64 {
        self.addr_mask & !self.group_field_mask()
    }

    // Number of index bits below the packed group index.
    fn residual_bits(&self) -> u32 {
        u64::BITS - self.residual_mask().leading_zeros()
    }

    fn index_for_pfn(&self, pfn: u64) -> u64 {
        let residual = pfn & self.residual_mask();
        if self.group_index_bits == 0 {
            return residual;
        }
        let group = (pfn >> self.group_pfn_shift()) & self.group_mask();
        residual | (group << self.residual_bits())
    }

    /// Returns if `addr` is within the MSI address window described by `self`.
    pub fn contains(&self, addr: GuestPhysAddr) -> bool {
        (addr.pfn().bits() & !self.window_mask()) == self.addr_pattern
    }

    /// Returns the MSI page table index for `addr`, or `None` if `addr` isn't within the MSI
    /// address window.
    pub fn index_of(&self, addr: GuestPhysAddr) -> Option<MsiPageTableIndex> {
        if !self.contains(addr) {
            return None;
        }
        let index = self.index_for_pfn(addr.pfn().bits());
        Some(MsiPageTableIndex(usize::try_from(index).ok()?))
    }

    /// Returns the number of entries an MSI page table for `self` must hold: one more than the
    /// index of the highest page in the window. At most `1 << PFN_BITS`.
    pub fn table_entries(&self) -> u64 {
        self.index_for_pfn(self.addr_pattern | self.window_mask()) + 1
    }

    /// Returns the guest physical address windows which must be reserved for MSI delivery, one
    /// per group index value. Every window lies below `1 << PHYS_ADDR_BITS`.
    pub fn reserved_windows(&self) -> impl Iterator<Item = ReservedWindow> {
        let base = self.addr_pattern << PFN_SHIFT;
        let len = (self.residual_mask() + 1) << PFN_SHIFT;
        let shift = self.group_index_shift;
        let groups = self.group_mask() + 1;
        (0..groups).map(move |g| ReservedWindow {
            base: RawAddr::guest(base | (g << shift)),
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn guest_page(pfn: u64) -> GuestPhysAddr {
        RawAddr::guest(pfn << PFN_SHIFT)
    }

    #[test]
    fn flat_index() {
        let addressing = MsiAddressing::flat(0xff, 0x1200).unwrap();
        assert_eq!(addressing.table_entries(), 256);
        let index = addressing.index_of(guest_page(0x1205)).unwrap();
        assert_eq!(index.bits(), 5);
        // The page offset doesn't take part in indexing.
        let index = addressing
            .index_of(RawAddr::guest((0x1205 << PFN_SHIFT) | 0xffc))
            .unwrap();
        assert_eq!(index.bits(), 5);
    }

    #[test]
    fn grouped_index() {
        // Group index in bits 6-7 of the page number.
        let addressing = MsiAddressing::new(0x3f, 0x10_0000, 2, 12 + 6).unwrap();
        let pfn = 0x10_0000 | (0b10 << 6) | 0b000101;
        assert_eq!(addressing.index_of(guest_page(pfn)).unwrap().bits(), 133);
        assert_eq!(addressing.table_entries(), 256);

        // Same layout, with the group bits included in the mask as a device context would have
        // them.
        let wide = MsiAddressing::new(0xff, 0x10_0000, 2, 12 + 6).unwrap();
        assert_eq!(wide.index_of(guest_page(pfn)).unwrap().bits(), 133);
        assert_eq!(wide.table_entries(), 256);
    }

    #[test]
    fn group_far_above_index() {
        // 8 interrupt files per group with groups 16MB apart.
        let addressing = MsiAddressing::new(0x7, 0x2_8000, 3, 24).unwrap();
        assert_eq!(addressing.table_entries(), 64);
        let pfn = 0x2_8000 | (5 << 12) | 3;
        assert_eq!(addressing.index_of(guest_page(pfn)).unwrap().bits(), (5 << 3) | 3);
        // Bits between the index and the group field must match the pattern.
        assert!(addressing.index_of(guest_page(pfn | 0x10)).is_none());
    }

    #[test]
    fn window_rejection() {
        let addressing = MsiAddressing::flat(0xff, 0x1200).unwrap();
        assert!(addressing.index_of(guest_page(0x1305)).is_none());
        assert!(addressing.index_of(guest_page(0x05)).is_none());
        assert!(!addressing.contains(guest_page(0x2205)));
    }

    #[test]
    fn invalid_addressing() {
        assert_eq!(
            MsiAddressing::flat(0, 0x1200),
            Err(Error::InvalidAddressing(AddressingError::EmptyIndexMask))
        );
        assert_eq!(
            MsiAddressing::flat(0xf0f, 0x1000),
            Err(Error::InvalidAddressing(
                AddressingError::NonContiguousIndexMask(0xf0f)
            ))
        );
        assert_eq!(
            MsiAddressing::flat(0xff, 0x1280),
            Err(Error::InvalidAddressing(AddressingError::PatternOverlapsMask(
                0x1280
            )))
        );
        assert_eq!(
            MsiAddressing::new(0xff, 0x1000, 2, 8),
            Err(Error::InvalidAddressing(
                AddressingError::GroupShiftBelowPage(8)
            ))
        );
        assert_eq!(
            MsiAddressing::new(0xff, 0x1000, 4, 62),
            Err(Error::InvalidAddressing(
                AddressingError::GroupFieldOverflow(4, 62)
            ))
        );
        assert_eq!(
            MsiAddressing::flat(u64::MAX, 0),
            Err(Error::InvalidAddressing(AddressingError::AddressTooWide(
                u64::MAX << PFN_BITS
            )))
        );
        assert_eq!(
            MsiAddressing::flat(0xff, 1 << 50),
            Err(Error::InvalidAddressing(AddressingError::AddressTooWide(
                1 << 50
            )))
        );
        assert_eq!(
            MsiAddressing::new(0xff, 0x1000, 4, 54),
            Err(Error::InvalidAddressing(
                AddressingError::GroupFieldOverflow(4, 54)
            ))
        );
        // Group field punching a hole in the middle of the mask.
        assert!(MsiAddressing::new(0xfff, 0x10000, 2, 12 + 4).is_err());
        // Group field covering the whole mask.
        assert_eq!(
            MsiAddressing::new(0x3, 0x1000, 2, 12),
            Err(Error::InvalidAddressing(AddressingError::EmptyIndexMask))
        );
        // Pattern with bits set in the group field.
        assert!(MsiAddressing::new(0x3f, 0x1080, 2, 18).is_err());
    }

    #[test]
    fn reserved_windows_per_group() {
        let addressing = MsiAddressing::new(0x3f, 0x10_0000, 2, 18).unwrap();
        let windows: Vec<_> = addressing.reserved_windows().collect();
        assert_eq!(windows.len(), 4);
        for (g, w) in windows.iter().enumerate() {
            assert_eq!(w.base.bits(), 0x1_0000_0000 | ((g as u64) << 18));
            assert_eq!(w.len, 64 * PAGE_SIZE_4K);
        }

        let flat = MsiAddressing::flat(0xff, 0x1200).unwrap();
        let windows: Vec<_> = flat.reserved_windows().collect();
        assert_eq!(
            windows,
            [ReservedWindow {
                base: RawAddr::guest(0x120_0000),
                len: 256 * PAGE_SIZE_4K,
            }]
        );
    }

    #[test]
    fn widest_window() {
        let mask = (1u64 << PFN_BITS) - 1;
        let addressing = MsiAddressing::flat(mask, 0).unwrap();
        assert_eq!(addressing.table_entries(), 1 << PFN_BITS);
        let windows: Vec<_> = addressing.reserved_windows().collect();
        assert_eq!(
            windows,
            [ReservedWindow {
                base: RawAddr::guest(0),
                len: 1 << PHYS_ADDR_BITS,
            }]
        );
        let top = guest_page(mask);
        assert_eq!(addressing.index_of(top).unwrap().bits() as u64, mask);
        assert!(addressing.index_of(guest_page(1 << PFN_BITS)).is_none());

        // Widest grouped layout: the group field ends at the last physical address bit.
        let grouped = MsiAddressing::new(0xff, 0, 4, (PHYS_ADDR_BITS - 4) as u8).unwrap();
        assert_eq!(grouped.table_entries(), 16 << 8);
        assert_eq!(grouped.reserved_windows().count(), 16);
    }

    // Generates valid addressing parameters: an index of 1-8 bits, optionally followed (after a
    // gap) by a group field of 1-3 bits that may or may not be included in the mask.
    fn addressing_params() -> impl Strategy<Value = (MsiAddressing, u64)> {
        (1u32..=8, 0u8..=3, 0u32..=4, any::<bool>(), 1u64..0x100).prop_map(
            |(index_bits, group_bits, gap, group_in_mask, pattern_hi)| {
                let residual = (1u64 << index_bits) - 1;
                let group_pfn_shift = index_bits + gap;
                let group_field = if group_bits == 0 {
                    0
                } else {
                    ((1u64 << group_bits) - 1) << group_pfn_shift
                };
                let mask = if group_in_mask && group_bits > 0 {
                    residual | group_field
                } else {
                    residual
                };
                let pattern = pattern_hi << 20;
                let shift = if group_bits == 0 {
                    0
                } else {
                    (group_pfn_shift + 12) as u8
                };
                let addressing = MsiAddressing::new(mask, pattern, group_bits, shift).unwrap();
                (addressing, mask | group_field)
            },
        )
    }

    proptest! {
        #[test]
        fn index_is_dense((addressing, window) in addressing_params()) {
            let entries = addressing.table_entries();
            let mut seen = HashSet::new();
            // Walk every page in the window, i.e. every subset of the window bits.
            let mut sub = 0u64;
            loop {
                let pfn = addressing.addr_pattern() | sub;
                let index = addressing.index_of(guest_page(pfn)).unwrap().bits() as u64;
                prop_assert!(index < entries);
                prop_assert!(seen.insert(index));
                if sub == window {
                    break;
                }
                sub = (sub.wrapping_sub(window)) & window;
            }
            prop_assert_eq!(seen.len() as u64, entries);
        }

        #[test]
        fn outside_window_rejected((addressing, window) in addressing_params(), stray in 20u32..40) {
            let pfn = (addressing.addr_pattern() | window) ^ (1u64 << stray);
            prop_assume!((1u64 << stray) & window == 0);
            prop_assert!(addressing.index_of(guest_page(pfn)).is_none());
        }
    }
}
