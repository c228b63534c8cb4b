// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use log::trace;
use static_assertions::const_assert;
use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

use crate::addr::*;
use crate::config::RemapConfig;
use crate::error::*;
use crate::geometry::{MsiAddressing, MsiPageTableIndex};

register_bitfields![u64,
    MsiPteFields [
        Valid OFFSET(0) NUMBITS(1) [],
        Mode OFFSET(1) NUMBITS(2) [
            Mrif = 1,
            Flat = 3
        ],
        Ppn OFFSET(10) NUMBITS(44) [],
    ],

    MsiTablePointerFields [
        Ppn OFFSET(0) NUMBITS(44) [],
        Mode OFFSET(60) NUMBITS(4) [
            Off = 0,
            Flat = 1
        ],
    ],
];

const MSI_PTE_PPN_BITS: u32 = 44;

/// How an MSI page-table entry translates writes to its page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsiPteMode {
    /// The entry has never been written; writes to the page aren't translated.
    Untranslated,
    /// Writes are forwarded to the target page ("write-through" mode).
    Translated,
    /// A mode this table doesn't produce, e.g. memory-resident interrupt files.
    Reserved,
}

/// The value of an MSI page-table entry. Only the first doubleword of an entry is used in
/// write-through mode, so this is the whole of an entry's meaningful state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiPteValue(u64);

impl MsiPteValue {
    /// An entry that doesn't translate anything.
    pub const INVALID: MsiPteValue = MsiPteValue(0);

    /// Returns a valid write-through entry forwarding writes to `target`.
    pub fn translated(target: SupervisorPfn) -> Result<Self> {
        if target.bits() >> MSI_PTE_PPN_BITS != 0 {
            return Err(Error::InvalidTargetPage(target.bits()));
        }
        let mut pte = LocalRegisterCopy::<u64, MsiPteFields::Register>::new(0);
        pte.modify(
            MsiPteFields::Valid::SET + MsiPteFields::Mode::Flat + MsiPteFields::Ppn.val(target.bits()),
        );
        Ok(Self(pte.get()))
    }

    /// Creates an entry value from its raw bits.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits of this entry.
    pub fn bits(&self) -> u64 {
        self.0
    }

    fn fields(&self) -> LocalRegisterCopy<u64, MsiPteFields::Register> {
        LocalRegisterCopy::new(self.0)
    }

    /// Returns if the entry is valid.
    pub fn valid(&self) -> bool {
        self.fields().is_set(MsiPteFields::Valid)
    }

    /// Returns the translation mode of the entry.
    pub fn mode(&self) -> MsiPteMode {
        match self.fields().read(MsiPteFields::Mode) {
            0 => MsiPteMode::Untranslated,
            3 => MsiPteMode::Translated,
            _ => MsiPteMode::Reserved,
        }
    }

    /// Returns the page writes are forwarded to.
    pub fn target(&self) -> SupervisorPfn {
        Pfn::supervisor(self.fields().read(MsiPteFields::Ppn))
    }
}

// An MSI page-table entry as laid out in memory. The second doubleword is only used by the
// memory-resident interrupt file (MRIF) format and stays zero.
#[repr(C)]
struct MsiPte {
    pte: AtomicU64,
    mrif: AtomicU64,
}

const_assert!(core::mem::size_of::<MsiPte>() == 16);

impl MsiPte {
    fn load(&self) -> MsiPteValue {
        MsiPteValue(self.pte.load(Ordering::Acquire))
    }

    // Replaces the entry with `val` in a single store, returning the previous value.
    fn swap(&self, val: MsiPteValue) -> MsiPteValue {
        MsiPteValue(self.pte.swap(val.bits(), Ordering::AcqRel))
    }

    fn clear(&self) {
        self.pte.store(0, Ordering::Relaxed);
        self.mrif.store(0, Ordering::Relaxed);
    }
}

/// A run of physically contiguous 4kB pages handed out by an `MsiPageAllocator`.
#[derive(Debug)]
pub struct TablePages {
    base: SupervisorPhysAddr,
    count: usize,
}

impl TablePages {
    /// Creates a `TablePages` covering `count` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be 4kB-aligned and the `count` pages starting at `base` must be accessible at
    /// the same address and uniquely owned by the returned `TablePages` until they are given back
    /// through `MsiPageAllocator::free_pages()`.
    pub unsafe fn new(base: SupervisorPhysAddr, count: usize) -> Self {
        Self { base, count }
    }

    /// Returns the address of the first page.
    pub fn base(&self) -> SupervisorPhysAddr {
        self.base
    }

    /// Returns the number of pages.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the length of the run in bytes.
    pub fn length_bytes(&self) -> u64 {
        self.count as u64 * PAGE_SIZE_4K
    }
}

/// Provides the host memory backing MSI page tables.
pub trait MsiPageAllocator: Send + Sync {
    /// Allocates `count` contiguous pages, preferably from `numa_node`. The run must be aligned
    /// to its size rounded up to a power of two.
    fn alloc_pages(&self, count: usize, numa_node: Option<u32>) -> Option<TablePages>;

    /// Returns pages previously obtained from `alloc_pages()`.
    fn free_pages(&self, pages: TablePages);
}

/// The value of the MSI table pointer and address matching fields a device context must be
/// programmed with to translate MSIs through an `MsiPageTable`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiTablePointer {
    /// The `msiptp` field: table PPN and mode.
    pub msiptp: u64,
    /// Page-number bits which select an entry.
    pub msi_addr_mask: u64,
    /// Page-number bits identifying the MSI window.
    pub msi_addr_pattern: u64,
}

/// An MSI page table. Used by the IOMMU to provide translation for incoming MSI writes from a PCI
/// device. MSI page tables have a flat structure with each entry providing translation for one
/// 4kB page: from the guest physical address of an interrupt file to the supervisor physical
/// address of that file.
///
/// Entries are read and written with single atomic accesses, so lookups may run concurrently
/// with updates and never observe a partially written entry. Updating an entry doesn't
/// invalidate copies of it cached by IOMMUs; that is up to the owner of the table.
pub struct MsiPageTable {
    base: SupervisorPhysAddr,
    num_pages: usize,
    num_entries: usize,
    addressing: MsiAddressing,
    allocator: Arc<dyn MsiPageAllocator>,
}

impl MsiPageTable {
    /// Returns the required size in bytes for an MSI page table with the specified addressing,
    /// or an error if it would exceed `max_pages`. The page table must also be aligned to this
    /// size.
    pub fn required_table_size(addressing: &MsiAddressing, max_pages: usize) -> Result<u64> {
        let entries = addressing.table_entries();
        let bytes = entries
            .checked_mul(core::mem::size_of::<MsiPte>() as u64)
            .ok_or(Error::MsiTableTooLarge(entries))?;
        let size = core::cmp::max(PAGE_SIZE_4K, bytes);
        if size > (max_pages as u64).saturating_mul(PAGE_SIZE_4K) {
            return Err(Error::MsiTableTooLarge(entries));
        }
        Ok(size)
    }

    /// Allocates a new `MsiPageTable` translating addresses according to `addressing`, with
    /// every entry invalid.
    pub fn allocate(
        addressing: MsiAddressing,
        allocator: Arc<dyn MsiPageAllocator>,
        config: &RemapConfig,
    ) -> Result<Self> {
        let table_size = Self::required_table_size(&addressing, config.max_table_pages)?;
        let num_pages = (table_size / PAGE_SIZE_4K) as usize;
        let pages = allocator
            .alloc_pages(num_pages, config.numa_node)
            .ok_or(Error::OutOfPages)?;
        if pages.count() < num_pages {
            allocator.free_pages(pages);
            return Err(Error::OutOfPages);
        }
        if !pages.base().is_aligned(table_size) {
            allocator.free_pages(pages);
            return Err(Error::MisalignedMsiTablePages);
        }
        let TablePages { base, count } = pages;
        let table = Self {
            base,
            num_pages: count,
            // Unwrap ok: the entry count was checked against the table size cap above.
            num_entries: usize::try_from(addressing.table_entries()).unwrap(),
            addressing,
            allocator,
        };
        for pte in table.ptes() {
            pte.clear();
        }
        Ok(table)
    }

    fn ptes(&self) -> &[MsiPte] {
        // Safety: `self.base` points to `self.num_pages` pages that this table uniquely owns
        // until it's dropped, which is enough to hold `self.num_entries` PTEs. PTEs are only
        // ever accessed atomically.
        unsafe { core::slice::from_raw_parts(self.base.bits() as *const MsiPte, self.num_entries) }
    }

    /// Returns the entry translating `addr`, or `None` if `addr` isn't in the table's MSI window.
    pub fn lookup(&self, addr: GuestPhysAddr) -> Option<MsiPteValue> {
        let index = self.addressing.index_of(addr)?;
        self.entry(index)
    }

    /// Returns the entry at `index`.
    pub fn entry(&self, index: MsiPageTableIndex) -> Option<MsiPteValue> {
        self.ptes().get(index.bits()).map(MsiPte::load)
    }

    /// Points the entry at `index` to `target` and marks it valid, returning the previous value
    /// of the entry. Concurrent lookups see either the previous or the new entry.
    ///
    /// `preserve_context` requests that the interrupt file context survive the retarget. The
    /// write-through format has nowhere to record it.
    pub fn update(
        &self,
        index: MsiPageTableIndex,
        target: SupervisorPfn,
        preserve_context: bool,
    ) -> Result<MsiPteValue> {
        let pte = self
            .ptes()
            .get(index.bits())
            .ok_or(Error::MsiIndexOutOfRange(index.bits()))?;
        let new = MsiPteValue::translated(target)?;
        let old = pte.swap(new);
        trace!(
            "MSI PTE {} at {:?}: {:#x} -> {:#x} (preserve context: {})",
            index.bits(),
            self.base,
            old.bits(),
            new.bits(),
            preserve_context
        );
        Ok(old)
    }

    /// Returns the base physical address of this page table.
    pub fn base_address(&self) -> SupervisorPhysAddr {
        self.base
    }

    /// Returns the number of entries in this page table.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Returns the addressing used to define the input to this page table.
    pub fn addressing(&self) -> &MsiAddressing {
        &self.addressing
    }

    /// Returns the table pointer and MSI address matching values for device contexts using this
    /// page table.
    pub fn pointer(&self) -> MsiTablePointer {
        let mut msiptp = LocalRegisterCopy::<u64, MsiTablePointerFields::Register>::new(0);
        msiptp.modify(
            MsiTablePointerFields::Ppn.val(self.base.pfn().bits())
                + MsiTablePointerFields::Mode::Flat,
        );
        MsiTablePointer {
            msiptp: msiptp.get(),
            msi_addr_mask: self.addressing.window_mask(),
            msi_addr_pattern: self.addressing.addr_pattern(),
        }
    }
}

impl Drop for MsiPageTable {
    fn drop(&mut self) {
        // Safety: We uniquely own the pages and nothing borrowed from them outlives `self`.
        let pages = unsafe { TablePages::new(self.base, self.num_pages) };
        self.allocator.free_pages(pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::StubPageAllocator;

    fn stub_table(addressing: MsiAddressing) -> (MsiPageTable, Arc<StubPageAllocator>) {
        let allocator = Arc::new(StubPageAllocator::new());
        let table =
            MsiPageTable::allocate(addressing, allocator.clone(), &RemapConfig::default()).unwrap();
        (table, allocator)
    }

    #[test]
    fn pte_encoding() {
        let pte = MsiPteValue::translated(Pfn::supervisor(0x9000)).unwrap();
        assert_eq!(pte.bits(), (0x9000 << 10) | 0b111);
        assert!(pte.valid());
        assert_eq!(pte.mode(), MsiPteMode::Translated);
        assert_eq!(pte.target(), Pfn::supervisor(0x9000));

        assert!(!MsiPteValue::INVALID.valid());
        assert_eq!(MsiPteValue::INVALID.mode(), MsiPteMode::Untranslated);
        // MRIF-mode entry.
        assert_eq!(MsiPteValue::from_bits(0b011).mode(), MsiPteMode::Reserved);

        assert_eq!(
            MsiPteValue::translated(Pfn::supervisor(1 << 44)),
            Err(Error::InvalidTargetPage(1 << 44))
        );
    }

    #[test]
    fn update_and_lookup() {
        let addressing = MsiAddressing::flat(0xff, 0x1200).unwrap();
        let (table, _allocator) = stub_table(addressing);
        assert_eq!(table.num_entries(), 256);
        let guest = Pfn::guest(0x1205).addr();
        let index = addressing.index_of(guest).unwrap();
        assert_eq!(table.lookup(guest), Some(MsiPteValue::INVALID));

        let old = table.update(index, Pfn::supervisor(0x9000), false).unwrap();
        assert_eq!(old, MsiPteValue::INVALID);
        let pte = table.lookup(guest).unwrap();
        assert!(pte.valid());
        assert_eq!(pte.mode(), MsiPteMode::Translated);
        assert_eq!(pte.target(), Pfn::supervisor(0x9000));

        // Neighbouring entries are untouched.
        let next = table.lookup(Pfn::guest(0x1206).addr()).unwrap();
        assert!(!next.valid());

        // Outside the window.
        assert_eq!(table.lookup(Pfn::guest(0x1305).addr()), None);
    }

    #[test]
    fn table_size_cap() {
        // 512 entries fill exactly two pages.
        let addressing = MsiAddressing::flat(0x1ff, 0x1000).unwrap();
        assert_eq!(
            MsiPageTable::required_table_size(&addressing, 2),
            Ok(2 * PAGE_SIZE_4K)
        );
        let addressing = MsiAddressing::flat(0x3ff, 0x1000).unwrap();
        assert_eq!(
            MsiPageTable::required_table_size(&addressing, 2),
            Err(Error::MsiTableTooLarge(1024))
        );
        let allocator = Arc::new(StubPageAllocator::new());
        assert_eq!(
            MsiPageTable::allocate(addressing, allocator.clone(), &RemapConfig::default()).err(),
            Some(Error::MsiTableTooLarge(1024))
        );
        assert_eq!(allocator.allocations(), 0);

        // Small tables still take a whole page.
        let addressing = MsiAddressing::flat(0x7, 0x1000).unwrap();
        assert_eq!(
            MsiPageTable::required_table_size(&addressing, 2),
            Ok(PAGE_SIZE_4K)
        );

        // Widest window a physical address allows.
        let addressing = MsiAddressing::flat((1 << PFN_BITS) - 1, 0).unwrap();
        assert_eq!(
            MsiPageTable::required_table_size(&addressing, 2),
            Err(Error::MsiTableTooLarge(1 << PFN_BITS))
        );
        assert_eq!(
            MsiPageTable::required_table_size(&addressing, usize::MAX),
            Ok(16 << PFN_BITS)
        );
    }

    #[test]
    fn allocation_failure() {
        let allocator = Arc::new(StubPageAllocator::new());
        allocator.set_exhausted(true);
        let addressing = MsiAddressing::flat(0xff, 0x1200).unwrap();
        assert_eq!(
            MsiPageTable::allocate(addressing, allocator, &RemapConfig::default()).err(),
            Some(Error::OutOfPages)
        );
    }

    #[test]
    fn pages_released_on_drop() {
        let addressing = MsiAddressing::new(0x3f, 0x10_0000, 2, 18).unwrap();
        let (table, allocator) = stub_table(addressing);
        assert_eq!(table.num_entries(), 256);
        assert_eq!(allocator.live_pages(), 1);
        drop(table);
        assert_eq!(allocator.live_pages(), 0);
    }

    #[test]
    fn table_pointer() {
        let addressing = MsiAddressing::new(0x3f, 0x10_0000, 2, 18).unwrap();
        let (table, _allocator) = stub_table(addressing);
        let pointer = table.pointer();
        assert_eq!(
            pointer.msiptp,
            (1 << 60) | table.base_address().pfn().bits()
        );
        assert_eq!(pointer.msi_addr_mask, 0xff);
        assert_eq!(pointer.msi_addr_pattern, 0x10_0000);
    }

    #[test]
    fn no_torn_reads() {
        let addressing = MsiAddressing::flat(0xff, 0x1200).unwrap();
        let (table, _allocator) = stub_table(addressing);
        let guest = Pfn::guest(0x1205).addr();
        let index = addressing.index_of(guest).unwrap();
        let targets: [u64; 4] = [0x9000, 0xa_5a5a, 0xfff_ffff_ffff, 0x1];
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20_000 {
                    let target = Pfn::supervisor(targets[i % targets.len()]);
                    table.update(index, target, false).unwrap();
                }
            });
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..20_000 {
                        let pte = table.lookup(guest).unwrap();
                        if pte.valid() {
                            assert_eq!(pte.mode(), MsiPteMode::Translated);
                            assert!(targets.contains(&pte.target().bits()));
                        } else {
                            assert_eq!(pte, MsiPteValue::INVALID);
                        }
                    }
                });
            }
        });
    }
}
