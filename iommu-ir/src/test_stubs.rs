// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::vec::Vec;
use sync::Mutex;

use crate::addr::*;
use crate::command::{Command, CommandKind};
use crate::instance::*;
use crate::msi_page_table::{MsiPageAllocator, TablePages};

fn table_layout(count: usize) -> Layout {
    let size = count * PAGE_SIZE_4K as usize;
    let align = count.next_power_of_two() * PAGE_SIZE_4K as usize;
    // Not fallible for the page counts used in tests.
    Layout::from_size_align(size, align).unwrap()
}

/// Hands out heap memory as MSI page table pages and keeps count of what's outstanding.
#[derive(Default)]
pub struct StubPageAllocator {
    exhausted: AtomicBool,
    allocations: AtomicUsize,
    live: Mutex<BTreeMap<u64, usize>>,
}

impl StubPageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent allocations fail (or succeed again).
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Relaxed);
    }

    /// Number of successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of pages allocated and not yet freed.
    pub fn live_pages(&self) -> usize {
        self.live.lock().values().sum()
    }
}

impl MsiPageAllocator for StubPageAllocator {
    fn alloc_pages(&self, count: usize, _numa_node: Option<u32>) -> Option<TablePages> {
        if self.exhausted.load(Ordering::Relaxed) || count == 0 {
            return None;
        }
        // Not safe - just a test. Garbage is written first so that tables have to clear their
        // entries.
        let base = unsafe {
            let ptr = alloc_zeroed(table_layout(count));
            if ptr.is_null() {
                return None;
            }
            ptr.write_bytes(0xa5, count * PAGE_SIZE_4K as usize);
            ptr as u64
        };
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(base, count);
        Some(unsafe { TablePages::new(RawAddr::supervisor(base), count) })
    }

    fn free_pages(&self, pages: TablePages) {
        let count = self
            .live
            .lock()
            .remove(&pages.base().bits())
            .expect("freeing pages that weren't allocated");
        assert_eq!(count, pages.count());
        unsafe { dealloc(pages.base().bits() as *mut u8, table_layout(count)) };
    }
}

/// An IOMMU whose command queue records submitted commands. Completion either succeeds at once
/// or, while the instance is hung, times out.
pub struct StubIommu {
    id: InstanceId,
    caps: IommuCapabilities,
    hung: AtomicBool,
    commands: Mutex<Vec<Command>>,
    waits: Mutex<Vec<CommandHandle>>,
}

impl StubIommu {
    /// Creates an instance that supports flat MSI page tables.
    pub fn new(id: u32) -> Arc<Self> {
        let mut caps = IommuCapabilities::new(0);
        caps.modify(Capabilities::Version.val(0x10) + Capabilities::Sv48x4::SET);
        caps.modify(Capabilities::MsiFlat::SET);
        Self::with_caps(id, caps)
    }

    /// Creates an instance without MSI page table support.
    pub fn without_msi_flat(id: u32) -> Arc<Self> {
        let mut caps = IommuCapabilities::new(0);
        caps.modify(Capabilities::Version.val(0x10) + Capabilities::Sv48x4::SET);
        Self::with_caps(id, caps)
    }

    fn with_caps(id: u32, caps: IommuCapabilities) -> Arc<Self> {
        Arc::new(Self {
            id: InstanceId::new(id),
            caps,
            hung: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            waits: Mutex::new(Vec::new()),
        })
    }

    /// Makes the instance stop (or resume) completing commands.
    pub fn set_hang(&self, hung: bool) {
        self.hung.store(hung, Ordering::Relaxed);
    }

    /// All commands submitted so far.
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// The `IOTINVAL.GVMA` commands submitted so far.
    pub fn invalidations(&self) -> Vec<Command> {
        self.commands()
            .into_iter()
            .filter(|c| c.kind() == CommandKind::IotinvalGvma)
            .collect()
    }

    /// The commands waited upon so far.
    pub fn waits(&self) -> Vec<CommandHandle> {
        self.waits.lock().clone()
    }
}

impl IommuInstance for StubIommu {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn capabilities(&self) -> IommuCapabilities {
        self.caps
    }

    fn submit(&self, cmd: Command) -> CommandHandle {
        let mut commands = self.commands.lock();
        commands.push(cmd);
        CommandHandle::new(commands.len() as u64 - 1)
    }

    fn await_completion(
        &self,
        handle: CommandHandle,
        _timeout: Duration,
    ) -> Result<(), CompletionTimeout> {
        self.waits.lock().push(handle);
        if self.hung.load(Ordering::Relaxed) {
            Err(CompletionTimeout)
        } else {
            Ok(())
        }
    }
}

/// A device directory backed by a map of device IDs to stub IOMMUs.
#[derive(Default)]
pub struct StubDirectory {
    owners: Mutex<BTreeMap<DeviceId, Arc<StubIommu>>>,
}

impl StubDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `device` behind `iommu`.
    pub fn add(&self, device: DeviceId, iommu: &Arc<StubIommu>) {
        self.owners.lock().insert(device, iommu.clone());
    }
}

impl DeviceDirectory for StubDirectory {
    fn owning_instance(&self, device: DeviceId) -> Option<Arc<dyn IommuInstance>> {
        let iommu = self.owners.lock().get(&device)?.clone();
        Some(iommu)
    }
}
