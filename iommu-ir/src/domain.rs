// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayString;
use core::fmt;
use log::{debug, error, info, trace, warn};
use sync::{Mutex, RcuBox};

use crate::addr::*;
use crate::bindings::{Binding, BindingId, BindingRegistry};
use crate::config::RemapConfig;
use crate::error::*;
use crate::geometry::{MsiAddressing, ReservedWindow};
use crate::gscid::GscId;
use crate::instance::{Capabilities, DeviceDirectory, DeviceId};
use crate::invalidate::InvalidationBroadcaster;
use crate::msi_page_table::{MsiPageAllocator, MsiPageTable, MsiPteValue, MsiTablePointer};

/// Lifecycle of a domain's interrupt remapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemapState {
    /// No MSI page table has been allocated yet.
    Uninitialized,
    /// The MSI page table is allocated and its addressing is fixed.
    Active,
    /// The remapping context has been torn down.
    Destroyed,
}

/// The outcome of a successful `set_vcpu_affinity()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AffinityUpdate {
    /// The entry was rewritten and every IOMMU confirmed the invalidation.
    Updated,
    /// The entry already had the requested value; nothing was written or invalidated.
    Unchanged,
    /// The affinity was cleared. The table isn't touched: the entry keeps its previous value
    /// until a later request overwrites it.
    Cleared,
}

/// A request to retarget the interrupt file at a guest physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AffinityRequest {
    guest_addr: GuestPhysAddr,
    host_addr: SupervisorPhysAddr,
    addressing: Option<MsiAddressing>,
    notifier: bool,
    preserve_context: bool,
}

impl AffinityRequest {
    /// Creates a request to deliver MSIs written to `guest_addr` to the interrupt file at
    /// `host_addr`, for a domain using `addressing`.
    pub fn new(
        guest_addr: GuestPhysAddr,
        host_addr: SupervisorPhysAddr,
        addressing: MsiAddressing,
    ) -> Self {
        Self {
            guest_addr,
            host_addr,
            addressing: Some(addressing),
            notifier: false,
            preserve_context: false,
        }
    }

    /// Creates a request clearing the affinity of the interrupt file at `guest_addr` without
    /// installing a replacement.
    pub fn clear(guest_addr: GuestPhysAddr) -> Self {
        Self {
            guest_addr,
            host_addr: RawAddr::supervisor(0),
            addressing: None,
            notifier: false,
            preserve_context: false,
        }
    }

    /// Requests delivery through a memory-resident interrupt file notifier.
    pub fn with_notifier(mut self) -> Self {
        self.notifier = true;
        self
    }

    /// Requests that the guest interrupt file context be kept across the retarget.
    pub fn preserving_context(mut self) -> Self {
        self.preserve_context = true;
        self
    }

    /// Returns the guest physical address of the interrupt file.
    pub fn guest_addr(&self) -> GuestPhysAddr {
        self.guest_addr
    }

    /// Returns the host physical address MSIs are to be delivered to.
    pub fn host_addr(&self) -> SupervisorPhysAddr {
        self.host_addr
    }

    /// Returns the addressing parameters carried by the request, if any.
    pub fn addressing(&self) -> Option<MsiAddressing> {
        self.addressing
    }

    /// Returns if notifier delivery was requested.
    pub fn notifier(&self) -> bool {
        self.notifier
    }

    /// Returns if the guest interrupt file context is to be kept.
    pub fn preserve_context(&self) -> bool {
        self.preserve_context
    }
}

const CONTEXT_NAME_LEN: usize = 32;

/// Identifies the interrupt remapping context of a protection domain. Every device linked to the
/// domain shares the one context, which is named after the first of them.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RemapContextHandle {
    name: ArrayString<CONTEXT_NAME_LEN>,
    gscid: GscId,
}

impl RemapContextHandle {
    fn new(device: DeviceId, gscid: GscId) -> Self {
        let mut name = ArrayString::<CONTEXT_NAME_LEN>::new();
        // Unwrap ok: device IDs always format to 12 characters.
        fmt::write(&mut name, format_args!("IOMMU-IR-{}", device)).unwrap();
        Self { name, gscid }
    }

    /// Returns the name of the context.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the GSCID of the domain the context belongs to.
    pub fn gscid(&self) -> GscId {
        self.gscid
    }
}

impl fmt::Debug for RemapContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemapContextHandle")
            .field("name", &self.name.as_str())
            .field("gscid", &self.gscid.bits())
            .finish()
    }
}

struct DomainInner {
    state: RemapState,
    context: Option<RemapContextHandle>,
    // The domain-wide invalidation following activation hasn't been acknowledged yet.
    flush_pending: bool,
}

/// A protection domain: the set of devices assigned to one VM, translated by a single set of page
/// tables. Holds the domain's MSI page table and drives its affinity state machine.
///
/// Affinity changes, attach and detach of devices, and teardown are serialized by a per-domain
/// lock, so separate domains never contend with each other. `lookup()` takes no lock at all and
/// never waits, so it may be called from interrupt context concurrently with any of them.
pub struct ProtectionDomain {
    gscid: GscId,
    config: RemapConfig,
    allocator: Arc<dyn MsiPageAllocator>,
    directory: Arc<dyn DeviceDirectory>,
    inner: Mutex<DomainInner>,
    table: RcuBox<MsiPageTable>,
    bindings: BindingRegistry,
    broadcaster: InvalidationBroadcaster,
}

impl ProtectionDomain {
    /// Creates a domain tagged with `gscid`. Its MSI page table will be allocated from
    /// `allocator` on first use; `directory` resolves devices to the IOMMU that owns them.
    pub fn new(
        gscid: GscId,
        allocator: Arc<dyn MsiPageAllocator>,
        directory: Arc<dyn DeviceDirectory>,
        config: RemapConfig,
    ) -> Self {
        Self {
            gscid,
            config,
            allocator,
            directory,
            inner: Mutex::new(DomainInner {
                state: RemapState::Uninitialized,
                context: None,
                flush_pending: false,
            }),
            table: RcuBox::empty(),
            bindings: BindingRegistry::new(),
            broadcaster: InvalidationBroadcaster::new(config.invalidation_timeout),
        }
    }

    /// Returns the GSCID of this domain.
    pub fn gscid(&self) -> GscId {
        self.gscid
    }

    /// Returns the lifecycle state of this domain.
    pub fn state(&self) -> RemapState {
        self.inner.lock().state
    }

    /// Returns the remapping context of this domain, if one has been created.
    pub fn context(&self) -> Option<RemapContextHandle> {
        self.inner.lock().context
    }

    /// Returns the devices bound to this domain. Devices are bound and unbound through
    /// `attach_device()`, `detach_device()` and `create_irq_remap_context()`.
    pub fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }

    fn bind(&self, device: DeviceId) -> Result<BindingId> {
        let instance = self
            .directory
            .owning_instance(device)
            .ok_or(Error::UnknownDevice(device))?;
        let id = self.bindings.insert(Binding::new(device, &instance))?;
        debug!(
            "GSCID {}: bound {} behind IOMMU {:?}",
            self.gscid.bits(),
            device,
            instance.id()
        );
        Ok(id)
    }

    /// Binds `device` to this domain, so that it's included in the domain's invalidations.
    pub fn attach_device(&self, device: DeviceId) -> Result<BindingId> {
        let inner = self.inner.lock();
        if inner.state == RemapState::Destroyed {
            return Err(Error::DomainDestroyed);
        }
        self.bind(device)
    }

    /// Unbinds `device` from this domain.
    pub fn detach_device(&self, device: DeviceId) -> Result<()> {
        let _inner = self.inner.lock();
        self.bindings.remove_device(device)?;
        debug!("GSCID {}: unbound {}", self.gscid.bits(), device);
        Ok(())
    }

    /// Creates the interrupt remapping context of this domain for `device`, binding the device if
    /// it isn't already. If the domain already has a context the device is linked to it and the
    /// existing context is returned.
    ///
    /// Fails with `Error::MissingMsiSupport` if the IOMMU owning `device` doesn't support flat MSI
    /// page tables. The device is left unbound and its MSIs aren't remapped; the caller decides
    /// whether to go on without remapping.
    pub fn create_irq_remap_context(&self, device: DeviceId) -> Result<RemapContextHandle> {
        let mut inner = self.inner.lock();
        if inner.state == RemapState::Destroyed {
            return Err(Error::DomainDestroyed);
        }
        let instance = self
            .directory
            .owning_instance(device)
            .ok_or(Error::UnknownDevice(device))?;
        if !instance.capabilities().is_set(Capabilities::MsiFlat) {
            warn!(
                "IOMMU {:?} can't remap interrupts of {}: no flat MSI page table support",
                instance.id(),
                device
            );
            return Err(Error::MissingMsiSupport(instance.id()));
        }
        if !self.bindings.contains(device) {
            self.bindings.insert(Binding::new(device, &instance))?;
        }
        if let Some(context) = inner.context {
            return Ok(context);
        }
        let context = RemapContextHandle::new(device, self.gscid);
        inner.context = Some(context);
        info!("Created {} for GSCID {}", context.name(), self.gscid.bits());
        Ok(context)
    }

    // Allocates and publishes the MSI page table, then flushes whatever the IOMMUs may still
    // hold for this GSCID.
    fn activate(&self, inner: &mut DomainInner, addressing: MsiAddressing) -> Result<()> {
        let table = MsiPageTable::allocate(addressing, self.allocator.clone(), &self.config)?;
        info!(
            "GSCID {}: MSI page table at {:?} with {} entries",
            self.gscid.bits(),
            table.base_address(),
            table.num_entries()
        );
        self.table.replace(Some(table));
        inner.state = RemapState::Active;
        inner.flush_pending = true;
        self.flush_domain(inner)
    }

    // Invalidates every cached entry tagged with this domain's GSCID. Stays pending until all
    // IOMMUs acknowledge it.
    fn flush_domain(&self, inner: &mut DomainInner) -> Result<()> {
        self.broadcaster.broadcast(&self.bindings, self.gscid, None)?;
        inner.flush_pending = false;
        Ok(())
    }

    /// Points the MSI page-table entry for `request.guest_addr()` at `request.host_addr()` and
    /// invalidates it on every IOMMU `device`'s domain is bound to.
    ///
    /// The first request for a domain must carry its addressing parameters; the MSI page table is
    /// allocated then and its addressing can't be changed afterwards. A request without
    /// addressing parameters on an active domain clears the affinity and leaves the table alone.
    ///
    /// If an IOMMU doesn't confirm the invalidation, `Error::UnconfirmedInvalidation` is returned
    /// with the entry already holding the new value. That IOMMU may keep delivering to the old
    /// target until its cached copy of the entry goes away.
    ///
    /// If the domain-wide invalidation issued when the table was allocated timed out, it's retried
    /// by every later request until it succeeds. Nothing is written before then.
    pub fn set_vcpu_affinity(
        &self,
        device: DeviceId,
        request: &AffinityRequest,
    ) -> Result<AffinityUpdate> {
        let mut inner = self.inner.lock();
        if inner.state == RemapState::Destroyed {
            return Err(Error::DomainDestroyed);
        }
        if !self.bindings.contains(device) {
            return Err(Error::DeviceNotBound(device));
        }
        if inner.state == RemapState::Uninitialized {
            let addressing = request.addressing().ok_or(Error::MissingAddressing)?;
            self.activate(&mut inner, addressing)?;
        } else if inner.flush_pending {
            warn!("GSCID {}: retrying domain-wide invalidation", self.gscid.bits());
            self.flush_domain(&mut inner)?;
        }
        // Only replaced with the domain lock held, so the table can't change under us.
        let guard = self.table.read();
        let table = guard.get().ok_or(Error::DomainDestroyed)?;
        match request.addressing() {
            None => {
                // TODO: Invalidate the entry once per-slot users are tracked; until then a
                // cleared slot keeps translating to its last target.
                debug!(
                    "GSCID {}: cleared affinity of {:?}",
                    self.gscid.bits(),
                    request.guest_addr()
                );
                return Ok(AffinityUpdate::Cleared);
            }
            Some(addressing) if *table.addressing() != addressing => {
                error!(
                    "GSCID {}: MSI addressing can't change from {:?} to {:?}",
                    self.gscid.bits(),
                    table.addressing(),
                    addressing
                );
                return Err(Error::AddressingMismatch);
            }
            Some(_) => (),
        }

        let guest_addr = request.guest_addr();
        let index = table
            .addressing()
            .index_of(guest_addr)
            .ok_or(Error::AddressOutsideWindow(guest_addr))?;
        if request.notifier() {
            error!(
                "GSCID {}: notifier delivery requested for {:?}",
                self.gscid.bits(),
                guest_addr
            );
            return Err(Error::NotifierUnsupported);
        }
        let target = request.host_addr().pfn();
        let new = MsiPteValue::translated(target)?;
        if table.entry(index) == Some(new) {
            trace!(
                "GSCID {}: {:?} already targets {:?}",
                self.gscid.bits(),
                guest_addr,
                target
            );
            return Ok(AffinityUpdate::Unchanged);
        }
        table.update(index, target, request.preserve_context())?;
        // The entry must be visible before any IOMMU is told to reload it.
        sync::dma_wmb();
        self.broadcaster
            .broadcast(&self.bindings, self.gscid, Some(target))
            .map_err(|e| match e {
                Error::InvalidationTimeout(instance) => Error::UnconfirmedInvalidation {
                    instance,
                    entry: new,
                },
                e => e,
            })?;
        debug!(
            "GSCID {}: {:?} -> {:?}",
            self.gscid.bits(),
            guest_addr,
            target
        );
        Ok(AffinityUpdate::Updated)
    }

    /// Returns the entry translating `addr`, or `None` if the domain has no MSI page table or
    /// `addr` is outside its window.
    pub fn lookup(&self, addr: GuestPhysAddr) -> Option<MsiPteValue> {
        self.table.read().get()?.lookup(addr)
    }

    /// Returns the addressing of the domain's MSI page table, if it's active.
    pub fn msi_addressing(&self) -> Option<MsiAddressing> {
        self.table.read().get().map(|t| *t.addressing())
    }

    /// Returns the MSI table pointer state device contexts of this domain must be programmed
    /// with, if the MSI page table is active.
    pub fn msi_table_pointer(&self) -> Option<MsiTablePointer> {
        self.table.read().get().map(|t| t.pointer())
    }

    /// Returns the guest physical ranges ordinary DMA mappings of this domain must stay out of:
    /// one per group of the MSI address window. Empty until the MSI page table is active.
    pub fn reserved_address_windows(&self) -> Vec<ReservedWindow> {
        self.table
            .read()
            .get()
            .map(|t| t.addressing().reserved_windows().collect())
            .unwrap_or_default()
    }

    /// Tears down the domain's remapping context, releasing its MSI page table and unbinding every
    /// device. Does nothing if already torn down.
    pub fn teardown_irq_remap_context(&self) {
        let mut inner = self.inner.lock();
        if inner.state == RemapState::Destroyed {
            return;
        }
        // Waits for lookups still reading the table. Its pages are freed on return.
        let table = self.table.replace(None);
        self.bindings.clear();
        inner.context = None;
        inner.state = RemapState::Destroyed;
        inner.flush_pending = false;
        info!(
            "GSCID {}: remapping torn down{}",
            self.gscid.bits(),
            if table.is_some() { ", MSI page table released" } else { "" }
        );
    }
}
