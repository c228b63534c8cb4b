// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use sync::{Mutex, MutexGuard, RcuCell};

use crate::error::*;
use crate::instance::{DeviceId, IommuInstance, InstanceId};

/// Links a device to the IOMMU instance translating for it. The binding doesn't keep either
/// alive; both are owned by the platform's device model.
pub struct Binding {
    device: DeviceId,
    instance_id: InstanceId,
    instance: Weak<dyn IommuInstance>,
}

impl Binding {
    /// Creates a binding of `device` to `instance`.
    pub fn new(device: DeviceId, instance: &Arc<dyn IommuInstance>) -> Self {
        Self {
            device,
            instance_id: instance.id(),
            instance: Arc::downgrade(instance),
        }
    }

    /// Returns the bound device.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Returns the ID of the IOMMU instance owning the device.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Returns the IOMMU instance owning the device, unless it has since been released.
    pub fn instance(&self) -> Option<Arc<dyn IommuInstance>> {
        self.instance.upgrade()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Binding")
            .field("device", &self.device)
            .field("instance", &self.instance_id)
            .finish()
    }
}

/// Identifies a binding in a `BindingRegistry`. IDs of removed bindings are never confused with
/// bindings later stored in the same slot thanks to the generation count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingId {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    binding: Option<Arc<Binding>>,
}

// A type-safe arena of bindings with slot reuse. Removed slots go on a free list and have their
// generation bumped so that stale IDs can be detected.
#[derive(Default)]
struct BindingArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl BindingArena {
    fn insert(&mut self, binding: Arc<Binding>) -> BindingId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.binding = Some(binding);
            BindingId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                binding: Some(binding),
            });
            BindingId {
                index: self.slots.len() - 1,
                generation: 0,
            }
        }
    }

    fn get(&self, id: BindingId) -> Option<&Arc<Binding>> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.binding.as_ref()
    }

    fn remove(&mut self, id: BindingId) -> Option<Arc<Binding>> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let binding = slot.binding.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(binding)
    }
}

#[derive(Default)]
struct RegistryInner {
    arena: BindingArena,
    // Iteration order. Bindings to the same instance are kept adjacent.
    order: Vec<BindingId>,
}

impl RegistryInner {
    fn find_device(&self, device: DeviceId) -> Option<BindingId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.arena.get(*id).map(|b| b.device()) == Some(device))
    }

    fn snapshot(&self) -> Vec<Arc<Binding>> {
        self.order
            .iter()
            .filter_map(|id| self.arena.get(*id).cloned())
            .collect()
    }
}

/// The set of devices bound to a protection domain, each with the IOMMU instance that owns it.
///
/// Iteration works on an immutable snapshot, so it may run concurrently with `insert()` and
/// `remove()`: an iterator sees the bindings present when it was created and keeps removed
/// bindings alive until it's dropped. Bindings are ordered by insertion, except that a new
/// binding to an instance that already has bindings is placed right after them. Walks over the
/// registry therefore visit each instance's bindings as one run.
///
/// Only the owning domain adds and removes bindings, under its own lock; others get read access.
#[derive(Default)]
pub struct BindingRegistry {
    inner: Mutex<RegistryInner>,
    published: RcuCell<Vec<Arc<Binding>>>,
}

impl BindingRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `binding` to the registry. Fails if its device is already bound.
    pub(crate) fn insert(&self, binding: Binding) -> Result<BindingId> {
        let mut inner = self.inner.lock();
        if inner.find_device(binding.device()).is_some() {
            return Err(Error::DeviceAlreadyBound(binding.device()));
        }
        let instance_id = binding.instance_id();
        let pos = inner
            .order
            .iter()
            .rposition(|id| inner.arena.get(*id).map(|b| b.instance_id()) == Some(instance_id))
            .map(|p| p + 1)
            .unwrap_or(inner.order.len());
        let id = inner.arena.insert(Arc::new(binding));
        inner.order.insert(pos, id);
        let old = self.published.publish(inner.snapshot());
        drop(inner);
        // Reclaimed here unless an iterator still holds it.
        drop(old);
        Ok(id)
    }

    fn remove_locked(
        &self,
        mut inner: MutexGuard<'_, RegistryInner>,
        id: BindingId,
    ) -> Result<Arc<Binding>> {
        let binding = inner.arena.remove(id).ok_or(Error::StaleBinding)?;
        inner.order.retain(|o| *o != id);
        let old = self.published.publish(inner.snapshot());
        drop(inner);
        drop(old);
        Ok(binding)
    }

    /// Removes the binding identified by `id`, returning it.
    pub(crate) fn remove(&self, id: BindingId) -> Result<Arc<Binding>> {
        self.remove_locked(self.inner.lock(), id)
    }

    /// Removes the binding of `device`, returning it.
    pub(crate) fn remove_device(&self, device: DeviceId) -> Result<Arc<Binding>> {
        let inner = self.inner.lock();
        let id = inner
            .find_device(device)
            .ok_or(Error::DeviceNotBound(device))?;
        self.remove_locked(inner, id)
    }

    /// Removes every binding.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = RegistryInner::default();
        let old = self.published.publish(Vec::new());
        drop(inner);
        drop(old);
    }

    /// Returns the ID of the binding of `device`, if it's bound.
    pub fn find(&self, device: DeviceId) -> Option<BindingId> {
        self.inner.lock().find_device(device)
    }

    /// Returns if `device` is bound.
    pub fn contains(&self, device: DeviceId) -> bool {
        self.iter().any(|b| b.device() == device)
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    /// Returns if there are no bindings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over the current bindings.
    pub fn iter(&self) -> BindingIter {
        BindingIter {
            snapshot: self.published.read(),
            pos: 0,
        }
    }
}

/// An iterator over a snapshot of a `BindingRegistry`.
pub struct BindingIter {
    snapshot: Arc<Vec<Arc<Binding>>>,
    pos: usize,
}

impl Iterator for BindingIter {
    type Item = Arc<Binding>;

    fn next(&mut self) -> Option<Self::Item> {
        let binding = self.snapshot.get(self.pos)?.clone();
        self.pos += 1;
        Some(binding)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.len() - self.pos;
        (remaining, Some(remaining))
    }
}
