// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Synchronization primitives.
//!
//! Synchronization primitves like mutexes and read/write-locks that are
//! usable in bare-metal environments. Locks are those supported by the
//! `spin` crate; `RcuCell` layers snapshot publication on top of them for
//! read-mostly data that must stay readable while it's being replaced.
//! `RcuBox` is for data read from contexts that must never spin, such as
//! interrupt handlers.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};

pub use spin::{Mutex, MutexGuard, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A read-mostly cell holding an immutable snapshot of `T`.
///
/// Readers take a reference-counted snapshot with `read()` and may keep using it for as long as
/// they like; the read lock is only held long enough to bump the reference count. Writers build
/// a complete new value and swap it in with `publish()`. A replaced snapshot is reclaimed once
/// the last reader holding it drops its reference, so a reader never observes a value that is
/// partially constructed or already freed.
pub struct RcuCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> RcuCell<T> {
    /// Creates a new `RcuCell` with `val` as the initial snapshot.
    pub fn new(val: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(val)),
        }
    }

    /// Returns the current snapshot.
    pub fn read(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Replaces the current snapshot with `val`, returning the previous one.
    pub fn publish(&self, val: T) -> Arc<T> {
        let new = Arc::new(val);
        core::mem::replace(&mut *self.current.write(), new)
    }
}

impl<T: Default> Default for RcuCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// An optional boxed value whose readers never block.
///
/// A reader announces itself in the counter of the current epoch, loads the current pointer and
/// uses the value through an `RcuReadGuard`. `replace()` swaps in a new value, moves new readers
/// to the other epoch's counter and waits for the old epoch's readers to leave before handing
/// back the previous value, so a value is never freed while it's in use and a steady stream of
/// readers can't hold up a writer. Readers don't wait on writers, so `read()` is safe from
/// interrupt context even when the interrupted code is in the middle of `replace()`.
pub struct RcuBox<T> {
    ptr: AtomicPtr<T>,
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
    writer: Mutex<()>,
}

// Safety: `RcuBox` owns its value like a `Box`, and shares it across threads like an `Arc`.
unsafe impl<T: Send + Sync> Send for RcuBox<T> {}
unsafe impl<T: Send + Sync> Sync for RcuBox<T> {}

impl<T> RcuBox<T> {
    const fn with_ptr(ptr: *mut T) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr),
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: Mutex::new(()),
        }
    }

    /// Creates an empty `RcuBox`.
    pub const fn empty() -> Self {
        Self::with_ptr(ptr::null_mut())
    }

    /// Creates an `RcuBox` holding `val`.
    pub fn new(val: T) -> Self {
        Self::with_ptr(Box::into_raw(Box::new(val)))
    }

    /// Returns a guard giving access to the current value. Never blocks.
    pub fn read(&self) -> RcuReadGuard<'_, T> {
        let readers = &self.readers[self.epoch.load(Ordering::SeqCst) & 1];
        // The count must be visible before the pointer is loaded; pairs with the swap and the
        // count load in `replace()`.
        readers.fetch_add(1, Ordering::SeqCst);
        let ptr = self.ptr.load(Ordering::SeqCst);
        RcuReadGuard { ptr, readers }
    }

    /// Replaces the value with `val` and returns the previous one once no reader can still be
    /// using it.
    ///
    /// Spins until the readers that may have seen the previous value are gone, so it must not be
    /// called while the calling thread holds an `RcuReadGuard` from this `RcuBox`.
    pub fn replace(&self, val: Option<T>) -> Option<Box<T>> {
        let _writer = self.writer.lock();
        let new = val.map_or(ptr::null_mut(), |v| Box::into_raw(Box::new(v)));
        let old = self.ptr.swap(new, Ordering::SeqCst);
        // A reader that loaded `old` registered in the current epoch before the swap.
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) & 1;
        while self.readers[epoch].load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
        if old.is_null() {
            None
        } else {
            // Safety: `old` came from `Box::into_raw()` and was unpublished by the swap above.
            // Every reader that loaded it has since dropped its guard.
            Some(unsafe { Box::from_raw(old) })
        }
    }
}

impl<T> Default for RcuBox<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for RcuBox<T> {
    fn drop(&mut self) {
        let ptr = *self.ptr.get_mut();
        if !ptr.is_null() {
            // Safety: We have exclusive access, so no guards are alive.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// Read access to the value of an `RcuBox`. The value stays alive until the guard is dropped.
pub struct RcuReadGuard<'a, T> {
    ptr: *const T,
    readers: &'a AtomicUsize,
}

impl<T> RcuReadGuard<'_, T> {
    /// Returns the value, or `None` if the `RcuBox` was empty when the guard was taken.
    pub fn get(&self) -> Option<&T> {
        // Safety: The pointer is either null or points to a value that `replace()` won't free
        // until our reader count is released in `drop()`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for RcuReadGuard<'_, T> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Orders preceeding memory stores with respect to succeeding memory stores, including stores
/// made on behalf of this CPU by a device (e.g. a command written to a queue).
pub fn dma_wmb() {
    fence(Ordering::Release);
}
