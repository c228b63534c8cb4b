// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use log::{debug, error, warn};

use crate::addr::SupervisorPfn;
use crate::bindings::BindingRegistry;
use crate::command::Command;
use crate::config::IOTINVAL_TIMEOUT;
use crate::error::*;
use crate::gscid::GscId;
use crate::instance::{CommandHandle, IommuInstance, InstanceId};

/// Flushes cached MSI page-table entries of a protection domain from every IOMMU instance one of
/// its devices sits behind.
///
/// Invalidation runs in two passes over a single snapshot of the domain's bindings. The first
/// pass queues an `IOTINVAL.GVMA` followed by an `IOFENCE.C` on each instance; the second waits
/// for each fence in turn. Every instance therefore works on its invalidation while the others
/// are being issued or waited upon. Bindings to the same instance are adjacent in the registry,
/// so an instance is skipped whenever it matches the previous binding's, and gets exactly one
/// invalidation however many of the domain's devices it owns.
pub struct InvalidationBroadcaster {
    timeout: Duration,
}

impl InvalidationBroadcaster {
    /// Creates a broadcaster waiting up to `timeout` for each instance.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns the per-instance completion timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invalidates the cached translations tagged with `gscid` on every instance in `bindings`,
    /// limited to the entry for `page` if given. Returns the number of instances invalidated.
    ///
    /// An instance that doesn't complete within the timeout doesn't stop the others from being
    /// waited upon; the first instance to time out is reported once all have been.
    pub fn broadcast(
        &self,
        bindings: &BindingRegistry,
        gscid: GscId,
        page: Option<SupervisorPfn>,
    ) -> Result<usize> {
        let mut pending: Vec<(Arc<dyn IommuInstance>, CommandHandle)> = Vec::new();
        let mut prev: Option<InstanceId> = None;
        for binding in bindings.iter() {
            let id = binding.instance_id();
            if prev == Some(id) {
                continue;
            }
            prev = Some(id);
            let Some(instance) = binding.instance() else {
                warn!("IOMMU {:?} released while bound to {}", id, binding.device());
                continue;
            };
            instance.submit(Command::iotinval_gvma(Some(gscid), page));
            let fence = instance.submit(Command::iofence());
            pending.push((instance, fence));
        }

        let mut result = Ok(pending.len());
        for (instance, fence) in pending {
            if instance.await_completion(fence, self.timeout).is_err() {
                error!(
                    "IOMMU {:?} didn't complete invalidation for GSCID {} within {:?}",
                    instance.id(),
                    gscid.bits(),
                    self.timeout
                );
                if result.is_ok() {
                    result = Err(Error::InvalidationTimeout(instance.id()));
                }
            }
        }
        if let Ok(count) = result {
            debug!(
                "Invalidated GSCID {} page {:?} on {} IOMMU(s)",
                gscid.bits(),
                page,
                count
            );
        }
        result
    }
}

impl Default for InvalidationBroadcaster {
    fn default() -> Self {
        Self::new(IOTINVAL_TIMEOUT)
    }
}
