// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::addr::{RawAddr, SupervisorPfn};
use crate::gscid::GscId;

/// An entry in an IOMMU command queue. Used to perform translation cache invalidations.
///
/// Note that completion of a particular invalidation command does not guarantee that the
/// invalidation itself has completed; an `IOFENCE.C` command is needed to flush all in-flight
/// commands.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    op: u64,
    addr: u64,
}

const OPCODE_MASK: u64 = 0x7f;
const FUNC3_SHIFT: u64 = 7;
const FUNC3_MASK: u64 = 0x7;

const IOTINVAL_OP: u64 = 0x1;
const IOFENCE_OP: u64 = 0x2;

const GVMA_FUNC: u64 = 0x1;

const AV: u64 = 1 << 11;
const GV: u64 = 1 << 12;
const GSCID_SHIFT: u64 = 40;

/// The kind of a `Command`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Invalidates 2nd-stage (and MSI) translations.
    IotinvalGvma,
    /// Orders completion of preceeding commands.
    IofenceC,
    /// Any other opcode.
    Other(u64),
}

impl Command {
    /// Creates a new `IOTINVAL.GVMA` comamnd for flushing 2nd-stage translation caches, which
    /// include cached MSI page-table entries.
    ///
    /// If `gscid` is not `None`, only translations matching the specified GSCID are flushed.
    ///
    /// If `page` is not `None`, only translations of the specified page are flushed.
    pub fn iotinval_gvma(gscid: Option<GscId>, page: Option<SupervisorPfn>) -> Self {
        let mut op = IOTINVAL_OP | (GVMA_FUNC << FUNC3_SHIFT);
        if let Some(g) = gscid {
            op |= GV | ((g.bits() as u64) << GSCID_SHIFT);
        }
        let addr = if let Some(p) = page {
            op |= AV;
            p.addr().bits()
        } else {
            0
        };
        Self { op, addr }
    }

    /// Creates a new `IOFENCE.C` command for synchronizing the command queue. Upon completion of
    /// this command, all prior commands submitted to the command queue are guaranteed to have
    /// completed.
    pub fn iofence() -> Self {
        const PR: u64 = 1 << 10;
        const PW: u64 = 1 << 11;
        Self {
            op: IOFENCE_OP | PR | PW,
            addr: 0,
        }
    }

    /// Returns the kind of this command.
    pub fn kind(&self) -> CommandKind {
        let opcode = self.op & OPCODE_MASK;
        let func = (self.op >> FUNC3_SHIFT) & FUNC3_MASK;
        match (opcode, func) {
            (IOTINVAL_OP, GVMA_FUNC) => CommandKind::IotinvalGvma,
            (IOFENCE_OP, 0) => CommandKind::IofenceC,
            _ => CommandKind::Other(opcode),
        }
    }

    /// Returns the GSCID an `IOTINVAL.GVMA` command is scoped to, if any.
    pub fn gscid(&self) -> Option<GscId> {
        if self.kind() == CommandKind::IotinvalGvma && self.op & GV != 0 {
            Some(GscId::new((self.op >> GSCID_SHIFT) as u16))
        } else {
            None
        }
    }

    /// Returns the page an `IOTINVAL.GVMA` command is scoped to, if any.
    pub fn page(&self) -> Option<SupervisorPfn> {
        if self.kind() == CommandKind::IotinvalGvma && self.op & AV != 0 {
            Some(RawAddr::supervisor(self.addr).pfn())
        } else {
            None
        }
    }

    /// Returns the two doublewords of this command as they're written to the queue.
    pub fn to_raw(&self) -> [u64; 2] {
        [self.op, self.addr]
    }
}
