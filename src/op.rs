/// Remote operation descriptors and the completions handed back to the core.
use serde::{Deserialize, Serialize};

use crate::memory::{le_to_u64, sign_extend};
use crate::packet::{AmoOp, Flags, OpKind};
use crate::HartId;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Admission category. Each has its own outstanding ceiling; AMOs are
/// admitted as loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Read,
    Write,
    ReadLock,
    WriteUnlock,
    Fence,
}

impl Category {
    /// Categories a fence waits on.
    pub const DATA: [Category; 4] = [
        Category::Read,
        Category::Write,
        Category::ReadLock,
        Category::WriteUnlock,
    ];
}

impl From<OpKind> for Category {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::Read | OpKind::BulkRead | OpKind::Amo => Category::Read,
            OpKind::ReadResp | OpKind::BulkReadResp | OpKind::AmoResp => Category::Read,
            OpKind::Write | OpKind::BulkWrite => Category::Write,
            OpKind::WriteResp | OpKind::BulkWriteResp => Category::Write,
            OpKind::ReadLock | OpKind::ReadLockResp => Category::ReadLock,
            OpKind::WriteUnlock | OpKind::WriteUnlockResp => Category::WriteUnlock,
            OpKind::Fence => Category::Fence,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Read => write!(f, "read"),
            Category::Write => write!(f, "write"),
            Category::ReadLock => write!(f, "readlock"),
            Category::WriteUnlock => write!(f, "writeunlock"),
            Category::Fence => write!(f, "fence"),
        }
    }
}

/// One counter per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub read: u64,
    pub write: u64,
    pub read_lock: u64,
    pub write_unlock: u64,
    pub fence: u64,
}

impl CategoryCounts {
    pub fn get(&self, cat: Category) -> u64 {
        match cat {
            Category::Read => self.read,
            Category::Write => self.write,
            Category::ReadLock => self.read_lock,
            Category::WriteUnlock => self.write_unlock,
            Category::Fence => self.fence,
        }
    }

    pub fn get_mut(&mut self, cat: Category) -> &mut u64 {
        match cat {
            Category::Read => &mut self.read,
            Category::Write => &mut self.write,
            Category::ReadLock => &mut self.read_lock,
            Category::WriteUnlock => &mut self.write_unlock,
            Category::Fence => &mut self.fence,
        }
    }

    /// Sum over the data categories (fences excluded).
    pub fn data_total(&self) -> u64 {
        Category::DATA.iter().map(|&c| self.get(c)).sum()
    }
}

// ---------------------------------------------------------------------------
// Completion plumbing
// ---------------------------------------------------------------------------

/// Register that receives a read-path result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Integer register file
    Reg(u8),
    /// Floating-point register file
    FReg(u8),
}

/// Identifies the instruction waiting on an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionHandle {
    pub hart: HartId,
    /// Caller-chosen tag, returned untouched
    pub tag: u64,
}

impl CompletionHandle {
    pub fn new(hart: HartId, tag: u64) -> Self {
        CompletionHandle { hart, tag }
    }
}

/// Final outcome of one descriptor, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: CompletionHandle,
    pub kind: OpKind,
    pub target: Option<Target>,
    pub flags: Flags,
    /// Loaded bytes, old AMO value, or the store-conditional outcome byte
    /// (0 = success). Empty for plain writes, bulk transfers and fences.
    pub data: Vec<u8>,
}

impl Completion {
    /// The loaded value widened to 64 bits, sign-extended when requested.
    pub fn value(&self) -> u64 {
        let raw = le_to_u64(&self.data);
        if self.flags.sign_extend() {
            sign_extend(raw, self.data.len()) as u64
        } else {
            raw
        }
    }

    /// For write-unlock completions: whether the conditional store landed.
    pub fn store_succeeded(&self) -> bool {
        self.data.first() == Some(&0)
    }
}

// ---------------------------------------------------------------------------
// RmtOp
// ---------------------------------------------------------------------------

/// Remote operation descriptor, owned by the controller from `submit`
/// until its completion is delivered.
#[derive(Debug, Clone)]
pub struct RmtOp {
    pub hart: HartId,
    pub kind: OpKind,
    pub nmspace: u64,
    /// Remote address for reads; local gather base for bulk writes
    pub src_addr: u64,
    /// Remote address for writes; local scatter base for bulk reads
    pub dest_addr: u64,
    pub size: u32,
    pub nelem: u32,
    pub stride: u32,
    pub flags: Flags,
    /// Write data or AMO operand, `size * nelem` bytes
    pub payload: Vec<u8>,
    pub target: Option<Target>,
    pub handle: CompletionHandle,
}

impl RmtOp {
    fn base(kind: OpKind, nmspace: u64, handle: CompletionHandle) -> Self {
        RmtOp {
            hart: handle.hart,
            kind,
            nmspace,
            src_addr: 0,
            dest_addr: 0,
            size: 0,
            nelem: 1,
            stride: 0,
            flags: Flags::empty(),
            payload: Vec::new(),
            target: None,
            handle,
        }
    }

    pub fn read(nmspace: u64, addr: u64, size: u32, target: Target, handle: CompletionHandle) -> Self {
        RmtOp {
            src_addr: addr,
            size,
            target: Some(target),
            ..Self::base(OpKind::Read, nmspace, handle)
        }
    }

    /// Copy `nelem` strided elements from remote `src_addr` to local `dest_addr`.
    pub fn bulk_read(
        nmspace: u64,
        src_addr: u64,
        dest_addr: u64,
        size: u32,
        nelem: u32,
        stride: u32,
        handle: CompletionHandle,
    ) -> Self {
        RmtOp {
            src_addr,
            dest_addr,
            size,
            nelem,
            stride,
            ..Self::base(OpKind::BulkRead, nmspace, handle)
        }
    }

    pub fn write(nmspace: u64, addr: u64, data: Vec<u8>, handle: CompletionHandle) -> Self {
        RmtOp {
            dest_addr: addr,
            size: data.len() as u32,
            payload: data,
            ..Self::base(OpKind::Write, nmspace, handle)
        }
    }

    /// Copy `nelem` strided elements from local `src_addr` to remote `dest_addr`.
    pub fn bulk_write(
        nmspace: u64,
        dest_addr: u64,
        src_addr: u64,
        size: u32,
        nelem: u32,
        stride: u32,
        handle: CompletionHandle,
    ) -> Self {
        RmtOp {
            src_addr,
            dest_addr,
            size,
            nelem,
            stride,
            ..Self::base(OpKind::BulkWrite, nmspace, handle)
        }
    }

    pub fn read_lock(nmspace: u64, addr: u64, size: u32, target: Target, handle: CompletionHandle) -> Self {
        RmtOp {
            src_addr: addr,
            size,
            target: Some(target),
            ..Self::base(OpKind::ReadLock, nmspace, handle)
        }
    }

    pub fn write_unlock(
        nmspace: u64,
        addr: u64,
        data: Vec<u8>,
        target: Target,
        handle: CompletionHandle,
    ) -> Self {
        RmtOp {
            dest_addr: addr,
            size: data.len() as u32,
            payload: data,
            target: Some(target),
            ..Self::base(OpKind::WriteUnlock, nmspace, handle)
        }
    }

    pub fn amo(
        nmspace: u64,
        addr: u64,
        op: AmoOp,
        operand: Vec<u8>,
        target: Target,
        handle: CompletionHandle,
    ) -> Self {
        RmtOp {
            dest_addr: addr,
            size: operand.len() as u32,
            payload: operand,
            flags: Flags::empty().with_amo(op),
            target: Some(target),
            ..Self::base(OpKind::Amo, nmspace, handle)
        }
    }

    pub fn fence(handle: CompletionHandle) -> Self {
        Self::base(OpKind::Fence, 0, handle)
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    pub fn category(&self) -> Category {
        self.kind.into()
    }

    /// Bytes moved by this operation.
    pub fn total_bytes(&self) -> u64 {
        self.size as u64 * self.nelem as u64
    }
}
