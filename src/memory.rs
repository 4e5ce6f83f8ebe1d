/// Local memory engine interface and a sparse reference implementation.
///
/// The remote memory controller never owns physical memory. It drives the
/// PE's local engine through `LocalMemory`: stores are synchronous, while
/// loads, load-reserves and atomics complete after the engine's latency and
/// are reported back through `poll_completion`, tagged with the
/// `LocalReqId` the controller passed in.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::packet::{AmoOp, Flags};
use crate::PeId;

/// Handle identifying one element-level local operation.
pub type LocalReqId = u64;

/// Engine handle shared between a core and its remote memory controller.
pub type SharedMemory = Rc<RefCell<dyn LocalMemory>>;

/// A finished asynchronous local operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemCompletion {
    pub req: LocalReqId,
    /// Loaded bytes; for AMOs, the value before the update.
    pub data: Vec<u8>,
}

pub trait LocalMemory {
    fn read(&mut self, addr: u64, size: u32, flags: Flags, req: LocalReqId);

    fn write(&mut self, addr: u64, data: &[u8], flags: Flags);

    /// Load and place a reservation on `[addr, addr + size)` for `owner`.
    fn load_reserve(&mut self, addr: u64, size: u32, owner: PeId, flags: Flags, req: LocalReqId);

    /// Store only if `owner` still holds a reservation on `addr`.
    /// The owner's reservation is released either way.
    fn store_conditional(&mut self, addr: u64, data: &[u8], owner: PeId, flags: Flags) -> bool;

    fn atomic_op(&mut self, addr: u64, op: AmoOp, operand: &[u8], flags: Flags, req: LocalReqId);

    fn mark_bulk_transfer_complete(&mut self, done: bool);

    fn poll_completion(&mut self) -> Option<MemCompletion>;
}

// ---------------------------------------------------------------------------
// FlatMemory
// ---------------------------------------------------------------------------

/// Byte-addressed PE memory backed by a sparse map, so large address spaces
/// cost nothing until touched. Unwritten bytes read as zero.
pub struct FlatMemory {
    pub size_bytes: usize,
    data: HashMap<u64, u8>,
    /// Ticks between issuing an asynchronous operation and its completion
    pub latency: u64,
    now: u64,
    in_flight: VecDeque<(u64, MemCompletion)>,
    /// owner → (base address, length)
    reservations: HashMap<PeId, (u64, u64)>,
    bulk_done: bool,
}

impl FlatMemory {
    pub fn new(size_bytes: usize) -> Self {
        FlatMemory {
            size_bytes,
            data: HashMap::new(),
            latency: 0,
            now: 0,
            in_flight: VecDeque::new(),
            reservations: HashMap::new(),
            bulk_done: false,
        }
    }

    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = latency;
        self
    }

    pub fn shared(self) -> Rc<RefCell<FlatMemory>> {
        Rc::new(RefCell::new(self))
    }

    /// Advance the engine clock by one cycle.
    pub fn tick(&mut self) {
        self.now += 1;
    }

    pub fn load_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| *self.data.get(&addr.wrapping_add(i)).unwrap_or(&0))
            .collect()
    }

    pub fn store_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.data.insert(addr.wrapping_add(i as u64), byte);
        }
    }

    pub fn load_u64(&self, addr: u64) -> u64 {
        le_to_u64(&self.load_bytes(addr, 8))
    }

    pub fn store_u64(&mut self, addr: u64, val: u64) {
        self.store_bytes(addr, &val.to_le_bytes());
    }

    /// Consume the bulk-transfer flag raised by the remote controller.
    pub fn take_bulk_transfer_complete(&mut self) -> bool {
        std::mem::take(&mut self.bulk_done)
    }

    pub fn has_reservation(&self, owner: PeId, addr: u64) -> bool {
        self.reservations.get(&owner).is_some_and(|&(base, _)| base == addr)
    }

    /// Operations issued but not yet reported.
    pub fn pending_completions(&self) -> usize {
        self.in_flight.len()
    }

    fn complete_later(&mut self, req: LocalReqId, data: Vec<u8>) {
        let ready_at = self.now + self.latency;
        self.in_flight.push_back((ready_at, MemCompletion { req, data }));
    }

    /// Drop every reservation overlapping `[addr, addr + len)` except `keep`'s.
    fn break_reservations(&mut self, addr: u64, len: u64, keep: Option<PeId>) {
        self.reservations.retain(|&owner, &mut (base, rlen)| {
            Some(owner) == keep
                || base.saturating_add(rlen) <= addr
                || addr.saturating_add(len) <= base
        });
    }

    fn store_and_invalidate(&mut self, addr: u64, bytes: &[u8]) {
        self.break_reservations(addr, bytes.len() as u64, None);
        self.store_bytes(addr, bytes);
    }
}

impl LocalMemory for FlatMemory {
    fn read(&mut self, addr: u64, size: u32, _flags: Flags, req: LocalReqId) {
        let data = self.load_bytes(addr, size as usize);
        self.complete_later(req, data);
    }

    fn write(&mut self, addr: u64, data: &[u8], _flags: Flags) {
        self.store_and_invalidate(addr, data);
    }

    fn load_reserve(&mut self, addr: u64, size: u32, owner: PeId, _flags: Flags, req: LocalReqId) {
        self.reservations.insert(owner, (addr, size as u64));
        let data = self.load_bytes(addr, size as usize);
        self.complete_later(req, data);
    }

    fn store_conditional(&mut self, addr: u64, data: &[u8], owner: PeId, _flags: Flags) -> bool {
        let held = self.has_reservation(owner, addr);
        self.reservations.remove(&owner);
        if held {
            self.store_and_invalidate(addr, data);
        }
        held
    }

    fn atomic_op(&mut self, addr: u64, op: AmoOp, operand: &[u8], _flags: Flags, req: LocalReqId) {
        let len = operand.len();
        let old_bytes = self.load_bytes(addr, len);
        let old = le_to_u64(&old_bytes);
        let rhs = le_to_u64(operand);
        let new = match op {
            AmoOp::Add => old.wrapping_add(rhs),
            AmoOp::Swap => rhs,
            AmoOp::And => old & rhs,
            AmoOp::Or => old | rhs,
            AmoOp::Xor => old ^ rhs,
            AmoOp::Min => {
                if sign_extend(old, len) <= sign_extend(rhs, len) { old } else { rhs }
            }
            AmoOp::Max => {
                if sign_extend(old, len) >= sign_extend(rhs, len) { old } else { rhs }
            }
            AmoOp::MinU => old.min(rhs),
            AmoOp::MaxU => old.max(rhs),
        };
        let new_bytes = new.to_le_bytes();
        self.store_and_invalidate(addr, &new_bytes[..len]);
        self.complete_later(req, old_bytes);
    }

    fn mark_bulk_transfer_complete(&mut self, done: bool) {
        self.bulk_done = done;
    }

    fn poll_completion(&mut self) -> Option<MemCompletion> {
        let ready = self
            .in_flight
            .front()
            .is_some_and(|&(ready_at, _)| ready_at <= self.now);
        if ready {
            self.in_flight.pop_front().map(|(_, c)| c)
        } else {
            None
        }
    }
}

/// Zero-extend up to eight little-endian bytes.
pub fn le_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

/// Sign-extend the low `len` bytes of `val`.
pub fn sign_extend(val: u64, len: usize) -> i64 {
    if len == 0 || len >= 8 {
        return val as i64;
    }
    let shift = 64 - 8 * len as u32;
    ((val << shift) as i64) >> shift
}
