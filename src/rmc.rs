/// Remote memory controller.
///
/// Sits between a PE's core and its network interface. The core hands over
/// `RmtOp` descriptors with `submit`; once per cycle `clock_tick` drains the
/// network, collects finished local-memory work, retries parked responses
/// and admits queued requests to the network under per-category ceilings.
/// The same controller serves requests arriving from peers against the PE's
/// local memory engine.
use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::RmcConfig;
use crate::error::{Result, RmcError};
use crate::fabric::{SendError, Transport};
use crate::memory::{MemCompletion, SharedMemory};
use crate::op::{Category, CategoryCounts, Completion, RmtOp};
use crate::packet::{OpKind, Packet};
use crate::router::NamespaceRouter;
use crate::tracker::{FinishedRecord, LocalCompletionTracker, TrackKey, TrackedRequest};
use crate::PeId;

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

pub trait RmtMemCtrl {
    /// Queue `op` for the network. Returns `false` only if the request can
    /// never be served by this controller.
    fn submit(&mut self, op: RmtOp) -> bool;

    /// No queued, in-flight or half-served work remains.
    fn is_drained(&self) -> bool;

    /// Requests submitted but not yet answered.
    fn outstanding_count(&self) -> u64;

    fn set_local_memory_engine(&mut self, mem: SharedMemory);

    fn clock_tick(&mut self) -> Result<()>;

    fn handle_packet(&mut self, pkt: Packet) -> Result<()>;

    fn poll_completion(&mut self) -> Option<Completion>;

    fn stats(&self) -> &RmcStats;
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RmcStats {
    /// Queued, not yet on the network
    pub pending: CategoryCounts,
    /// On the network, awaiting a response
    pub in_flight: CategoryCounts,
    /// Cumulative admissions
    pub admitted: CategoryCounts,
    /// Bytes returned by our reads
    pub read_bytes: u64,
    /// Bytes carried by our writes
    pub write_bytes: u64,
    pub amos: u64,
    pub fences_retired: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub responses_sent: u64,
    /// Responses the transport refused on first attempt
    pub responses_parked: u64,
    /// Admissions abandoned because the transport was full
    pub send_stalls: u64,
    pub completions: u64,
}

// ---------------------------------------------------------------------------
// BasicRmtMemCtrl
// ---------------------------------------------------------------------------

struct QueuedOp {
    op: RmtOp,
    /// Bulk-write payload still being gathered from local memory
    gather: Option<u64>,
}

pub struct BasicRmtMemCtrl {
    id: PeId,
    config: RmcConfig,
    transport: Box<dyn Transport>,
    router: NamespaceRouter,
    mem: Option<SharedMemory>,

    rqst_q: VecDeque<QueuedOp>,
    outstanding: HashMap<u32, RmtOp>,
    tracker: LocalCompletionTracker,
    resp_q: VecDeque<(PeId, Packet)>,
    completions: VecDeque<Completion>,

    next_id: u32,
    next_gather: u64,
    stats: RmcStats,
}

impl BasicRmtMemCtrl {
    pub fn new(config: RmcConfig, transport: Box<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let id = transport.id();
        let router = NamespaceRouter::from_hosts(id, &transport.peers(), config.max_namespaces)?;
        log::info!(
            "PE {}: remote memory controller up (loads {}, stores {}, ops/cycle {})",
            id,
            config.max_loads,
            config.max_stores,
            config.max_ops
        );
        Ok(BasicRmtMemCtrl {
            id,
            config,
            transport,
            router,
            mem: None,
            rqst_q: VecDeque::new(),
            outstanding: HashMap::new(),
            tracker: LocalCompletionTracker::new(),
            resp_q: VecDeque::new(),
            completions: VecDeque::new(),
            next_id: 0,
            next_gather: 0,
            stats: RmcStats::default(),
        })
    }

    pub fn id(&self) -> PeId {
        self.id
    }

    pub fn config(&self) -> &RmcConfig {
        &self.config
    }

    pub fn router(&self) -> &NamespaceRouter {
        &self.router
    }

    /// Responses parked behind a full transport.
    pub fn parked_responses(&self) -> usize {
        self.resp_q.len()
    }

    /// Peer requests still waiting on local memory.
    pub fn serving(&self) -> usize {
        self.tracker.len()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    fn needs_local_memory(kind: OpKind) -> bool {
        matches!(kind, OpKind::BulkRead | OpKind::BulkWrite)
    }

    /// Start gathering a bulk write's payload. Returns the gather sequence.
    fn start_gather(&mut self, op: &RmtOp, mem: &SharedMemory) -> Result<u64> {
        let seq = self.next_gather;
        self.next_gather += 1;
        let key = TrackKey::Gather { seq };
        self.tracker.open(TrackedRequest {
            key,
            kind: op.kind,
            src_addr: op.src_addr,
            dest_addr: op.dest_addr,
            size: op.size,
            nelem: op.nelem,
            stride: op.stride,
            flags: op.flags,
            aq: op.flags.acquire(),
            rl: op.flags.release(),
        })?;
        let mut mem = mem.borrow_mut();
        for i in 0..op.nelem {
            let addr = element_addr(op.src_addr, i, op.stride);
            let req = self.tracker.issue_element(key, i);
            mem.read(addr, op.size, op.flags, req);
        }
        Ok(seq)
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    fn fence_clear(&self) -> bool {
        Category::DATA
            .iter()
            .all(|&cat| self.stats.in_flight.get(cat) == 0)
            && self.resp_q.is_empty()
            && self.transport.is_drained()
    }

    fn retire_fence(&mut self) {
        if let Some(QueuedOp { op, .. }) = self.rqst_q.pop_front() {
            *self.stats.pending.get_mut(Category::Fence) -= 1;
            self.stats.fences_retired += 1;
            log::debug!("PE {}: fence retired (hart {})", self.id, op.hart);
            self.complete(op, Vec::new());
        }
    }

    /// Try to put queue entry `idx` on the network. `Ok(false)` means the
    /// transport is full and the entry stays queued.
    fn issue(&mut self, idx: usize) -> Result<bool> {
        let Some(entry) = self.rqst_q.get(idx) else {
            return Ok(false);
        };
        let op = &entry.op;
        let dest = self.router.resolve(op.nmspace)?;
        let pkt = Packet {
            kind: op.kind,
            id: self.next_id,
            src: self.id,
            src_addr: op.src_addr,
            dest_addr: op.dest_addr,
            size: op.size as u64,
            nelem: op.nelem,
            stride: op.stride,
            flags: op.flags,
            aq: op.flags.acquire(),
            rl: op.flags.release(),
            payload: if op.kind.carries_data() { op.payload.clone() } else { Vec::new() },
        };

        match self.transport.send(dest, &pkt) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                self.stats.send_stalls += 1;
                log::debug!("PE {}: transport full, {} #{} stays queued", self.id, pkt.kind, pkt.id);
                return Ok(false);
            }
            Err(SendError::UnknownEndpoint(pe)) => return Err(RmcError::UnknownEndpoint(pe)),
        }
        self.next_id = self.next_id.wrapping_add(1);

        let Some(QueuedOp { mut op, .. }) = self.rqst_q.remove(idx) else {
            return Ok(true);
        };
        let cat = op.category();
        *self.stats.pending.get_mut(cat) -= 1;
        *self.stats.in_flight.get_mut(cat) += 1;
        *self.stats.admitted.get_mut(cat) += 1;
        self.stats.packets_sent += 1;
        match op.kind {
            OpKind::Amo => self.stats.amos += 1,
            OpKind::Write | OpKind::BulkWrite | OpKind::WriteUnlock => {
                self.stats.write_bytes += op.total_bytes()
            }
            _ => {}
        }
        log::trace!(
            "PE {}: {} #{} to PE {} (ns {:#x}) admitted",
            self.id,
            op.kind,
            pkt.id,
            dest,
            op.nmspace
        );
        op.payload = Vec::new();
        self.outstanding.insert(pkt.id, op);
        Ok(true)
    }

    /// Admit queued requests in order, up to `max_ops` per cycle.
    fn dispatch(&mut self) -> Result<()> {
        let mut admitted = 0;
        let mut idx = 0;
        while idx < self.rqst_q.len() && admitted < self.config.max_ops {
            let entry = &self.rqst_q[idx];
            if entry.op.kind == OpKind::Fence {
                if idx == 0 && self.fence_clear() {
                    self.retire_fence();
                    continue;
                }
                log::trace!("PE {}: fence holds the queue at position {}", self.id, idx);
                break;
            }
            if let Some(seq) = entry.gather {
                log::trace!("PE {}: bulk write gather#{} not ready", self.id, seq);
                idx += 1;
                continue;
            }
            let cat = entry.op.category();
            if self.stats.in_flight.get(cat) >= self.config.ceiling(cat) as u64 {
                log::debug!("PE {}: {} ceiling reached", self.id, cat);
                idx += 1;
                continue;
            }
            if !self.issue(idx)? {
                break;
            }
            admitted += 1;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Responses we send
    // -----------------------------------------------------------------------

    fn send_response(&mut self, dest: PeId, pkt: Packet) -> Result<()> {
        if !self.resp_q.is_empty() {
            self.resp_q.push_back((dest, pkt));
            return Ok(());
        }
        match self.transport.send(dest, &pkt) {
            Ok(()) => {
                self.stats.responses_sent += 1;
                self.stats.packets_sent += 1;
                Ok(())
            }
            Err(SendError::QueueFull) => {
                log::warn!("PE {}: parking {} #{} for PE {}", self.id, pkt.kind, pkt.id, dest);
                self.stats.responses_parked += 1;
                self.resp_q.push_back((dest, pkt));
                Ok(())
            }
            Err(SendError::UnknownEndpoint(pe)) => Err(RmcError::UnknownEndpoint(pe)),
        }
    }

    fn flush_responses(&mut self) -> Result<()> {
        for _ in 0..self.config.max_responses {
            let Some((dest, pkt)) = self.resp_q.front() else {
                break;
            };
            match self.transport.send(*dest, pkt) {
                Ok(()) => {
                    self.resp_q.pop_front();
                    self.stats.responses_sent += 1;
                    self.stats.packets_sent += 1;
                }
                Err(SendError::QueueFull) => break,
                Err(SendError::UnknownEndpoint(pe)) => return Err(RmcError::UnknownEndpoint(pe)),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Serving peer requests
    // -----------------------------------------------------------------------

    fn engine(&self) -> Result<SharedMemory> {
        self.mem.clone().ok_or(RmcError::NoMemoryEngine(self.id))
    }

    /// Reads from peers allocate and issue `size * nelem` locally, so bound them.
    fn check_request_size(&self, pkt: &Packet) -> Result<()> {
        let limit = self.config.max_request_bytes;
        match pkt.size.checked_mul(pkt.nelem as u64) {
            Some(total) if total <= limit => Ok(()),
            _ => Err(RmcError::TooLarge {
                kind: pkt.kind,
                size: pkt.size,
                nelem: pkt.nelem,
                limit,
            }),
        }
    }

    fn handle_read_request(&mut self, pkt: Packet) -> Result<()> {
        let mem = self.engine()?;
        let size = element_size(&pkt)?;
        self.check_request_size(&pkt)?;
        let key = TrackKey::Remote { src: pkt.src, id: pkt.id };
        self.tracker.open(TrackedRequest {
            key,
            kind: pkt.kind,
            src_addr: pkt.src_addr,
            dest_addr: pkt.dest_addr,
            size,
            nelem: pkt.nelem,
            stride: pkt.stride,
            flags: pkt.flags,
            aq: pkt.aq,
            rl: pkt.rl,
        })?;
        let mut mem = mem.borrow_mut();
        for i in 0..pkt.nelem {
            let addr = element_addr(pkt.src_addr, i, pkt.stride);
            let req = self.tracker.issue_element(key, i);
            if pkt.kind == OpKind::ReadLock {
                mem.load_reserve(addr, size, pkt.src, pkt.flags, req);
            } else {
                mem.read(addr, size, pkt.flags, req);
            }
        }
        Ok(())
    }

    fn handle_write_request(&mut self, pkt: Packet) -> Result<()> {
        let mem = self.engine()?;
        let size = element_size(&pkt)? as usize;
        let payload = if pkt.kind == OpKind::WriteUnlock {
            let stored = mem
                .borrow_mut()
                .store_conditional(pkt.dest_addr, &pkt.payload, pkt.src, pkt.flags);
            log::trace!("PE {}: SC from PE {} at {:#x}: {}", self.id, pkt.src, pkt.dest_addr, stored);
            vec![if stored { 0 } else { 1 }]
        } else {
            let mut mem = mem.borrow_mut();
            for (i, chunk) in pkt.payload.chunks_exact(size).enumerate() {
                let addr = element_addr(pkt.dest_addr, i as u32, pkt.stride);
                mem.write(addr, chunk, pkt.flags);
            }
            Vec::new()
        };
        let resp = Packet::response_to(&pkt, self.id, payload)?;
        self.send_response(pkt.src, resp)
    }

    fn handle_amo_request(&mut self, pkt: Packet) -> Result<()> {
        let mem = self.engine()?;
        let amo = pkt.flags.amo_op()?;
        if !matches!(pkt.size, 1 | 2 | 4 | 8) || pkt.nelem != 1 {
            return Err(RmcError::InvalidAmo { size: pkt.size, nelem: pkt.nelem });
        }
        let key = TrackKey::Remote { src: pkt.src, id: pkt.id };
        self.tracker.open(TrackedRequest {
            key,
            kind: pkt.kind,
            src_addr: pkt.src_addr,
            dest_addr: pkt.dest_addr,
            size: pkt.size as u32,
            nelem: 1,
            stride: pkt.stride,
            flags: pkt.flags,
            aq: pkt.aq,
            rl: pkt.rl,
        })?;
        let req = self.tracker.issue_element(key, 0);
        mem.borrow_mut()
            .atomic_op(pkt.dest_addr, amo, &pkt.payload, pkt.flags, req);
        Ok(())
    }

    fn on_local_complete(&mut self, done: MemCompletion) -> Result<()> {
        match self.tracker.on_element_complete(done.req, &done.data)? {
            Some(record) => self.finish_record(record),
            None => Ok(()),
        }
    }

    fn finish_record(&mut self, record: FinishedRecord) -> Result<()> {
        let FinishedRecord { req, buffer } = record;
        match req.key {
            TrackKey::Remote { src, id } => {
                let kind = req
                    .kind
                    .response()
                    .ok_or(RmcError::UnexpectedPacket { kind: req.kind })?;
                let resp = Packet {
                    kind,
                    id,
                    src: self.id,
                    src_addr: req.src_addr,
                    dest_addr: req.dest_addr,
                    size: req.size as u64,
                    nelem: req.nelem,
                    stride: req.stride,
                    flags: req.flags,
                    aq: req.aq,
                    rl: req.rl,
                    payload: buffer,
                };
                self.send_response(src, resp)
            }
            TrackKey::Gather { seq } => {
                match self.rqst_q.iter_mut().find(|q| q.gather == Some(seq)) {
                    Some(queued) => {
                        queued.op.payload = buffer;
                        queued.gather = None;
                        log::trace!("PE {}: gather#{} complete", self.id, seq);
                    }
                    None => log::warn!("PE {}: gather#{} finished with no queued write", self.id, seq),
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Responses to our own requests
    // -----------------------------------------------------------------------

    fn handle_response(&mut self, pkt: Packet) -> Result<()> {
        let (expected, expected_bytes) = match self.outstanding.get(&pkt.id) {
            Some(op) => (op.kind, op.total_bytes()),
            None => {
                return Err(RmcError::UnknownCorrelationId {
                    kind: pkt.kind,
                    src: pkt.src,
                    id: pkt.id,
                });
            }
        };
        if expected.response() != Some(pkt.kind) {
            return Err(RmcError::ResponseMismatch { expected, got: pkt.kind, id: pkt.id });
        }
        if matches!(
            pkt.kind,
            OpKind::ReadResp | OpKind::BulkReadResp | OpKind::ReadLockResp | OpKind::AmoResp
        ) && pkt.payload.len() as u64 != expected_bytes
        {
            return Err(RmcError::PayloadMismatch {
                kind: pkt.kind,
                expected: expected_bytes as usize,
                got: pkt.payload.len(),
            });
        }
        let Some(op) = self.outstanding.remove(&pkt.id) else {
            return Ok(());
        };
        *self.stats.in_flight.get_mut(op.category()) -= 1;

        let data = match pkt.kind {
            OpKind::ReadResp | OpKind::ReadLockResp | OpKind::AmoResp => {
                self.stats.read_bytes += pkt.payload.len() as u64;
                pkt.payload
            }
            OpKind::BulkReadResp => {
                let mem = self.engine()?;
                let mut mem = mem.borrow_mut();
                for (i, chunk) in pkt.payload.chunks_exact(op.size as usize).enumerate() {
                    let addr = element_addr(op.dest_addr, i as u32, op.stride);
                    mem.write(addr, chunk, op.flags);
                }
                mem.mark_bulk_transfer_complete(true);
                self.stats.read_bytes += pkt.payload.len() as u64;
                Vec::new()
            }
            OpKind::WriteUnlockResp => pkt.payload,
            _ => Vec::new(),
        };
        log::trace!("PE {}: {} #{} from PE {} completes", self.id, pkt.kind, pkt.id, pkt.src);
        self.complete(op, data);
        Ok(())
    }

    fn complete(&mut self, op: RmtOp, data: Vec<u8>) {
        self.stats.completions += 1;
        self.completions.push_back(Completion {
            handle: op.handle,
            kind: op.kind,
            target: op.target,
            flags: op.flags,
            data,
        });
    }
}

impl RmtMemCtrl for BasicRmtMemCtrl {
    fn submit(&mut self, op: RmtOp) -> bool {
        if op.kind.is_response() {
            log::error!("PE {}: cannot submit {}", self.id, op.kind);
            return false;
        }
        if op.kind != OpKind::Fence && (op.size == 0 || op.nelem == 0) {
            log::debug!("PE {}: empty {} from hart {} ignored", self.id, op.kind, op.hart);
            return true;
        }
        // Bulk-write payloads are gathered from local memory, never supplied.
        if op.kind.carries_data()
            && op.kind != OpKind::BulkWrite
            && op.payload.len() as u64 != op.total_bytes()
        {
            log::error!(
                "PE {}: {} payload is {} bytes, expected {}",
                self.id,
                op.kind,
                op.payload.len(),
                op.total_bytes()
            );
            return false;
        }
        if op.total_bytes() > self.config.max_request_bytes {
            log::error!(
                "PE {}: {} of {} bytes exceeds the {}-byte limit",
                self.id,
                op.kind,
                op.total_bytes(),
                self.config.max_request_bytes
            );
            return false;
        }
        if op.kind == OpKind::Amo && (!matches!(op.size, 1 | 2 | 4 | 8) || op.nelem != 1) {
            log::error!("PE {}: AMO with {}-byte operand refused", self.id, op.size);
            return false;
        }

        let mut gather = None;
        if Self::needs_local_memory(op.kind) {
            let Some(mem) = self.mem.clone() else {
                log::error!("PE {}: {} needs a local memory engine", self.id, op.kind);
                return false;
            };
            if op.kind == OpKind::BulkWrite {
                match self.start_gather(&op, &mem) {
                    Ok(seq) => gather = Some(seq),
                    Err(e) => {
                        log::error!("PE {}: {}", self.id, e);
                        return false;
                    }
                }
            }
        }

        log::trace!(
            "PE {}: hart {} queued {} ns {:#x} ({} x {} bytes)",
            self.id,
            op.hart,
            op.kind,
            op.nmspace,
            op.nelem,
            op.size
        );
        *self.stats.pending.get_mut(op.category()) += 1;
        self.rqst_q.push_back(QueuedOp { op, gather });
        true
    }

    fn is_drained(&self) -> bool {
        self.rqst_q.is_empty()
            && self.outstanding.is_empty()
            && self.resp_q.is_empty()
            && self.tracker.is_empty()
            && self.transport.is_drained()
    }

    fn outstanding_count(&self) -> u64 {
        (self.rqst_q.len() + self.outstanding.len()) as u64
    }

    fn set_local_memory_engine(&mut self, mem: SharedMemory) {
        self.mem = Some(mem);
    }

    fn clock_tick(&mut self) -> Result<()> {
        while let Some(bytes) = self.transport.recv() {
            let pkt = Packet::decode(&bytes)?;
            self.handle_packet(pkt)?;
        }

        if let Some(mem) = self.mem.clone() {
            loop {
                let next = mem.borrow_mut().poll_completion();
                match next {
                    Some(done) => self.on_local_complete(done)?,
                    None => break,
                }
            }
        }

        self.flush_responses()?;
        self.dispatch()
    }

    fn handle_packet(&mut self, pkt: Packet) -> Result<()> {
        pkt.validate()?;
        self.stats.packets_received += 1;
        log::trace!("PE {}: recv {} #{} from PE {}", self.id, pkt.kind, pkt.id, pkt.src);
        match pkt.kind {
            OpKind::Read | OpKind::BulkRead | OpKind::ReadLock => self.handle_read_request(pkt),
            OpKind::Write | OpKind::BulkWrite | OpKind::WriteUnlock => {
                self.handle_write_request(pkt)
            }
            OpKind::Amo => self.handle_amo_request(pkt),
            OpKind::Fence => Err(RmcError::UnexpectedPacket { kind: pkt.kind }),
            _ => self.handle_response(pkt),
        }
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    fn stats(&self) -> &RmcStats {
        &self.stats
    }
}

fn element_addr(base: u64, idx: u32, stride: u32) -> u64 {
    base.wrapping_add(idx as u64 * stride as u64)
}

fn element_size(pkt: &Packet) -> Result<u32> {
    u32::try_from(pkt.size).map_err(|_| RmcError::Oversized { kind: pkt.kind, size: pkt.size })
}
