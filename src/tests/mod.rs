use super::*;
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::fabric::{SendError, Transport};
use crate::memory::{FlatMemory, LocalMemory, LocalReqId, MemCompletion};
use crate::op::Category;
use crate::packet::{AmoOp, Flags, OpKind, Packet};

mod locks;
mod system;

/// Namespace of PE 1 as seen from PE 0 (namespace i + 1 is PE i).
const PE1: u64 = 2;

// ---------------------------------------------------------------------------
// Recording transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Wire {
    sent: Vec<(PeId, Packet)>,
    inbox: VecDeque<Vec<u8>>,
    /// Sends accepted before `QueueFull`; `None` = unlimited
    credits: Option<usize>,
    /// Packets reported as still waiting to leave
    backlog: usize,
}

struct MockTransport {
    id: PeId,
    peers: Vec<PeId>,
    wire: Rc<RefCell<Wire>>,
}

impl Transport for MockTransport {
    fn id(&self) -> PeId {
        self.id
    }

    fn peers(&self) -> Vec<PeId> {
        self.peers.clone()
    }

    fn send(&mut self, dest: PeId, pkt: &Packet) -> std::result::Result<(), SendError> {
        if !self.peers.contains(&dest) {
            return Err(SendError::UnknownEndpoint(dest));
        }
        let mut wire = self.wire.borrow_mut();
        if let Some(credits) = wire.credits.as_mut() {
            if *credits == 0 {
                return Err(SendError::QueueFull);
            }
            *credits -= 1;
        }
        // Round-trip through the codec like a real port would.
        let pkt = Packet::decode(&pkt.encode()).unwrap();
        wire.sent.push((dest, pkt));
        Ok(())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.wire.borrow_mut().inbox.pop_front()
    }

    fn is_drained(&self) -> bool {
        self.wire.borrow().backlog == 0
    }
}

// ---------------------------------------------------------------------------
// Scripted memory engine: completions are released by the test
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedMemory {
    /// (address, request) of every asynchronous read issued
    reads: Vec<(u64, LocalReqId)>,
    writes: Vec<(u64, Vec<u8>)>,
    ready: VecDeque<MemCompletion>,
    bulk_done: bool,
}

impl ScriptedMemory {
    fn shared() -> Rc<RefCell<ScriptedMemory>> {
        Rc::new(RefCell::new(ScriptedMemory::default()))
    }

    fn complete(&mut self, req: LocalReqId, data: Vec<u8>) {
        self.ready.push_back(MemCompletion { req, data });
    }
}

impl LocalMemory for ScriptedMemory {
    fn read(&mut self, addr: u64, _size: u32, _flags: Flags, req: LocalReqId) {
        self.reads.push((addr, req));
    }

    fn write(&mut self, addr: u64, data: &[u8], _flags: Flags) {
        self.writes.push((addr, data.to_vec()));
    }

    fn load_reserve(&mut self, addr: u64, _size: u32, _owner: PeId, _flags: Flags, req: LocalReqId) {
        self.reads.push((addr, req));
    }

    fn store_conditional(&mut self, _addr: u64, _data: &[u8], _owner: PeId, _flags: Flags) -> bool {
        false
    }

    fn atomic_op(&mut self, addr: u64, _op: AmoOp, _operand: &[u8], _flags: Flags, req: LocalReqId) {
        self.reads.push((addr, req));
    }

    fn mark_bulk_transfer_complete(&mut self, done: bool) {
        self.bulk_done = done;
    }

    fn poll_completion(&mut self) -> Option<MemCompletion> {
        self.ready.pop_front()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Controller for PE 0 on a four-PE mock fabric.
fn controller(config: RmcConfig) -> (BasicRmtMemCtrl, Rc<RefCell<Wire>>) {
    let wire = Rc::new(RefCell::new(Wire::default()));
    let port = MockTransport { id: 0, peers: vec![0, 1, 2, 3], wire: wire.clone() };
    (BasicRmtMemCtrl::new(config, Box::new(port)).unwrap(), wire)
}

fn attach_flat(rmc: &mut BasicRmtMemCtrl) -> Rc<RefCell<FlatMemory>> {
    let mem = FlatMemory::new(1 << 20).shared();
    rmc.set_local_memory_engine(mem.clone());
    mem
}

fn attach_scripted(rmc: &mut BasicRmtMemCtrl) -> Rc<RefCell<ScriptedMemory>> {
    let mem = ScriptedMemory::shared();
    rmc.set_local_memory_engine(mem.clone());
    mem
}

fn handle(tag: u64) -> CompletionHandle {
    CompletionHandle::new(0, tag)
}

fn take_sent(wire: &Rc<RefCell<Wire>>) -> Vec<(PeId, Packet)> {
    std::mem::take(&mut wire.borrow_mut().sent)
}

fn completions(rmc: &mut BasicRmtMemCtrl) -> Vec<Completion> {
    std::iter::from_fn(|| rmc.poll_completion()).collect()
}

/// A request arriving from `src`.
fn incoming(kind: OpKind, id: u32, src: PeId, addr: u64, size: u64, nelem: u32, payload: Vec<u8>) -> Packet {
    Packet {
        kind,
        id,
        src,
        src_addr: addr,
        dest_addr: addr,
        size,
        nelem,
        stride: size as u32,
        flags: Flags::empty(),
        aq: false,
        rl: false,
        payload,
    }
}

fn reply(req: &Packet, payload: Vec<u8>) -> Packet {
    Packet::response_to(req, 1, payload).unwrap()
}

// ---------------------------------------------------------------------------
// Basic request / response
// ---------------------------------------------------------------------------

#[test]
fn scalar_read_round_trip() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    assert!(rmc.submit(RmtOp::read(PE1, 0x100, 8, Target::Reg(3), handle(1))));
    assert_eq!(rmc.stats().pending.read, 1);

    rmc.clock_tick().unwrap();
    let sent = take_sent(&wire);
    assert_eq!(sent.len(), 1);
    let (dest, pkt) = &sent[0];
    assert_eq!(*dest, 1);
    assert_eq!(pkt.kind, OpKind::Read);
    assert_eq!((pkt.src, pkt.src_addr, pkt.size, pkt.nelem), (0, 0x100, 8, 1));
    assert!(pkt.payload.is_empty());
    assert_eq!(rmc.stats().in_flight.read, 1);
    assert_eq!(rmc.outstanding_count(), 1);

    // Deliver the response through the transport so it is decoded on the tick.
    let resp = reply(pkt, 0xdead_beef_u64.to_le_bytes().to_vec());
    wire.borrow_mut().inbox.push_back(resp.encode());
    rmc.clock_tick().unwrap();

    let done = completions(&mut rmc);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].handle.tag, 1);
    assert_eq!(done[0].kind, OpKind::Read);
    assert_eq!(done[0].target, Some(Target::Reg(3)));
    assert_eq!(done[0].value(), 0xdead_beef);
    assert_eq!(rmc.stats().in_flight.read, 0);
    assert_eq!(rmc.outstanding_count(), 0);
    assert!(rmc.is_drained());

    // The table entry is gone: a replay is a protocol error.
    assert!(matches!(
        rmc.handle_packet(resp),
        Err(RmcError::UnknownCorrelationId { id: 0, src: 1, .. })
    ));
}

#[test]
fn sign_extended_load() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    let op = RmtOp::read(PE1, 0x10, 2, Target::Reg(1), handle(0)).with_flags(Flags::empty().with_sign_extend());
    rmc.submit(op);
    rmc.clock_tick().unwrap();
    let (_, pkt) = take_sent(&wire).pop().unwrap();
    assert!(pkt.flags.sign_extend());
    rmc.handle_packet(reply(&pkt, vec![0x00, 0x80])).unwrap();
    assert_eq!(rmc.poll_completion().unwrap().value() as i64, -32768);
}

#[test]
fn zero_size_submit_is_a_no_op() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    assert!(rmc.submit(RmtOp::read(PE1, 0x100, 0, Target::Reg(1), handle(1))));
    assert!(rmc.submit(RmtOp::write(PE1, 0x100, Vec::new(), handle(2))));
    assert!(rmc.submit(RmtOp::bulk_read(PE1, 0, 0x100, 8, 0, 8, handle(3))));

    rmc.clock_tick().unwrap();
    assert!(wire.borrow().sent.is_empty());
    assert!(rmc.poll_completion().is_none());
    assert_eq!(rmc.outstanding_count(), 0);
    assert_eq!(rmc.stats().pending.data_total(), 0);
    assert!(rmc.is_drained());
}

#[test]
fn unknown_correlation_id_is_fatal() {
    let (mut rmc, _wire) = controller(RmcConfig::default());
    let stray = Packet {
        kind: OpKind::ReadResp,
        id: 42,
        src: 2,
        src_addr: 0,
        dest_addr: 0,
        size: 8,
        nelem: 1,
        stride: 0,
        flags: Flags::empty(),
        aq: false,
        rl: false,
        payload: vec![0; 8],
    };
    assert!(matches!(
        rmc.handle_packet(stray),
        Err(RmcError::UnknownCorrelationId { kind: OpKind::ReadResp, src: 2, id: 42 })
    ));
}

#[test]
fn mismatched_response_kind_is_fatal() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    rmc.submit(RmtOp::read(PE1, 0x100, 4, Target::Reg(1), handle(1)));
    rmc.clock_tick().unwrap();
    let (_, pkt) = take_sent(&wire).pop().unwrap();

    let mut resp = reply(&pkt, Vec::new());
    resp.kind = OpKind::WriteResp;
    assert!(matches!(
        rmc.handle_packet(resp),
        Err(RmcError::ResponseMismatch { expected: OpKind::Read, got: OpKind::WriteResp, .. })
    ));
}

#[test]
fn malformed_bytes_fail_the_tick() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    wire.borrow_mut().inbox.push_back(vec![0x06; 12]);
    assert!(matches!(rmc.clock_tick(), Err(RmcError::Truncated { .. })));
}

#[test]
fn unknown_namespace_is_fatal_at_dispatch() {
    let (mut rmc, _wire) = controller(RmcConfig::default());
    assert!(rmc.submit(RmtOp::read(99, 0, 8, Target::Reg(1), handle(1))));
    assert!(matches!(rmc.clock_tick(), Err(RmcError::UnknownNamespace(99))));
}

#[test]
fn namespace_table_follows_peer_list() {
    let (rmc, _wire) = controller(RmcConfig::default());
    assert!(rmc.router().resolve(4).is_ok());
    assert!(rmc.router().resolve(5).is_err());
    assert_eq!(rmc.router().resolve(0).unwrap(), 0);
    assert_eq!(rmc.router().resolve(PE1).unwrap(), 1);

    let wire = Rc::new(RefCell::new(Wire::default()));
    let port = MockTransport { id: 0, peers: vec![0, 1, 2, 3], wire };
    let small = RmcConfig::new().with_max_namespaces(3);
    assert!(matches!(
        BasicRmtMemCtrl::new(small, Box::new(port)),
        Err(RmcError::NamespaceTableFull { capacity: 3 })
    ));
}

#[test]
fn write_payload_must_match_geometry() {
    let (mut rmc, _wire) = controller(RmcConfig::default());
    let mut op = RmtOp::write(PE1, 0x100, vec![1, 2, 3, 4], handle(1));
    op.size = 8;
    assert!(!rmc.submit(op));
    assert!(!rmc.submit(RmtOp::amo(PE1, 0, AmoOp::Add, vec![1, 2, 3], Target::Reg(1), handle(2))));
    assert_eq!(rmc.outstanding_count(), 0);
}

#[test]
fn short_response_leaves_request_outstanding() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    rmc.submit(RmtOp::read(PE1, 0x100, 8, Target::Reg(1), handle(1)));
    rmc.clock_tick().unwrap();
    let (_, pkt) = take_sent(&wire).pop().unwrap();

    let mut short = reply(&pkt, vec![0; 4]);
    short.size = 4;
    assert!(matches!(
        rmc.handle_packet(short),
        Err(RmcError::PayloadMismatch { expected: 8, got: 4, .. })
    ));
    assert_eq!(rmc.stats().in_flight.read, 1);
    assert_eq!(rmc.outstanding_count(), 1);
    assert!(rmc.poll_completion().is_none());
}
