/// In-process packet fabric connecting the PEs of one simulation.
///
/// Each endpoint owns a bounded outbound queue. Every fabric tick moves up to
/// `packets_per_cycle` packets off each outbound queue, in order, into the
/// destination's inbound queue. Packets travel as encoded bytes, so every
/// hop goes through the wire codec. Delivery is reliable and in-order per
/// (source, destination) pair; there is no topology and no variable latency.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FabricConfig;
use crate::packet::Packet;
use crate::PeId;

// ---------------------------------------------------------------------------
// Transport interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Outbound queue full. Retry on a later cycle.
    #[error("outbound queue full")]
    QueueFull,
    /// No such endpoint. Fatal.
    #[error("endpoint {0} does not exist")]
    UnknownEndpoint(PeId),
}

/// What a remote memory controller needs from its network interface.
pub trait Transport {
    /// This endpoint's id.
    fn id(&self) -> PeId;

    /// Every endpoint reachable on the fabric, including this one.
    fn peers(&self) -> Vec<PeId>;

    fn send(&mut self, dest: PeId, pkt: &Packet) -> Result<(), SendError>;

    /// Next delivered packet, still encoded.
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// Nothing of ours is still waiting to leave.
    fn is_drained(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Endpoint {
    outbound: VecDeque<(PeId, Vec<u8>)>,
    inbound: VecDeque<Vec<u8>>,
}

/// Cumulative fabric counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FabricStats {
    pub packets_delivered: u64,
    pub bytes_delivered: u64,
    /// Sends refused because the outbound queue was full
    pub refused: u64,
}

pub struct Fabric {
    pub config: FabricConfig,
    endpoints: Vec<Endpoint>,
    pub stats: FabricStats,
}

impl Fabric {
    pub fn new(num_endpoints: usize, config: FabricConfig) -> Self {
        let endpoints = (0..num_endpoints).map(|_| Endpoint::default()).collect();
        Fabric { config, endpoints, stats: FabricStats::default() }
    }

    pub fn shared(self) -> Rc<RefCell<Fabric>> {
        Rc::new(RefCell::new(self))
    }

    pub fn num_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    fn endpoint(&self, id: PeId) -> Option<&Endpoint> {
        self.endpoints.get(id as usize)
    }

    fn enqueue(&mut self, src: PeId, dest: PeId, bytes: Vec<u8>) -> Result<(), SendError> {
        if dest as usize >= self.endpoints.len() {
            return Err(SendError::UnknownEndpoint(dest));
        }
        let depth = self.config.queue_depth;
        let ep = self
            .endpoints
            .get_mut(src as usize)
            .ok_or(SendError::UnknownEndpoint(src))?;
        if ep.outbound.len() >= depth {
            self.stats.refused += 1;
            return Err(SendError::QueueFull);
        }
        ep.outbound.push_back((dest, bytes));
        Ok(())
    }

    fn dequeue(&mut self, id: PeId) -> Option<Vec<u8>> {
        self.endpoints.get_mut(id as usize)?.inbound.pop_front()
    }

    /// Move one cycle's worth of packets from every outbound queue.
    pub fn tick(&mut self) {
        let budget = self.config.packets_per_cycle;
        let mut moving = Vec::new();
        for ep in &mut self.endpoints {
            let n = budget.min(ep.outbound.len());
            moving.extend(ep.outbound.drain(..n));
        }
        for (dest, bytes) in moving {
            self.stats.packets_delivered += 1;
            self.stats.bytes_delivered += bytes.len() as u64;
            // Destination was checked at enqueue time.
            if let Some(ep) = self.endpoints.get_mut(dest as usize) {
                ep.inbound.push_back(bytes);
            }
        }
    }

    /// Packets queued or delivered but not yet received.
    pub fn in_transit(&self) -> usize {
        self.endpoints
            .iter()
            .map(|ep| ep.outbound.len() + ep.inbound.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.in_transit() == 0
    }
}

// ---------------------------------------------------------------------------
// NicPort
// ---------------------------------------------------------------------------

/// One endpoint's handle onto a shared fabric.
pub struct NicPort {
    id: PeId,
    fabric: Rc<RefCell<Fabric>>,
}

impl NicPort {
    pub fn new(id: PeId, fabric: Rc<RefCell<Fabric>>) -> Self {
        NicPort { id, fabric }
    }
}

impl Transport for NicPort {
    fn id(&self) -> PeId {
        self.id
    }

    fn peers(&self) -> Vec<PeId> {
        (0..self.fabric.borrow().num_endpoints() as PeId).collect()
    }

    fn send(&mut self, dest: PeId, pkt: &Packet) -> Result<(), SendError> {
        log::trace!("PE {}: send {} #{} to PE {}", self.id, pkt.kind, pkt.id, dest);
        self.fabric.borrow_mut().enqueue(self.id, dest, pkt.encode())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.fabric.borrow_mut().dequeue(self.id)
    }

    fn is_drained(&self) -> bool {
        self.fabric
            .borrow()
            .endpoint(self.id)
            .is_none_or(|ep| ep.outbound.is_empty())
    }
}
