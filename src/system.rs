/// Multi-PE simulation driver.
///
/// Builds N processing elements on one shared fabric. Each PE owns a remote
/// memory controller, a flat local memory and a port on the fabric:
///
///   System
///   ├── PE 0  (BasicRmtMemCtrl + FlatMemory + NicPort)
///   ├── PE 1
///   └── ...
///       connected by one in-process Fabric
///
/// A cycle advances the fabric first, then every local memory, then every
/// controller, always in PE order, so runs are deterministic.
use std::cell::RefCell;
use std::rc::Rc;

use crate::config::SimConfig;
use crate::error::{Result, RmcError};
use crate::fabric::{Fabric, NicPort};
use crate::memory::{FlatMemory, SharedMemory};
use crate::metrics::{now_ms, write_metrics, LiveMetrics, PeSnapshot};
use crate::op::{Completion, RmtOp};
use crate::rmc::{BasicRmtMemCtrl, RmtMemCtrl};
use crate::PeId;

// ---------------------------------------------------------------------------
// ProcessingElement
// ---------------------------------------------------------------------------

pub struct ProcessingElement {
    pub id: PeId,
    pub rmc: BasicRmtMemCtrl,
    /// Also attached to `rmc` as its local memory engine
    pub mem: Rc<RefCell<FlatMemory>>,
}

impl ProcessingElement {
    fn snapshot(&self) -> PeSnapshot {
        PeSnapshot {
            id: self.id,
            outstanding: self.rmc.outstanding_count(),
            parked_responses: self.rmc.parked_responses(),
            serving: self.rmc.serving(),
            drained: self.rmc.is_drained(),
            stats: self.rmc.stats().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

pub struct System {
    pub config: SimConfig,
    pub fabric: Rc<RefCell<Fabric>>,
    pub pes: Vec<ProcessingElement>,
    pub cycle: u64,
}

impl System {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let fabric = Fabric::new(config.num_pes, config.fabric.clone()).shared();
        let mut pes = Vec::with_capacity(config.num_pes);
        for id in 0..config.num_pes as PeId {
            let port = NicPort::new(id, fabric.clone());
            let mut rmc = BasicRmtMemCtrl::new(config.rmc.clone(), Box::new(port))?;
            let mem = FlatMemory::new(config.mem_size_bytes)
                .with_latency(config.mem_latency)
                .shared();
            let engine: SharedMemory = mem.clone();
            rmc.set_local_memory_engine(engine);
            pes.push(ProcessingElement { id, rmc, mem });
        }
        log::info!(
            "system up: {} PEs, fabric depth {} x {} packets/cycle, memory latency {}",
            config.num_pes,
            config.fabric.queue_depth,
            config.fabric.packets_per_cycle,
            config.mem_latency
        );
        Ok(System { config, fabric, pes, cycle: 0 })
    }

    pub fn num_pes(&self) -> usize {
        self.pes.len()
    }

    fn pe_index(&self, pe: PeId) -> Result<usize> {
        let idx = pe as usize;
        if idx < self.pes.len() { Ok(idx) } else { Err(RmcError::UnknownEndpoint(pe)) }
    }

    pub fn pe(&self, pe: PeId) -> Result<&ProcessingElement> {
        Ok(&self.pes[self.pe_index(pe)?])
    }

    pub fn pe_mut(&mut self, pe: PeId) -> Result<&mut ProcessingElement> {
        let idx = self.pe_index(pe)?;
        Ok(&mut self.pes[idx])
    }

    /// Hand `op` to `pe`'s controller.
    pub fn submit(&mut self, pe: PeId, op: RmtOp) -> Result<bool> {
        Ok(self.pe_mut(pe)?.rmc.submit(op))
    }

    /// Every completion `pe` has delivered so far.
    pub fn drain_completions(&mut self, pe: PeId) -> Result<Vec<Completion>> {
        let rmc = &mut self.pe_mut(pe)?.rmc;
        Ok(std::iter::from_fn(|| rmc.poll_completion()).collect())
    }

    pub fn tick(&mut self) -> Result<()> {
        self.fabric.borrow_mut().tick();
        for pe in &self.pes {
            pe.mem.borrow_mut().tick();
        }
        for pe in &mut self.pes {
            pe.rmc.clock_tick()?;
        }
        self.cycle += 1;

        let every = self.config.metrics_every;
        if every > 0 && self.cycle % every == 0 {
            self.publish_metrics("running");
        }
        Ok(())
    }

    /// Nothing queued anywhere: controllers, memories and fabric.
    pub fn is_quiescent(&self) -> bool {
        self.fabric.borrow().is_empty()
            && self
                .pes
                .iter()
                .all(|pe| pe.rmc.is_drained() && pe.mem.borrow().pending_completions() == 0)
    }

    /// Tick until quiescent. Returns the number of cycles run.
    pub fn run_until_drained(&mut self, max_cycles: u64) -> Result<u64> {
        let start = self.cycle;
        while !self.is_quiescent() {
            if self.cycle - start >= max_cycles {
                log::warn!("system still busy after {} cycles", max_cycles);
                if self.config.metrics_every > 0 {
                    self.publish_metrics("stalled");
                }
                return Err(RmcError::NotQuiescent { cycles: max_cycles });
            }
            self.tick()?;
        }
        log::debug!("system drained after {} cycles", self.cycle - start);
        if self.config.metrics_every > 0 {
            self.publish_metrics("drained");
        }
        Ok(self.cycle - start)
    }

    pub fn snapshot(&self, status: &str) -> LiveMetrics {
        let fabric = self.fabric.borrow();
        LiveMetrics {
            status: status.to_string(),
            cycle: self.cycle,
            num_pes: self.pes.len(),
            queue_depth: fabric.config.queue_depth,
            packets_per_cycle: fabric.config.packets_per_cycle,
            in_transit: fabric.in_transit(),
            fabric: fabric.stats,
            pes: self.pes.iter().map(ProcessingElement::snapshot).collect(),
            timestamp_ms: now_ms(),
        }
    }

    /// Write a snapshot for the visualizer.
    pub fn publish_metrics(&self, status: &str) {
        write_metrics(&self.snapshot(status));
    }
}
