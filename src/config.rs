/// Configuration for the remote memory controller, the fabric and the
/// multi-PE driver. All structs deserialize from JSON with every field
/// optional; missing fields take the defaults below.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RmcError};
use crate::op::Category;

// ---------------------------------------------------------------------------
// Remote memory controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RmcConfig {
    /// Maximum outstanding remote loads (reads, bulk reads and AMOs)
    pub max_loads: u32,
    /// Maximum outstanding remote stores (writes and bulk writes)
    pub max_stores: u32,
    /// Maximum outstanding read-lock (load-reserve) requests
    pub max_readlocks: u32,
    /// Maximum outstanding write-unlock (store-conditional) requests
    pub max_writeunlocks: u32,
    /// Requests admitted to the network per cycle
    pub max_ops: u32,
    /// Parked responses retried per cycle
    pub max_responses: u32,
    /// Namespace lookaside buffer capacity
    pub max_namespaces: usize,
    /// Largest `size * nelem` accepted for one request, local or remote
    pub max_request_bytes: u64,
    /// 0 = warnings only, 1 = info, 2 = debug, 3+ = trace
    pub verbose: u32,
}

impl Default for RmcConfig {
    fn default() -> Self {
        Self {
            max_loads: 64,
            max_stores: 64,
            max_readlocks: 64,
            max_writeunlocks: 64,
            max_ops: 2,
            max_responses: 2,
            max_namespaces: 1024,
            max_request_bytes: 16 << 20,
            verbose: 0,
        }
    }
}

impl RmcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_loads(mut self, max_loads: u32) -> Self {
        self.max_loads = max_loads;
        self
    }

    pub fn with_max_stores(mut self, max_stores: u32) -> Self {
        self.max_stores = max_stores;
        self
    }

    pub fn with_max_readlocks(mut self, max_readlocks: u32) -> Self {
        self.max_readlocks = max_readlocks;
        self
    }

    pub fn with_max_writeunlocks(mut self, max_writeunlocks: u32) -> Self {
        self.max_writeunlocks = max_writeunlocks;
        self
    }

    pub fn with_max_ops(mut self, max_ops: u32) -> Self {
        self.max_ops = max_ops;
        self
    }

    pub fn with_max_responses(mut self, max_responses: u32) -> Self {
        self.max_responses = max_responses;
        self
    }

    pub fn with_max_namespaces(mut self, max_namespaces: usize) -> Self {
        self.max_namespaces = max_namespaces;
        self
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: u64) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    /// Outstanding-request ceiling for `cat`. Fences have none.
    pub fn ceiling(&self, cat: Category) -> u32 {
        match cat {
            Category::Read => self.max_loads,
            Category::Write => self.max_stores,
            Category::ReadLock => self.max_readlocks,
            Category::WriteUnlock => self.max_writeunlocks,
            Category::Fence => u32::MAX,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, val) in [
            ("max_loads", self.max_loads),
            ("max_stores", self.max_stores),
            ("max_readlocks", self.max_readlocks),
            ("max_writeunlocks", self.max_writeunlocks),
            ("max_ops", self.max_ops),
            ("max_responses", self.max_responses),
        ] {
            if val == 0 {
                return Err(RmcError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        if self.max_namespaces == 0 {
            return Err(RmcError::InvalidConfig("max_namespaces must be at least 1".into()));
        }
        if self.max_request_bytes == 0 {
            return Err(RmcError::InvalidConfig("max_request_bytes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

/// Fixed-budget point-to-point fabric. No topology, no variable latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Outbound packets buffered per endpoint before sends are refused
    pub queue_depth: usize,
    /// Packets each endpoint injects per cycle
    pub packets_per_cycle: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig { queue_depth: 64, packets_per_cycle: 4 }
    }
}

impl FabricConfig {
    /// Deep queues and a wide injection budget; backpressure is rare.
    pub fn wide() -> Self {
        FabricConfig { queue_depth: 1024, packets_per_cycle: 32 }
    }

    /// One packet per cycle through a two-entry queue; backpressure is common.
    pub fn narrow() -> Self {
        FabricConfig { queue_depth: 2, packets_per_cycle: 1 }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 || self.packets_per_cycle == 0 {
            return Err(RmcError::InvalidConfig(
                "fabric queue_depth and packets_per_cycle must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Whole simulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub num_pes: usize,
    /// Per-PE memory size in bytes
    pub mem_size_bytes: usize,
    /// Local memory completion latency in cycles
    pub mem_latency: u64,
    pub rmc: RmcConfig,
    pub fabric: FabricConfig,
    /// Write a metrics snapshot every N cycles (0 = never)
    pub metrics_every: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            num_pes: 4,
            mem_size_bytes: 64 * 1024 * 1024,
            mem_latency: 2,
            rmc: RmcConfig::default(),
            fabric: FabricConfig::default(),
            metrics_every: 0,
        }
    }
}

impl SimConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_pes == 0 {
            return Err(RmcError::InvalidConfig("num_pes must be at least 1".into()));
        }
        self.rmc.validate()?;
        self.fabric.validate()
    }
}
