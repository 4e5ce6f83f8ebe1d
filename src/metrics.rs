/// Live metrics for the TUI visualizer.
///
/// The system driver writes a JSON snapshot to METRICS_PATH every
/// `metrics_every` cycles and once more when a run finishes. The viz binary
/// polls this file and re-renders the dashboard. Writes are atomic (write to
/// .tmp then rename) to avoid torn reads.
use serde::{Deserialize, Serialize};

use crate::fabric::FabricStats;
use crate::rmc::RmcStats;
use crate::PeId;

pub const METRICS_PATH: &str = "/tmp/rmemsim_live.json";

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One PE's remote memory controller at snapshot time.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct PeSnapshot {
    pub id: PeId,
    /// Submitted requests not yet answered
    pub outstanding: u64,
    /// Responses waiting for transport space
    pub parked_responses: usize,
    /// Peer requests waiting on this PE's memory
    pub serving: usize,
    pub drained: bool,
    pub stats: RmcStats,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    /// "idle" | "running" | "drained" | "stalled"
    pub status: String,
    pub cycle: u64,
    pub num_pes: usize,
    /// Fabric queue depth per endpoint
    pub queue_depth: usize,
    pub packets_per_cycle: usize,
    /// Packets queued or delivered but not yet received
    pub in_transit: usize,
    pub fabric: FabricStats,
    /// Index = PE id
    pub pes: Vec<PeSnapshot>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

impl LiveMetrics {
    pub fn total_completions(&self) -> u64 {
        self.pes.iter().map(|pe| pe.stats.completions).sum()
    }

    pub fn total_outstanding(&self) -> u64 {
        self.pes.iter().map(|pe| pe.outstanding).sum()
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write metrics to METRICS_PATH.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_metrics(metrics: &LiveMetrics) {
    match serde_json::to_string(metrics) {
        Ok(json) => {
            let tmp = format!("{}.tmp", METRICS_PATH);
            if let Err(e) = std::fs::write(&tmp, &json).and_then(|_| std::fs::rename(&tmp, METRICS_PATH)) {
                log::warn!("could not write metrics to {}: {}", METRICS_PATH, e);
            }
        }
        Err(e) => log::warn!("could not serialize metrics: {}", e),
    }
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no simulation has run yet).
pub fn read_metrics() -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(METRICS_PATH).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
