pub mod config;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod metrics;
pub mod op;
pub mod packet;
pub mod rmc;
pub mod router;
pub mod system;
pub mod tracker;

#[cfg(test)]
mod tests;

/// Processing-element (endpoint) id on the fabric.
pub type PeId = u32;

/// Hardware thread id within a PE.
pub type HartId = u32;

pub use config::{FabricConfig, RmcConfig, SimConfig};
pub use error::{Result, RmcError};
pub use op::{Completion, CompletionHandle, RmtOp, Target};
pub use rmc::{BasicRmtMemCtrl, RmtMemCtrl};
