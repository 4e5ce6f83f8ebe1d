/// Error types for the remote memory subsystem.
///
/// Everything here is fatal to the simulation: configuration mistakes found
/// at setup, and protocol invariant violations found while running. Ordinary
/// backpressure (a saturated admission ceiling, a full transport queue) is
/// never reported as an error.
use thiserror::Error;

use crate::packet::OpKind;
use crate::PeId;

#[derive(Debug, Error)]
pub enum RmcError {
    // -- configuration ------------------------------------------------------
    #[error("namespace {0:#x} has no routing entry")]
    UnknownNamespace(u64),

    #[error("namespace table full ({capacity} entries)")]
    NamespaceTableFull { capacity: usize },

    #[error("namespace {0:#x} is already mapped")]
    DuplicateNamespace(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no local memory engine attached to PE {0}")]
    NoMemoryEngine(PeId),

    #[error("endpoint {0} is not attached to the fabric")]
    UnknownEndpoint(PeId),

    // -- protocol -----------------------------------------------------------
    #[error("response {kind} from PE {src} carries unknown correlation id {id}")]
    UnknownCorrelationId { kind: OpKind, src: PeId, id: u32 },

    #[error("response kind {got} does not answer request kind {expected} (id {id})")]
    ResponseMismatch { expected: OpKind, got: OpKind, id: u32 },

    #[error("unknown operation kind {0:#04x}")]
    UnknownOpKind(u8),

    #[error("unknown AMO sub-opcode {0}")]
    UnknownAmoOp(u32),

    #[error("{kind} is not valid on the wire")]
    UnexpectedPacket { kind: OpKind },

    #[error("packet truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("{kind} payload is {got} bytes, expected {expected}")]
    PayloadMismatch { kind: OpKind, expected: usize, got: usize },

    #[error("{kind} request with size {size} x {nelem} elements")]
    EmptyRequest { kind: OpKind, size: u64, nelem: u32 },

    #[error("{kind} element size {size} does not fit the local memory interface")]
    Oversized { kind: OpKind, size: u64 },

    #[error("{kind} of {size} x {nelem} bytes exceeds the {limit}-byte limit")]
    TooLarge { kind: OpKind, size: u64, nelem: u32, limit: u64 },

    #[error("AMO with {size}-byte operand x {nelem} elements (need 1, 2, 4 or 8 bytes x 1)")]
    InvalidAmo { size: u64, nelem: u32 },

    #[error("local request {0} is not tracked")]
    UnknownLocalRequest(u64),

    #[error("local completion record for {0} already open")]
    DuplicateRecord(String),

    // -- simulation driver --------------------------------------------------
    #[error("system not quiescent after {cycles} cycles")]
    NotQuiescent { cycles: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RmcError>;
