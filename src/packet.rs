/// Wire packets for the remote memory protocol.
///
/// Every remote transaction is one request packet and one response packet.
/// The response reuses the request's correlation id so the originator can
/// match it against its outstanding-request table.
///
/// # Layout
///
/// All multi-byte fields are little-endian.
///
/// | Offset | Size | Field                                   |
/// | -----: | ---: | --------------------------------------- |
/// |      0 |    1 | kind                                    |
/// |      1 |    4 | correlation id                          |
/// |      5 |    4 | source endpoint                         |
/// |      9 |    8 | source address                          |
/// |     17 |    8 | destination address                     |
/// |     25 |    8 | element size                            |
/// |     33 |    4 | element count                           |
/// |     37 |    4 | stride                                  |
/// |     41 |    4 | flags                                   |
/// |     45 |    1 | ordering bits (bit 0 aq, bit 1 rl)      |
/// |     46 |    4 | payload length                          |
/// |     50 |    n | payload                                 |
use std::fmt;

use bitvec::{field::BitField, prelude as bv};
use paste::paste;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RmcError};
use crate::PeId;

pub const PKT_HDR_SIZE: usize = 50;

// ---------------------------------------------------------------------------
// OpKind
// ---------------------------------------------------------------------------

/// Operation carried by a packet. Response kinds live at `0x10 | request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    Read = 0x00,
    BulkRead = 0x01,
    Write = 0x02,
    BulkWrite = 0x03,
    ReadLock = 0x04,
    WriteUnlock = 0x05,
    Amo = 0x06,
    /// Local barrier. Never transmitted.
    Fence = 0x07,

    ReadResp = 0x10,
    BulkReadResp = 0x11,
    WriteResp = 0x12,
    BulkWriteResp = 0x13,
    ReadLockResp = 0x14,
    WriteUnlockResp = 0x15,
    AmoResp = 0x16,
}

impl OpKind {
    pub fn is_response(self) -> bool {
        (self as u8) & 0x10 != 0
    }

    /// The response kind answering this request kind.
    pub fn response(self) -> Option<OpKind> {
        match self {
            OpKind::Read => Some(OpKind::ReadResp),
            OpKind::BulkRead => Some(OpKind::BulkReadResp),
            OpKind::Write => Some(OpKind::WriteResp),
            OpKind::BulkWrite => Some(OpKind::BulkWriteResp),
            OpKind::ReadLock => Some(OpKind::ReadLockResp),
            OpKind::WriteUnlock => Some(OpKind::WriteUnlockResp),
            OpKind::Amo => Some(OpKind::AmoResp),
            _ => None,
        }
    }

    /// Whether a packet of this kind carries `size * nelem` payload bytes.
    pub fn carries_data(self) -> bool {
        matches!(
            self,
            OpKind::Write
                | OpKind::BulkWrite
                | OpKind::WriteUnlock
                | OpKind::Amo
                | OpKind::ReadResp
                | OpKind::BulkReadResp
                | OpKind::ReadLockResp
                | OpKind::WriteUnlockResp
                | OpKind::AmoResp
        )
    }
}

impl TryFrom<u8> for OpKind {
    type Error = RmcError;

    fn try_from(val: u8) -> Result<Self> {
        Ok(match val {
            0x00 => OpKind::Read,
            0x01 => OpKind::BulkRead,
            0x02 => OpKind::Write,
            0x03 => OpKind::BulkWrite,
            0x04 => OpKind::ReadLock,
            0x05 => OpKind::WriteUnlock,
            0x06 => OpKind::Amo,
            0x07 => OpKind::Fence,
            0x10 => OpKind::ReadResp,
            0x11 => OpKind::BulkReadResp,
            0x12 => OpKind::WriteResp,
            0x13 => OpKind::BulkWriteResp,
            0x14 => OpKind::ReadLockResp,
            0x15 => OpKind::WriteUnlockResp,
            0x16 => OpKind::AmoResp,
            other => return Err(RmcError::UnknownOpKind(other)),
        })
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// AMO sub-opcodes
// ---------------------------------------------------------------------------

/// Atomic memory operation applied at the remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AmoOp {
    Add = 0,
    Swap = 1,
    And = 2,
    Or = 3,
    Xor = 4,
    Min = 5,
    Max = 6,
    MinU = 7,
    MaxU = 8,
}

impl TryFrom<u32> for AmoOp {
    type Error = RmcError;

    fn try_from(val: u32) -> Result<Self> {
        Ok(match val {
            0 => AmoOp::Add,
            1 => AmoOp::Swap,
            2 => AmoOp::And,
            3 => AmoOp::Or,
            4 => AmoOp::Xor,
            5 => AmoOp::Min,
            6 => AmoOp::Max,
            7 => AmoOp::MinU,
            8 => AmoOp::MaxU,
            other => return Err(RmcError::UnknownAmoOp(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Bit-field accessors
// ---------------------------------------------------------------------------

macro_rules! impl_accessor {
    ($field:ident, bool, $bit:expr) => {
        paste! {
            #[inline(always)]
            pub fn [< set_ $field >](&mut self, val: bool) {
                self.bits.set($bit, val);
            }

            #[inline(always)]
            pub fn $field(&self) -> bool {
                self.bits[$bit]
            }
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            #[inline(always)]
            pub fn [< set_ $field >](&mut self, val: $field_ty) {
                self.bits[$lsb..=$msb].store_le::<$field_ty>(val);
            }

            #[inline(always)]
            pub fn $field(&self) -> $field_ty {
                self.bits[$lsb..=$msb].load_le::<$field_ty>()
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Per-operation flag word, transmitted verbatim.
///
/// # Layout
///
/// | Lsb | Msb | Name        |
/// | --: | --: | ----------- |
/// |   0 |   0 | acquire     |
/// |   1 |   1 | release     |
/// |   2 |   2 | sign_extend |
/// |   3 |   3 | bypass      |
/// |   8 |  11 | amo_code    |
///
/// Bits not listed are carried through untouched.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Flags {
    bits: bv::BitArr!(for 32, in u32),
}

impl Flags {
    impl_accessor!(acquire, bool, 0);
    impl_accessor!(release, bool, 1);
    impl_accessor!(sign_extend, bool, 2);
    impl_accessor!(amo_code, u8, 8, 11);

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bits(raw: u32) -> Self {
        Flags { bits: bv::BitArray::new([raw]) }
    }

    pub fn bits(self) -> u32 {
        self.bits.load_le::<u32>()
    }

    /// Every bit set in either word.
    pub fn union(self, other: Flags) -> Self {
        Flags::from_bits(self.bits() | other.bits())
    }

    pub fn with_acquire(mut self) -> Self {
        self.set_acquire(true);
        self
    }

    pub fn with_release(mut self) -> Self {
        self.set_release(true);
        self
    }

    pub fn with_sign_extend(mut self) -> Self {
        self.set_sign_extend(true);
        self
    }

    pub fn with_amo(mut self, op: AmoOp) -> Self {
        self.set_amo_code(op as u8);
        self
    }

    pub fn amo_op(self) -> Result<AmoOp> {
        AmoOp::try_from(self.amo_code() as u32)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flags")
            .field("acquire", &self.acquire())
            .field("release", &self.release())
            .field("sign_extend", &self.sign_extend())
            .field("amo_code", &self.amo_code())
            .field("raw", &format_args!("{:#x}", self.bits()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed packet header, 50 bytes. See the module docs for the byte layout.
///
/// | Lsb | Msb | Name        |
/// | --: | --: | ----------- |
/// |   0 |   7 | kind        |
/// |   8 |  39 | id          |
/// |  40 |  71 | src         |
/// |  72 | 135 | src_addr    |
/// | 136 | 199 | dest_addr   |
/// | 200 | 263 | size        |
/// | 264 | 295 | nelem       |
/// | 296 | 327 | stride      |
/// | 328 | 359 | flags       |
/// | 360 | 360 | aq          |
/// | 361 | 361 | rl          |
/// | 368 | 399 | payload_len |
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct PacketHeader {
    bits: bv::BitArr!(for PKT_HDR_SIZE * 8, in u8),
}

impl PacketHeader {
    impl_accessor!(kind, u8, 0, 7);
    impl_accessor!(id, u32, 8, 39);
    impl_accessor!(src, u32, 40, 71);
    impl_accessor!(src_addr, u64, 72, 135);
    impl_accessor!(dest_addr, u64, 136, 199);
    impl_accessor!(size, u64, 200, 263);
    impl_accessor!(nelem, u32, 264, 295);
    impl_accessor!(stride, u32, 296, 327);
    impl_accessor!(flags, u32, 328, 359);
    impl_accessor!(aq, bool, 360);
    impl_accessor!(rl, bool, 361);
    impl_accessor!(payload_len, u32, 368, 399);

    fn from_bytes(raw: [u8; PKT_HDR_SIZE]) -> Self {
        PacketHeader { bits: bv::BitArray::new(raw) }
    }

    fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: OpKind,
    pub id: u32,
    pub src: PeId,
    pub src_addr: u64,
    pub dest_addr: u64,
    pub size: u64,
    pub nelem: u32,
    pub stride: u32,
    pub flags: Flags,
    /// Acquire bit mirrored from the issuing instruction.
    pub aq: bool,
    /// Release bit mirrored from the issuing instruction.
    pub rl: bool,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build the response to `req`, sent from `src`.
    ///
    /// Addresses, geometry and flags are echoed so the originator can
    /// cross-check them; only the kind, source and payload change.
    pub fn response_to(req: &Packet, src: PeId, payload: Vec<u8>) -> Result<Packet> {
        let kind = req
            .kind
            .response()
            .ok_or(RmcError::UnexpectedPacket { kind: req.kind })?;
        let (size, nelem) = match kind {
            OpKind::WriteUnlockResp => (1, 1),
            _ => (req.size, req.nelem),
        };
        Ok(Packet {
            kind,
            id: req.id,
            src,
            src_addr: req.src_addr,
            dest_addr: req.dest_addr,
            size,
            nelem,
            stride: req.stride,
            flags: req.flags,
            aq: req.aq,
            rl: req.rl,
            payload,
        })
    }

    /// `size * nelem`, or `None` if the geometry does not fit in memory.
    pub fn total_bytes(&self) -> Option<usize> {
        self.size
            .checked_mul(self.nelem as u64)
            .and_then(|n| usize::try_from(n).ok())
    }

    /// Number of payload bytes this packet must carry.
    pub fn expected_payload_len(&self) -> Option<usize> {
        if self.kind.carries_data() { self.total_bytes() } else { Some(0) }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut hdr = PacketHeader::default();
        hdr.set_kind(self.kind as u8);
        hdr.set_id(self.id);
        hdr.set_src(self.src);
        hdr.set_src_addr(self.src_addr);
        hdr.set_dest_addr(self.dest_addr);
        hdr.set_size(self.size);
        hdr.set_nelem(self.nelem);
        hdr.set_stride(self.stride);
        hdr.set_flags(self.flags.bits());
        hdr.set_aq(self.aq);
        hdr.set_rl(self.rl);
        hdr.set_payload_len(self.payload.len() as u32);

        let mut buf = Vec::with_capacity(PKT_HDR_SIZE + self.payload.len());
        buf.extend_from_slice(hdr.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Packet> {
        let truncated = RmcError::Truncated { need: PKT_HDR_SIZE, got: buf.len() };
        let raw = buf
            .get(..PKT_HDR_SIZE)
            .and_then(|b| <[u8; PKT_HDR_SIZE]>::try_from(b).ok())
            .ok_or(truncated)?;
        let hdr = PacketHeader::from_bytes(raw);

        let kind = OpKind::try_from(hdr.kind())?;
        if kind == OpKind::Fence {
            return Err(RmcError::UnexpectedPacket { kind });
        }
        let need = PKT_HDR_SIZE + hdr.payload_len() as usize;
        if buf.len() < need {
            return Err(RmcError::Truncated { need, got: buf.len() });
        }

        let pkt = Packet {
            kind,
            id: hdr.id(),
            src: hdr.src(),
            src_addr: hdr.src_addr(),
            dest_addr: hdr.dest_addr(),
            size: hdr.size(),
            nelem: hdr.nelem(),
            stride: hdr.stride(),
            flags: Flags::from_bits(hdr.flags()),
            aq: hdr.aq(),
            rl: hdr.rl(),
            payload: buf[PKT_HDR_SIZE..need].to_vec(),
        };
        pkt.validate()?;
        Ok(pkt)
    }

    /// Check the payload-length invariant and request geometry.
    pub fn validate(&self) -> Result<()> {
        if !self.kind.is_response() && (self.size == 0 || self.nelem == 0) {
            return Err(RmcError::EmptyRequest {
                kind: self.kind,
                size: self.size,
                nelem: self.nelem,
            });
        }
        let expected = self.expected_payload_len().ok_or(RmcError::TooLarge {
            kind: self.kind,
            size: self.size,
            nelem: self.nelem,
            limit: usize::MAX as u64,
        })?;
        if self.payload.len() != expected {
            return Err(RmcError::PayloadMismatch {
                kind: self.kind,
                expected,
                got: self.payload.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pkt() -> Packet {
        Packet {
            kind: OpKind::Write,
            id: 7,
            src: 3,
            src_addr: 0,
            dest_addr: 0x1000,
            size: 4,
            nelem: 1,
            stride: 0,
            flags: Flags::empty().with_release(),
            aq: false,
            rl: true,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), PKT_HDR_SIZE);
        assert_eq!(std::mem::size_of::<Flags>(), 4);
    }

    #[test]
    fn overflowing_geometry_is_an_error() {
        let mut pkt = write_pkt();
        pkt.size = 1 << 63;
        pkt.nelem = 2;
        pkt.payload.clear();
        assert!(matches!(
            Packet::decode(&pkt.encode()),
            Err(RmcError::TooLarge { nelem: 2, .. })
        ));
    }

    #[test]
    fn header_is_fifty_bytes() {
        let mut pkt = write_pkt();
        pkt.kind = OpKind::WriteResp;
        pkt.payload.clear();
        assert_eq!(pkt.encode().len(), PKT_HDR_SIZE);
    }

    #[test]
    fn decode_restores_write() {
        let pkt = write_pkt();
        let bytes = pkt.encode();
        assert_eq!(bytes[0], OpKind::Write as u8);
        assert_eq!(&bytes[1..5], &7u32.to_le_bytes());
        assert_eq!(bytes[45], 0b10);
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = write_pkt().encode();
        bytes[0] = 0x3f;
        assert!(matches!(Packet::decode(&bytes), Err(RmcError::UnknownOpKind(0x3f))));
    }

    #[test]
    fn fence_never_decodes() {
        let mut bytes = write_pkt().encode();
        bytes[0] = OpKind::Fence as u8;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(RmcError::UnexpectedPacket { kind: OpKind::Fence })
        ));
    }

    #[test]
    fn payload_must_match_geometry() {
        let mut pkt = write_pkt();
        pkt.nelem = 2;
        assert!(matches!(
            Packet::decode(&pkt.encode()),
            Err(RmcError::PayloadMismatch { expected: 8, got: 4, .. })
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = write_pkt().encode();
        assert!(matches!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(RmcError::Truncated { .. })
        ));
        assert!(matches!(Packet::decode(&bytes[..10]), Err(RmcError::Truncated { .. })));
    }

    #[test]
    fn write_unlock_response_carries_one_byte() {
        let mut req = write_pkt();
        req.kind = OpKind::WriteUnlock;
        req.size = 8;
        req.payload = vec![0; 8];
        let resp = Packet::response_to(&req, 9, vec![1]).unwrap();
        assert_eq!(resp.kind, OpKind::WriteUnlockResp);
        assert_eq!(resp.id, req.id);
        assert_eq!((resp.size, resp.nelem), (1, 1));
        resp.validate().unwrap();
    }

    #[test]
    fn amo_subop_lives_in_flags() {
        let flags = Flags::empty().with_acquire().with_amo(AmoOp::MaxU);
        assert!(flags.acquire());
        assert_eq!(flags.bits(), 0x801);
        assert_eq!(flags.amo_op().unwrap(), AmoOp::MaxU);
        assert!(matches!(Flags::from_bits(0xf << 8).amo_op(), Err(RmcError::UnknownAmoOp(15))));
    }
}
