//! Frames exchanged with the backend.
//!
//! Every frame is a fixed six byte header followed by a payload whose size
//! is fixed by the frame type:
//!
//! ```text
//! type u8 | txn_id u16 | consumer_ack_req u8 | crc u16 | payload[..]
//! ```
//!
//! All multi-byte fields are little-endian and packed. Payload contents are
//! described by the types in [`payload`] and [`command`].

use std::fmt;

use parallax_crc::crc16;

pub mod command;
pub mod payload;

pub use command::Command;
pub use payload::{
    AddUser, CmdResp, CmdStatus, EmployeeRecord, FotaAck, FotaDescriptor, FotaKind, FotaStatus,
    Hello, Login, Payload, SyncMode, SyncRequest,
};

pub const HEADER_LEN: usize = 6;
pub const SMALL_PAYLOAD: usize = 16;
pub const MEDIUM_PAYLOAD: usize = 256;
pub const LARGE_PAYLOAD: usize = 512;
pub const MAX_FRAME_LEN: usize = HEADER_LEN + LARGE_PAYLOAD;

const OFF_TYPE: usize = 0;
const OFF_TXN: usize = 1;
const OFF_ACK_REQ: usize = 3;
const OFF_CRC: usize = 4;

/// The first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Cmd = 1,
    InternalAck = 2,
    DeviceAck = 3,
    ServerAck = 4,
    Login = 5,
    Hello = 6,
    CmdResp = 7,
    Echo = 9,
    Sync = 10,
    Fota = 11,
    FotaAck = 12,
    Void = 13,
    /// Diagnostic: the device restarts as soon as it sees this tag.
    Crash = 100,
}

impl PacketType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => PacketType::Data,
            1 => PacketType::Cmd,
            2 => PacketType::InternalAck,
            3 => PacketType::DeviceAck,
            4 => PacketType::ServerAck,
            5 => PacketType::Login,
            6 => PacketType::Hello,
            7 => PacketType::CmdResp,
            9 => PacketType::Echo,
            10 => PacketType::Sync,
            11 => PacketType::Fota,
            12 => PacketType::FotaAck,
            13 => PacketType::Void,
            100 => PacketType::Crash,
            _ => return None,
        })
    }

    pub const fn payload_len(self) -> usize {
        match self {
            PacketType::Data => LARGE_PAYLOAD,
            PacketType::InternalAck | PacketType::DeviceAck | PacketType::ServerAck => {
                SMALL_PAYLOAD
            }
            PacketType::Crash => 0,
            _ => MEDIUM_PAYLOAD,
        }
    }

    /// Total frame length, header included.
    pub const fn frame_len(self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    pub const fn is_ack(self) -> bool {
        matches!(
            self,
            PacketType::InternalAck | PacketType::DeviceAck | PacketType::ServerAck
        )
    }
}

/// Frame length for a raw type byte, if the type is known.
pub fn packet_get_size(tag: u8) -> Option<usize> {
    PacketType::from_u8(tag).map(PacketType::frame_len)
}

/// Reason byte carried by the three ack frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckReason(pub u8);

impl AckReason {
    pub const GOOD: Self = Self(0);
    pub const TCP_DOWN: Self = Self(1);
    pub const SERVER_TIMED_OUT: Self = Self(2);

    pub fn is_good(&self) -> bool {
        *self == Self::GOOD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    UnknownType(u8),
    WrongLength { expected: usize, got: usize },
    WrongType { expected: PacketType, got: PacketType },
    UnknownCommand(u8),
    Truncated,
}

/// One whole frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

// ---- impls ----

impl Packet {
    /// A zeroed frame of the given type, CRC unset.
    pub fn new(ty: PacketType, txn_id: u16, ack_required: bool) -> Self {
        let mut bytes = vec![0u8; ty.frame_len()];
        bytes[OFF_TYPE] = ty as u8;
        bytes[OFF_TXN..OFF_TXN + 2].copy_from_slice(&txn_id.to_le_bytes());
        bytes[OFF_ACK_REQ] = ack_required as u8;
        Self { bytes }
    }

    /// A frame carrying `payload`, CRC stamped.
    pub fn with_payload<P: Payload>(ty: PacketType, txn_id: u16, ack_required: bool, payload: &P) -> Self {
        let mut pkt = Self::new(ty, txn_id, ack_required);
        payload.encode(pkt.payload_mut());
        pkt.stamp_crc();
        pkt
    }

    /// A frame with raw payload bytes, zero padded, CRC stamped.
    pub fn with_raw(ty: PacketType, txn_id: u16, ack_required: bool, data: &[u8]) -> Self {
        let mut pkt = Self::new(ty, txn_id, ack_required);
        let body = pkt.payload_mut();
        let n = data.len().min(body.len());
        body[..n].copy_from_slice(&data[..n]);
        pkt.stamp_crc();
        pkt
    }

    /// An ack of one of the three ack types. Acks are never acked.
    pub fn ack(ty: PacketType, txn_id: u16, reason: AckReason) -> Self {
        Self::with_raw(ty, txn_id, false, &[reason.0])
    }

    /// Validates the type byte and length of a received frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let tag = *bytes.first().ok_or(DecodeError::Truncated)?;
        let ty = PacketType::from_u8(tag).ok_or(DecodeError::UnknownType(tag))?;
        if bytes.len() != ty.frame_len() {
            return Err(DecodeError::WrongLength {
                expected: ty.frame_len(),
                got: bytes.len(),
            });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn packet_type(&self) -> PacketType {
        // validated by every constructor
        PacketType::from_u8(self.bytes[OFF_TYPE]).unwrap_or(PacketType::Void)
    }

    pub fn txn_id(&self) -> u16 {
        u16::from_le_bytes([self.bytes[OFF_TXN], self.bytes[OFF_TXN + 1]])
    }

    pub fn set_txn_id(&mut self, txn_id: u16) {
        self.bytes[OFF_TXN..OFF_TXN + 2].copy_from_slice(&txn_id.to_le_bytes());
    }

    pub fn consumer_ack_required(&self) -> bool {
        self.bytes.get(OFF_ACK_REQ).is_some_and(|b| *b != 0)
    }

    pub fn crc(&self) -> u16 {
        match self.bytes.get(OFF_CRC..OFF_CRC + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    pub fn stamp_crc(&mut self) {
        let crc = crc16(self.payload());
        if let Some(b) = self.bytes.get_mut(OFF_CRC..OFF_CRC + 2) {
            b.copy_from_slice(&crc.to_le_bytes());
        }
    }

    /// Does the header CRC cover the payload as it stands?
    pub fn crc_matches(&self) -> bool {
        self.crc() == crc16(self.payload())
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(HEADER_LEN..).unwrap_or(&[])
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.bytes.get_mut(HEADER_LEN..).unwrap_or(&mut [])
    }

    /// Reason byte of an ack frame.
    pub fn ack_reason(&self) -> AckReason {
        AckReason(self.payload().first().copied().unwrap_or(0))
    }

    /// Decodes the payload, checking the frame type first.
    pub fn decode<P: Payload>(&self, expected: PacketType) -> Result<P, DecodeError> {
        let got = self.packet_type();
        if got != expected {
            return Err(DecodeError::WrongType { expected, got });
        }
        P::decode(self.payload())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type())
            .field("txn_id", &self.txn_id())
            .field("ack_req", &self.consumer_ack_required())
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(packet_get_size(0), Some(518));
        assert_eq!(packet_get_size(1), Some(262));
        for ack in [2, 3, 4] {
            assert_eq!(packet_get_size(ack), Some(22));
        }
        for medium in [5, 6, 7, 9, 10, 11, 12, 13] {
            assert_eq!(packet_get_size(medium), Some(262));
        }
        assert_eq!(packet_get_size(8), None);
        assert_eq!(packet_get_size(99), None);
    }

    #[test]
    fn header_layout() {
        let pkt = Packet::ack(PacketType::DeviceAck, 0x1234, AckReason::GOOD);
        let b = pkt.as_bytes();
        assert_eq!(b.len(), 22);
        assert_eq!(b[0], 3);
        assert_eq!(&b[1..3], &[0x34, 0x12]);
        assert_eq!(b[3], 0);
        assert!(pkt.crc_matches());
        assert_eq!(pkt.ack_reason(), AckReason::GOOD);
    }

    #[test]
    fn txn_id_rewrite() {
        let mut pkt = Packet::new(PacketType::Echo, 2005, true);
        pkt.set_txn_id(pkt.txn_id().wrapping_sub(2000));
        assert_eq!(pkt.txn_id(), 5);
        assert!(pkt.consumer_ack_required());
    }

    #[test]
    fn from_bytes_checks_length() {
        let pkt = Packet::new(PacketType::Cmd, 7, true);
        assert_eq!(Packet::from_bytes(pkt.as_bytes()).as_ref(), Ok(&pkt));
        assert_eq!(
            Packet::from_bytes(&pkt.as_bytes()[..100]),
            Err(DecodeError::WrongLength {
                expected: 262,
                got: 100
            })
        );
        assert_eq!(Packet::from_bytes(&[8, 0, 0]), Err(DecodeError::UnknownType(8)));
        assert_eq!(Packet::from_bytes(&[]), Err(DecodeError::Truncated));
    }

    #[test]
    fn every_kind_survives_the_wire() {
        let kinds: Vec<PacketType> = (0..=13).filter_map(PacketType::from_u8).collect();
        assert_eq!(kinds.len(), 13);
        for ty in kinds {
            for ack_required in [false, true] {
                let txn_id = 2000 + ty as u16;
                let body = [ty as u8, 0xA5, 0x5A];
                let sent = Packet::with_raw(ty, txn_id, ack_required, &body);
                assert_eq!(sent.as_bytes().len(), packet_get_size(ty as u8).unwrap());

                let got = Packet::from_bytes(sent.as_bytes()).unwrap();
                assert_eq!(got.packet_type(), ty);
                assert_eq!(got.txn_id(), txn_id);
                assert_eq!(got.consumer_ack_required(), ack_required);
                assert_eq!(&got.payload()[..3], &body);
                assert!(got.payload()[3..].iter().all(|b| *b == 0));
                assert!(got.crc_matches());
            }
        }
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut pkt = Packet::with_raw(PacketType::Void, 1, true, b"hello");
        assert!(pkt.crc_matches());
        pkt.payload_mut()[0] ^= 0xFF;
        assert!(!pkt.crc_matches());
    }
}
