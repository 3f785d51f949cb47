//! Typed payloads.
//!
//! Encoding writes into a zeroed payload area; unused tail bytes stay zero.
//! Strings are NUL padded and truncated to leave room for the terminator.

use parallax_crc::crc32;

use crate::settings::{MAX_DEVICE_NAME, MAX_EMPLOYEE, MAX_NAME_LEN};

use super::DecodeError;

/// A fixed layout payload.
pub trait Payload: Sized {
    fn encode(&self, out: &mut [u8]);
    fn decode(buf: &[u8]) -> Result<Self, DecodeError>;
}

pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, at: 0 }
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) -> &mut Self {
        let end = (self.at + data.len()).min(self.buf.len());
        if let Some(dst) = self.buf.get_mut(self.at..end) {
            dst.copy_from_slice(&data[..dst.len()]);
        }
        self.at += data.len();
        self
    }

    pub(crate) fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes(&[v])
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub(crate) fn u64(&mut self, v: u64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// A NUL padded string field of `field` bytes.
    pub(crate) fn cstr(&mut self, s: &str, field: usize) -> &mut Self {
        let mut end = s.len().min(field.saturating_sub(1));
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let start = self.at;
        self.bytes(&s.as_bytes()[..end]);
        self.at = start + field;
        self
    }
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let out = self
            .buf
            .get(self.at..self.at + n)
            .ok_or(DecodeError::Truncated)?;
        self.at += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// A NUL padded string field; a field without a NUL is taken whole.
    pub(crate) fn cstr(&mut self, field: usize) -> Result<String, DecodeError> {
        let raw = self.bytes(field)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Status byte of a command response.
///
/// Storage failures are reported with their own codes, which share the
/// byte with the command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdStatus(pub u8);

impl CmdStatus {
    pub const GOOD: Self = Self(0);
    pub const FAILED: Self = Self(1);
    pub const FAILED_NO_CURRENT_USERS: Self = Self(3);
    pub const FAILED_CRC: Self = Self(10);
    pub const UID_EXISTS: Self = Self(20);

    pub const FILE_FAIL: Self = Self(10);
    pub const FILE_MEM_FULL: Self = Self(11);
    pub const FILE_USER_NOT_EXIST: Self = Self(12);
    pub const FILE_USER_EXISTS: Self = Self(13);
    pub const FILE_MEM_EMPTY: Self = Self(14);

    /// Returned by SET_DEVICE_ID when the value could not be persisted.
    pub const ITEM_CANT_SET: Self = Self(4);
}

/// First frame the device sends on every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub device_id: u64,
    pub fw_version: u16,
    pub bricked: u8,
    pub name: String,
}

impl Payload for Hello {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out)
            .u64(self.device_id)
            .u16(self.fw_version)
            .u8(self.bricked)
            .cstr(&self.name, MAX_DEVICE_NAME);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            device_id: r.u64()?,
            fw_version: r.u16()?,
            bricked: r.u8()?,
            name: r.cstr(MAX_DEVICE_NAME)?,
        })
    }
}

const LOGIN_NAME_FIELD: usize = 249;

/// A sign in or sign out at the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    /// Tenths of a degree above zero.
    pub temperature: u16,
    pub sign_in: bool,
    pub uid: u32,
    pub name: String,
}

impl Payload for Login {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out)
            .u16(self.temperature)
            .u8(self.sign_in as u8)
            .u32(self.uid)
            .cstr(&self.name, LOGIN_NAME_FIELD);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            temperature: r.u16()?,
            sign_in: r.u8()? != 0,
            uid: r.u32()?,
            name: r.cstr(LOGIN_NAME_FIELD)?,
        })
    }
}

pub const CMD_RESP_PAYLOAD_LEN: usize = 250;

/// One response frame to a server command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdResp {
    pub status: CmdStatus,
    /// Transaction id of the command being answered.
    pub orig_txn_id: u16,
    pub total_packets: u8,
    pub sequence: u8,
    /// Length the server should read, not always `payload.len()`.
    pub payload_len: u8,
    pub payload: Vec<u8>,
}

impl CmdResp {
    /// A single-frame response without a body.
    pub fn status(status: CmdStatus, orig_txn_id: u16) -> Self {
        Self {
            status,
            orig_txn_id,
            total_packets: 1,
            sequence: 0,
            payload_len: 0,
            payload: Vec::new(),
        }
    }

    /// A single-frame response carrying `body`.
    pub fn with_body(status: CmdStatus, orig_txn_id: u16, body: &[u8]) -> Self {
        let body = &body[..body.len().min(CMD_RESP_PAYLOAD_LEN)];
        Self {
            payload_len: body.len() as u8,
            payload: body.to_vec(),
            ..Self::status(status, orig_txn_id)
        }
    }
}

impl Payload for CmdResp {
    fn encode(&self, out: &mut [u8]) {
        let body = &self.payload[..self.payload.len().min(CMD_RESP_PAYLOAD_LEN)];
        Writer::new(out)
            .u8(self.status.0)
            .u16(self.orig_txn_id)
            .u8(self.total_packets)
            .u8(self.sequence)
            .u8(self.payload_len)
            .bytes(body);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let status = CmdStatus(r.u8()?);
        let orig_txn_id = r.u16()?;
        let total_packets = r.u8()?;
        let sequence = r.u8()?;
        let payload_len = r.u8()?;
        let payload = r.bytes(payload_len as usize)?.to_vec();
        Ok(Self {
            status,
            orig_txn_id,
            total_packets,
            sequence,
            payload_len,
            payload,
        })
    }
}

/// Body of ADD_USER and ADD_USER_TO_FLASH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddUser {
    pub uid: u32,
    /// Replace an existing user with the same uid instead of refusing.
    pub replace: bool,
    pub name: String,
}

impl Payload for AddUser {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out)
            .u32(self.uid)
            .u8(self.replace as u8)
            .cstr(&self.name, MAX_NAME_LEN);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            uid: r.u32()?,
            replace: r.u8()? != 0,
            name: r.cstr(MAX_NAME_LEN)?,
        })
    }
}

/// A stored user, as persisted and as reported by GET_ALL_USERS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeRecord {
    pub slot: u16,
    pub uid: u32,
    pub name: String,
}

impl EmployeeRecord {
    pub const ENCODED_LEN: usize = 2 + 4 + MAX_NAME_LEN;

    /// The length a GET_ALL_USERS response advertises for this record.
    pub fn advertised_len(&self) -> u8 {
        (self.name.len().min(MAX_NAME_LEN - 1) + 6) as u8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::ENCODED_LEN];
        self.encode(&mut out);
        out
    }
}

impl Payload for EmployeeRecord {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out)
            .u16(self.slot)
            .u32(self.uid)
            .cstr(&self.name, MAX_NAME_LEN);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            slot: r.u16()?,
            uid: r.u32()?,
            name: r.cstr(MAX_NAME_LEN)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMode(pub u8);

impl SyncMode {
    pub const NORMAL: Self = Self(0);
    /// Storage only, the sensor is left alone.
    pub const TEST: Self = Self(1);
}

/// Body of SYNC: the server's view of which slots should exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub crc32: u32,
    pub mode: SyncMode,
    pub bitfield: Vec<u8>,
}

impl SyncRequest {
    pub const DELETE: u8 = 100;
    pub const EXISTS: u8 = 200;

    /// Builds a request with the CRC computed over `bitfield`.
    pub fn new(mode: SyncMode, bitfield: Vec<u8>) -> Self {
        Self {
            crc32: crc32(&bitfield),
            mode,
            bitfield,
        }
    }

    pub fn crc_ok(&self) -> bool {
        crc32(&self.bitfield) == self.crc32
    }

    /// Slots the server wants gone.
    pub fn doomed_slots(&self) -> impl Iterator<Item = u16> + '_ {
        self.bitfield
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == Self::DELETE)
            .map(|(i, _)| i as u16)
    }
}

impl Payload for SyncRequest {
    fn encode(&self, out: &mut [u8]) {
        let mut field = [0u8; MAX_EMPLOYEE];
        let n = self.bitfield.len().min(MAX_EMPLOYEE);
        field[..n].copy_from_slice(&self.bitfield[..n]);
        Writer::new(out).u32(self.crc32).u8(self.mode.0).bytes(&field);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            crc32: r.u32()?,
            mode: SyncMode(r.u8()?),
            bitfield: r.bytes(MAX_EMPLOYEE)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FotaKind(pub u8);

impl FotaKind {
    pub const START: Self = Self(0);
    pub const START_ACK: Self = Self(1);
    pub const META: Self = Self(2);
    pub const META_ACK: Self = Self(3);
    pub const FINAL: Self = Self(4);
    pub const FINAL_ACK: Self = Self(5);
    pub const FINAL_TEST_ONLY: Self = Self(6);
    pub const FINAL_TEST_ACK: Self = Self(7);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FotaStatus(pub u8);

impl FotaStatus {
    pub const GOOD: Self = Self(0);
    pub const FAILED: Self = Self(1);
    pub const TIMEDOUT: Self = Self(2);
    pub const FAILED_SAME_FW: Self = Self(3);
    pub const FAILED_CRC16: Self = Self(4);
    pub const FAILED_CRC32: Self = Self(5);
    pub const UNKNOWN: Self = Self(6);
}

/// Body of the FOTA frame: START, META and FINAL all share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FotaDescriptor {
    pub magic: u32,
    pub kind: FotaKind,
    pub fw_version: u16,
    pub fw_crc32: u32,
    /// CRC16 of the 4 KiB block that follows a META.
    pub fw_crc16: u16,
    pub fw_segment: u16,
    /// Number of 4 KiB blocks in the image.
    pub fw_blocks: u16,
}

impl Payload for FotaDescriptor {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out)
            .u32(self.magic)
            .u8(self.kind.0)
            .u16(self.fw_version)
            .u32(self.fw_crc32)
            .u16(self.fw_crc16)
            .u16(self.fw_segment)
            .u16(self.fw_blocks);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            magic: r.u32()?,
            kind: FotaKind(r.u8()?),
            fw_version: r.u16()?,
            fw_crc32: r.u32()?,
            fw_crc16: r.u16()?,
            fw_segment: r.u16()?,
            fw_blocks: r.u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FotaAck {
    pub kind: FotaKind,
    pub status: FotaStatus,
}

impl Payload for FotaAck {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out).u8(self.kind.0).u8(self.status.0);
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        Ok(Self {
            kind: FotaKind(r.u8()?),
            status: FotaStatus(r.u8()?),
        })
    }
}
