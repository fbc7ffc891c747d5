//! Wire-format header structures: storage header, standard header, the
//! conditional "extra" fields (ECU id / session id / timestamp), and the
//! extended header. Byte layout and bit positions are taken from
//! `spec.md` §3/§6, matching AUTOSAR/GENIVI DLT.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::CodecError;

/// Sync pattern used to locate frame boundaries in a byte stream.
pub const STORAGE_PATTERN: [u8; 4] = *b"DLT\x01";
pub const STORAGE_HEADER_LEN: usize = 16;
pub const STANDARD_HEADER_LEN: usize = 4;
pub const EXTENDED_HEADER_LEN: usize = 10;

pub const HTYP_UEH: u8 = 0x01;
pub const HTYP_MSBF: u8 = 0x02;
pub const HTYP_WEID: u8 = 0x04;
pub const HTYP_WSID: u8 = 0x08;
pub const HTYP_WTMS: u8 = 0x10;

pub const MSIN_VERB: u8 = 0x01;
pub const MSIN_MSTP_SHIFT: u8 = 1;
pub const MSIN_MSTP_MASK: u8 = 0x0E;
pub const MSIN_MTIN_SHIFT: u8 = 4;
pub const MSIN_MTIN_MASK: u8 = 0xF0;

/// A 4-byte NUL-padded ASCII identifier (`apid`, `ctid`, ECU id).
///
/// Equality is whole-field equality per spec §3; `Display` strips
/// trailing NULs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const EMPTY: FourCc = FourCc([0, 0, 0, 0]);

    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; 4];
        let bytes = s.as_bytes();
        let n = bytes.len().min(4);
        buf[..n].copy_from_slice(&bytes[..n]);
        FourCc(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        let n = bytes.len().min(4);
        buf[..n].copy_from_slice(&bytes[..n]);
        FourCc(buf)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(4);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({:?})", self.to_string())
    }
}

/// Storage header: present only for on-disk/archived messages (spec §3).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StorageHeader {
    pub seconds: u32,
    pub microseconds: i32,
    pub ecu_id: FourCc,
}

impl StorageHeader {
    pub fn now(ecu_id: FourCc) -> Self {
        let now = chrono::Utc::now();
        StorageHeader {
            seconds: now.timestamp() as u32,
            microseconds: now.timestamp_subsec_micros() as i32,
            ecu_id,
        }
    }

    /// Parses a 16-byte storage header out of `buf`, which must already
    /// have been confirmed to start with [`STORAGE_PATTERN`] and to be
    /// at least [`STORAGE_HEADER_LEN`] bytes long.
    pub(crate) fn parse_unchecked(buf: &[u8]) -> Self {
        let seconds = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let microseconds = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let ecu_id = FourCc::from_bytes(&buf[12..16]);
        StorageHeader {
            seconds,
            microseconds,
            ecu_id,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&STORAGE_PATTERN);
        out.extend_from_slice(&self.seconds.to_le_bytes());
        out.extend_from_slice(&self.microseconds.to_le_bytes());
        out.extend_from_slice(self.ecu_id.as_bytes());
    }

    /// Seconds-since-epoch as a float, combining `seconds` and
    /// `microseconds`, used as the shared time cell value (spec §4.8).
    pub fn timestamp_f64(&self) -> f64 {
        self.seconds as f64 + (self.microseconds as f64) / 1_000_000.0
    }
}

/// Standard header: `htyp` flags, `mcnt` counter, total `len` (spec §3/§6).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StandardHeader {
    pub htyp: u8,
    pub mcnt: u8,
    pub len: u16,
}

impl StandardHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < STANDARD_HEADER_LEN {
            return None;
        }
        let mut cursor = Cursor::new(buf);
        let htyp = cursor.read_u8().ok()?;
        let mcnt = cursor.read_u8().ok()?;
        let len = cursor.read_u16::<BigEndian>().ok()?;
        Some((StandardHeader { htyp, mcnt, len }, STANDARD_HEADER_LEN))
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.write_u8(self.htyp)?;
        out.write_u8(self.mcnt)?;
        out.write_u16::<BigEndian>(self.len)?;
        Ok(())
    }

    pub fn use_extended_header(&self) -> bool {
        self.htyp & HTYP_UEH != 0
    }

    pub fn has_ecu_id(&self) -> bool {
        self.htyp & HTYP_WEID != 0
    }

    pub fn has_session_id(&self) -> bool {
        self.htyp & HTYP_WSID != 0
    }

    pub fn has_timestamp(&self) -> bool {
        self.htyp & HTYP_WTMS != 0
    }

    pub fn version(&self) -> u8 {
        (self.htyp >> 5) & 0x07
    }
}

/// Fields present in the standard header iff the corresponding `htyp`
/// bit is set: ECU id (`WEID`), session id (`WSID`), timestamp (`WTMS`,
/// 0.1ms units).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExtraHeader {
    pub ecu_id: Option<FourCc>,
    pub session_id: Option<u32>,
    pub timestamp: Option<u32>,
}

impl ExtraHeader {
    pub fn parse(cursor: &mut Cursor<&[u8]>, htyp: u8) -> Result<Self, CodecError> {
        let ecu_id = if htyp & HTYP_WEID != 0 {
            let mut buf = [0u8; 4];
            cursor.read_exact(&mut buf)?;
            Some(FourCc(buf))
        } else {
            None
        };
        let session_id = if htyp & HTYP_WSID != 0 {
            Some(cursor.read_u32::<BigEndian>()?)
        } else {
            None
        };
        let timestamp = if htyp & HTYP_WTMS != 0 {
            Some(cursor.read_u32::<BigEndian>()?)
        } else {
            None
        };
        Ok(ExtraHeader {
            ecu_id,
            session_id,
            timestamp,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(ecu_id) = self.ecu_id {
            out.extend_from_slice(ecu_id.as_bytes());
        }
        if let Some(session_id) = self.session_id {
            out.write_u32::<BigEndian>(session_id)?;
        }
        if let Some(timestamp) = self.timestamp {
            out.write_u32::<BigEndian>(timestamp)?;
        }
        Ok(())
    }

    /// Timestamp in seconds, for callers that want the same unit as the
    /// storage header timestamp.
    pub fn timestamp_seconds(&self) -> f64 {
        self.timestamp.unwrap_or(0) as f64 / 10_000.0
    }
}

/// Message type, decoded from `msin` bits 1..3 (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Log,
    AppTrace,
    NwTrace,
    Control,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v {
            0 => MessageType::Log,
            1 => MessageType::AppTrace,
            2 => MessageType::NwTrace,
            3 => MessageType::Control,
            other => MessageType::Unknown(other),
        }
    }
}

impl MessageType {
    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::Log => 0,
            MessageType::AppTrace => 1,
            MessageType::NwTrace => 2,
            MessageType::Control => 3,
            MessageType::Unknown(v) => *v,
        }
    }
}

/// Control message subtype (spec §6: request=1, response=2, time=3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSubtype {
    Request,
    Response,
    Time,
    Unknown(u8),
}

impl From<u8> for ControlSubtype {
    fn from(v: u8) -> Self {
        match v {
            1 => ControlSubtype::Request,
            2 => ControlSubtype::Response,
            3 => ControlSubtype::Time,
            other => ControlSubtype::Unknown(other),
        }
    }
}

/// Extended header: present iff `UEH` is set (spec §3/§6).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExtendedHeader {
    pub msin: u8,
    pub noar: u8,
    pub apid: FourCc,
    pub ctid: FourCc,
}

impl ExtendedHeader {
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let msin = cursor.read_u8()?;
        let noar = cursor.read_u8()?;
        let mut apid = [0u8; 4];
        cursor.read_exact(&mut apid)?;
        let mut ctid = [0u8; 4];
        cursor.read_exact(&mut ctid)?;
        Ok(ExtendedHeader {
            msin,
            noar,
            apid: FourCc(apid),
            ctid: FourCc(ctid),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.msin);
        out.push(self.noar);
        out.extend_from_slice(self.apid.as_bytes());
        out.extend_from_slice(self.ctid.as_bytes());
    }

    pub fn is_verbose(&self) -> bool {
        self.msin & MSIN_VERB != 0
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from((self.msin & MSIN_MSTP_MASK) >> MSIN_MSTP_SHIFT)
    }

    pub fn subtype(&self) -> u8 {
        (self.msin & MSIN_MTIN_MASK) >> MSIN_MTIN_SHIFT
    }

    pub fn control_subtype(&self) -> ControlSubtype {
        ControlSubtype::from(self.subtype())
    }

    /// Log level, meaningful when `message_type() == MessageType::Log`.
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from(self.subtype())
    }
}

/// Log level, decoded from `msin` subtype bits when message type is `Log`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    #[default]
    Unknown,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
    Other(u8),
}

impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            1 => LogLevel::Fatal,
            2 => LogLevel::Error,
            3 => LogLevel::Warn,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            6 => LogLevel::Verbose,
            0 => LogLevel::Unknown,
            other => LogLevel::Other(other),
        }
    }
}
