//! Typed-argument payload decoding (verbose mode), non-verbose/control
//! payload rendering, and the small set of control service responses
//! the spec requires decoding (spec §4.1/§6).

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::codec::header::{ControlSubtype, ExtendedHeader, MessageType};
use crate::codec::CodecError;

pub const TYPE_INFO_TYLE: u32 = 0x0000_000F;
pub const TYPE_INFO_BOOL: u32 = 0x0000_0010;
pub const TYPE_INFO_SINT: u32 = 0x0000_0020;
pub const TYPE_INFO_UINT: u32 = 0x0000_0040;
pub const TYPE_INFO_FLOA: u32 = 0x0000_0080;
pub const TYPE_INFO_ARAY: u32 = 0x0000_0100;
pub const TYPE_INFO_STRG: u32 = 0x0000_0200;
pub const TYPE_INFO_RAWD: u32 = 0x0000_0400;
pub const TYPE_INFO_VARI: u32 = 0x0000_0800;
pub const TYPE_INFO_FIXP: u32 = 0x0000_1000;
pub const TYPE_INFO_TRAI: u32 = 0x0000_2000;
pub const TYPE_INFO_STRU: u32 = 0x0000_4000;
pub const TYPE_INFO_SCOD: u32 = 0x0003_8000;

pub const SCOD_ASCII: u32 = 0x0000_0000;
pub const SCOD_UTF8: u32 = 0x0000_8000;
pub const SCOD_HEX: u32 = 0x0001_0000;
pub const SCOD_BIN: u32 = 0x0001_8000;

pub const TYLE_8BIT: u32 = 1;
pub const TYLE_16BIT: u32 = 2;
pub const TYLE_32BIT: u32 = 3;
pub const TYLE_64BIT: u32 = 4;
pub const TYLE_128BIT: u32 = 5;

pub const SERVICE_ID_GET_SOFTWARE_VERSION: u32 = 0x13;
pub const SERVICE_ID_UNREGISTER_CONTEXT: u32 = 0xF01;
pub const SERVICE_ID_CONNECTION_INFO: u32 = 0xF02;
pub const SERVICE_ID_TIMEZONE: u32 = 0xF03;
pub const SERVICE_ID_MARKER: u32 = 0xF04;

const CTRL_RETURN_TYPES: [&str; 9] = [
    "ok",
    "not_supported",
    "error",
    "3",
    "4",
    "5",
    "6",
    "7",
    "no_matching_context_id",
];

const CTRL_SERVICE_IDS: [&str; 21] = [
    "",
    "set_log_level",
    "set_trace_status",
    "get_log_info",
    "get_default_log_level",
    "store_config",
    "reset_to_factory_default",
    "set_com_interface_status",
    "set_com_interface_max_bandwidth",
    "set_verbose_mode",
    "set_message_filtering",
    "set_timing_packets",
    "get_local_time",
    "use_ecu_id",
    "use_session_id",
    "use_timestamp",
    "use_extended_header",
    "set_default_log_level",
    "set_default_trace_status",
    "get_software_version",
    "message_buffer_overflow",
];

/// A single decoded verbose-mode argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    String(String),
    Raw(Vec<u8>),
    /// 128-bit values and any other unsupported width: rendered as the
    /// literal `ERROR` text, never a fatal parse error (spec §4.1/§8).
    Error,
}

fn string_coding(type_info: u32) -> u32 {
    type_info & TYPE_INFO_SCOD
}

fn read_len_prefixed_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// Decodes `noar` verbose-mode typed arguments out of `payload`.
pub fn decode_verbose_arguments(payload: &[u8], noar: u8) -> Result<Vec<Argument>, CodecError> {
    let mut cursor = Cursor::new(payload);
    let mut args = Vec::with_capacity(noar as usize);

    for _ in 0..noar {
        let type_info = cursor.read_u32::<LittleEndian>()?;

        // Variable-info (name/unit) precedes the value when VARI is set;
        // the AUTOSAR encoding stores it as a length-prefixed name
        // string (and, for numeric types, a length-prefixed unit
        // string). We only need the value for display, so skip it.
        if type_info & TYPE_INFO_VARI != 0 {
            let _name = read_len_prefixed_bytes(&mut cursor)?;
            if type_info & (TYPE_INFO_SINT | TYPE_INFO_UINT | TYPE_INFO_FLOA) != 0 {
                let _unit = read_len_prefixed_bytes(&mut cursor)?;
            }
        }

        let tyle = type_info & TYPE_INFO_TYLE;

        let arg = if type_info & TYPE_INFO_STRG != 0 {
            let coding = string_coding(type_info);
            if coding == SCOD_ASCII || coding == SCOD_UTF8 {
                let bytes = read_len_prefixed_bytes(&mut cursor)?;
                let text = String::from_utf8_lossy(&bytes)
                    .trim_end_matches('\0')
                    .to_string();
                Argument::String(text)
            } else {
                Argument::Error
            }
        } else if type_info & TYPE_INFO_BOOL != 0 {
            Argument::Bool(cursor.read_u8()? != 0)
        } else if type_info & TYPE_INFO_UINT != 0 {
            match tyle {
                TYLE_8BIT => Argument::Unsigned(cursor.read_u8()? as u64),
                TYLE_16BIT => Argument::Unsigned(cursor.read_u16::<LittleEndian>()? as u64),
                TYLE_32BIT => Argument::Unsigned(cursor.read_u32::<LittleEndian>()? as u64),
                TYLE_64BIT => Argument::Unsigned(cursor.read_u64::<LittleEndian>()?),
                TYLE_128BIT => Argument::Error,
                _ => Argument::Error,
            }
        } else if type_info & TYPE_INFO_SINT != 0 {
            match tyle {
                TYLE_8BIT => Argument::Signed(cursor.read_i8()? as i64),
                TYLE_16BIT => Argument::Signed(cursor.read_i16::<LittleEndian>()? as i64),
                TYLE_32BIT => Argument::Signed(cursor.read_i32::<LittleEndian>()? as i64),
                TYLE_64BIT => Argument::Signed(cursor.read_i64::<LittleEndian>()?),
                TYLE_128BIT => Argument::Error,
                _ => Argument::Error,
            }
        } else if type_info & TYPE_INFO_FLOA != 0 {
            match tyle {
                TYLE_32BIT => Argument::Float(cursor.read_f32::<LittleEndian>()? as f64),
                TYLE_64BIT => Argument::Float(cursor.read_f64::<LittleEndian>()?),
                _ => Argument::Error,
            }
        } else if type_info & TYPE_INFO_RAWD != 0 {
            Argument::Raw(read_len_prefixed_bytes(&mut cursor)?)
        } else {
            Argument::Error
        };

        args.push(arg);
    }

    Ok(args)
}

impl std::fmt::Display for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Argument::Bool(b) => write!(f, "{b}"),
            Argument::Signed(v) => write!(f, "{v}"),
            Argument::Unsigned(v) => write!(f, "{v}"),
            Argument::Float(v) => write!(f, "{v}"),
            Argument::String(s) => write!(f, "{s}"),
            Argument::Raw(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Argument::Error => write!(f, "ERROR"),
        }
    }
}

fn ctrl_service_id_string(service_id: u32) -> String {
    match service_id {
        SERVICE_ID_UNREGISTER_CONTEXT => "unregister_context".to_string(),
        SERVICE_ID_CONNECTION_INFO => "connection_info".to_string(),
        SERVICE_ID_TIMEZONE => "timezone".to_string(),
        SERVICE_ID_MARKER => "marker".to_string(),
        sid if (sid as usize) < CTRL_SERVICE_IDS.len() => CTRL_SERVICE_IDS[sid as usize].to_string(),
        _ => String::new(),
    }
}

fn ctrl_return_type_string(return_type: u8) -> &'static str {
    CTRL_RETURN_TYPES
        .get(return_type as usize)
        .copied()
        .unwrap_or("")
}

fn message_id_string(message_id: u32) -> String {
    ctrl_service_id_string(message_id)
}

/// Connection state reported by the `connection_info` control response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Unknown(u8),
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Disconnected,
            2 => ConnectionState::Connected,
            other => ConnectionState::Unknown(other),
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Unknown(_) => write!(f, "unknown"),
        }
    }
}

/// Renders a control-response `connection_info` payload:
/// `{u32 service_id; u8 status; u8 state; char comid[4]}`.
fn decode_connection_info(data: &[u8]) -> Option<String> {
    if data.len() < 10 {
        return None;
    }
    // service_id (4, skipped) + status (1) + state (1) + comid (4)
    let status_offset = 4;
    let state = data[status_offset + 1];
    let comid = &data[status_offset + 2..status_offset + 6];
    let comid_str = String::from_utf8_lossy(comid)
        .trim_end_matches('\0')
        .to_string();
    let state = ConnectionState::from(state);
    Some(format!("{state} {comid_str}"))
}

/// Renders a decoded payload as human-readable text (spec §4.1).
///
/// `payload` is the raw payload bytes; `extended_header` is `None` for
/// frames without one (non-verbose with no apid/ctid context).
pub fn decode_payload_text(
    payload: &[u8],
    extended_header: Option<&ExtendedHeader>,
) -> Result<String, CodecError> {
    let is_verbose = extended_header.map(|h| h.is_verbose()).unwrap_or(false);
    let message_type = extended_header.map(|h| h.message_type());

    if !is_verbose && message_type != Some(MessageType::Control) {
        // Non-verbose log payload: 4-byte message id + opaque bytes (spec §3/§4.1).
        if payload.len() < 4 {
            return Ok(String::new());
        }
        let message_id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let rest = &payload[4..];
        let hex: String = rest.iter().map(|b| format!("{b:02x}")).collect();
        return Ok(format!("[{}] #{}#", message_id_string(message_id), hex));
    }

    if message_type == Some(MessageType::Control) {
        let eh = extended_header.unwrap();
        if eh.control_subtype() == ControlSubtype::Response {
            if payload.len() < 4 {
                return Ok(String::new());
            }
            let service_id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);

            if service_id == SERVICE_ID_MARKER {
                return Ok("MARKER".to_string());
            }

            let return_type = if payload.len() >= 5 { payload[4] } else { 0 };
            let header = format!(
                "[{} {}] ",
                ctrl_service_id_string(service_id),
                ctrl_return_type_string(return_type)
            );

            let tail = if service_id == SERVICE_ID_GET_SOFTWARE_VERSION {
                let rest = payload.get(9..).unwrap_or(&[]);
                String::from_utf8_lossy(rest).trim_end_matches('\0').to_string()
            } else if service_id == SERVICE_ID_CONNECTION_INFO {
                decode_connection_info(payload).unwrap_or_default()
            } else if service_id == SERVICE_ID_TIMEZONE {
                let rest = payload.get(5..).unwrap_or(&[]);
                String::from_utf8_lossy(rest).trim_end_matches('\0').to_string()
            } else {
                String::new()
            };

            return Ok(header + &tail);
        }

        // Control request/time: `[service_name] <tail>`.
        if payload.len() < 4 {
            return Ok(String::new());
        }
        let service_id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let rest = payload.get(4..).unwrap_or(&[]);
        let tail = String::from_utf8_lossy(rest).trim_end_matches('\0').to_string();
        return Ok(format!("[{}] {}", ctrl_service_id_string(service_id), tail));
    }

    // Verbose payload: render each argument, space-separated.
    let noar = extended_header.map(|h| h.noar).unwrap_or(0);
    let args = decode_verbose_arguments(payload, noar)?;
    Ok(args
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::header::FourCc;

    fn ext_header(msin: u8, noar: u8) -> ExtendedHeader {
        ExtendedHeader {
            msin,
            noar,
            apid: FourCc::new("MON"),
            ctid: FourCc::new("CPUS"),
        }
    }

    #[test]
    fn verbose_utf8_string_argument() {
        let text = "4 online cores\n";
        let mut payload = Vec::new();
        let type_info: u32 = TYPE_INFO_STRG | SCOD_UTF8;
        payload.extend_from_slice(&type_info.to_le_bytes());
        let bytes = text.as_bytes();
        let len = (bytes.len() + 1) as u16; // + NUL terminator
        payload.extend_from_slice(&len.to_le_bytes());
        payload.extend_from_slice(bytes);
        payload.push(0);

        let eh = ext_header(crate::codec::header::MSIN_VERB, 1);
        let decoded = decode_payload_text(&payload, Some(&eh)).unwrap();
        assert_eq!(decoded, "4 online cores\n");
    }

    #[test]
    fn unsupported_128bit_renders_error_literal() {
        let mut payload = Vec::new();
        let type_info: u32 = TYPE_INFO_UINT | TYLE_128BIT;
        payload.extend_from_slice(&type_info.to_le_bytes());
        payload.extend_from_slice(&[0u8; 16]);

        let args = decode_verbose_arguments(&payload, 1).unwrap();
        assert_eq!(args[0], Argument::Error);
        assert_eq!(args[0].to_string(), "ERROR");
    }
}
