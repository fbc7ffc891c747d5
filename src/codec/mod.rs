//! C1 — the DLT frame codec: header structures, typed-argument payload
//! decoding, and the `DltMessage` decode/encode entry points (spec §4.1).

pub mod header;
pub mod message;
pub mod payload;

pub use header::{
    ControlSubtype, ExtendedHeader, ExtraHeader, FourCc, LogLevel, MessageType, StandardHeader,
    StorageHeader,
};
pub use message::{ContinuityChecker, DecodeOutcome, DltMessage, SortData};
pub use payload::Argument;

use thiserror::Error;

/// Errors raised while decoding or encoding a single DLT frame.
///
/// `Incomplete` and `Corrupt` are not fatal to a stream decoder: both
/// are ordinary outcomes reported through [`DecodeOutcome`] rather than
/// this error type. `CodecError` covers the remaining cases, where the
/// bytes present are self-inconsistent (declared lengths that overrun
/// the buffer in ways corruption-recovery cannot repair) or I/O fails
/// while building an in-memory cursor.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated header field")]
    Io(#[from] std::io::Error),

    #[error("standard header declares length {declared}, got {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unsupported standard header version {0}")]
    UnsupportedVersion(u8),
}
