//! DLT (Diagnostic Log and Trace) frame codec, file tailer, and
//! in-process fan-out broker.
//!
//! Three subsystems, each usable on its own:
//! - [`codec`]: zero-copy-ish decode/encode of single DLT frames.
//! - [`source`]: file (batch + live tail) and socket (TCP/UNIX/UDP
//!   multicast) producers of decoded frames.
//! - [`broker`]: a multi-subscriber fan-out engine sitting on top of a
//!   [`source::Source`], matching subscribers against frames via
//!   [`filter::FilterSet`].

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod source;

pub use error::{Error, Result};
