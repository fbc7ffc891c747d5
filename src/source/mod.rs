//! C3/C4 — message sources: tailing files and live sockets, both
//! producing a stream of decoded [`crate::codec::DltMessage`]s that a
//! dispatcher drains (spec §4.3, §4.4).

pub mod file;
pub mod socket;

pub use file::FileSource;
pub use socket::SocketSource;

use thiserror::Error;

use crate::codec::DltMessage;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("source was stopped")]
    Stopped,
}

/// Outcome of a single poll of a [`Source`].
pub enum PollOutcome {
    /// A message was produced.
    Message(DltMessage),
    /// No message is available right now but the source is still
    /// live; the caller should poll again after its own backoff.
    Pending,
    /// The source is exhausted (end of file in batch mode, or the
    /// connection closed) and will never produce another message.
    Done,
}

/// A source of DLT frames a dispatcher drains in a loop (spec §4.5
/// step 2, "read one message from the source").
pub trait Source {
    fn poll(&mut self) -> Result<PollOutcome, SourceError>;

    /// Cooperative shutdown; a subsequent `poll()` should return
    /// `Ok(PollOutcome::Done)` once any in-flight read unblocks.
    fn stop(&mut self);
}
