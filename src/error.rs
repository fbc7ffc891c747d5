//! Crate-wide error type, aggregating each module's own `thiserror`
//! enum behind `#[from]`, the same nesting the teacher used for its
//! single `parser::Error`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),

    #[error(transparent)]
    Filter(#[from] crate::filter::FilterError),

    #[error(transparent)]
    Source(#[from] crate::source::SourceError),

    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
