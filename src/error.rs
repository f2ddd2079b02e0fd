//! Error types for the FastCGI client.

use thiserror::Error;

use std::io;

#[derive(Debug, Error)]
pub enum Error {
    /// Read or write failure on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record of a type that has no place at this point of the exchange.
    #[error("unexpected record type {record_type} for request {request_id}")]
    UnexpectedRecord { record_type: u8, request_id: u16 },

    /// A record for a request id that is not in flight on this connection.
    #[error("record for unknown request {request_id}")]
    UnexpectedRequestId { request_id: u16 },

    #[error("unexpected FastCGI version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("un-encodable name-value pair length: {0:#x}")]
    NameValueTooLong(usize),

    #[error("{record_type} record is too long: {len}")]
    RecordTooLong { record_type: u8, len: usize },

    #[error("request id allocator is shut down")]
    AllocatorClosed,
}

impl Error {
    /// True for errors that mean the peer broke the protocol or the stream lost
    /// framing. The connection must not be reused after one of these.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Error::UnexpectedRecord { .. }
            | Error::UnexpectedRequestId { .. }
            | Error::UnsupportedVersion(_)
            | Error::Malformed(_) => true,
            Error::Io(_)
            | Error::NameValueTooLong(_)
            | Error::RecordTooLong { .. }
            | Error::AllocatorClosed => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
