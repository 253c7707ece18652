use thiserror::Error;

use crate::protocol::response::{ErrPayload, ErrPayloadBytes};

#[derive(Debug, Error)]
pub enum Error {
    /// ERR packet sent by the server. Fatal only to the command that caused it.
    #[error("Server Error: {0}")]
    ServerError(#[from] ErrPayload),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bad config error: {0}")]
    BadConfigError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Unexpected end of packet")]
    UnexpectedEof,

    #[error("Unsupported authentication plugin: {0}")]
    UnsupportedAuthPlugin(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Usage error: {0}")]
    UsageError(String),
}

impl Error {
    /// Protocol-level failures: malformed or unexpected packets, unsupported plugins
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::ProtocolError(_)
                | Error::InvalidPacket
                | Error::UnexpectedEof
                | Error::UnsupportedAuthPlugin(_)
        )
    }

    /// The error code of a server ERR packet
    pub fn server_error_code(&self) -> Option<u16> {
        match self {
            Error::ServerError(err) => Some(err.error_code),
            _ => None,
        }
    }

    /// Whether this error always means the connection is gone.
    ///
    /// A protocol error may or may not end the connection: a malformed row only
    /// fails its own command, an out-of-sequence packet disconnects. Check
    /// [`Conn::is_closed`](crate::Conn::is_closed) once the error is seen.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::IoError(_) | Error::ConnectionLost)
    }
}

impl<'a> From<ErrPayloadBytes<'a>> for Error {
    fn from(value: ErrPayloadBytes) -> Self {
        match ErrPayload::try_from(value) {
            Ok(err_payload) => Error::ServerError(err_payload),
            Err(err) => err,
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

pub type Result<T> = std::result::Result<T, Error>;
