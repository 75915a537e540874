use thiserror::Error;

use hl_proto::CodecError;

/// Why a session token was refused at handshake time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid session token")]
    InvalidToken,

    #[error("session expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Bad session seed {0:?}, expected user:token")]
    BadSessionSeed(String),
}
