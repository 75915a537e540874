use thiserror::Error;

use hl_crypto::CryptoError;
use hl_proto::{AuthorizationError, CodecError};
use hl_store::VaultError;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Token rejected. Not retried; the caller must re-authenticate.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Not authorised: {0}")]
    NotSender(#[from] AuthorizationError),

    #[error("Unknown message {0}")]
    UnknownMessage(String),

    #[error("Message {0} has been deleted")]
    MessageDeleted(String),

    #[error("Message {0} has not reached the relay yet")]
    NotYetSent(String),

    #[error("Outbound queue full: {0}")]
    QueueFull(String),
}
