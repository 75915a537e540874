use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised when someone other than the original sender edits or deletes a
/// message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("user {user_id} is not the sender of message {message_id}")]
pub struct AuthorizationError {
    pub message_id: String,
    pub user_id: String,
}
