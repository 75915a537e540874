use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Identity keypair not initialised, generate or load one first")]
    IdentityNotInitialized,

    #[error("No channel established with peer {0}")]
    ChannelNotEstablished(String),

    #[error("Invalid peer public key: {0}")]
    InvalidPeerKey(String),

    #[error("Decryption failed (authentication tag mismatch, possible tampering)")]
    DecryptionFailure,

    #[error("AEAD encryption failed")]
    EncryptionFailure,

    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
