use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Wrong password")]
    WrongPassword,

    #[error("Vault not initialised or locked, unlock with password first")]
    NotInitialized,

    #[error("Vault has been cleared")]
    Cleared,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] hl_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Corrupt record {0}")]
    CorruptRecord(String),
}
