//! hl_store: Hushline encrypted local storage
//!
//! `SecureVault` derives a master key from the user password and seals every
//! record (identity keys, profile and history caches, the outbound queue)
//! with it. Records go through the `KeyValueStore` capability: `SqliteStore`
//! on devices, `MemoryStore` in tests.

pub mod backend;
pub mod error;
pub mod sqlite;
pub mod vault;

pub use backend::{KeyValueStore, MemoryStore};
pub use error::VaultError;
pub use sqlite::SqliteStore;
pub use vault::{history_key, SecureVault, VaultConfig, VaultState, OUTBOX_KEY, PROFILE_KEY};
