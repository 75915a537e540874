//! hl_crypto: Hushline key management and cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Every primitive sits behind a small capability trait so protocol logic
//!   can be exercised with deterministic fakes.
//! - Zeroize all secret material on drop.
//!
//! # Module layout
//! - `backend`      : capability traits (random, AEAD, key agreement, KDFs)
//! - `aead`         : AES-256-GCM seal/open producing `EncryptedBlob`s
//! - `kdf`          : HKDF channel keys, PBKDF2 master keys, salts
//! - `identity`     : X25519 identity keypair + export format
//! - `channel`      : per-peer symmetric key table
//! - `key_manager`  : the `KeyManager` façade used by the transport
//! - `error`        : unified error type

pub mod aead;
pub mod backend;
pub mod channel;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod key_manager;

pub use aead::EncryptedBlob;
pub use backend::CryptoBackend;
pub use error::CryptoError;
pub use identity::{ExportedIdentity, PublicKeyBytes};
pub use key_manager::KeyManager;
