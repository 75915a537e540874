//! Key derivation functions
//!
//! `derive_channel_key`: HKDF-SHA256 over the X25519 shared secret, bound to
//!   this protocol by fixed salt/info strings.
//!
//! `master_key_from_password`: PBKDF2-SHA256, derives the 32-byte key that
//!   seals every vault record.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::backend::{CryptoBackend, KEY_LEN};
use crate::error::CryptoError;

/// HKDF salt for per-peer channel keys.
pub const CHANNEL_SALT: &[u8] = b"hushline-channel-salt-v1";
/// HKDF info for per-peer channel keys.
pub const CHANNEL_INFO: &[u8] = b"hushline-aes-gcm-key-v1";
/// Vault salt length in bytes.
pub const SALT_LEN: usize = 16;

// ── Channel key (HKDF) ───────────────────────────────────────────────────────

/// 32-byte AES-256-GCM key shared with one peer. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; KEY_LEN]);

impl ChannelKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

/// Stretch a raw key-agreement output into the channel key.
pub fn derive_channel_key(
    backend: &CryptoBackend,
    shared_secret: &[u8],
) -> Result<ChannelKey, CryptoError> {
    let mut key = ChannelKey([0u8; KEY_LEN]);
    backend.kdf.derive(shared_secret, CHANNEL_SALT, CHANNEL_INFO, &mut key.0)?;
    Ok(key)
}

// ── Master key (PBKDF2) ──────────────────────────────────────────────────────

/// 32-byte vault master key derived from the user password. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Derive the master key from a password + salt.
/// The salt is stored next to the vault records (not secret).
pub fn master_key_from_password(
    backend: &CryptoBackend,
    password: &[u8],
    salt: &[u8],
) -> Result<MasterKey, CryptoError> {
    if salt.len() < SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt must be at least {SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    let mut key = MasterKey([0u8; KEY_LEN]);
    backend.password_kdf.derive(password, salt, &mut key.0)?;
    Ok(key)
}

/// Fresh random salt (call once per identity; persist it).
pub fn generate_salt(backend: &CryptoBackend) -> Result<[u8; SALT_LEN], CryptoError> {
    backend.random_array()
}
