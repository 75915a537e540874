//! Identity key management
//!
//! Each device identity owns one long-term X25519 `IdentityKeyPair`. The
//! public half is registered with the relay so peers can derive a channel
//! key; the secret half only ever leaves memory sealed by the vault, in
//! the `ExportedIdentity` form.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::backend::CryptoBackend;
use crate::error::CryptoError;

// ── Public key newtype ───────────────────────────────────────────────────────

/// 32-byte X25519 public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyBytes(pub [u8; 32]);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Decode a peer key. Wrong encoding or length is `InvalidPeerKey`.
    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidPeerKey(e.to_string()))?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidPeerKey(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Serialize for PublicKeyBytes {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_b64())
    }
}

impl<'de> Deserialize<'de> for PublicKeyBytes {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_b64(&s).map_err(serde::de::Error::custom)
    }
}

// ── Identity keypair ─────────────────────────────────────────────────────────

/// Long-term key-agreement keypair.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate(backend: &CryptoBackend) -> Result<Self, CryptoError> {
        let secret_bytes: [u8; 32] = backend.random_array()?;
        Ok(Self::from_secret(backend, secret_bytes))
    }

    pub fn from_secret(backend: &CryptoBackend, secret_bytes: [u8; 32]) -> Self {
        let public = PublicKeyBytes(backend.agreement.public_key(&secret_bytes));
        Self { public, secret_bytes }
    }

    pub fn public(&self) -> &PublicKeyBytes {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    pub fn export(&self) -> ExportedIdentity {
        ExportedIdentity {
            public_key: self.public.to_b64(),
            secret_key: URL_SAFE_NO_PAD.encode(self.secret_bytes),
        }
    }

    /// Rebuild from an export, checking that the public half matches.
    pub fn import(backend: &CryptoBackend, exported: &ExportedIdentity) -> Result<Self, CryptoError> {
        let mut secret = URL_SAFE_NO_PAD.decode(&exported.secret_key)?;
        let arr: Result<[u8; 32], _> = secret.as_slice().try_into();
        secret.zeroize();
        let arr = arr.map_err(|_| CryptoError::InvalidKey("identity secret must be 32 bytes".into()))?;
        let pair = Self::from_secret(backend, arr);
        let claimed = PublicKeyBytes::from_b64(&exported.public_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if claimed != pair.public {
            return Err(CryptoError::InvalidKey(
                "exported public key does not match secret".into(),
            ));
        }
        Ok(pair)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Serialised identity, as sealed into the vault.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct ExportedIdentity {
    pub public_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for ExportedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedIdentity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
