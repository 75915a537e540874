//! Authenticated Encryption with Associated Data
//!
//! AES-256-GCM through the `AeadCipher` capability.
//! Key size: 32 bytes.  Nonce: 12 bytes (random, fresh per call).  Tag: 16 bytes.
//!
//! Ciphertext and nonce travel separately as an `EncryptedBlob`:
//!   { "ciphertext": base64(ct + tag), "iv": base64(nonce) }

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::backend::{CryptoBackend, KEY_LEN, NONCE_LEN};
use crate::error::CryptoError;

/// Ciphertext plus the IV it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
}

impl EncryptedBlob {
    pub fn ciphertext_b64(&self) -> String {
        STANDARD.encode(&self.ciphertext)
    }

    pub fn iv_b64(&self) -> String {
        STANDARD.encode(&self.iv)
    }

    /// Rebuild from the base64 fields carried in protocol events.
    pub fn from_b64(ciphertext: &str, iv: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            ciphertext: STANDARD.decode(ciphertext)?,
            iv: STANDARD.decode(iv)?,
        })
    }

    fn nonce(&self) -> Result<[u8; NONCE_LEN], CryptoError> {
        self.iv
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailure)
    }
}

/// Seal `plaintext` under `key` with a nonce drawn fresh from the backend's
/// random source.
pub fn seal(
    backend: &CryptoBackend,
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<EncryptedBlob, CryptoError> {
    let nonce: [u8; NONCE_LEN] = backend.random_array()?;
    let ciphertext = backend.aead.seal(key, &nonce, plaintext, aad)?;
    Ok(EncryptedBlob { ciphertext, iv: nonce.to_vec() })
}

/// Open a blob. Any malformed IV or tag mismatch is `DecryptionFailure`.
pub fn open(
    backend: &CryptoBackend,
    key: &[u8; KEY_LEN],
    blob: &EncryptedBlob,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let nonce = blob.nonce()?;
    backend.aead.open(key, &nonce, &blob.ciphertext, aad)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
