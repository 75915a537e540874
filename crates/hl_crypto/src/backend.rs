//! Capability interfaces over the platform crypto primitives.
//!
//! The key manager, the vault and the transport only ever talk to these
//! traits. `CryptoBackend::system()` wires the production implementations;
//! tests swap single members (typically the random source) for fakes.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// AES-GCM nonce length (96 bits).
pub const NONCE_LEN: usize = 12;
/// Symmetric key length for every AEAD key in the system.
pub const KEY_LEN: usize = 32;
/// Default PBKDF2-SHA256 iteration count for the vault master key.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

/// Cryptographically secure random bytes.
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError>;
}

/// Authenticated encryption with a 32-byte key and 96-bit nonce.
pub trait AeadCipher: Send + Sync {
    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Diffie-Hellman style key agreement over 32-byte keys.
pub trait KeyAgreement: Send + Sync {
    fn public_key(&self, secret: &[u8; 32]) -> [u8; 32];

    fn agree(
        &self,
        secret: &[u8; 32],
        peer_public: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError>;
}

/// Extract-and-expand key derivation.
pub trait KeyDerivation: Send + Sync {
    fn derive(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), CryptoError>;
}

/// Deliberately slow password-based key derivation.
pub trait PasswordKdf: Send + Sync {
    fn derive(&self, password: &[u8], salt: &[u8], out: &mut [u8]) -> Result<(), CryptoError>;
}

// ── Production implementations ───────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CryptoError::Entropy(e.to_string()))
    }
}

/// AES-256-GCM.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcm;

impl AeadCipher for AesGcm {
    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailure)?;
        cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailure)
    }

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailure)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailure)
    }
}

/// X25519 ECDH.
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519;

impl KeyAgreement for X25519 {
    fn public_key(&self, secret: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*secret);
        *X25519Public::from(&secret).as_bytes()
    }

    fn agree(
        &self,
        secret: &[u8; 32],
        peer_public: &[u8; 32],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let secret = StaticSecret::from(*secret);
        let shared = secret.diffie_hellman(&X25519Public::from(*peer_public));
        // Low-order peer points yield an all-zero secret.
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPeerKey(
                "peer key produced a non-contributory shared secret".into(),
            ));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

/// HKDF-SHA256.
#[derive(Debug, Default, Clone, Copy)]
pub struct HkdfSha256;

impl KeyDerivation for HkdfSha256 {
    fn derive(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), CryptoError> {
        Hkdf::<Sha256>::new(Some(salt), ikm)
            .expand(info, out)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }
}

/// PBKDF2-HMAC-SHA256 with an explicit iteration count.
#[derive(Debug, Clone, Copy)]
pub struct Pbkdf2Sha256 {
    pub iterations: u32,
}

impl Default for Pbkdf2Sha256 {
    fn default() -> Self {
        Self { iterations: DEFAULT_PBKDF2_ITERATIONS }
    }
}

impl PasswordKdf for Pbkdf2Sha256 {
    fn derive(&self, password: &[u8], salt: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
        if self.iterations == 0 {
            return Err(CryptoError::KeyDerivation("iteration count must be non-zero".into()));
        }
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, self.iterations, out);
        Ok(())
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────────

/// The set of primitives a component is constructed with.
#[derive(Clone)]
pub struct CryptoBackend {
    pub random: Arc<dyn RandomSource>,
    pub aead: Arc<dyn AeadCipher>,
    pub agreement: Arc<dyn KeyAgreement>,
    pub kdf: Arc<dyn KeyDerivation>,
    pub password_kdf: Arc<dyn PasswordKdf>,
}

impl CryptoBackend {
    /// OS randomness, AES-256-GCM, X25519, HKDF-SHA256, PBKDF2-SHA256.
    pub fn system() -> Self {
        Self::with_pbkdf2_iterations(DEFAULT_PBKDF2_ITERATIONS)
    }

    pub fn with_pbkdf2_iterations(iterations: u32) -> Self {
        Self {
            random: Arc::new(OsRandom),
            aead: Arc::new(AesGcm),
            agreement: Arc::new(X25519),
            kdf: Arc::new(HkdfSha256),
            password_kdf: Arc::new(Pbkdf2Sha256 { iterations }),
        }
    }

    /// Replace the random source (deterministic nonces in tests).
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        self.random.fill(&mut out)?;
        Ok(out)
    }
}

impl Default for CryptoBackend {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for CryptoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBackend").finish_non_exhaustive()
    }
}
