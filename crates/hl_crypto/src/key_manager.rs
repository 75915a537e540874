//! `KeyManager`: identity, per-peer channels, message encryption.
//!
//! Constructed explicitly and owned by the client context; there is no
//! process-wide instance. All mutation goes through `&mut self`, the
//! transport serialises access.

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::aead::{self, EncryptedBlob};
use crate::backend::CryptoBackend;
use crate::channel::ChannelTable;
use crate::error::CryptoError;
use crate::identity::{ExportedIdentity, IdentityKeyPair, PublicKeyBytes};
use crate::kdf::derive_channel_key;

/// Associated data bound into every message ciphertext.
const MESSAGE_AAD: &[u8] = b"hushline-message-v1";

#[derive(Debug)]
pub struct KeyManager {
    backend: CryptoBackend,
    identity: Option<IdentityKeyPair>,
    channels: ChannelTable,
}

impl KeyManager {
    pub fn new(backend: CryptoBackend) -> Self {
        Self { backend, identity: None, channels: ChannelTable::new() }
    }

    pub fn backend(&self) -> &CryptoBackend {
        &self.backend
    }

    /// Create a fresh identity. Channels derived from a previous identity
    /// are no longer valid and are dropped.
    pub fn generate_identity(&mut self) -> Result<PublicKeyBytes, CryptoError> {
        let pair = IdentityKeyPair::generate(&self.backend)?;
        let public = pair.public().clone();
        self.channels.clear();
        self.identity = Some(pair);
        info!(fingerprint = %public.fingerprint(), "generated identity keypair");
        Ok(public)
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    pub fn public_key(&self) -> Option<PublicKeyBytes> {
        self.identity.as_ref().map(|i| i.public().clone())
    }

    /// Derive and store the channel key for `peer_id`, replacing any
    /// previous entry.
    pub fn establish_channel(&mut self, peer_id: &str, peer_public_key: &str) -> Result<(), CryptoError> {
        let identity = self.identity.as_ref().ok_or(CryptoError::IdentityNotInitialized)?;
        let peer = PublicKeyBytes::from_b64(peer_public_key)?;
        let shared = self.backend.agreement.agree(identity.secret_bytes(), &peer.0)?;
        let key = derive_channel_key(&self.backend, &shared[..])?;
        let replaced = self.channels.insert(peer_id, key);
        debug!(peer = peer_id, replaced, "channel established");
        Ok(())
    }

    pub fn encrypt_for(&self, peer_id: &str, plaintext: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        let key = self
            .channels
            .snapshot(peer_id)
            .ok_or_else(|| CryptoError::ChannelNotEstablished(peer_id.to_string()))?;
        aead::seal(&self.backend, key.as_bytes(), plaintext, MESSAGE_AAD)
    }

    pub fn decrypt_from(
        &self,
        peer_id: &str,
        blob: &EncryptedBlob,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let key = self
            .channels
            .snapshot(peer_id)
            .ok_or_else(|| CryptoError::ChannelNotEstablished(peer_id.to_string()))?;
        aead::open(&self.backend, key.as_bytes(), blob, MESSAGE_AAD)
    }

    pub fn has_channel(&self, peer_id: &str) -> bool {
        self.channels.contains(peer_id)
    }

    pub fn remove_channel(&mut self, peer_id: &str) -> bool {
        self.channels.remove(peer_id)
    }

    pub fn channel_peers(&self) -> Vec<String> {
        self.channels.peers()
    }

    /// Drop every channel and the identity. Called when the vault locks.
    pub fn teardown(&mut self) {
        let dropped = self.channels.clear();
        self.identity = None;
        debug!(channels = dropped, "key material torn down");
    }

    pub fn export_identity(&self) -> Result<ExportedIdentity, CryptoError> {
        self.identity
            .as_ref()
            .map(IdentityKeyPair::export)
            .ok_or(CryptoError::IdentityNotInitialized)
    }

    pub fn load_identity(&mut self, exported: &ExportedIdentity) -> Result<PublicKeyBytes, CryptoError> {
        let pair = IdentityKeyPair::import(&self.backend, exported)?;
        let public = pair.public().clone();
        if self.public_key().as_ref() != Some(&public) {
            self.channels.clear();
        }
        self.identity = Some(pair);
        Ok(public)
    }
}
