//! ClientContext: the owned root of one client identity.
//!
//! Holds the vault, the key manager and the transport for a single user so
//! several identities can live side by side in one process (tests run Alice
//! and Bob this way). Nothing here is global.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use hl_crypto::{CryptoBackend, KeyManager, PublicKeyBytes};
use hl_proto::{Connector, MessageEnvelope};
use hl_store::{history_key, KeyValueStore, SecureVault, VaultConfig, VaultState, PROFILE_KEY};

use crate::{
    config::TransportConfig,
    error::TransportError,
    transport::{EventStream, SessionTransport, SharedKeys},
};

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub backend: CryptoBackend,
    pub vault: VaultConfig,
    pub transport: TransportConfig,
}

pub struct ClientContext {
    vault: Arc<SecureVault>,
    keys: SharedKeys,
    transport: SessionTransport,
}

impl ClientContext {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn Connector>,
        options: ContextOptions,
    ) -> (Self, EventStream) {
        let vault = Arc::new(SecureVault::new(store, options.backend.clone(), options.vault));
        let keys: SharedKeys = Arc::new(Mutex::new(KeyManager::new(options.backend)));
        let (transport, events) = SessionTransport::builder(user_id, keys.clone(), connector)
            .config(options.transport)
            .vault(vault.clone())
            .build();
        (
            Self {
                vault,
                keys,
                transport,
            },
            events,
        )
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn vault(&self) -> &Arc<SecureVault> {
        &self.vault
    }

    pub fn keys(&self) -> &SharedKeys {
        &self.keys
    }

    /// Unlock the vault and bring the identity into memory.
    ///
    /// A new identity gets a fresh keypair sealed into the vault; a returning
    /// one loads its stored keypair (or creates one if none was stored). The
    /// persisted outbound queue is restored. Any failure, including a wrong
    /// password on an already unlocked context, ends with the session
    /// disconnected, every key dropped and the vault locked.
    pub async fn unlock(&self, password: &[u8], is_new_identity: bool) -> Result<PublicKeyBytes, TransportError> {
        if let Err(e) = self.vault.initialize(password, is_new_identity).await {
            // A rejected unlock leaves nothing from an earlier session resident.
            self.lock().await;
            return Err(e.into());
        }
        match self.load_identity(is_new_identity).await {
            Ok(public) => {
                tracing::info!(
                    user_id = %self.transport.user_id(),
                    fingerprint = %public.fingerprint(),
                    "client unlocked"
                );
                Ok(public)
            }
            Err(e) => {
                self.lock().await;
                Err(e)
            }
        }
    }

    async fn load_identity(&self, is_new_identity: bool) -> Result<PublicKeyBytes, TransportError> {
        let stored = if is_new_identity {
            None
        } else {
            self.vault.get_keys().await?
        };
        let public = match stored {
            Some(exported) => self.keys.lock().load_identity(&exported)?,
            None => {
                let exported = {
                    let mut keys = self.keys.lock();
                    keys.generate_identity()?;
                    keys.export_identity()?
                };
                self.vault.store_keys(&exported).await?;
                PublicKeyBytes::from_b64(&exported.public_key)?
            }
        };
        self.transport.restore_outbox().await?;
        Ok(public)
    }

    pub async fn connect(&self, token: &str) -> Result<(), TransportError> {
        self.transport.connect(token).await
    }

    /// Disconnect, drop every key from memory and lock the vault. Queued
    /// sends stay sealed in the vault for the next unlock.
    pub async fn lock(&self) {
        self.transport.disconnect().await;
        self.keys.lock().teardown();
        self.vault.lock().await;
    }

    /// Irreversibly delete all local data for this identity.
    pub async fn clear_all_data(&self) -> Result<(), TransportError> {
        self.transport.disconnect().await;
        self.keys.lock().teardown();
        self.vault.clear().await?;
        tracing::info!(user_id = %self.transport.user_id(), "local data cleared");
        Ok(())
    }

    /// Tear the session down whenever the vault locks, including the
    /// inactivity auto-lock of an idle client.
    pub fn spawn_lock_watcher(&self) -> JoinHandle<()> {
        let mut changes = self.vault.state_changes();
        let vault = self.vault.clone();
        let keys = self.keys.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            loop {
                let deadline = vault.auto_lock_deadline().await;
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *changes.borrow_and_update();
                        if matches!(state, VaultState::Locked | VaultState::Cleared) {
                            transport.disconnect().await;
                            keys.lock().teardown();
                            tracing::info!(?state, "session closed after vault lock");
                        }
                    }
                    // Applies the lock; the state change is handled next turn.
                    () = idle_until(deadline) => {
                        vault.state().await;
                    }
                }
            }
        })
    }

    // ── Caches ───────────────────────────────────────────────────────────────

    /// Seal the current envelopes of `chat_id` into the history cache.
    pub async fn save_history(&self, chat_id: &str) -> Result<usize, TransportError> {
        let messages = self.transport.chat_messages(chat_id);
        self.vault.set_item(&history_key(chat_id), &messages).await?;
        Ok(messages.len())
    }

    /// Load the history cache of `chat_id` into the transport. A missing or
    /// unreadable cache yields an empty history.
    pub async fn load_history(&self, chat_id: &str) -> Result<Vec<MessageEnvelope>, TransportError> {
        let messages: Vec<MessageEnvelope> = self
            .vault
            .get_item(&history_key(chat_id))
            .await?
            .unwrap_or_default();
        self.transport.import_history(messages.clone());
        Ok(messages)
    }

    pub async fn save_profile<T: Serialize>(&self, profile: &T) -> Result<(), TransportError> {
        Ok(self.vault.set_item(PROFILE_KEY, profile).await?)
    }

    pub async fn load_profile<T: DeserializeOwned>(&self) -> Result<Option<T>, TransportError> {
        Ok(self.vault.get_item(PROFILE_KEY).await?)
    }
}

async fn idle_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
