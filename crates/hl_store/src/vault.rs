//! SecureVault: password-gated encrypted storage for identity keys and
//! client caches.
//!
//! The 32-byte master key is derived from the user password with PBKDF2 and
//! only ever lives in memory. Every record is sealed with AES-256-GCM under
//! that key, with the record name bound as associated data so sealed values
//! cannot be swapped between records.
//!
//! Auto-lock: configurable inactivity timer. Any operation that needs the
//! key first checks the timer and locks the vault if it has expired. An idle
//! owner drives the lock itself from `auto_lock_deadline`.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use zeroize::{Zeroize, Zeroizing};

use hl_crypto::{
    aead,
    kdf::{self, MasterKey},
    CryptoBackend, EncryptedBlob, ExportedIdentity,
};

use crate::{backend::KeyValueStore, error::VaultError};

/// Plaintext, non-secret PBKDF2 salt.
pub const SALT_KEY: &str = "vault/salt";
const VERIFY_KEY: &str = "vault/verify";
const IDENTITY_KEY: &str = "vault/identity";
const ITEM_PREFIX: &str = "item/";

const VERIFY_MARKER: &[u8] = b"hushline-vault-ok";

/// Item key for the cached profile of the local user.
pub const PROFILE_KEY: &str = "profile";
/// Item key for the persisted outbound queue.
pub const OUTBOX_KEY: &str = "outbox";

/// Item key for the cached message history of one chat.
pub fn history_key(chat_id: &str) -> String {
    format!("history/{chat_id}")
}

fn record_aad(key: &str) -> Vec<u8> {
    format!("hushline-vault-v1:{key}").into_bytes()
}

fn item_key(key: &str) -> String {
    format!("{ITEM_PREFIX}{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    /// No master key has been derived yet.
    Uninitialized,
    Unlocked,
    /// Key dropped, records remain on disk.
    Locked,
    /// Records deleted. Terminal.
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Inactivity timeout in seconds. 0 disables auto-lock.
    pub auto_lock_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self { auto_lock_secs: 1800 }
    }
}

struct Resident {
    master: MasterKey,
    salt: Zeroizing<Vec<u8>>,
    last_activity: Instant,
}

struct Inner {
    state: VaultState,
    resident: Option<Resident>,
    auto_lock_secs: u64,
}

impl Inner {
    fn expired(&self) -> bool {
        match &self.resident {
            Some(r) if self.auto_lock_secs > 0 => {
                r.last_activity.elapsed() >= Duration::from_secs(self.auto_lock_secs)
            }
            _ => false,
        }
    }

    fn drop_key(&mut self) {
        if let Some(mut r) = self.resident.take() {
            r.master.zeroize();
            r.salt.zeroize();
        }
    }
}

pub struct SecureVault {
    store: Arc<dyn KeyValueStore>,
    backend: CryptoBackend,
    inner: RwLock<Inner>,
    state_tx: watch::Sender<VaultState>,
}

impl SecureVault {
    pub fn new(store: Arc<dyn KeyValueStore>, backend: CryptoBackend, config: VaultConfig) -> Self {
        let (state_tx, _) = watch::channel(VaultState::Uninitialized);
        Self {
            store,
            backend,
            inner: RwLock::new(Inner {
                state: VaultState::Uninitialized,
                resident: None,
                auto_lock_secs: config.auto_lock_secs,
            }),
            state_tx,
        }
    }

    /// Derive the master key and unlock.
    ///
    /// With `is_new_identity` any existing records are wiped and a fresh salt
    /// and verification marker are written. Otherwise the stored marker must
    /// open under the derived key, or the call fails with `WrongPassword` and
    /// no key is left resident.
    pub async fn initialize(&self, password: &[u8], is_new_identity: bool) -> Result<(), VaultError> {
        if self.inner.read().await.state == VaultState::Cleared {
            return Err(VaultError::Cleared);
        }

        let salt = if is_new_identity {
            Zeroizing::new(kdf::generate_salt(&self.backend)?.to_vec())
        } else {
            Zeroizing::new(
                self.store
                    .get(SALT_KEY)
                    .await?
                    .ok_or(VaultError::NotInitialized)?,
            )
        };

        let master = self.derive(password, &salt).await?;

        if is_new_identity {
            let marker = aead::seal(
                &self.backend,
                master.as_bytes(),
                VERIFY_MARKER,
                &record_aad(VERIFY_KEY),
            )?;
            self.store.clear().await?;
            self.store.put(SALT_KEY, salt.to_vec()).await?;
            self.store.put(VERIFY_KEY, serde_json::to_vec(&marker)?).await?;
        } else if !self.verify(&master).await? {
            let mut inner = self.inner.write().await;
            if inner.resident.is_some() {
                inner.drop_key();
                self.set_state(&mut inner, VaultState::Locked);
            }
            tracing::warn!("vault unlock rejected: wrong password");
            return Err(VaultError::WrongPassword);
        }

        let mut inner = self.inner.write().await;
        if inner.state == VaultState::Cleared {
            return Err(VaultError::Cleared);
        }
        inner.drop_key();
        inner.resident = Some(Resident {
            master,
            salt,
            last_activity: Instant::now(),
        });
        self.set_state(&mut inner, VaultState::Unlocked);
        tracing::info!(new_identity = is_new_identity, "vault unlocked");
        Ok(())
    }

    /// True if this device already holds a vault (a salt has been persisted).
    pub async fn has_vault(&self) -> Result<bool, VaultError> {
        Ok(self.store.get(SALT_KEY).await?.is_some())
    }

    // ── Identity keys ────────────────────────────────────────────────────────

    pub async fn store_keys(&self, identity: &ExportedIdentity) -> Result<(), VaultError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(identity)?);
        self.put_sealed(IDENTITY_KEY, &plaintext).await
    }

    /// Stored identity, if any. A record that fails to open is an error.
    pub async fn get_keys(&self) -> Result<Option<ExportedIdentity>, VaultError> {
        match self.open_sealed(IDENTITY_KEY).await? {
            Some(plaintext) => Ok(Some(serde_json::from_slice(&plaintext)?)),
            None => Ok(None),
        }
    }

    // ── Generic items ────────────────────────────────────────────────────────

    pub async fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), VaultError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        self.put_sealed(&item_key(key), &plaintext).await
    }

    /// Cached item. Unreadable records are reported as a miss.
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, VaultError> {
        let plaintext = match self.open_sealed(&item_key(key)).await {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(None),
            Err(VaultError::Crypto(e)) => {
                tracing::warn!(key, error = %e, "vault item failed to open; treating as miss");
                return Ok(None);
            }
            Err(VaultError::CorruptRecord(_)) => {
                tracing::warn!(key, "vault item is malformed; treating as miss");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&plaintext) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(key, error = %e, "vault item did not parse; treating as miss");
                Ok(None)
            }
        }
    }

    pub async fn remove_item(&self, key: &str) -> Result<bool, VaultError> {
        self.with_key(|_| Ok(())).await?;
        self.store.delete(&item_key(key)).await
    }

    /// Item keys under `prefix` (without the internal namespace).
    pub async fn item_keys(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        self.with_key(|_| Ok(())).await?;
        let keys = self.store.keys_with_prefix(&item_key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(ITEM_PREFIX).map(str::to_string))
            .collect())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Drop the master key. Records on disk are untouched.
    pub async fn lock(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == VaultState::Cleared {
            return;
        }
        inner.drop_key();
        if inner.state == VaultState::Unlocked {
            self.set_state(&mut inner, VaultState::Locked);
            tracing::info!("vault locked");
        }
    }

    /// Delete every record and drop the key. The vault refuses all further use.
    pub async fn clear(&self) -> Result<(), VaultError> {
        self.store.clear().await?;
        let mut inner = self.inner.write().await;
        inner.drop_key();
        self.set_state(&mut inner, VaultState::Cleared);
        tracing::info!("vault cleared");
        Ok(())
    }

    pub async fn state(&self) -> VaultState {
        let mut inner = self.inner.write().await;
        self.apply_auto_lock(&mut inner);
        inner.state
    }

    pub async fn is_locked(&self) -> bool {
        self.state().await != VaultState::Unlocked
    }

    pub fn state_changes(&self) -> watch::Receiver<VaultState> {
        self.state_tx.subscribe()
    }

    /// Record activity (resets the auto-lock timer).
    pub async fn touch(&self) {
        let mut inner = self.inner.write().await;
        self.apply_auto_lock(&mut inner);
        if let Some(r) = inner.resident.as_mut() {
            r.last_activity = Instant::now();
        }
    }

    /// Set the auto-lock timeout in seconds. 0 = disable auto-lock.
    pub async fn set_auto_lock_timeout(&self, seconds: u64) {
        self.inner.write().await.auto_lock_secs = seconds;
    }

    /// Seconds until auto-lock. `None` while no key is resident,
    /// `u64::MAX` when auto-lock is disabled.
    pub async fn time_until_lock(&self) -> Option<u64> {
        let mut inner = self.inner.write().await;
        self.apply_auto_lock(&mut inner);
        let auto_lock_secs = inner.auto_lock_secs;
        inner.resident.as_ref().map(|r| {
            if auto_lock_secs == 0 {
                return u64::MAX;
            }
            auto_lock_secs.saturating_sub(r.last_activity.elapsed().as_secs())
        })
    }

    /// Instant the vault locks itself if left idle. `None` while no key is
    /// resident or auto-lock is disabled.
    pub async fn auto_lock_deadline(&self) -> Option<Instant> {
        let inner = self.inner.read().await;
        match &inner.resident {
            Some(r) if inner.auto_lock_secs > 0 => {
                Some(r.last_activity + Duration::from_secs(inner.auto_lock_secs))
            }
            _ => None,
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn set_state(&self, inner: &mut Inner, state: VaultState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn apply_auto_lock(&self, inner: &mut Inner) {
        if inner.expired() {
            inner.drop_key();
            self.set_state(inner, VaultState::Locked);
            tracing::info!("vault auto-locked after inactivity");
        }
    }

    /// Run `f` with the resident key. Resets the inactivity timer.
    async fn with_key<F, R>(&self, f: F) -> Result<R, VaultError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, VaultError>,
    {
        let mut inner = self.inner.write().await;
        if inner.state == VaultState::Cleared {
            return Err(VaultError::Cleared);
        }
        self.apply_auto_lock(&mut inner);
        match inner.resident.as_mut() {
            Some(r) => {
                r.last_activity = Instant::now();
                f(r.master.as_bytes())
            }
            None => Err(VaultError::NotInitialized),
        }
    }

    async fn derive(&self, password: &[u8], salt: &[u8]) -> Result<MasterKey, VaultError> {
        let backend = self.backend.clone();
        let password = Zeroizing::new(password.to_vec());
        let salt = Zeroizing::new(salt.to_vec());
        let key = tokio::task::spawn_blocking(move || {
            kdf::master_key_from_password(&backend, &password, &salt)
        })
        .await
        .map_err(|e| VaultError::Backend(format!("key derivation task failed: {e}")))??;
        Ok(key)
    }

    async fn verify(&self, master: &MasterKey) -> Result<bool, VaultError> {
        let raw = self
            .store
            .get(VERIFY_KEY)
            .await?
            .ok_or_else(|| VaultError::CorruptRecord(VERIFY_KEY.to_string()))?;
        let marker: EncryptedBlob = serde_json::from_slice(&raw)
            .map_err(|_| VaultError::CorruptRecord(VERIFY_KEY.to_string()))?;
        Ok(
            match aead::open(&self.backend, master.as_bytes(), &marker, &record_aad(VERIFY_KEY)) {
                Ok(plaintext) => plaintext.as_slice() == VERIFY_MARKER,
                Err(_) => false,
            },
        )
    }

    async fn put_sealed(&self, key: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let aad = record_aad(key);
        let blob = self
            .with_key(|k| Ok(aead::seal(&self.backend, k, plaintext, &aad)?))
            .await?;
        self.store.put(key, serde_json::to_vec(&blob)?).await
    }

    async fn open_sealed(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        self.with_key(|_| Ok(())).await?;
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let blob: EncryptedBlob =
            serde_json::from_slice(&raw).map_err(|_| VaultError::CorruptRecord(key.to_string()))?;
        let aad = record_aad(key);
        let plaintext = self
            .with_key(|k| Ok(aead::open(&self.backend, k, &blob, &aad)?))
            .await?;
        Ok(Some(plaintext))
    }
}

impl std::fmt::Debug for SecureVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureVault")
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}
