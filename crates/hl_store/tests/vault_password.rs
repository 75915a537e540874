use std::sync::Arc;

use hl_crypto::{CryptoBackend, KeyManager};
use hl_store::{SecureVault, SqliteStore, VaultConfig, VaultError, VaultState};

fn backend() -> CryptoBackend {
    CryptoBackend::with_pbkdf2_iterations(1_000)
}

#[tokio::test]
async fn wrong_password_leaves_no_key_resident() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vault.db");

    let mut km = KeyManager::new(backend());
    km.generate_identity().unwrap();
    let identity = km.export_identity().unwrap();

    {
        let store = SqliteStore::open(&path).await.expect("open");
        let vault = SecureVault::new(Arc::new(store.clone()), backend(), VaultConfig::default());
        vault.initialize(b"right password", true).await.unwrap();
        vault.store_keys(&identity).await.unwrap();
        vault.lock().await;
        store.close().await;
    }

    // Fresh process: same database, new vault handle.
    let store = SqliteStore::open(&path).await.expect("reopen");
    let vault = SecureVault::new(Arc::new(store), backend(), VaultConfig::default());
    assert!(vault.has_vault().await.unwrap());

    let err = vault.initialize(b"wrong password", false).await.unwrap_err();
    assert!(matches!(err, VaultError::WrongPassword));
    assert_eq!(vault.state().await, VaultState::Uninitialized);
    assert!(matches!(vault.get_keys().await, Err(VaultError::NotInitialized)));

    vault.initialize(b"right password", false).await.unwrap();
    let loaded = vault.get_keys().await.unwrap().expect("identity persisted");
    assert_eq!(loaded.public_key, identity.public_key);

    let mut restored = KeyManager::new(backend());
    let public = restored.load_identity(&loaded).unwrap();
    assert_eq!(public.to_b64(), identity.public_key);
}

#[tokio::test]
async fn wrong_password_while_unlocked_locks_the_vault() {
    let store = Arc::new(hl_store::MemoryStore::new());
    let vault = SecureVault::new(store, backend(), VaultConfig::default());
    vault.initialize(b"pw", true).await.unwrap();

    assert!(matches!(
        vault.initialize(b"nope", false).await,
        Err(VaultError::WrongPassword)
    ));
    assert_eq!(vault.state().await, VaultState::Locked);
    assert!(matches!(vault.get_keys().await, Err(VaultError::NotInitialized)));
}
