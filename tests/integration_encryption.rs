use anchor_agent::adapters::alerts::AlertSink;
use anchor_agent::adapters::source::LocalSourceTree;
use anchor_agent::adapters::vault::{METADATA_HASH_KEY, VaultProvider};
use anchor_agent::domain::settings::{BackupMode, MirrorReconcile};
use anchor_agent::error::AgentError;
use anchor_agent::services::crypto_service::CryptoEngine;
use anchor_agent::services::drive_watcher::{DriveWatcher, DriveWatcherConfig};
use anchor_agent::services::exclusion::ExclusionFilter;
use anchor_agent::services::status::StatusRegistry;
use anchor_agent::services::transfer_queue::TransferQueue;
use anchor_agent::services::webhook_service::{WebhookConfig, WebhookService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

mod common;
use common::{RecordingAlertSink, StubVault, wait_for};

#[tokio::test]
async fn handshake_creates_an_encrypted_identity_and_unlocks_it() {
    common::setup_tracing();
    let vault = StubVault::default();

    // New vault with a password: identity carries salt + sealed token.
    let engine = CryptoEngine::new();
    let identity = engine.handshake(&vault, Some("hunter2")).await.unwrap();
    assert!(identity.is_encrypted());
    assert!(engine.is_configured());

    // Same vault, wrong password: exactly one mismatch, engine untouched.
    let second = CryptoEngine::new();
    let err = second.handshake(&vault, Some("wrong")).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidPassword));
    assert!(!second.is_configured());

    // Right password on an already-initialized vault unlocks.
    let third = CryptoEngine::new();
    let reopened = third.handshake(&vault, Some("hunter2")).await.unwrap();
    assert_eq!(reopened.vault_id, identity.vault_id);
    assert!(third.is_configured());

    // An encrypted vault without a password cannot be used.
    let locked = CryptoEngine::new();
    assert!(matches!(locked.handshake(&vault, None).await.unwrap_err(), AgentError::InvalidPassword));
}

#[tokio::test]
async fn handshake_without_password_creates_an_unencrypted_identity() {
    common::setup_tracing();
    let vault = StubVault::default();

    let engine = CryptoEngine::new();
    let identity = engine.handshake(&vault, None).await.unwrap();
    assert!(!identity.is_encrypted());
    assert!(!engine.is_configured());

    // The identity is stable across handshakes.
    let again = CryptoEngine::new().handshake(&vault, None).await.unwrap();
    assert_eq!(again.vault_id, identity.vault_id);
}

#[tokio::test]
async fn encrypted_pipeline_stores_anchor_objects_that_decrypt_to_the_plaintext() {
    let source = tempfile::tempdir().unwrap();
    let payload = b"the secret sauce".repeat(100);
    std::fs::write(source.path().join("secret.bin"), &payload).unwrap();

    let vault = Arc::new(StubVault::default());
    let engine = CryptoEngine::new();
    engine.handshake(vault.as_ref(), Some("passw0rd")).await.unwrap();
    assert!(engine.is_configured());

    let (ledger, _state_dir) = common::temp_ledger().await;
    let watcher = DriveWatcher::new(
        DriveWatcherConfig {
            mode: BackupMode::Basic,
            reconcile: MirrorReconcile::FutureOnly,
            key_prefix: None,
            remote_vault: false,
        },
        Arc::new(LocalSourceTree::new(source.path())),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        ledger.clone(),
        engine.clone(),
        TransferQueue::new(),
        None,
        Arc::new(ExclusionFilter::default()),
        Arc::new(RecordingAlertSink::default()) as Arc<dyn AlertSink>,
        Arc::new(StatusRegistry::new()),
        WebhookService::new(WebhookConfig::default()),
        None,
        None,
    );

    let (_events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_watcher = Arc::clone(&watcher);
    tokio::spawn(async move {
        run_watcher.run(events_rx, shutdown_rx).await;
    });

    assert!(wait_for(Duration::from_secs(15), || vault.object("secret.bin.anchor").is_some()).await);
    // Only the encrypted representation exists.
    assert!(vault.object("secret.bin").is_none());

    // Metadata carries the plaintext hash (never the ciphertext's).
    let expected_hash = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        hex::encode(hasher.finalize())
    };
    let metadata = vault.metadata_of("secret.bin.anchor").unwrap();
    assert_eq!(metadata.get(METADATA_HASH_KEY), Some(&expected_hash));

    let entry = ledger.entry("secret.bin").await.unwrap().expect("ledger row");
    assert_eq!(entry.content_hash, expected_hash);

    // Ciphertext is not the plaintext, and round-trips through decryption.
    let ciphertext = vault.object("secret.bin.anchor").unwrap();
    assert_ne!(ciphertext, payload);

    let scratch = tempfile::tempdir().unwrap();
    let encrypted_path = scratch.path().join("fetched.anchor");
    let restored_path = scratch.path().join("restored.bin");
    tokio::fs::write(&encrypted_path, &ciphertext).await.unwrap();
    engine.decrypt_file(&encrypted_path, &restored_path, || false).await.unwrap();
    assert_eq!(tokio::fs::read(&restored_path).await.unwrap(), payload);

    let _ = shutdown_tx.send(true);
}
