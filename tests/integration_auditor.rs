use anchor_agent::adapters::alerts::AlertSink;
use anchor_agent::adapters::vault::{LocalVault, METADATA_HASH_KEY, VaultProvider, never_cancelled};
use anchor_agent::domain::entry::VerifyState;
use anchor_agent::domain::events::AlertCategory;
use anchor_agent::services::crypto_service::sha256_file;
use anchor_agent::services::status::StatusRegistry;
use anchor_agent::services::webhook_service::{WebhookConfig, WebhookService};
use anchor_agent::workers::IntegrityAuditor;
use std::collections::HashMap;
use std::sync::Arc;

mod common;
use common::RecordingAlertSink;

struct Rig {
    auditor: IntegrityAuditor,
    ledger: anchor_agent::services::ledger_service::LedgerService,
    vault: Arc<LocalVault>,
    alerts: Arc<RecordingAlertSink>,
    status: Arc<StatusRegistry>,
    _vault_dir: tempfile::TempDir,
    _state_dir: tempfile::TempDir,
}

async fn rig() -> Rig {
    let (ledger, state_dir) = common::temp_ledger().await;
    let vault_dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(LocalVault::new(vault_dir.path()));
    let alerts = Arc::new(RecordingAlertSink::default());
    let status = Arc::new(StatusRegistry::new());

    let auditor = IntegrityAuditor::new(
        ledger.clone(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        Some(LocalVault::new(vault_dir.path())),
        Some("drive".to_string()),
        Arc::clone(&status),
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
        WebhookService::new(WebhookConfig::default()),
        None,
    );

    Rig { auditor, ledger, vault, alerts, status, _vault_dir: vault_dir, _state_dir: state_dir }
}

#[tokio::test]
async fn matching_metadata_marks_entries_verified() {
    let rig = rig().await;
    let staging = tempfile::tempdir().unwrap();
    let file = staging.path().join("ok.bin");
    tokio::fs::write(&file, b"healthy bytes").await.unwrap();
    let hash = sha256_file(&file).await.unwrap();

    rig.vault
        .save_file(&file, "drive/ok.bin", &HashMap::from([(METADATA_HASH_KEY.to_string(), hash.clone())]), never_cancelled())
        .await
        .unwrap();
    rig.ledger.mark_processed("ok.bin", "g1", &hash).await;

    assert_eq!(rig.auditor.audit_batch().await.unwrap(), 1);

    let entry = rig.ledger.entry("ok.bin").await.unwrap().unwrap();
    assert_eq!(entry.verify_state, VerifyState::Verified);
    assert!(entry.verify_at.is_some());
    assert_eq!(rig.alerts.count(AlertCategory::VaultIssue), 0);

    // Verified entries leave the pending queue.
    assert_eq!(rig.auditor.audit_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_attribute_on_a_local_vault_self_heals_when_bytes_match() {
    let rig = rig().await;

    // The object exists with correct bytes but no recorded hash.
    let object = rig._vault_dir.path().join("drive/x.bin");
    tokio::fs::create_dir_all(object.parent().unwrap()).await.unwrap();
    tokio::fs::write(&object, b"intact content").await.unwrap();
    let hash = sha256_file(&object).await.unwrap();
    rig.ledger.mark_processed("x.bin", "g1", &hash).await;

    assert_eq!(rig.auditor.audit_batch().await.unwrap(), 1);

    let entry = rig.ledger.entry("x.bin").await.unwrap().unwrap();
    assert_eq!(entry.verify_state, VerifyState::Verified);

    // The attribute was restored for the next audit cycle.
    let metadata = rig.vault.get_metadata("drive/x.bin").await.unwrap();
    assert_eq!(metadata.get(METADATA_HASH_KEY), Some(&hash));
    assert_eq!(rig.alerts.count(AlertCategory::VaultIssue), 0);
}

#[tokio::test]
async fn corrupted_bytes_are_flagged_as_mismatch() {
    let rig = rig().await;

    let object = rig._vault_dir.path().join("drive/bad.bin");
    tokio::fs::create_dir_all(object.parent().unwrap()).await.unwrap();
    tokio::fs::write(&object, b"tampered").await.unwrap();
    rig.ledger.mark_processed("bad.bin", "g1", "0000000000000000000000000000000000000000000000000000000000000000").await;

    rig.auditor.audit_batch().await.unwrap();

    let entry = rig.ledger.entry("bad.bin").await.unwrap().unwrap();
    assert_eq!(entry.verify_state, VerifyState::Mismatch);
    assert_eq!(rig.alerts.count(AlertCategory::VaultIssue), 1);
    assert_eq!(rig.status.snapshot().integrity_errors, 1);
    assert_eq!(rig.status.snapshot().integrity_health, "degraded");
}

#[tokio::test]
async fn mismatched_metadata_hash_is_flagged_without_rereading_bytes() {
    let rig = rig().await;
    let staging = tempfile::tempdir().unwrap();
    let file = staging.path().join("drifted.bin");
    tokio::fs::write(&file, b"current vault bytes").await.unwrap();

    rig.vault
        .save_file(
            &file,
            "drive/drifted.bin",
            &HashMap::from([(METADATA_HASH_KEY.to_string(), "recorded-at-upload".to_string())]),
            never_cancelled(),
        )
        .await
        .unwrap();
    rig.ledger.mark_processed("drifted.bin", "g1", "something-else-entirely").await;

    rig.auditor.audit_batch().await.unwrap();

    let entry = rig.ledger.entry("drifted.bin").await.unwrap().unwrap();
    assert_eq!(entry.verify_state, VerifyState::Mismatch);
}
