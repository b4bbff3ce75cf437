use anchor_agent::adapters::alerts::AlertSink;
use anchor_agent::adapters::source::LocalSourceTree;
use anchor_agent::adapters::vault::{LocalVault, METADATA_HASH_KEY, VaultProvider};
use anchor_agent::domain::events::{AlertCategory, SourceEvent};
use anchor_agent::domain::settings::{BackupMode, MirrorReconcile};
use anchor_agent::services::crypto_service::CryptoEngine;
use anchor_agent::services::drive_watcher::{DriveWatcher, DriveWatcherConfig};
use anchor_agent::services::exclusion::ExclusionFilter;
use anchor_agent::services::status::StatusRegistry;
use anchor_agent::services::transfer_queue::TransferQueue;
use anchor_agent::services::webhook_service::{WebhookConfig, WebhookService};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

mod common;
use common::{RecordingAlertSink, StubVault, wait_for, wait_for_async};

struct Harness {
    watcher: Arc<DriveWatcher>,
    events_tx: mpsc::UnboundedSender<SourceEvent>,
    shutdown_tx: watch::Sender<bool>,
    alerts: Arc<RecordingAlertSink>,
    ledger: anchor_agent::services::ledger_service::LedgerService,
    _state_dir: tempfile::TempDir,
}

async fn spawn_watcher(
    source_root: &std::path::Path,
    vault: Arc<dyn VaultProvider>,
    mode: BackupMode,
    reconcile: MirrorReconcile,
    crypto: CryptoEngine,
) -> Harness {
    let (ledger, state_dir) = common::temp_ledger().await;
    let alerts = Arc::new(RecordingAlertSink::default());

    let watcher = DriveWatcher::new(
        DriveWatcherConfig { mode, reconcile, key_prefix: None, remote_vault: false },
        Arc::new(LocalSourceTree::new(source_root)),
        vault,
        ledger.clone(),
        crypto,
        TransferQueue::new(),
        None,
        Arc::new(ExclusionFilter::default()),
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
        Arc::new(StatusRegistry::new()),
        WebhookService::new(WebhookConfig::default()),
        None,
        None,
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_watcher = Arc::clone(&watcher);
    tokio::spawn(async move {
        run_watcher.run(events_rx, shutdown_rx).await;
    });

    Harness { watcher, events_tx, shutdown_tx, alerts, ledger, _state_dir: state_dir }
}

#[tokio::test]
async fn fresh_local_vault_backs_up_one_file_with_hash_metadata() {
    let source = tempfile::tempdir().unwrap();
    let vault_dir = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("a.txt"), b"hello").unwrap();

    let vault = Arc::new(LocalVault::new(vault_dir.path()));
    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Basic,
        MirrorReconcile::FutureOnly,
        CryptoEngine::new(),
    )
    .await;

    let dest = vault_dir.path().join("a.txt");
    assert!(wait_for(Duration::from_secs(10), || dest.exists()).await, "a.txt was not vaulted");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");

    let metadata = vault.get_metadata("a.txt").await.unwrap();
    assert_eq!(
        metadata.get(METADATA_HASH_KEY).map(String::as_str),
        Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );

    let entry = harness.ledger.entry("a.txt").await.unwrap().expect("ledger row");
    assert_eq!(entry.content_hash, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    assert_eq!(entry.failure_count, 0);
    assert_eq!(entry.verify_state, anchor_agent::domain::entry::VerifyState::Pending);

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn mirror_mode_deletes_vault_copy_when_source_disappears() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("b.txt"), b"mirrored").unwrap();

    let vault = Arc::new(StubVault::default());
    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Mirror,
        MirrorReconcile::FutureOnly,
        CryptoEngine::new(),
    )
    .await;

    assert!(wait_for(Duration::from_secs(10), || vault.object("b.txt").is_some()).await);

    std::fs::remove_file(source.path().join("b.txt")).unwrap();
    harness.events_tx.send(SourceEvent::Deleted(source.path().join("b.txt"))).unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || vault.object("b.txt").is_none()).await,
        "vault copy survived a mirror deletion"
    );
    let ledger = harness.ledger.clone();
    assert!(
        wait_for_async(Duration::from_secs(5), || {
            let ledger = ledger.clone();
            async move { ledger.entry("b.txt").await.unwrap().is_none() }
        })
        .await
    );

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn strict_mirror_reconciliation_removes_orphans() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("keep.txt"), b"still here").unwrap();

    let vault = Arc::new(StubVault::default());
    // Pretend "ghost.txt" was backed up in a previous life.
    vault
        .objects
        .insert("ghost.txt".to_string(), (b"ghost".to_vec(), std::collections::HashMap::new()));

    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Mirror,
        MirrorReconcile::Strict,
        CryptoEngine::new(),
    )
    .await;

    // Let the start-up scan finish before seeding the orphan.
    assert!(wait_for(Duration::from_secs(10), || vault.object("keep.txt").is_some()).await);
    harness.ledger.mark_processed("ghost.txt", "gone-gen", "gone-hash").await;

    // A fresh smart scan runs the strict reconcile at its end.
    harness.watcher.smart_scan().await;

    assert!(wait_for(Duration::from_secs(10), || vault.object("ghost.txt").is_none()).await);
    assert!(vault.object("keep.txt").is_some());
    assert!(harness.ledger.entry("ghost.txt").await.unwrap().is_none());

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn three_consecutive_failures_quarantine_the_path_with_one_alert() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("c.txt"), b"never makes it").unwrap();

    let vault = Arc::new(StubVault::failing(u64::MAX));
    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Basic,
        MirrorReconcile::FutureOnly,
        CryptoEngine::new(),
    )
    .await;

    // First attempt comes from the start-up smart scan.
    let ledger = harness.ledger.clone();
    assert!(
        wait_for_async(Duration::from_secs(20), || {
            let ledger = ledger.clone();
            async move { ledger.failure_count("c.txt").await == 1 }
        })
        .await
    );

    for expected in 2..=3i64 {
        harness.events_tx.send(SourceEvent::Changed(source.path().join("c.txt"))).unwrap();
        let ledger = harness.ledger.clone();
        assert!(
            wait_for_async(Duration::from_secs(30), || {
                let ledger = ledger.clone();
                async move { ledger.failure_count("c.txt").await == expected }
            })
            .await,
            "failure {expected} not recorded"
        );
    }

    assert_eq!(harness.alerts.count(AlertCategory::VaultIssue), 1);

    // Quarantined: further events do not reach the vault.
    let attempts_before = vault.saves.load(Ordering::SeqCst);
    harness.events_tx.send(SourceEvent::Changed(source.path().join("c.txt"))).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(vault.saves.load(Ordering::SeqCst), attempts_before);
    assert_eq!(harness.ledger.failure_count("c.txt").await, 3);

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn case_only_rename_deletes_the_old_key_before_uploading() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("Foo.txt"), b"cased").unwrap();

    let vault = Arc::new(StubVault::default());
    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Basic,
        MirrorReconcile::FutureOnly,
        CryptoEngine::new(),
    )
    .await;

    assert!(wait_for(Duration::from_secs(10), || vault.object("Foo.txt").is_some()).await);

    std::fs::rename(source.path().join("Foo.txt"), source.path().join("foo.txt")).unwrap();
    harness.events_tx.send(SourceEvent::Changed(source.path().join("foo.txt"))).unwrap();

    assert!(wait_for(Duration::from_secs(10), || vault.object("foo.txt").is_some()).await);
    assert!(vault.object("Foo.txt").is_none(), "old casing must not coexist with the new one");
    assert!(harness.ledger.entry("foo.txt").await.unwrap().is_some());
    assert!(harness.ledger.entry("Foo.txt").await.unwrap().is_none());

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn move_events_take_the_rename_fast_path() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("d.txt"), b"movable").unwrap();

    let vault = Arc::new(StubVault::default());
    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Basic,
        MirrorReconcile::FutureOnly,
        CryptoEngine::new(),
    )
    .await;

    assert!(wait_for(Duration::from_secs(10), || vault.object("d.txt").is_some()).await);
    let saves_before = vault.saves.load(Ordering::SeqCst);

    std::fs::rename(source.path().join("d.txt"), source.path().join("e.txt")).unwrap();
    harness
        .events_tx
        .send(SourceEvent::Moved { from: source.path().join("d.txt"), to: source.path().join("e.txt") })
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || vault.object("e.txt").is_some()).await);
    assert!(vault.object("d.txt").is_none());
    // Server-side move, not a re-upload.
    assert_eq!(vault.saves.load(Ordering::SeqCst), saves_before);

    // The ledger followed the rename: same generation, no reprocessing.
    let entry = harness.ledger.entry("e.txt").await.unwrap().expect("renamed row");
    assert!(!harness.ledger.should_process("e.txt", &entry.gen_id).await);

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn excluded_and_zero_byte_paths() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("good.txt"), b"ok").unwrap();
    std::fs::write(source.path().join("empty.txt"), b"").unwrap();
    std::fs::write(source.path().join(".DS_Store"), b"junk").unwrap();
    std::fs::write(source.path().join("scratch.tmp"), b"junk").unwrap();

    let vault = Arc::new(StubVault::default());
    let harness = spawn_watcher(
        source.path(),
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        BackupMode::Basic,
        MirrorReconcile::FutureOnly,
        CryptoEngine::new(),
    )
    .await;

    assert!(wait_for(Duration::from_secs(10), || vault.object("good.txt").is_some()).await);
    // Zero-byte files are allowed on the unencrypted path.
    assert!(wait_for(Duration::from_secs(10), || vault.object("empty.txt").is_some()).await);
    assert_eq!(vault.object("empty.txt").unwrap().len(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(vault.object(".DS_Store").is_none());
    assert!(vault.object("scratch.tmp").is_none());

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn baseline_records_without_uploading() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("history.txt"), b"old data").unwrap();

    let vault = Arc::new(StubVault::default());
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
        CryptoEngine::new(),
        TransferQueue::new(),
        None,
        Arc::new(ExclusionFilter::default()),
        Arc::new(RecordingAlertSink::default()) as Arc<dyn AlertSink>,
        Arc::new(StatusRegistry::new()),
        WebhookService::new(WebhookConfig::default()),
        None,
        None,
    );

    watcher.mark_everything_synced().await;

    assert!(vault.objects.is_empty(), "baseline must not upload");
    let entry = ledger.entry("history.txt").await.unwrap().expect("baseline row");
    assert!(!ledger.should_process("history.txt", &entry.gen_id).await);
}
