use anchor_agent::adapters::alerts::AlertSink;
use anchor_agent::adapters::photos::{PhotoAsset, PhotoResource};
use anchor_agent::adapters::vault::{METADATA_HASH_KEY, VaultProvider};
use anchor_agent::services::crypto_service::CryptoEngine;
use anchor_agent::services::photo_watcher::{PhotoWatcher, PhotoWatcherConfig};
use anchor_agent::services::status::StatusRegistry;
use anchor_agent::services::transfer_queue::TransferQueue;
use anchor_agent::services::webhook_service::{WebhookConfig, WebhookService};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use time::macros::datetime;
use tokio::sync::watch;

mod common;
use common::{RecordingAlertSink, StubPhotoLibrary, StubVault, wait_for};

fn sample_library() -> StubPhotoLibrary {
    StubPhotoLibrary::with_assets(vec![
        (
            PhotoAsset {
                identifier: "asset-1".to_string(),
                created_at: datetime!(2024-06-03 10:00 UTC),
                resources: vec![
                    PhotoResource { file_name: "IMG_0001.HEIC".to_string() },
                    PhotoResource { file_name: "IMG_0001.MOV".to_string() },
                ],
            },
            vec![b"heic bytes".to_vec(), b"live photo movie".to_vec()],
        ),
        (
            PhotoAsset {
                identifier: "asset-2".to_string(),
                created_at: datetime!(2023-12-24 18:30 UTC),
                resources: vec![PhotoResource { file_name: "IMG_0002.JPG".to_string() }],
            },
            vec![b"jpeg bytes".to_vec()],
        ),
    ])
}

#[tokio::test]
async fn first_run_exports_the_whole_library_under_dated_keys() {
    let (ledger, state_dir) = common::temp_ledger().await;
    let vault = Arc::new(StubVault::default());
    let library = Arc::new(sample_library());

    let watcher = PhotoWatcher::new(
        PhotoWatcherConfig {
            remote_vault: false,
            poll_interval_secs: 1,
            token_path: state_dir.path().join("photo_token"),
        },
        Arc::clone(&library) as Arc<dyn anchor_agent::adapters::photos::PhotoLibrary>,
        Arc::clone(&vault) as Arc<dyn VaultProvider>,
        ledger.clone(),
        CryptoEngine::new(),
        TransferQueue::new(),
        None,
        Arc::new(RecordingAlertSink::default()) as Arc<dyn AlertSink>,
        Arc::new(StatusRegistry::new()),
        WebhookService::new(WebhookConfig::default()),
        None,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_watcher = Arc::clone(&watcher);
    tokio::spawn(async move {
        run_watcher.run(shutdown_rx).await;
    });

    // Every resource of every asset lands under photos/<YYYY>/<MM>/.
    assert!(wait_for(Duration::from_secs(15), || {
        vault.object("photos/2024/06/IMG_0001.HEIC").is_some()
            && vault.object("photos/2024/06/IMG_0001.MOV").is_some()
            && vault.object("photos/2023/12/IMG_0002.JPG").is_some()
    })
    .await);
    assert_eq!(vault.object("photos/2024/06/IMG_0001.MOV").unwrap(), b"live photo movie".to_vec());
    assert!(vault.metadata_of("photos/2023/12/IMG_0002.JPG").unwrap().contains_key(METADATA_HASH_KEY));

    // The library token was captured after the full scan.
    assert!(
        wait_for(Duration::from_secs(5), || {
            std::fs::read_to_string(state_dir.path().join("photo_token")).is_ok_and(|t| t == "t1")
        })
        .await
    );
    assert_eq!(library.full_scans.load(Ordering::SeqCst), 1);

    // Later polls see no changes and export nothing new.
    let saves = vault.saves.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(vault.saves.load(Ordering::SeqCst), saves);
    assert_eq!(library.full_scans.load(Ordering::SeqCst), 1, "saved token must prevent rescans");

    let _ = shutdown_tx.send(true);
}
