use anchor_agent::api;
use anchor_agent::domain::events::{BackupSurface, NetworkState, StatusEvent, WatcherState};
use anchor_agent::services::status::StatusRegistry;
use std::sync::Arc;

mod common;

#[tokio::test]
async fn metrics_endpoint_serves_the_status_snapshot() {
    common::setup_tracing();
    let status = Arc::new(StatusRegistry::new());
    status.publish(StatusEvent::WatcherState { surface: BackupSurface::Drive, state: WatcherState::Monitoring });
    status.publish(StatusEvent::Network(NetworkState::Verified));
    status.publish(StatusEvent::FileVaulted { surface: BackupSurface::Drive });
    status.publish(StatusEvent::FileVaulted { surface: BackupSurface::Drive });
    status.publish(StatusEvent::FileVaulted { surface: BackupSurface::Photos });
    status.record_verified();
    status.set_pending(7);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::mgmt_router(status)).await.unwrap();
    });

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["files_vaulted"], 2);
    assert_eq!(body["photos_backed_up"], 1);
    assert_eq!(body["integrity_verified"], 1);
    assert_eq!(body["integrity_errors"], 0);
    assert_eq!(body["files_pending"], 7);
    assert_eq!(body["drive_status"], "monitoring");
    assert_eq!(body["network_status"], "verified");
    assert_eq!(body["is_paused"], false);
    assert_eq!(body["integrity_health"], "ok");
    assert_eq!(body["app_version"], env!("CARGO_PKG_VERSION"));
    assert!(body["hostname"].as_str().is_some_and(|h| !h.is_empty()));
    assert!(body["timestamp"].as_i64().is_some_and(|t| t > 0));
}
