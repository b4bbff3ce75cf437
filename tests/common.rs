#![allow(dead_code)]
use anchor_agent::adapters::alerts::AlertSink;
use anchor_agent::adapters::photos::{PhotoAsset, PhotoChanges, PhotoLibrary, PhotoResource};
use anchor_agent::adapters::vault::{
    CancelCheck, VaultError, VaultFileMetadata, VaultProvider, VaultResult,
};
use anchor_agent::domain::events::AlertCategory;
use anchor_agent::domain::identity::VaultIdentity;
use anchor_agent::services::ledger_service::LedgerService;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

static INIT: OnceLock<()> = OnceLock::new();

pub fn setup_tracing() {
    INIT.get_or_init(|| {
        anchor_agent::telemetry::init_test_telemetry();
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("sqlx=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("aws=warn".parse().unwrap());
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// Opens a fresh ledger in its own temp directory. The directory guard must
/// outlive the service.
pub async fn temp_ledger() -> (LedgerService, TempDir) {
    setup_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let (ledger, was_reset) = LedgerService::open(&dir.path().join("ledger.db")).await.expect("open ledger");
    assert!(!was_reset, "fresh ledger must not report a reset");
    (ledger, dir)
}

/// In-memory vault for exercising the transfer pipeline without disk or
/// network. Can inject a fixed number of save failures.
#[derive(Debug, Default)]
pub struct StubVault {
    pub objects: DashMap<String, (Vec<u8>, HashMap<String, String>)>,
    pub identity: Mutex<Option<VaultIdentity>>,
    pub failures_remaining: AtomicU64,
    pub saves: AtomicU64,
    pub deletes: AtomicU64,
}

impl StubVault {
    pub fn failing(times: u64) -> Self {
        let vault = Self::default();
        vault.failures_remaining.store(times, Ordering::SeqCst);
        vault
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.0.clone())
    }

    pub fn metadata_of(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects.get(key).map(|o| o.1.clone())
    }
}

#[async_trait]
impl VaultProvider for StubVault {
    async fn load_identity(&self) -> VaultResult<Option<VaultIdentity>> {
        Ok(self.identity.lock().expect("identity lock").clone())
    }

    async fn save_identity(&self, identity: &VaultIdentity) -> VaultResult<()> {
        *self.identity.lock().expect("identity lock") = Some(identity.clone());
        Ok(())
    }

    async fn save_file(
        &self,
        local_source: &Path,
        key: &str,
        metadata: &HashMap<String, String>,
        cancel: CancelCheck,
    ) -> VaultResult<()> {
        if cancel() {
            return Err(VaultError::Cancelled);
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VaultError::Internal("injected failure".to_string()));
        }

        let bytes = tokio::fs::read(local_source).await?;
        self.objects.insert(key.to_string(), (bytes, metadata.clone()));
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> VaultResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects.remove(key);
        Ok(())
    }

    async fn move_item(&self, old_key: &str, new_key: &str) -> VaultResult<()> {
        let (_, object) = self.objects.remove(old_key).ok_or(VaultError::NotFound)?;
        self.objects.insert(new_key.to_string(), object);
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> VaultResult<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn get_metadata(&self, key: &str) -> VaultResult<HashMap<String, String>> {
        self.objects.get(key).map(|o| o.1.clone()).ok_or(VaultError::NotFound)
    }

    async fn list_files(&self, prefix: &str) -> VaultResult<Vec<VaultFileMetadata>> {
        let mut entries = Vec::new();
        for item in &self.objects {
            if item.key().starts_with(prefix) {
                entries.push(VaultFileMetadata {
                    name: item.key().rsplit('/').next().unwrap_or_default().to_string(),
                    path: item.key().clone(),
                    is_folder: false,
                    size: item.value().0.len() as u64,
                    modified: None,
                });
            }
        }
        Ok(entries)
    }

    async fn list_all_files(&self) -> VaultResult<Vec<String>> {
        Ok(self.objects.iter().map(|o| o.key().clone()).collect())
    }

    async fn wipe(&self, prefix: &str) -> VaultResult<()> {
        self.objects.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

/// Alert sink that records what it was asked to display.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    pub alerts: Mutex<Vec<(String, AlertCategory)>>,
}

impl RecordingAlertSink {
    pub fn count(&self, category: AlertCategory) -> usize {
        self.alerts.lock().expect("alerts lock").iter().filter(|(_, c)| *c == category).count()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, title: &str, _body: &str, category: AlertCategory) {
        self.alerts.lock().expect("alerts lock").push((title.to_string(), category));
    }
}

/// Photo library stub: a fixed set of assets with file contents, handed out
/// in batches keyed by the change token.
#[derive(Debug, Default)]
pub struct StubPhotoLibrary {
    pub assets: Mutex<Vec<PhotoAsset>>,
    pub contents: DashMap<String, Vec<u8>>,
    pub token: Mutex<String>,
    pub full_scans: AtomicU64,
}

impl StubPhotoLibrary {
    pub fn with_assets(assets: Vec<(PhotoAsset, Vec<Vec<u8>>)>) -> Self {
        let library = Self { token: Mutex::new("t1".to_string()), ..Self::default() };
        for (asset, payloads) in assets {
            for (resource, payload) in asset.resources.iter().zip(payloads) {
                library.contents.insert(format!("{}/{}", asset.identifier, resource.file_name), payload);
            }
            library.assets.lock().expect("assets lock").push(asset);
        }
        library
    }
}

#[async_trait]
impl PhotoLibrary for StubPhotoLibrary {
    async fn changes_since(&self, token: Option<&str>) -> anchor_agent::error::Result<PhotoChanges> {
        let current = self.token.lock().expect("token lock").clone();
        if token.is_none() {
            self.full_scans.fetch_add(1, Ordering::SeqCst);
        }
        let assets = if token == Some(current.as_str()) {
            Vec::new()
        } else {
            self.assets.lock().expect("assets lock").clone()
        };
        Ok(PhotoChanges { assets, token: current })
    }

    async fn export_resource(
        &self,
        asset: &PhotoAsset,
        resource: &PhotoResource,
        dest_dir: &Path,
    ) -> anchor_agent::error::Result<PathBuf> {
        let payload = self
            .contents
            .get(&format!("{}/{}", asset.identifier, resource.file_name))
            .map(|p| p.clone())
            .unwrap_or_default();
        let dest = dest_dir.join(&resource.file_name);
        tokio::fs::write(&dest, payload).await?;
        Ok(dest)
    }
}

/// Polls until `predicate` holds or the timeout elapses.
pub async fn wait_for<F>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    predicate()
}

/// Polls an async predicate until it holds or the timeout elapses.
pub async fn wait_for_async<F, Fut>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    predicate().await
}
