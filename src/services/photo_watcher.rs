use crate::adapters::alerts::AlertSink;
use crate::adapters::photos::{PhotoAsset, PhotoLibrary, PhotoResource};
use crate::adapters::vault::{CancelCheck, METADATA_HASH_KEY, VaultProvider};
use crate::domain::entry::MAX_FAILURES;
use crate::domain::events::{AlertCategory, BackupSurface, NetworkState, StatusEvent, WatcherState, WebhookEvent};
use crate::error::AgentError;
use crate::services::crypto_service::{self, CryptoEngine, ENCRYPTED_SUFFIX};
use crate::services::ledger_service::LedgerService;
use crate::services::status::StatusRegistry;
use crate::services::transfer_queue::{RateLimiter, TransferQueue};
use crate::services::webhook_service::WebhookService;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Namespace for exported assets inside the vault and the ledger.
const PHOTO_PREFIX: &str = "photos";

#[derive(Clone, Debug)]
struct Metrics {
    photos_exported: Counter<u64>,
    export_failures: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("anchor-agent");
        Self {
            photos_exported: meter
                .u64_counter("anchor_photos_exported")
                .with_description("Photo resources durably written to the vault")
                .build(),
            export_failures: meter.u64_counter("anchor_photos_export_failures").build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PhotoWatcherConfig {
    /// Remote vaults gate transfers on a verified network link.
    pub remote_vault: bool,
    /// How often the library's change token is polled.
    pub poll_interval_secs: u64,
    /// Where the saved change token persists across restarts.
    pub token_path: PathBuf,
}

/// Exports photo-library assets into the vault.
///
/// Consumes the library's persistent change token: the first run (no saved
/// token) exports the whole library, later runs only the assets inserted
/// since the token, advancing it after each completed batch.
pub struct PhotoWatcher {
    config: PhotoWatcherConfig,
    library: Arc<dyn PhotoLibrary>,
    vault: Arc<dyn VaultProvider>,
    ledger: LedgerService,
    crypto: CryptoEngine,
    queue: TransferQueue,
    limiter: Option<Arc<RateLimiter>>,
    alerts: Arc<dyn AlertSink>,
    status: Arc<StatusRegistry>,
    webhooks: WebhookService,
    network_rx: Option<watch::Receiver<NetworkState>>,
    running: AtomicBool,
    paused: AtomicBool,
    metrics: Metrics,
}

impl std::fmt::Debug for PhotoWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoWatcher").field("config", &self.config).finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_arguments)]
impl PhotoWatcher {
    #[must_use]
    pub fn new(
        config: PhotoWatcherConfig,
        library: Arc<dyn PhotoLibrary>,
        vault: Arc<dyn VaultProvider>,
        ledger: LedgerService,
        crypto: CryptoEngine,
        queue: TransferQueue,
        limiter: Option<Arc<RateLimiter>>,
        alerts: Arc<dyn AlertSink>,
        status: Arc<StatusRegistry>,
        webhooks: WebhookService,
        network_rx: Option<watch::Receiver<NetworkState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            library,
            vault,
            ledger,
            crypto,
            queue,
            limiter,
            alerts,
            status,
            webhooks,
            network_rx,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            metrics: Metrics::new(),
        })
    }

    fn set_state(&self, state: WatcherState) {
        self.status.publish(StatusEvent::WatcherState { surface: BackupSurface::Photos, state });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Global pause toggle shared with the drive pipeline.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.set_state(if paused { WatcherState::Paused } else { WatcherState::Monitoring });
    }

    fn cancel_check(self: &Arc<Self>) -> CancelCheck {
        let this = Arc::clone(self);
        Arc::new(move || !this.running.load(Ordering::SeqCst) || this.paused.load(Ordering::SeqCst))
    }

    fn network_allows_transfers(&self) -> bool {
        if !self.config.remote_vault {
            return true;
        }
        self.network_rx.as_ref().is_none_or(|rx| *rx.borrow() == NetworkState::Verified)
    }

    /// The vault key for one asset resource:
    /// `photos/<YYYY>/<MM>/<original-filename>`.
    fn resource_key(asset: &PhotoAsset, resource: &PhotoResource) -> String {
        format!(
            "{PHOTO_PREFIX}/{:04}/{:02}/{}",
            asset.created_at.year(),
            u8::from(asset.created_at.month()),
            resource.file_name
        )
    }

    async fn load_token(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.config.token_path).await {
            Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read photo change token; forcing full scan");
                None
            }
        }
    }

    async fn store_token(&self, token: &str) {
        if let Some(parent) = self.config.token_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::error!(error = %e, "Could not create state directory for photo token");
            return;
        }
        if let Err(e) = tokio::fs::write(&self.config.token_path, token).await {
            tracing::error!(error = %e, "Could not persist photo change token");
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        self.set_state(WatcherState::Monitoring);
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));

        while !*shutdown.borrow() && self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {
                    if self.network_allows_transfers() && !self.paused.load(Ordering::SeqCst) {
                        self.process_changes().await;
                    } else {
                        self.set_state(WatcherState::Paused);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_state(WatcherState::Idle);
        tracing::info!("Photo watcher shutting down...");
    }

    /// One token-to-token pass over the library.
    #[tracing::instrument(skip(self), fields(exported = tracing::field::Empty))]
    pub async fn process_changes(self: &Arc<Self>) {
        let token = self.load_token().await;
        let changes = match self.library.changes_since(token.as_deref()).await {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(error = %e, "Photo library enumeration failed");
                return;
            }
        };

        if changes.assets.is_empty() {
            self.store_token(&changes.token).await;
            self.set_state(WatcherState::Monitoring);
            return;
        }

        self.set_state(WatcherState::Scanning);
        tracing::info!(assets = changes.assets.len(), first_run = token.is_none(), "Exporting photo assets");

        let mut exported = 0u64;
        for asset in &changes.assets {
            if !self.running.load(Ordering::SeqCst) || !self.network_allows_transfers() {
                // Token is not advanced; the next pass re-fetches this batch.
                self.set_state(WatcherState::Paused);
                return;
            }
            for resource in &asset.resources {
                if self.export_resource(asset, resource).await {
                    exported += 1;
                }
            }
        }

        self.store_token(&changes.token).await;
        tracing::Span::current().record("exported", exported);

        if exported > 0 {
            self.webhooks.fire(WebhookEvent::BackupComplete, Some(BackupSurface::Photos), exported, None);
        }
        self.set_state(WatcherState::Monitoring);
    }

    /// Exports one resource end to end. Returns true when it was vaulted.
    async fn export_resource(self: &Arc<Self>, asset: &PhotoAsset, resource: &PhotoResource) -> bool {
        let key = Self::resource_key(asset, resource);

        if self.ledger.failure_count(&key).await >= MAX_FAILURES {
            return false;
        }
        if !self.ledger.should_process(&key, &asset.identifier).await {
            return false;
        }

        match self.transfer(asset, resource, &key).await {
            Ok(()) => true,
            Err(AgentError::Cancelled) => false,
            Err(AgentError::DiskFull { required, available }) => {
                tracing::error!(required, available, "Vault is full; disabling photo backup");
                self.running.store(false, Ordering::SeqCst);
                self.set_state(WatcherState::Disabled);
                self.alerts
                    .send(
                        "Vault is full",
                        "Photo backups are disabled until space is freed.",
                        AlertCategory::VaultIssue,
                    )
                    .await;
                false
            }
            Err(e) => {
                self.metrics.export_failures.add(1, &[]);
                let failures = self.ledger.increment_failure(&key).await;
                tracing::warn!(error = %e, key, failures, "Photo export failed");
                if failures == MAX_FAILURES {
                    self.webhooks.fire(
                        WebhookEvent::BackupFailed,
                        Some(BackupSurface::Photos),
                        0,
                        Some(format!("{key}: {e}")),
                    );
                }
                false
            }
        }
    }

    async fn transfer(
        self: &Arc<Self>,
        asset: &PhotoAsset,
        resource: &PhotoResource,
        key: &str,
    ) -> crate::error::Result<()> {
        let staging = tempfile::tempdir()?;
        let exported = self.library.export_resource(asset, resource, staging.path()).await?;

        let _permit = self.queue.enqueue().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(AgentError::Cancelled);
        }
        self.set_state(WatcherState::Vaulting);

        let plaintext_size = tokio::fs::metadata(&exported).await?.len();
        let content_hash = crypto_service::sha256_file(&exported).await?;
        let cancel = self.cancel_check();

        let (artifact, upload_key) = if self.crypto.is_configured() {
            CryptoEngine::ensure_temp_capacity(staging.path(), plaintext_size)?;
            let encrypted = exported.with_file_name(format!("{}{ENCRYPTED_SUFFIX}", resource.file_name));
            let cancel = Arc::clone(&cancel);
            self.crypto.encrypt_file(&exported, &encrypted, move || cancel()).await?;
            (encrypted, format!("{key}{ENCRYPTED_SUFFIX}"))
        } else {
            (exported, key.to_string())
        };

        if let Some(limiter) = &self.limiter {
            limiter.consume(plaintext_size).await;
        }

        let metadata: HashMap<String, String> =
            HashMap::from([(METADATA_HASH_KEY.to_string(), content_hash.clone())]);
        self.vault.save_file(&artifact, &upload_key, &metadata, cancel).await.map_err(AgentError::from)?;

        if !self.ledger.mark_processed(key, &asset.identifier, &content_hash).await {
            return Err(AgentError::Transient("Ledger write not recorded".to_string()));
        }

        self.metrics.photos_exported.add(1, &[]);
        self.status.publish(StatusEvent::FileVaulted { surface: BackupSurface::Photos });
        tracing::debug!(key, bytes = plaintext_size, "Photo resource vaulted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn resource_keys_are_laid_out_by_capture_date() {
        let asset = PhotoAsset {
            identifier: "A1".to_string(),
            created_at: datetime!(2024-06-03 12:00 UTC),
            resources: vec![PhotoResource { file_name: "IMG_0001.HEIC".to_string() }],
        };
        assert_eq!(PhotoWatcher::resource_key(&asset, &asset.resources[0]), "photos/2024/06/IMG_0001.HEIC");
    }
}
