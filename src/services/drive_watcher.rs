use crate::adapters::alerts::AlertSink;
use crate::adapters::source::{DownloadStatus, SourceTree};
use crate::adapters::vault::{CancelCheck, METADATA_HASH_KEY, VaultError, VaultProvider};
use crate::domain::entry::MAX_FAILURES;
use crate::domain::events::{
    AlertCategory, BackupSurface, NetworkState, SourceEvent, StatusEvent, WatcherState, WebhookEvent,
};
use crate::domain::key::namespaced;
use crate::domain::settings::{BackupMode, MirrorReconcile};
use crate::error::AgentError;
use crate::services::crypto_service::{self, CryptoEngine, ENCRYPTED_SUFFIX};
use crate::services::exclusion::ExclusionFilter;
use crate::services::ledger_service::LedgerService;
use crate::services::status::StatusRegistry;
use crate::services::transfer_queue::{RateLimiter, TransferQueue};
use crate::services::webhook_service::WebhookService;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use opentelemetry::metrics::Counter;
use opentelemetry::global;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Events for the same path within this window collapse into one handler.
const DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
struct Metrics {
    files_vaulted: Counter<u64>,
    bytes_vaulted: Counter<u64>,
    transfer_failures: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("anchor-agent");
        Self {
            files_vaulted: meter
                .u64_counter("anchor_drive_files_vaulted")
                .with_description("Files durably written to the vault")
                .build(),
            bytes_vaulted: meter
                .u64_counter("anchor_drive_bytes_vaulted")
                .with_description("Plaintext bytes written to the vault")
                .build(),
            transfer_failures: meter.u64_counter("anchor_drive_transfer_failures").build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DriveWatcherConfig {
    pub mode: BackupMode,
    pub reconcile: MirrorReconcile,
    /// Key namespace inside the vault (`drive` on S3 or a shared root).
    pub key_prefix: Option<String>,
    /// Remote vaults gate transfers on a verified network link.
    pub remote_vault: bool,
}

/// Owns the change→upload pipeline for the user's file tree.
///
/// A single task consumes the inbound event channel; per-path ordering comes
/// from the debounce map plus the ledger's check-then-update pattern, and
/// cross-path concurrency is bounded by the transfer queue.
pub struct DriveWatcher {
    config: DriveWatcherConfig,
    source: Arc<dyn SourceTree>,
    vault: Arc<dyn VaultProvider>,
    ledger: LedgerService,
    crypto: CryptoEngine,
    queue: TransferQueue,
    limiter: Option<Arc<RateLimiter>>,
    exclusions: Arc<ExclusionFilter>,
    alerts: Arc<dyn AlertSink>,
    status: Arc<StatusRegistry>,
    webhooks: WebhookService,
    network_rx: Option<watch::Receiver<NetworkState>>,
    vault_rx: Option<watch::Receiver<bool>>,
    running: AtomicBool,
    paused: AtomicBool,
    debounce_tokens: DashMap<String, u64>,
    debounce_seq: AtomicU64,
    metrics: Metrics,
}

impl std::fmt::Debug for DriveWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveWatcher")
            .field("config", &self.config)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_arguments)]
impl DriveWatcher {
    #[must_use]
    pub fn new(
        config: DriveWatcherConfig,
        source: Arc<dyn SourceTree>,
        vault: Arc<dyn VaultProvider>,
        ledger: LedgerService,
        crypto: CryptoEngine,
        queue: TransferQueue,
        limiter: Option<Arc<RateLimiter>>,
        exclusions: Arc<ExclusionFilter>,
        alerts: Arc<dyn AlertSink>,
        status: Arc<StatusRegistry>,
        webhooks: WebhookService,
        network_rx: Option<watch::Receiver<NetworkState>>,
        vault_rx: Option<watch::Receiver<bool>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            source,
            vault,
            ledger,
            crypto,
            queue,
            limiter,
            exclusions,
            alerts,
            status,
            webhooks,
            network_rx,
            vault_rx,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            debounce_tokens: DashMap::new(),
            debounce_seq: AtomicU64::new(0),
            metrics: Metrics::new(),
        })
    }

    fn set_state(&self, state: WatcherState) {
        self.status.publish(StatusEvent::WatcherState { surface: BackupSurface::Drive, state });
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.paused.load(Ordering::SeqCst)
    }

    fn cancel_check(self: &Arc<Self>) -> CancelCheck {
        let this = Arc::clone(self);
        Arc::new(move || !this.is_active())
    }

    /// Global pause toggle (user action or expensive-network policy).
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.status.publish(StatusEvent::Paused(paused));
        self.set_state(if paused { WatcherState::Paused } else { WatcherState::Monitoring });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn logical_key(&self, relative_path: &str) -> String {
        namespaced(self.config.key_prefix.as_deref(), relative_path)
    }

    /// Both representations a path may have in the vault, encrypted and not.
    fn key_variants(&self, relative_path: &str) -> [String; 2] {
        let key = self.logical_key(relative_path);
        [format!("{key}{ENCRYPTED_SUFFIX}"), key]
    }

    fn relative_from_key(&self, object_key: &str) -> String {
        let key = self
            .config
            .key_prefix
            .as_deref()
            .and_then(|p| object_key.strip_prefix(&format!("{p}/")))
            .unwrap_or(object_key);
        key.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(key).to_string()
    }

    fn relative_from_path(&self, path: &Path) -> Option<String> {
        path.strip_prefix(self.source.root())
            .ok()
            .map(|rel| rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
            .filter(|rel| !rel.is_empty())
    }

    /// Main loop: start-up sweep, smart scan, then event consumption until
    /// shutdown. Network and vault transitions pause and resume the
    /// pipeline; a reconnect kicks a fresh smart scan.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SourceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.running.store(true, Ordering::SeqCst);

        // Remote vaults wait for a verified link before the first transfer.
        if self.config.remote_vault
            && let Some(rx) = &self.network_rx
            && *rx.borrow() != NetworkState::Verified
        {
            self.paused.store(true, Ordering::SeqCst);
            self.set_state(WatcherState::Paused);
        }

        self.sweep_stale_uploads().await;
        self.smart_scan().await;
        self.set_state(WatcherState::Monitoring);

        let mut network_rx = self.network_rx.clone();
        let mut vault_rx = self.vault_rx.clone();

        while !*shutdown.borrow() && self.running.load(Ordering::SeqCst) {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.dispatch(event),
                        None => break,
                    }
                }
                Ok(state) = next_value(&mut network_rx) => {
                    self.on_network_change(state).await;
                }
                Ok(connected) = next_value(&mut vault_rx) => {
                    self.on_vault_change(connected).await;
                }
                _ = shutdown.changed() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_state(WatcherState::Idle);
        tracing::info!("Drive watcher shutting down...");
    }

    async fn on_network_change(self: &Arc<Self>, state: NetworkState) {
        if !self.config.remote_vault {
            return;
        }
        if state == NetworkState::Verified {
            if self.paused.swap(false, Ordering::SeqCst) {
                tracing::info!("Network verified; resuming transfers");
                self.set_state(WatcherState::Monitoring);
                self.smart_scan().await;
            }
        } else if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::warn!(network = %state, "Network lost; pausing transfers");
            self.set_state(WatcherState::Paused);
        }
    }

    async fn on_vault_change(self: &Arc<Self>, connected: bool) {
        if connected {
            if self.paused.swap(false, Ordering::SeqCst) {
                tracing::info!("Vault reconnected; rescanning");
                self.set_state(WatcherState::Scanning);
                self.smart_scan().await;
                self.set_state(WatcherState::Monitoring);
            }
        } else if !self.paused.swap(true, Ordering::SeqCst) {
            self.set_state(WatcherState::WaitingForVault);
            self.alerts
                .send("Vault disconnected", "Backups are paused until the vault returns.", AlertCategory::VaultIssue)
                .await;
        }
    }

    /// In-flight upload rows whose source no longer exists are aborted on
    /// the provider and removed at every start-up.
    async fn sweep_stale_uploads(&self) {
        let uploads = match self.ledger.active_uploads().await {
            Ok(uploads) => uploads,
            Err(e) => {
                tracing::warn!(error = %e, "Could not enumerate in-flight uploads");
                return;
            }
        };

        for upload in uploads {
            let relative = self.relative_from_key(&upload.object_key);
            let gone = matches!(self.source.stat(&relative).await, Ok(None));
            if !gone {
                continue;
            }

            tracing::info!(key = %upload.object_key, "Aborting orphaned upload");
            if let Err(e) = self.vault.abort_upload(&upload.object_key, &upload.upload_id).await {
                tracing::warn!(error = %e, key = %upload.object_key, "Failed to abort orphaned upload");
                continue;
            }
            self.ledger.clear_upload(&upload.object_key).await;
        }
    }

    /// Full enumeration that processes only entries whose generation
    /// identifier differs from the ledger's.
    #[tracing::instrument(skip(self), fields(processed = tracing::field::Empty))]
    pub async fn smart_scan(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        self.set_state(WatcherState::Scanning);

        let entries = match self.source.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Smart scan enumeration failed");
                self.set_state(WatcherState::Monitoring);
                return;
            }
        };

        let mut tasks = JoinSet::new();
        let mut pending = 0u64;
        for entry in entries {
            if entry.is_directory {
                continue;
            }
            if self.exclusions.should_ignore(Path::new(&entry.relative_path)) {
                continue;
            }
            if self.ledger.failure_count(&entry.relative_path).await >= MAX_FAILURES {
                continue;
            }
            if !self.ledger.should_process(&entry.relative_path, &entry.gen_id).await {
                continue;
            }

            pending += 1;
            self.status.set_pending(pending);
            let this = Arc::clone(self);
            let relative = entry.relative_path;
            tasks.spawn(async move { this.handle_path(&relative).await });
        }

        let mut processed = 0u64;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(true)) {
                processed += 1;
            }
            pending = pending.saturating_sub(1);
            self.status.set_pending(pending);
        }
        tracing::Span::current().record("processed", processed);

        if self.config.mode == BackupMode::Mirror && self.config.reconcile == MirrorReconcile::Strict {
            self.reconcile_mirror().await;
        }

        if processed > 0 {
            self.webhooks.fire(WebhookEvent::BackupComplete, Some(BackupSurface::Drive), processed, None);
        }
        self.set_state(WatcherState::Monitoring);
    }

    /// Strict mirror reconciliation: any tracked path missing from the
    /// source is removed from the vault and forgotten.
    pub async fn reconcile_mirror(&self) {
        let tracked = match self.ledger.all_tracked_paths().await {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "Mirror reconciliation could not list tracked paths");
                return;
            }
        };

        for path in tracked {
            if !matches!(self.source.stat(&path).await, Ok(None)) {
                continue;
            }
            self.delete_from_vault(&path).await;
        }
    }

    /// Opt-out of historical backfill: record the current generation of
    /// every eligible file without uploading anything.
    pub async fn mark_everything_synced(&self) {
        let entries = match self.source.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Baseline walk failed");
                return;
            }
        };

        let mut count = 0u64;
        for entry in entries {
            if entry.is_directory || self.exclusions.should_ignore(Path::new(&entry.relative_path)) {
                continue;
            }
            self.ledger.mark_baseline(&entry.relative_path, &entry.gen_id).await;
            count += 1;
        }
        tracing::info!(count, "Marked existing files as synced");
    }

    fn dispatch(self: &Arc<Self>, event: SourceEvent) {
        if let SourceEvent::Moved { from, to } = event {
            let (Some(old), Some(new)) = (self.relative_from_path(&from), self.relative_from_path(&to)) else {
                return;
            };
            let this = Arc::clone(self);
            tokio::spawn(async move { this.handle_move(&old, &new).await });
            return;
        }

        let Some(relative) = self.relative_from_path(event.primary_path()) else { return };
        if self.exclusions.should_ignore(Path::new(&relative)) {
            return;
        }
        self.debounce(relative);
    }

    /// Schedules a handler after the debounce window; a later event for the
    /// same path supersedes the pending one.
    fn debounce(self: &Arc<Self>, relative: String) {
        let token = self.debounce_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.debounce_tokens.insert(relative.clone(), token);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let still_current = this.debounce_tokens.get(&relative).is_some_and(|current| *current == token);
            if !still_current {
                return;
            }
            this.debounce_tokens.remove(&relative);
            this.handle_path(&relative).await;
        });
    }

    /// Rename fast-path: move the ledger subtree and the vault object; a
    /// failed vault move falls back to uploading the new path from scratch.
    async fn handle_move(self: &Arc<Self>, old: &str, new: &str) {
        tracing::debug!(old, new, "Handling move");
        self.ledger.rename(old, new).await;

        let suffix = if self.crypto.is_configured() { ENCRYPTED_SUFFIX } else { "" };
        let old_key = format!("{}{suffix}", self.logical_key(old));
        let new_key = format!("{}{suffix}", self.logical_key(new));

        if let Err(e) = self.vault.move_item(&old_key, &new_key).await {
            tracing::warn!(error = %e, old_key, new_key, "Vault move failed; re-uploading");
            self.ledger.remove(new).await;
            self.handle_path(new).await;
        }
    }

    async fn delete_from_vault(&self, relative: &str) {
        for key in self.key_variants(relative) {
            if let Err(e) = self.vault.delete_file(&key).await {
                tracing::warn!(error = %e, key, "Failed to delete vault object");
                return;
            }
        }
        self.ledger.remove(relative).await;
    }

    /// Processes one observed path end to end. Returns true when a file was
    /// durably vaulted.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_path(self: &Arc<Self>, relative: &str) -> bool {
        if !self.is_active() {
            return false;
        }

        let entry = match self.source.stat(relative).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if self.config.mode == BackupMode::Mirror {
                    tracing::debug!(relative, "Source gone; mirroring deletion");
                    self.delete_from_vault(relative).await;
                }
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, relative, "Could not stat source path");
                return false;
            }
        };

        if entry.is_directory {
            return false;
        }
        if self.ledger.failure_count(relative).await >= MAX_FAILURES {
            return false;
        }
        if !self.ledger.should_process(relative, &entry.gen_id).await {
            return false;
        }

        // A case-only rename must not leave both spellings on a
        // case-insensitive backend: delete the old key before uploading.
        if let Some(stored) = self.ledger.stored_casing(relative).await
            && stored != relative
        {
            tracing::info!(old = %stored, new = %relative, "Casing changed; replacing vault object");
            self.delete_from_vault(&stored).await;
        }

        match entry.download_status {
            DownloadStatus::Current | DownloadStatus::Unknown => {}
            DownloadStatus::NotDownloaded => {
                self.set_state(WatcherState::Downloading);
                if let Err(e) = self.source.request_materialization(relative).await {
                    tracing::warn!(error = %e, relative, "Materialization request failed");
                }
                // A later change event retries once the bytes are present.
                return false;
            }
        }

        match self.transfer(relative, &entry.gen_id).await {
            Ok(()) => true,
            Err(AgentError::Cancelled) => false,
            Err(AgentError::DiskFull { required, available }) => {
                tracing::error!(required, available, "Vault is full; disabling drive backup");
                self.running.store(false, Ordering::SeqCst);
                self.set_state(WatcherState::Disabled);
                self.alerts
                    .send(
                        "Vault is full",
                        "Backups are disabled until space is freed.",
                        AlertCategory::VaultIssue,
                    )
                    .await;
                self.webhooks.fire(
                    WebhookEvent::VaultIssue,
                    Some(BackupSurface::Drive),
                    0,
                    Some("vault full".to_string()),
                );
                false
            }
            Err(e) => {
                self.metrics.transfer_failures.add(1, &[]);
                let failures = self.ledger.increment_failure(relative).await;
                tracing::warn!(error = %e, relative, failures, "Transfer failed");
                if failures == MAX_FAILURES {
                    self.alerts
                        .send(
                            "File repeatedly failing to back up",
                            &format!("{relative} will not be retried until failures are reset."),
                            AlertCategory::VaultIssue,
                        )
                        .await;
                    self.webhooks.fire(
                        WebhookEvent::BackupFailed,
                        Some(BackupSurface::Drive),
                        0,
                        Some(format!("{relative}: {e}")),
                    );
                }
                false
            }
        }
    }

    /// Snapshot → hash → (encrypt) → upload → commit.
    async fn transfer(self: &Arc<Self>, relative: &str, gen_id: &str) -> crate::error::Result<()> {
        // Fresh per-operation directory; dropped (and deleted) on every
        // exit path.
        let staging = tempfile::tempdir()?;
        let snapshot = self.source.snapshot(relative, staging.path()).await?;

        let _permit = self.queue.enqueue().await;
        if !self.is_active() {
            return Err(AgentError::Cancelled);
        }
        self.set_state(WatcherState::Vaulting);

        let plaintext_size = tokio::fs::metadata(&snapshot).await?.len();
        let content_hash = crypto_service::sha256_file(&snapshot).await?;
        let cancel = self.cancel_check();

        let (artifact, upload_key) = if self.crypto.is_configured() {
            CryptoEngine::ensure_temp_capacity(staging.path(), plaintext_size)?;
            let encrypted = snapshot.with_file_name(format!(
                "{}{ENCRYPTED_SUFFIX}",
                snapshot.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
            ));
            let cancel = Arc::clone(&cancel);
            self.crypto.encrypt_file(&snapshot, &encrypted, move || cancel()).await?;
            (encrypted, format!("{}{ENCRYPTED_SUFFIX}", self.logical_key(relative)))
        } else {
            (snapshot.clone(), self.logical_key(relative))
        };

        if let Some(limiter) = &self.limiter {
            limiter.consume(plaintext_size).await;
        }

        let metadata: HashMap<String, String> =
            HashMap::from([(METADATA_HASH_KEY.to_string(), content_hash.clone())]);

        let retry_strategy = ExponentialBuilder::default().with_max_times(2);
        let save = || {
            let cancel = Arc::clone(&cancel);
            let metadata = metadata.clone();
            let artifact = artifact.clone();
            let upload_key = upload_key.clone();
            async move { self.vault.save_file(&artifact, &upload_key, &metadata, cancel).await }
        };
        save.retry(&retry_strategy)
            .when(|e| matches!(e, VaultError::Internal(_) | VaultError::Io(_)))
            .notify(|e, duration| {
                tracing::debug!("Vault write retry in {:?} due to error: {:?}", duration, e);
            })
            .await
            .map_err(AgentError::from)?;

        // Only a durable vault write marks the path processed.
        if !self.ledger.mark_processed(relative, gen_id, &content_hash).await {
            return Err(AgentError::Transient("Ledger write not recorded".to_string()));
        }

        self.metrics.files_vaulted.add(1, &[]);
        self.metrics.bytes_vaulted.add(plaintext_size, &[]);
        self.status.publish(StatusEvent::FileVaulted { surface: BackupSurface::Drive });
        tracing::debug!(relative, bytes = plaintext_size, "File vaulted");
        Ok(())
    }
}

/// Waits for the next value of an optional watch channel; pends forever
/// when the channel is absent so it never wins the select.
async fn next_value<T: Clone>(rx: &mut Option<watch::Receiver<T>>) -> Result<T, watch::error::RecvError> {
    match rx {
        Some(rx) => {
            rx.changed().await?;
            Ok(rx.borrow_and_update().clone())
        }
        None => std::future::pending().await,
    }
}
