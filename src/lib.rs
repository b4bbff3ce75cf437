#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod telemetry;
pub mod workers;

use crate::adapters::alerts::{AlertSink, LogAlertSink, NoopAlertSink};
use crate::adapters::photos::PhotoLibrary;
use crate::adapters::source::watcher::FsEventSource;
use crate::adapters::source::{LocalSourceTree, SourceTree};
use crate::adapters::vault::{LocalVault, S3Vault, VaultProvider};
use crate::config::Config;
use crate::domain::events::{AlertCategory, SourceEvent, StatusEvent};
use crate::domain::settings::{Schedule, VaultKind};
use crate::services::crypto_service::CryptoEngine;
use crate::services::drive_watcher::{DriveWatcher, DriveWatcherConfig};
use crate::services::exclusion::ExclusionFilter;
use crate::services::ledger_service::LedgerService;
use crate::services::network_monitor::NetworkMonitor;
use crate::services::photo_watcher::{PhotoWatcher, PhotoWatcherConfig};
use crate::services::status::StatusRegistry;
use crate::services::transfer_queue::{RateLimiter, TransferQueue};
use crate::services::vault_monitor::VaultMonitor;
use crate::services::webhook_service::WebhookService;
use crate::workers::IntegrityAuditor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// The drive pipeline plus its event feed: realtime subscriptions carry a
/// platform watcher, scheduled mode a periodic rescan instead.
pub struct DriveUnit {
    pub watcher: Arc<DriveWatcher>,
    fs_events: Option<FsEventSource>,
    events_tx: mpsc::UnboundedSender<SourceEvent>,
    events_rx: mpsc::UnboundedReceiver<SourceEvent>,
    scan_interval: Option<Duration>,
}

impl std::fmt::Debug for DriveUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveUnit").field("scan_interval", &self.scan_interval).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Workers {
    pub drive: Option<DriveUnit>,
    pub photos: Option<Arc<PhotoWatcher>>,
    pub auditor: IntegrityAuditor,
    pub network_monitor: Option<NetworkMonitor>,
    pub vault_monitor: Option<VaultMonitor>,
}

#[derive(Debug)]
pub struct Agent {
    pub ledger: LedgerService,
    pub status: Arc<StatusRegistry>,
    pub workers: Workers,
}

impl Workers {
    #[must_use]
    pub fn spawn_all(self, shutdown_rx: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Some(monitor) = self.network_monitor {
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                monitor.run(rx).await;
            }));
        }

        if let Some(monitor) = self.vault_monitor {
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                monitor.run(rx).await;
            }));
        }

        if let Some(unit) = self.drive {
            let DriveUnit { watcher, fs_events, events_tx, events_rx, scan_interval } = unit;

            // Forward platform notifications into the watcher's channel.
            if let Some(fs_events) = fs_events {
                let (guard, mut raw) = fs_events.into_parts();
                let tx = events_tx.clone();
                let mut rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    let _guard = guard;
                    loop {
                        tokio::select! {
                            event = raw.recv() => {
                                match event {
                                    Some(event) => {
                                        if tx.send(event).is_err() {
                                            break;
                                        }
                                    }
                                    None => break,
                                }
                            }
                            _ = rx.changed() => break,
                        }
                    }
                }));
            }

            // Scheduled mode: no subscription, just periodic smart scans.
            if let Some(interval) = scan_interval {
                let scan_watcher = Arc::clone(&watcher);
                let mut rx = shutdown_rx.clone();
                // Holding the sender keeps the watcher's channel open.
                let keepalive = events_tx;
                tasks.push(tokio::spawn(async move {
                    let _keepalive = keepalive;
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    while !*rx.borrow() {
                        tokio::select! {
                            _ = ticker.tick() => scan_watcher.smart_scan().await,
                            _ = rx.changed() => {}
                        }
                    }
                }));
            }

            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                watcher.run(events_rx, rx).await;
            }));
        }

        if let Some(photo_watcher) = self.photos {
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                photo_watcher.run(rx).await;
            }));
        }

        let auditor = self.auditor;
        tasks.push(tokio::spawn(async move {
            auditor.run(shutdown_rx).await;
        }));

        tasks
    }
}

/// Builder for constructing and wiring the agent object graph.
pub struct AgentBuilder {
    config: Config,
    photo_library: Option<Arc<dyn PhotoLibrary>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder").field("config", &self.config).finish_non_exhaustive()
    }
}

impl AgentBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config, photo_library: None, alert_sink: None }
    }

    /// Injects the host photo-library boundary.
    #[must_use]
    pub fn with_photo_library(mut self, library: Arc<dyn PhotoLibrary>) -> Self {
        self.photo_library = Some(library);
        self
    }

    /// Overrides the alert sink (the default logs alerts).
    #[must_use]
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Builds the agent: opens the ledger, performs the vault identity
    /// handshake and wires every service and worker.
    ///
    /// # Errors
    /// Returns an error when mandatory configuration is missing, the ledger
    /// cannot be opened at all, or the vault handshake fails.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(self) -> anyhow::Result<Agent> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.state_dir).await?;

        let status = Arc::new(StatusRegistry::new());
        let webhooks = WebhookService::new(config.webhook());
        let alerts: Arc<dyn AlertSink> = self.alert_sink.unwrap_or_else(|| {
            if config.notifications_enabled { Arc::new(LogAlertSink) } else { Arc::new(NoopAlertSink) }
        });

        let (ledger, ledger_was_reset) = LedgerService::open(&config.ledger_path()).await?;
        if ledger_was_reset {
            status.publish(StatusEvent::LedgerReset);
            alerts
                .send(
                    "Backup records were reset",
                    "The sync ledger was unreadable and has been re-created; the next scan re-checks everything.",
                    AlertCategory::VaultIssue,
                )
                .await;
        }

        let exclusions =
            Arc::new(ExclusionFilter::new(config.ignored_folder_list(), config.ignored_extension_list()));

        // Vault provider plus the monitor matching its kind.
        let (vault, local_vault, network_monitor, network_rx, vault_monitor, vault_rx): (
            Arc<dyn VaultProvider>,
            Option<LocalVault>,
            _,
            _,
            _,
            _,
        ) = match config.vault_kind {
            VaultKind::Local => {
                let root = config
                    .vault_root
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--vault-root is required for a local vault"))?;
                let local = LocalVault::new(root.clone());
                let (monitor, rx) = VaultMonitor::new(root);
                (Arc::new(local.clone()), Some(local), None, None, Some(monitor), Some(rx))
            }
            VaultKind::S3 => {
                let bucket = config
                    .s3_bucket
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--s3-bucket is required for an S3 vault"))?;
                let client = initialize_s3_client(&config).await;
                let vault = S3Vault::connect(client, bucket, ledger.clone()).await;
                let (monitor, rx) = NetworkMonitor::new(config.probe_url.clone(), config.probe_body.clone());
                (Arc::new(vault), None, Some(monitor), Some(rx), None, None)
            }
        };

        let crypto = CryptoEngine::new();
        let identity = crypto.handshake(vault.as_ref(), config.vault_password.as_deref()).await?;
        tracing::info!(vault_id = %identity.vault_id, encrypted = crypto.is_configured(), "Vault ready");

        let queue = TransferQueue::new();
        let limiter =
            (config.max_upload_mbps > 0).then(|| Arc::new(RateLimiter::new(config.max_upload_mbps)));
        let remote_vault = config.vault_kind == VaultKind::S3;

        // Key namespaces: an S3 vault (or a local vault shared between
        // drive and photos) multiplexes by prefix.
        let drive_prefix =
            (remote_vault || config.photos_enabled).then(|| "drive".to_string());

        // A different vault than last run invalidates the ledger, but the
        // new vault's own contents seed it so unchanged files are not
        // re-uploaded wholesale.
        let vault_marker = config.state_dir.join("vault_id");
        let previous_vault = tokio::fs::read_to_string(&vault_marker).await.ok();
        let current_vault = identity.vault_id.to_string();
        if previous_vault.as_deref().map(str::trim).is_some_and(|p| p != current_vault) {
            tracing::info!(vault_id = %current_vault, "Vault changed; rebuilding ledger from its contents");
            rebuild_ledger_from_vault(&ledger, vault.as_ref(), config.source_root.as_deref(), drive_prefix.as_deref())
                .await;
        }
        if let Err(e) = tokio::fs::write(&vault_marker, &current_vault).await {
            tracing::warn!(error = %e, "Could not persist the vault id marker");
        }

        let drive = if config.drive_enabled && config.source_root.is_some() {
            let root = config.source_root.clone().unwrap_or_default();
            let source: Arc<dyn SourceTree> = Arc::new(LocalSourceTree::new(root.clone()));

            let schedule = config.schedule().map_err(|e| anyhow::anyhow!(e))?;
            let (fs_events, scan_interval) = match schedule {
                Schedule::Realtime => (Some(FsEventSource::subscribe(&root)?), None),
                Schedule::EveryMinutes(minutes) => (None, Some(Duration::from_secs(minutes * 60))),
            };

            let watcher = DriveWatcher::new(
                DriveWatcherConfig {
                    mode: config.backup_mode,
                    reconcile: config.mirror_reconcile,
                    key_prefix: drive_prefix.clone(),
                    remote_vault,
                },
                source,
                Arc::clone(&vault),
                ledger.clone(),
                crypto.clone(),
                queue.clone(),
                limiter.clone(),
                Arc::clone(&exclusions),
                Arc::clone(&alerts),
                Arc::clone(&status),
                webhooks.clone(),
                network_rx.clone(),
                vault_rx,
            );

            if config.baseline {
                watcher.mark_everything_synced().await;
            }

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Some(DriveUnit { watcher, fs_events, events_tx, events_rx, scan_interval })
        } else {
            None
        };

        let photos = match (&self.photo_library, config.photos_enabled) {
            (Some(library), true) => Some(PhotoWatcher::new(
                PhotoWatcherConfig {
                    remote_vault,
                    poll_interval_secs: config.photos_poll_secs,
                    token_path: config.photo_token_path(),
                },
                Arc::clone(library),
                Arc::clone(&vault),
                ledger.clone(),
                crypto.clone(),
                queue.clone(),
                limiter,
                Arc::clone(&alerts),
                Arc::clone(&status),
                webhooks.clone(),
                network_rx.clone(),
            )),
            (None, true) => {
                tracing::warn!("Photo backup enabled but no photo library boundary was provided");
                None
            }
            _ => None,
        };

        // A persisted pause outlives restarts; transfers resume on a timer.
        if let Some(until) = config.paused_until().map_err(|e| anyhow::anyhow!(e))? {
            let now = time::OffsetDateTime::now_utc();
            if until > now {
                status.publish(StatusEvent::Paused(true));
                let drive_watcher = drive.as_ref().map(|unit| Arc::clone(&unit.watcher));
                let photo_watcher = photos.clone();
                if let Some(watcher) = &drive_watcher {
                    watcher.set_paused(true);
                }
                if let Some(watcher) = &photo_watcher {
                    watcher.set_paused(true);
                }

                let remaining = std::time::Duration::try_from(until - now).unwrap_or_default();
                let resume_status = Arc::clone(&status);
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    tracing::info!("Scheduled pause elapsed; resuming transfers");
                    if let Some(watcher) = drive_watcher {
                        watcher.set_paused(false);
                    }
                    if let Some(watcher) = photo_watcher {
                        watcher.set_paused(false);
                    }
                    resume_status.publish(StatusEvent::Paused(false));
                });
            }
        }

        let auditor = IntegrityAuditor::new(
            ledger.clone(),
            Arc::clone(&vault),
            local_vault,
            drive_prefix,
            Arc::clone(&status),
            alerts,
            webhooks,
            network_rx,
        );

        Ok(Agent {
            ledger,
            status,
            workers: Workers { drive, photos, auditor, network_monitor, vault_monitor },
        })
    }
}

/// Re-seeds a wiped ledger from a newly attached vault's enumeration: every
/// object that still exists unchanged in the source becomes a baseline
/// entry, so switching vaults does not re-upload terabytes.
async fn rebuild_ledger_from_vault(
    ledger: &LedgerService,
    vault: &dyn VaultProvider,
    source_root: Option<&std::path::Path>,
    drive_prefix: Option<&str>,
) {
    ledger.wipe().await;
    let Some(root) = source_root else { return };

    let keys = match vault.list_all_files().await {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(error = %e, "Could not enumerate the new vault; next scan re-uploads as needed");
            return;
        }
    };

    let mut seeded = 0u64;
    for key in keys {
        if key == domain::identity::IDENTITY_FILE_NAME || key.starts_with("photos/") {
            continue;
        }
        let relative = drive_prefix
            .and_then(|p| key.strip_prefix(&format!("{p}/")))
            .unwrap_or(&key);
        let relative = relative.strip_suffix(services::crypto_service::ENCRYPTED_SUFFIX).unwrap_or(relative);

        let Ok(meta) = std::fs::metadata(root.join(relative)) else { continue };
        if !meta.is_file() {
            continue;
        }
        ledger.mark_baseline(relative, &adapters::source::generation_id(&meta)).await;
        seeded += 1;
    }
    tracing::info!(seeded, "Ledger re-seeded from the vault enumeration");
}

/// Initializes an S3 client from configuration.
#[tracing::instrument(skip(config))]
pub async fn initialize_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = aws_config::Region::new(config.s3_region.clone());
    let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);

    if let Some(ref endpoint) = config.s3_endpoint {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    if let (Some(ak), Some(sk)) = (&config.s3_access_key, &config.s3_secret_key) {
        let creds = aws_credential_types::Credentials::new(ak.clone(), sk.clone(), None, None, "static");
        config_loader = config_loader.credentials_provider(creds);
    }

    let sdk_config = config_loader.load().await;
    // Non-AWS endpoints generally require path-style addressing.
    let force_path_style = config.s3_force_path_style || config.s3_endpoint.is_some();
    let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(force_path_style);
    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}

/// Sets up a panic hook that logs the panic message and location.
pub fn setup_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .map_or_else(|| payload.downcast_ref::<String>().map_or_else(|| "Box<Any>", String::as_str), |s| *s);

        let location = panic_info.location().map_or_else(
            || "unknown".to_string(),
            |location| format!("{}:{}:{}", location.file(), location.line(), location.column()),
        );

        tracing::error!(
            panic.message = %msg,
            panic.location = %location,
            "Agent panicked"
        );
    }));
}

/// Returns a future that completes when a termination signal is received.
///
/// # Panics
/// Panics if the signal handlers cannot be installed.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}

/// Spawns a task that listens for OS signals and broadcasts a shutdown signal.
pub fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });
}
