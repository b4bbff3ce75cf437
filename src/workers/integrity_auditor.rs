use crate::adapters::alerts::AlertSink;
use crate::adapters::vault::{LocalVault, METADATA_HASH_KEY, VaultError, VaultProvider, local};
use crate::domain::entry::{FileEntry, VerifyState};
use crate::domain::events::{AlertCategory, NetworkState, StatusEvent, WebhookEvent};
use crate::domain::key::namespaced;
use crate::services::crypto_service::{self, ENCRYPTED_SUFFIX};
use crate::services::ledger_service::LedgerService;
use crate::services::status::StatusRegistry;
use crate::services::webhook_service::WebhookService;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::Instrument;

/// Entries examined per cycle.
const AUDIT_BATCH: i64 = 50;
/// Pause between individual verifications (~10 files/second).
const VERIFY_PACING: StdDuration = StdDuration::from_millis(100);
const BUSY_SLEEP: StdDuration = StdDuration::from_secs(60);
const IDLE_SLEEP: StdDuration = StdDuration::from_secs(60 * 60);

#[derive(Clone, Debug)]
struct Metrics {
    verified: Counter<u64>,
    mismatches: Counter<u64>,
    self_healed: Counter<u64>,
    read_errors: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("anchor-agent");
        Self {
            verified: meter.u64_counter("anchor_integrity_verified").build(),
            mismatches: meter.u64_counter("anchor_integrity_mismatches").build(),
            self_healed: meter.u64_counter("anchor_integrity_self_healed").build(),
            read_errors: meter.u64_counter("anchor_integrity_read_errors").build(),
        }
    }
}

/// Outcome of one entry's verification.
enum Audit {
    Mark(VerifyState),
    /// Remote read failure; leave the entry pending for the next cycle.
    RetryLater,
}

/// Background loop that re-verifies stored objects against their recorded
/// hashes, self-healing missing metadata on local vaults where that can be
/// done without guessing.
pub struct IntegrityAuditor {
    ledger: LedgerService,
    vault: Arc<dyn VaultProvider>,
    /// Set when the vault is a local mount; enables xattr self-heal.
    local_vault: Option<LocalVault>,
    drive_prefix: Option<String>,
    status: Arc<StatusRegistry>,
    alerts: Arc<dyn AlertSink>,
    webhooks: WebhookService,
    /// Present for remote vaults; audits gate on a verified link.
    network_rx: Option<watch::Receiver<NetworkState>>,
    metrics: Metrics,
}

impl std::fmt::Debug for IntegrityAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityAuditor")
            .field("drive_prefix", &self.drive_prefix)
            .field("remote", &self.network_rx.is_some())
            .finish_non_exhaustive()
    }
}

impl IntegrityAuditor {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: LedgerService,
        vault: Arc<dyn VaultProvider>,
        local_vault: Option<LocalVault>,
        drive_prefix: Option<String>,
        status: Arc<StatusRegistry>,
        alerts: Arc<dyn AlertSink>,
        webhooks: WebhookService,
        network_rx: Option<watch::Receiver<NetworkState>>,
    ) -> Self {
        Self {
            ledger,
            vault,
            local_vault,
            drive_prefix,
            status,
            alerts,
            webhooks,
            network_rx,
            metrics: Metrics::new(),
        }
    }

    fn network_verified(&self) -> bool {
        self.network_rx.as_ref().is_none_or(|rx| *rx.borrow() == NetworkState::Verified)
    }

    /// The vault key for a ledger path. Photo entries carry their namespace
    /// in the path; drive entries get the configured prefix.
    fn key_for(&self, path: &str) -> String {
        if path.starts_with("photos/") {
            path.to_string()
        } else {
            namespaced(self.drive_prefix.as_deref(), path)
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let sleep = if self.network_verified() {
                async {
                    match self.audit_batch().await {
                        Ok(0) => IDLE_SLEEP,
                        Ok(_) => BUSY_SLEEP,
                        Err(e) => {
                            tracing::error!(error = %e, "Integrity audit cycle failed");
                            BUSY_SLEEP
                        }
                    }
                }
                .instrument(tracing::info_span!("run_integrity_audit"))
                .await
            } else {
                tracing::debug!("Network not verified; integrity audit deferred");
                BUSY_SLEEP
            };

            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Integrity auditor shutting down...");
    }

    /// Verifies up to [`AUDIT_BATCH`] least-recently-verified entries.
    ///
    /// # Errors
    /// Returns an error if the pending entries cannot be listed.
    #[tracing::instrument(skip(self), fields(batch = tracing::field::Empty))]
    pub async fn audit_batch(&self) -> crate::error::Result<u64> {
        let entries = self.ledger.files_for_auditing(AUDIT_BATCH).await?;
        tracing::Span::current().record("batch", entries.len());

        let mut examined = 0u64;
        for entry in entries {
            match self.verify_entry(&entry).await {
                Audit::Mark(state) => {
                    self.ledger.update_verification(&entry.path, state, OffsetDateTime::now_utc()).await;
                    self.record_outcome(&entry.path, state).await;
                }
                Audit::RetryLater => {}
            }
            examined += 1;
            tokio::time::sleep(VERIFY_PACING).await;
        }
        Ok(examined)
    }

    async fn record_outcome(&self, path: &str, state: VerifyState) {
        match state {
            VerifyState::Verified => {
                self.metrics.verified.add(1, &[]);
                self.status.record_verified();
            }
            VerifyState::Mismatch => {
                self.metrics.mismatches.add(1, &[]);
                self.status.publish(StatusEvent::VerifyMismatch { path: path.to_string() });
                self.alerts
                    .send(
                        "Backup integrity mismatch",
                        &format!("The vault copy of {path} no longer matches what was backed up."),
                        AlertCategory::VaultIssue,
                    )
                    .await;
                self.webhooks.fire(WebhookEvent::IntegrityMismatch, None, 0, Some(path.to_string()));
            }
            VerifyState::MissingMetadata => {
                tracing::warn!(path, "Vault object has no recorded hash to verify against");
            }
            VerifyState::Pending => {}
        }
    }

    /// Checks one entry, preferring the encrypted representation of the key.
    async fn verify_entry(&self, entry: &FileEntry) -> Audit {
        let bare_key = self.key_for(&entry.path);
        let encrypted_key = format!("{bare_key}{ENCRYPTED_SUFFIX}");

        for (key, encrypted) in [(&encrypted_key, true), (&bare_key, false)] {
            match self.vault.get_metadata(key).await {
                Ok(metadata) => return self.judge(entry, key, encrypted, &metadata).await,
                Err(VaultError::NotFound) => {}
                Err(e) => {
                    // A flaky remote read must never turn into a mismatch.
                    self.metrics.read_errors.add(1, &[]);
                    tracing::warn!(error = %e, key, "Metadata read failed; will retry");
                    self.webhooks.fire(WebhookEvent::IntegrityError, None, 0, Some(format!("{key}: {e}")));
                    return Audit::RetryLater;
                }
            }
        }

        // Neither representation exists.
        if self.local_vault.is_some() {
            Audit::Mark(VerifyState::Mismatch)
        } else {
            Audit::Mark(VerifyState::MissingMetadata)
        }
    }

    async fn judge(
        &self,
        entry: &FileEntry,
        key: &str,
        encrypted: bool,
        metadata: &HashMap<String, String>,
    ) -> Audit {
        if let Some(stored_hash) = metadata.get(METADATA_HASH_KEY) {
            return if *stored_hash == entry.content_hash {
                Audit::Mark(VerifyState::Verified)
            } else {
                tracing::warn!(path = %entry.path, "Recorded hash differs from vault metadata");
                Audit::Mark(VerifyState::Mismatch)
            };
        }

        // Metadata attribute missing. On a local, unencrypted object the
        // plaintext is right there: recompute and restore the attribute when
        // it matches the ledger.
        if let Some(local) = &self.local_vault
            && !encrypted
        {
            return self.self_heal(local, entry, key).await;
        }

        Audit::Mark(VerifyState::MissingMetadata)
    }

    async fn self_heal(&self, local: &LocalVault, entry: &FileEntry, key: &str) -> Audit {
        let vault_path = local.root().join(key);
        let computed = match crypto_service::sha256_file(&vault_path).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(error = %e, key, "Self-heal hash failed");
                return Audit::Mark(VerifyState::Mismatch);
            }
        };

        if computed != entry.content_hash {
            return Audit::Mark(VerifyState::Mismatch);
        }

        let write_path = vault_path.clone();
        let hash = computed.clone();
        let result = tokio::task::spawn_blocking(move || {
            local::write_xattr(&write_path, METADATA_HASH_KEY, &hash)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.metrics.self_healed.add(1, &[]);
                tracing::info!(key, "Restored missing hash attribute");
                Audit::Mark(VerifyState::Verified)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, key, "Could not write restored attribute");
                Audit::RetryLater
            }
            Err(e) => {
                tracing::warn!(error = %e, key, "Self-heal task failed");
                Audit::RetryLater
            }
        }
    }
}
