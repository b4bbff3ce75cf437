use crate::domain::settings::{BackupMode, MirrorReconcile, Schedule, VaultKind};
use crate::services::webhook_service::WebhookConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

const DEFAULT_STATE_DIR: &str = ".anchor-agent";
const DEFAULT_SCHEDULE: &str = "realtime";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_METRICS_HOST: &str = "127.0.0.1";
const DEFAULT_METRICS_PORT: u16 = 4777;
const DEFAULT_PHOTOS_POLL_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TRACE_SAMPLING_RATIO: f64 = 0.1;
// The standard captive-portal detection pair: a URL with a fixed,
// cache-proof body.
const DEFAULT_PROBE_URL: &str = "http://captive.apple.com/hotspot-detect.html";
const DEFAULT_PROBE_BODY: &str =
    "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Root of the cloud-synced tree to back up
    #[arg(long, env = "ANCHOR_SOURCE_ROOT")]
    pub source_root: Option<PathBuf>,

    #[arg(long, env = "ANCHOR_DRIVE_ENABLED", default_value_t = true)]
    pub drive_enabled: bool,

    #[arg(long, env = "ANCHOR_PHOTOS_ENABLED", default_value_t = false)]
    pub photos_enabled: bool,

    /// Directory holding the ledger, saved tokens and other agent state
    #[arg(long, env = "ANCHOR_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    #[arg(long, env = "ANCHOR_BACKUP_MODE", value_enum, default_value_t = BackupMode::Basic)]
    pub backup_mode: BackupMode,

    #[arg(long, env = "ANCHOR_MIRROR_RECONCILE", value_enum, default_value_t = MirrorReconcile::Strict)]
    pub mirror_reconcile: MirrorReconcile,

    /// `realtime` or `every:<minutes>`
    #[arg(long, env = "ANCHOR_SCHEDULE", default_value = DEFAULT_SCHEDULE)]
    pub schedule: String,

    /// Upload cap in MB/s; 0 means unlimited
    #[arg(long, env = "ANCHOR_MAX_UPLOAD_MBPS", default_value_t = 0)]
    pub max_upload_mbps: u64,

    #[arg(long, env = "ANCHOR_PAUSE_ON_EXPENSIVE_NETWORK", default_value_t = false)]
    pub pause_on_expensive_network: bool,

    /// Suspend all transfers until this RFC 3339 instant
    #[arg(long, env = "ANCHOR_PAUSED_UNTIL")]
    pub paused_until: Option<String>,

    /// Vault password; presence of a password on an encrypted vault (or at
    /// vault creation) enables client-side encryption
    #[arg(long, env = "ANCHOR_VAULT_PASSWORD", hide_env_values = true)]
    pub vault_password: Option<String>,

    /// Comma-separated folder names to exclude in addition to the builtins
    #[arg(long, env = "ANCHOR_IGNORED_FOLDERS", default_value = "")]
    pub ignored_folders: String,

    /// Comma-separated extensions to exclude in addition to the builtins
    #[arg(long, env = "ANCHOR_IGNORED_EXTENSIONS", default_value = "")]
    pub ignored_extensions: String,

    /// Record the current state of the source as already backed up, then
    /// continue watching (opt-out of historical backfill)
    #[arg(long, env = "ANCHOR_BASELINE", default_value_t = false)]
    pub baseline: bool,

    #[arg(long, env = "ANCHOR_NOTIFICATIONS_ENABLED", default_value_t = true)]
    pub notifications_enabled: bool,

    // --- Vault -----------------------------------------------------------
    #[arg(long, env = "ANCHOR_VAULT_KIND", value_enum, default_value_t = VaultKind::Local)]
    pub vault_kind: VaultKind,

    /// Mount point of a local vault
    #[arg(long, env = "ANCHOR_VAULT_ROOT")]
    pub vault_root: Option<PathBuf>,

    // --- S3 / MinIO ------------------------------------------------------
    #[arg(long, env = "ANCHOR_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, env = "ANCHOR_S3_REGION", default_value = DEFAULT_S3_REGION)]
    pub s3_region: String,

    #[arg(long, env = "ANCHOR_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "ANCHOR_S3_ACCESS_KEY", hide_env_values = true)]
    pub s3_access_key: Option<String>,

    #[arg(long, env = "ANCHOR_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,

    /// Force path style (required for most non-AWS endpoints)
    #[arg(long, env = "ANCHOR_S3_FORCE_PATH_STYLE", default_value_t = false)]
    pub s3_force_path_style: bool,

    // --- Network probe ---------------------------------------------------
    #[arg(long, env = "ANCHOR_PROBE_URL", default_value = DEFAULT_PROBE_URL)]
    pub probe_url: String,

    #[arg(long, env = "ANCHOR_PROBE_BODY", default_value = DEFAULT_PROBE_BODY)]
    pub probe_body: String,

    // --- Photos ----------------------------------------------------------
    #[arg(long, env = "ANCHOR_PHOTOS_POLL_SECS", default_value_t = DEFAULT_PHOTOS_POLL_SECS)]
    pub photos_poll_secs: u64,

    // --- Webhook ---------------------------------------------------------
    #[arg(long, env = "ANCHOR_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    #[arg(long, env = "ANCHOR_WEBHOOK_ON_COMPLETE", default_value_t = true)]
    pub webhook_on_complete: bool,

    #[arg(long, env = "ANCHOR_WEBHOOK_ON_FAILURE", default_value_t = true)]
    pub webhook_on_failure: bool,

    #[arg(long, env = "ANCHOR_WEBHOOK_ON_VAULT_ISSUE", default_value_t = true)]
    pub webhook_on_vault_issue: bool,

    #[arg(long, env = "ANCHOR_WEBHOOK_ON_INTEGRITY", default_value_t = true)]
    pub webhook_on_integrity: bool,

    // --- Management endpoint ---------------------------------------------
    #[arg(long, env = "ANCHOR_METRICS_HOST", default_value = DEFAULT_METRICS_HOST)]
    pub metrics_host: String,

    #[arg(long, env = "ANCHOR_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    #[arg(long, env = "ANCHOR_SHUTDOWN_TIMEOUT_SECS", default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout_secs: u64,

    // --- Telemetry -------------------------------------------------------
    #[arg(long, env = "ANCHOR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "ANCHOR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, env = "ANCHOR_TRACE_SAMPLING_RATIO", default_value_t = DEFAULT_TRACE_SAMPLING_RATIO)]
    pub trace_sampling_ratio: f64,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(ToString::to_string).collect()
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.db")
    }

    #[must_use]
    pub fn photo_token_path(&self) -> PathBuf {
        self.state_dir.join("photo_token")
    }

    /// # Errors
    /// Returns a message when the schedule string is malformed.
    pub fn schedule(&self) -> Result<Schedule, String> {
        Schedule::parse(&self.schedule)
    }

    /// # Errors
    /// Returns a message when the pause instant is malformed.
    pub fn paused_until(&self) -> Result<Option<time::OffsetDateTime>, String> {
        self.paused_until
            .as_deref()
            .map(|raw| {
                time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
                    .map_err(|e| format!("Invalid paused-until instant {raw}: {e}"))
            })
            .transpose()
    }

    #[must_use]
    pub fn ignored_folder_list(&self) -> Vec<String> {
        split_list(&self.ignored_folders)
    }

    #[must_use]
    pub fn ignored_extension_list(&self) -> Vec<String> {
        split_list(&self.ignored_extensions)
    }

    #[must_use]
    pub fn webhook(&self) -> WebhookConfig {
        WebhookConfig {
            url: self.webhook_url.clone(),
            on_complete: self.webhook_on_complete,
            on_failure: self.webhook_on_failure,
            on_vault_issue: self.webhook_on_vault_issue,
            on_integrity: self.webhook_on_integrity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_options_split_on_commas_and_trim() {
        assert_eq!(split_list("target, .cache ,iso"), vec!["target", ".cache", "iso"]);
        assert!(split_list("").is_empty());
        assert!(split_list(" , ,").is_empty());
    }
}
