use crate::adapters::ledger::file_repo::FileRepository;
use crate::adapters::ledger::upload_repo::UploadRepository;
use crate::adapters::ledger::{self, LedgerPools};
use crate::domain::entry::{FileEntry, UploadEntry, VerifyState};
use crate::error::Result;
use std::path::Path;
use time::OffsetDateTime;

/// Durable record of what has been backed up and what is in flight.
///
/// Single source of truth for "processed": a file is only marked processed
/// after the vault write has durably completed. All writes go through a
/// single-connection pool; reads run concurrently on a separate pool.
///
/// Mutating operations never surface a typed error to callers: a failed
/// write is logged and reported as "not done", which the watcher treats as
/// "not yet processed" and retries on a later tick.
#[derive(Clone, Debug)]
pub struct LedgerService {
    pools: LedgerPools,
    files: FileRepository,
    uploads: UploadRepository,
}

impl LedgerService {
    /// Opens the ledger at `path`, resetting it if the self-check fails.
    /// The second return value reports whether a reset happened.
    ///
    /// # Errors
    /// Returns an error only if the database cannot be opened at all.
    pub async fn open(path: &Path) -> Result<(Self, bool)> {
        let (pools, was_reset) = ledger::open(path).await?;
        Ok((Self { pools, files: FileRepository::new(), uploads: UploadRepository::new() }, was_reset))
    }

    /// True iff the path is untracked or its generation identifier changed.
    pub async fn should_process(&self, path: &str, current_gen_id: &str) -> bool {
        let lookup = async {
            let mut conn = self.pools.reader.acquire().await?;
            self.files.find(&mut conn, path).await
        };

        match lookup.await {
            Ok(Some(entry)) => entry.gen_id != current_gen_id,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, path, "Ledger read failed; treating as unprocessed");
                true
            }
        }
    }

    /// Marks a durably vaulted file as processed. Returns false (after
    /// logging) if the write could not be recorded.
    pub async fn mark_processed(&self, path: &str, gen_id: &str, content_hash: &str) -> bool {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.upsert_processed(&mut conn, path, gen_id, content_hash).await
        };

        write.await.map_or_else(
            |e| {
                tracing::error!(error = %e, path, "Failed to record processed file");
                false
            },
            |()| true,
        )
    }

    /// Records a baseline entry without uploading (opt-out of backfill).
    pub async fn mark_baseline(&self, path: &str, gen_id: &str) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.upsert_baseline(&mut conn, path, gen_id).await
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, path, "Failed to record baseline entry");
        }
    }

    /// Bumps the consecutive-failure counter, returning the new count
    /// (0 if the write failed).
    pub async fn increment_failure(&self, path: &str) -> i64 {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.increment_failure(&mut conn, path).await
        };

        write.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, path, "Failed to increment failure count");
            0
        })
    }

    pub async fn failure_count(&self, path: &str) -> i64 {
        let lookup = async {
            let mut conn = self.pools.reader.acquire().await?;
            self.files.failure_count(&mut conn, path).await
        };

        lookup.await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, path, "Failed to read failure count");
            0
        })
    }

    /// Operator reset: zeroes every failure counter so quarantined paths
    /// become eligible again.
    pub async fn reset_all_failures(&self) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.reset_all_failures(&mut conn).await
        };

        match write.await {
            Ok(count) if count > 0 => tracing::info!(count, "Reset failure counters"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Failed to reset failure counters"),
        }
    }

    /// Renames the exact entry and every entry under `old + "/"` in one
    /// transaction, so no reader observes a partial rename.
    pub async fn rename(&self, old: &str, new: &str) {
        let write = async {
            let mut tx = self.pools.writer.begin().await?;
            self.files.rename(&mut tx, old, new).await?;
            tx.commit().await?;
            Ok::<_, crate::error::AgentError>(())
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, old, new, "Failed to rename ledger entries");
        }
    }

    pub async fn remove(&self, path: &str) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.remove(&mut conn, path).await
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, path, "Failed to remove ledger entry");
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.delete_prefix(&mut conn, prefix).await
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, prefix, "Failed to delete ledger prefix");
        }
    }

    pub async fn wipe(&self) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.wipe(&mut conn).await
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, "Failed to wipe ledger");
        }
    }

    /// Every tracked path, for mirror-mode reconciliation.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    pub async fn all_tracked_paths(&self) -> Result<Vec<String>> {
        let mut conn = self.pools.reader.acquire().await?;
        self.files.all_paths(&mut conn).await
    }

    /// The casing the ledger stored for a path, matched case-insensitively.
    /// `None` when the path has never been tracked under any casing.
    pub async fn stored_casing(&self, path: &str) -> Option<String> {
        let lookup = async {
            let mut conn = self.pools.reader.acquire().await?;
            self.files.stored_casing(&mut conn, path).await
        };

        lookup.await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, path, "Failed to read stored casing");
            None
        })
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    pub async fn entry(&self, path: &str) -> Result<Option<FileEntry>> {
        let mut conn = self.pools.reader.acquire().await?;
        self.files.find(&mut conn, path).await
    }

    // --- In-flight multipart uploads -------------------------------------

    /// Records a multipart upload id before any part is issued. Unlike the
    /// file mutators this propagates failure: the multipart protocol must
    /// not start uploading parts it cannot resume.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the write fails.
    pub async fn record_upload(&self, object_key: &str, upload_id: &str) -> Result<()> {
        let mut conn = self.pools.writer.acquire().await?;
        self.uploads.insert(&mut conn, object_key, upload_id, OffsetDateTime::now_utc().unix_timestamp()).await
    }

    pub async fn find_upload(&self, object_key: &str) -> Option<UploadEntry> {
        let lookup = async {
            let mut conn = self.pools.reader.acquire().await?;
            self.uploads.find(&mut conn, object_key).await
        };

        lookup.await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, object_key, "Failed to read upload entry");
            None
        })
    }

    pub async fn clear_upload(&self, object_key: &str) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.uploads.remove(&mut conn, object_key).await
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, object_key, "Failed to clear upload entry");
        }
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    pub async fn active_uploads(&self) -> Result<Vec<UploadEntry>> {
        let mut conn = self.pools.reader.acquire().await?;
        self.uploads.all(&mut conn).await
    }

    // --- Verification ----------------------------------------------------

    /// Up to `limit` entries pending verification, oldest attempt first.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    pub async fn files_for_auditing(&self, limit: i64) -> Result<Vec<FileEntry>> {
        let mut conn = self.pools.reader.acquire().await?;
        self.files.due_for_audit(&mut conn, limit).await
    }

    pub async fn update_verification(&self, path: &str, state: VerifyState, at: OffsetDateTime) {
        let write = async {
            let mut conn = self.pools.writer.acquire().await?;
            self.files.update_verification(&mut conn, path, state, at.unix_timestamp()).await
        };

        if let Err(e) = write.await {
            tracing::error!(error = %e, path, "Failed to update verification state");
        }
    }
}
