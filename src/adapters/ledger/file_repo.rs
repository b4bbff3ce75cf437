use crate::adapters::ledger::records::FileRecord;
use crate::domain::entry::{FileEntry, VerifyState};
use crate::error::Result;
use sqlx::SqliteConnection;

#[derive(Clone, Debug, Default)]
pub struct FileRepository {}

impl FileRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Finds a tracked file by exact (case-sensitive) path.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn find(&self, conn: &mut SqliteConnection, path: &str) -> Result<Option<FileEntry>> {
        let record = sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(conn)
            .await?;

        Ok(record.map(Into::into))
    }

    /// Returns the stored casing for a path, matching case-insensitively.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn stored_casing(&self, conn: &mut SqliteConnection, path: &str) -> Result<Option<String>> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT path FROM files WHERE path = ?1 COLLATE NOCASE LIMIT 1")
                .bind(path)
                .fetch_optional(conn)
                .await?;

        Ok(stored)
    }

    /// Insert-or-replace after a durable vault write. Resets the failure
    /// count and re-queues the entry for verification.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn, content_hash), err)]
    pub(crate) async fn upsert_processed(
        &self,
        conn: &mut SqliteConnection,
        path: &str,
        gen_id: &str,
        content_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, gen_id, content_hash, failure_count, verify_state, verify_at)
            VALUES (?1, ?2, ?3, 0, 'pending', NULL)
            ON CONFLICT (path) DO UPDATE SET
                gen_id = excluded.gen_id,
                content_hash = excluded.content_hash,
                failure_count = 0,
                verify_state = 'pending',
                verify_at = NULL
            "#,
        )
        .bind(path)
        .bind(gen_id)
        .bind(content_hash)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Records a baseline entry without an upload (opt-out of backfill).
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn upsert_baseline(&self, conn: &mut SqliteConnection, path: &str, gen_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, gen_id, content_hash, failure_count, verify_state, verify_at)
            VALUES (?1, ?2, '', 0, 'verified', NULL)
            ON CONFLICT (path) DO UPDATE SET
                gen_id = excluded.gen_id,
                failure_count = 0
            "#,
        )
        .bind(path)
        .bind(gen_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Increments the consecutive-failure counter, creating the row if the
    /// path has never succeeded. Returns the new count.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn increment_failure(&self, conn: &mut SqliteConnection, path: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO files (path, gen_id, content_hash, failure_count)
            VALUES (?1, '', '', 1)
            ON CONFLICT (path) DO UPDATE SET failure_count = failure_count + 1
            RETURNING failure_count
            "#,
        )
        .bind(path)
        .fetch_one(conn)
        .await?;
        Ok(count)
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn failure_count(&self, conn: &mut SqliteConnection, path: &str) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar("SELECT failure_count FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(conn)
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Zeroes every failure counter (operator reset).
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn reset_all_failures(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let result = sqlx::query("UPDATE files SET failure_count = 0 WHERE failure_count > 0").execute(conn).await?;
        Ok(result.rows_affected())
    }

    /// Renames the exact row and every row under `old + "/"`. The caller is
    /// responsible for running this inside a transaction so no reader sees a
    /// partial rename.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if either update fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn rename(&self, conn: &mut SqliteConnection, old: &str, new: &str) -> Result<()> {
        sqlx::query("UPDATE OR REPLACE files SET path = ?2 WHERE path = ?1")
            .bind(old)
            .bind(new)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            UPDATE OR REPLACE files
            SET path = ?2 || substr(path, length(?1) + 1)
            WHERE substr(path, 1, length(?1) + 1) = ?1 || '/'
            "#,
        )
        .bind(old)
        .bind(new)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn remove(&self, conn: &mut SqliteConnection, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE path = ?1").bind(path).execute(conn).await?;
        Ok(())
    }

    /// Removes every row whose path starts with `prefix`.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn delete_prefix(&self, conn: &mut SqliteConnection, prefix: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM files WHERE substr(path, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn wipe(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("DELETE FROM files").execute(conn).await?;
        Ok(())
    }

    /// All tracked paths, for mirror-mode reconciliation.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn all_paths(&self, conn: &mut SqliteConnection) -> Result<Vec<String>> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM files ORDER BY path").fetch_all(conn).await?;
        Ok(paths)
    }

    /// Up to `limit` entries awaiting verification, least recently verified
    /// first (never-verified entries sort before everything else).
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn due_for_audit(&self, conn: &mut SqliteConnection, limit: i64) -> Result<Vec<FileEntry>> {
        let records = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT * FROM files
            WHERE verify_state = 'pending' AND content_hash != ''
            ORDER BY verify_at IS NOT NULL, verify_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn update_verification(
        &self,
        conn: &mut SqliteConnection,
        path: &str,
        state: VerifyState,
        at: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE files SET verify_state = ?2, verify_at = ?3 WHERE path = ?1")
            .bind(path)
            .bind(state.to_string())
            .bind(at)
            .execute(conn)
            .await?;
        Ok(())
    }
}
