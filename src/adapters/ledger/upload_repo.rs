use crate::adapters::ledger::records::UploadRecord;
use crate::domain::entry::UploadEntry;
use crate::error::Result;
use sqlx::SqliteConnection;

#[derive(Clone, Debug, Default)]
pub struct UploadRepository {}

impl UploadRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Records a freshly created multipart upload. Replaces any previous row
    /// for the key so there is exactly one in-flight entry per object.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn insert(
        &self,
        conn: &mut SqliteConnection,
        object_key: &str,
        upload_id: &str,
        started_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO uploads (object_key, upload_id, started_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (object_key) DO UPDATE SET
                upload_id = excluded.upload_id,
                started_at = excluded.started_at
            "#,
        )
        .bind(object_key)
        .bind(upload_id)
        .bind(started_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn find(&self, conn: &mut SqliteConnection, object_key: &str) -> Result<Option<UploadEntry>> {
        let record = sqlx::query_as::<_, UploadRecord>("SELECT * FROM uploads WHERE object_key = ?1")
            .bind(object_key)
            .fetch_optional(conn)
            .await?;

        Ok(record.map(Into::into))
    }

    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn remove(&self, conn: &mut SqliteConnection, object_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM uploads WHERE object_key = ?1").bind(object_key).execute(conn).await?;
        Ok(())
    }

    /// Every in-flight upload, for the start-up orphan sweep.
    ///
    /// # Errors
    /// Returns `sqlx::Error` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), err)]
    pub(crate) async fn all(&self, conn: &mut SqliteConnection) -> Result<Vec<UploadEntry>> {
        let records = sqlx::query_as::<_, UploadRecord>("SELECT * FROM uploads ORDER BY started_at")
            .fetch_all(conn)
            .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }
}
