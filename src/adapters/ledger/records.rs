use crate::domain::entry::{FileEntry, UploadEntry, VerifyState};
use sqlx::FromRow;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, FromRow)]
pub struct FileRecord {
    pub path: String,
    pub gen_id: String,
    pub content_hash: String,
    pub failure_count: i64,
    pub verify_state: String,
    pub verify_at: Option<i64>,
}

impl From<FileRecord> for FileEntry {
    fn from(record: FileRecord) -> Self {
        Self {
            path: record.path,
            gen_id: record.gen_id,
            content_hash: record.content_hash,
            failure_count: record.failure_count,
            verify_state: VerifyState::from_str(&record.verify_state).unwrap_or(VerifyState::Pending),
            verify_at: record.verify_at.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        }
    }
}

#[derive(Debug, FromRow)]
pub struct UploadRecord {
    pub object_key: String,
    pub upload_id: String,
    pub started_at: i64,
}

impl From<UploadRecord> for UploadEntry {
    fn from(record: UploadRecord) -> Self {
        Self {
            object_key: record.object_key,
            upload_id: record.upload_id,
            started_at: OffsetDateTime::from_unix_timestamp(record.started_at)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        }
    }
}
