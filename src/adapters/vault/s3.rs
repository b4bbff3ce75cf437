use crate::adapters::vault::{
    CancelCheck, VaultError, VaultFileMetadata, VaultProvider, VaultResult,
};
use crate::domain::identity::{IDENTITY_FILE_NAME, LEGACY_IDENTITY_FILE_NAME, VaultIdentity};
use crate::domain::key::sanitize_key;
use crate::services::ledger_service::LedgerService;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Objects up to this size use a single `PutObject`; anything larger goes
/// through the resumable multipart protocol.
const MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;
/// S3 caps a multipart upload at this many parts.
const MAX_PARTS: u64 = 10_000;
/// Server-side copies above this size must use `UploadPartCopy`.
const SINGLE_COPY_LIMIT: u64 = 5 * 1024 * 1024 * 1024;
/// Part size for multipart server-side copies.
const COPY_PART_SIZE: u64 = 100 * 1024 * 1024;
/// Multipart uploads older than this are orphans and swept on connect.
const ORPHAN_UPLOAD_MAX_AGE_SECS: i64 = 24 * 60 * 60;
/// `DeleteObjects` accepts at most this many keys per call.
const DELETE_BATCH: usize = 1000;

/// Part size and count for a multipart upload of `file_size` bytes.
///
/// The part size grows past 5 MiB only when needed to stay under the
/// 10 000-part cap.
#[must_use]
pub fn plan_parts(file_size: u64) -> (u64, i32) {
    let part_size = MULTIPART_THRESHOLD.max(file_size.div_ceil(MAX_PARTS));
    let total_parts = file_size.div_ceil(part_size).max(1);
    (part_size, i32::try_from(total_parts).unwrap_or(i32::MAX))
}

/// Vault backed by an S3-compatible bucket.
///
/// Holds the resumable multipart protocol; upload ids persist in the ledger
/// so an interrupted transfer continues where it stopped after a restart.
#[derive(Clone, Debug)]
pub struct S3Vault {
    client: Client,
    bucket: String,
    ledger: LedgerService,
}

impl S3Vault {
    /// Constructs the provider and sweeps multipart uploads abandoned more
    /// than 24 hours ago. Sweep failures are logged, not fatal.
    pub async fn connect(client: Client, bucket: String, ledger: LedgerService) -> Self {
        let vault = Self { client, bucket, ledger };
        if let Err(e) = vault.sweep_stale_uploads().await {
            tracing::warn!(error = %e, bucket = %vault.bucket, "Orphan multipart sweep failed");
        }
        vault
    }

    fn map_sdk_error<E, R>(e: &aws_sdk_s3::error::SdkError<E, R>) -> VaultError
    where
        E: std::fmt::Debug,
        R: std::fmt::Debug,
    {
        VaultError::Internal(format!("{e:?}"))
    }

    /// Percent-encodes a logical key for use on the wire.
    fn object_key(key: &str) -> VaultResult<String> {
        sanitize_key(key).map_err(|e| VaultError::Internal(e.to_string()))
    }

    /// Aborts every multipart upload older than the orphan window. An abort
    /// on an upload the server no longer knows about counts as success.
    async fn sweep_stale_uploads(&self) -> VaultResult<()> {
        let cutoff = OffsetDateTime::now_utc().unix_timestamp() - ORPHAN_UPLOAD_MAX_AGE_SECS;
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        let mut swept = 0u64;

        loop {
            let output = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .set_key_marker(key_marker.clone())
                .set_upload_id_marker(upload_id_marker.clone())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;

            for upload in output.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else { continue };
                let initiated = upload.initiated().map_or(0, aws_sdk_s3::primitives::DateTime::secs);
                if initiated >= cutoff {
                    continue;
                }
                self.abort_multipart(key, upload_id).await?;
                swept += 1;
            }

            if output.is_truncated().unwrap_or(false) {
                key_marker = output.next_key_marker().map(ToString::to_string);
                upload_id_marker = output.next_upload_id_marker().map(ToString::to_string);
            } else {
                break;
            }
        }

        if swept > 0 {
            tracing::info!(count = swept, bucket = %self.bucket, "Aborted orphaned multipart uploads");
        }
        Ok(())
    }

    /// Idempotent abort: a missing upload id is treated as already aborted.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> VaultResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(aws_sdk_s3::error::SdkError::ServiceError(err)) if err.err().is_no_such_upload() => Ok(()),
            Err(e) => Err(Self::map_sdk_error(&e)),
        }
    }

    async fn put_small(
        &self,
        local_source: &Path,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> VaultResult<()> {
        let body = ByteStream::from_path(local_source).await.map_err(|e| VaultError::Internal(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .body(body)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e))?;
        Ok(())
    }

    /// Parts already uploaded for `upload_id`, or `None` when the server no
    /// longer knows the id (ghost upload).
    async fn completed_parts(&self, key: &str, upload_id: &str) -> VaultResult<Option<BTreeMap<i32, String>>> {
        let mut parts = BTreeMap::new();
        let mut marker: Option<String> = None;

        loop {
            let output = match self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .send()
                .await
            {
                Ok(o) => o,
                Err(aws_sdk_s3::error::SdkError::ServiceError(err)) if err.err().code() == Some("NoSuchUpload") => {
                    return Ok(None);
                }
                Err(e) => return Err(Self::map_sdk_error(&e)),
            };

            for part in output.parts() {
                if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    parts.insert(number, etag.to_string());
                }
            }

            if output.is_truncated().unwrap_or(false) {
                marker = output.next_part_number_marker().map(ToString::to_string);
            } else {
                break;
            }
        }
        Ok(Some(parts))
    }

    /// `ledger_key` is the logical key the agent tracks; `wire_key` is its
    /// percent-encoded form on the bucket. The ledger row keeps the logical
    /// key so the start-up sweep can map it back to a source path.
    #[tracing::instrument(
        skip(self, metadata, cancel),
        fields(size, resumed_parts = tracing::field::Empty),
        err
    )]
    async fn put_multipart(
        &self,
        local_source: &Path,
        ledger_key: &str,
        wire_key: &str,
        size: u64,
        metadata: &HashMap<String, String>,
        cancel: CancelCheck,
    ) -> VaultResult<()> {
        let result = self.run_multipart(local_source, ledger_key, wire_key, size, metadata, cancel).await;

        if let Err(ref e) = result
            && !matches!(e, VaultError::Cancelled)
        {
            // A vanished source makes the upload unresumable; clean up now
            // rather than waiting for the orphan sweep.
            if tokio::fs::metadata(local_source).await.is_err() {
                if let Some(entry) = self.ledger.find_upload(ledger_key).await {
                    let _ = self.abort_multipart(wire_key, &entry.upload_id).await;
                }
                self.ledger.clear_upload(ledger_key).await;
            }
        }
        result
    }

    async fn run_multipart(
        &self,
        local_source: &Path,
        ledger_key: &str,
        wire_key: &str,
        size: u64,
        metadata: &HashMap<String, String>,
        cancel: CancelCheck,
    ) -> VaultResult<()> {
        let (part_size, total_parts) = plan_parts(size);

        // A ghost upload id (recorded locally, unknown to the server) costs
        // one extra round: drop it and create a fresh upload.
        let (upload_id, mut completed) = 'resolve: {
            for _ in 0..2 {
                let upload_id = match self.ledger.find_upload(ledger_key).await {
                    Some(entry) => entry.upload_id,
                    None => {
                        let output = self
                            .client
                            .create_multipart_upload()
                            .bucket(&self.bucket)
                            .key(wire_key)
                            .set_metadata(Some(metadata.clone()))
                            .send()
                            .await
                            .map_err(|e| Self::map_sdk_error(&e))?;
                        let upload_id = output
                            .upload_id()
                            .ok_or_else(|| VaultError::Internal("CreateMultipartUpload returned no id".into()))?
                            .to_string();

                        // Record before the first part; an unrecordable id is
                        // unresumable, so abort it instead of uploading blind.
                        if let Err(e) = self.ledger.record_upload(ledger_key, &upload_id).await {
                            let _ = self.abort_multipart(wire_key, &upload_id).await;
                            return Err(VaultError::Internal(format!("Failed to record upload id: {e}")));
                        }
                        upload_id
                    }
                };

                match self.completed_parts(wire_key, &upload_id).await? {
                    Some(parts) => break 'resolve (upload_id, parts),
                    None => {
                        tracing::warn!(key = wire_key, "Stale upload id no longer known to the server; restarting");
                        self.ledger.clear_upload(ledger_key).await;
                    }
                }
            }
            return Err(VaultError::Internal(format!("Could not establish a multipart upload for {wire_key}")));
        };

        tracing::Span::current().record("resumed_parts", completed.len());

        let mut file = tokio::fs::File::open(local_source).await?;
        for part_number in 1..=total_parts {
            if cancel() {
                self.abort_multipart(wire_key, &upload_id).await?;
                self.ledger.clear_upload(ledger_key).await;
                return Err(VaultError::Cancelled);
            }
            if completed.contains_key(&part_number) {
                continue;
            }

            let offset = (u64::try_from(part_number).unwrap_or(1) - 1) * part_size;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut buf = Vec::with_capacity(usize::try_from(part_size).unwrap_or(usize::MAX));
            let mut handle = (&mut file).take(part_size);
            handle.read_to_end(&mut buf).await?;
            if buf.is_empty() {
                break;
            }

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(wire_key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;

            let etag = output
                .e_tag()
                .ok_or_else(|| VaultError::Internal("UploadPart returned no ETag".into()))?
                .to_string();
            completed.insert(part_number, etag);
        }

        let parts: Vec<CompletedPart> = completed
            .iter()
            .map(|(number, etag)| CompletedPart::builder().part_number(*number).e_tag(etag).build())
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(wire_key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e))?;

        self.ledger.clear_upload(ledger_key).await;
        Ok(())
    }

    async fn head_size(&self, key: &str) -> VaultResult<u64> {
        let output = self.client.head_object().bucket(&self.bucket).key(key).send().await.map_err(|e| {
            if let aws_sdk_s3::error::SdkError::ServiceError(ref err) = e
                && err.err().is_not_found()
            {
                return VaultError::NotFound;
            }
            Self::map_sdk_error(&e)
        })?;
        Ok(output.content_length().and_then(|l| u64::try_from(l).ok()).unwrap_or(0))
    }

    async fn copy_multipart(&self, from: &str, to: &str, size: u64) -> VaultResult<()> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(to)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| VaultError::Internal("CreateMultipartUpload returned no id".into()))?
            .to_string();

        let result = async {
            let mut parts = Vec::new();
            let mut offset = 0u64;
            let mut part_number = 1i32;

            while offset < size {
                let end = (offset + COPY_PART_SIZE).min(size) - 1;
                let output = self
                    .client
                    .upload_part_copy()
                    .bucket(&self.bucket)
                    .key(to)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .copy_source(format!("{}/{}", self.bucket, from))
                    .copy_source_range(format!("bytes={offset}-{end}"))
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error(&e))?;

                let etag = output
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .ok_or_else(|| VaultError::Internal("UploadPartCopy returned no ETag".into()))?
                    .to_string();
                parts.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());

                offset = end + 1;
                part_number += 1;
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(to)
                .upload_id(&upload_id)
                .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = self.abort_multipart(to, &upload_id).await;
        }
        result
    }

    async fn read_object(&self, key: &str) -> VaultResult<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => {
                let bytes =
                    output.body.collect().await.map_err(|e| VaultError::Internal(e.to_string()))?.into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(aws_sdk_s3::error::SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(Self::map_sdk_error(&e)),
        }
    }
}

#[async_trait]
impl VaultProvider for S3Vault {
    async fn load_identity(&self) -> VaultResult<Option<VaultIdentity>> {
        for name in [IDENTITY_FILE_NAME, LEGACY_IDENTITY_FILE_NAME] {
            if let Some(bytes) = self.read_object(name).await? {
                let identity = serde_json::from_slice(&bytes)
                    .map_err(|e| VaultError::Internal(format!("Unreadable vault identity: {e}")))?;
                return Ok(Some(identity));
            }
        }
        Ok(None)
    }

    async fn save_identity(&self, identity: &VaultIdentity) -> VaultResult<()> {
        let bytes = serde_json::to_vec_pretty(identity)
            .map_err(|e| VaultError::Internal(format!("Failed to encode vault identity: {e}")))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(IDENTITY_FILE_NAME)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, metadata, cancel), err)]
    async fn save_file(
        &self,
        local_source: &Path,
        key: &str,
        metadata: &HashMap<String, String>,
        cancel: CancelCheck,
    ) -> VaultResult<()> {
        let wire_key = Self::object_key(key)?;
        let size = tokio::fs::metadata(local_source).await?.len();

        if size <= MULTIPART_THRESHOLD {
            if cancel() {
                return Err(VaultError::Cancelled);
            }
            self.put_small(local_source, &wire_key, metadata).await
        } else {
            self.put_multipart(local_source, key, &wire_key, size, metadata, cancel).await
        }
    }

    async fn delete_file(&self, key: &str) -> VaultResult<()> {
        let key = Self::object_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e))?;
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> VaultResult<()> {
        let key = Self::object_key(key)?;
        self.abort_multipart(&key, upload_id).await
    }

    /// Server-side rename: single `CopyObject` up to 5 GiB, ranged
    /// `UploadPartCopy` above, then delete of the source key.
    async fn move_item(&self, old_key: &str, new_key: &str) -> VaultResult<()> {
        let from = Self::object_key(old_key)?;
        let to = Self::object_key(new_key)?;

        let size = self.head_size(&from).await?;
        if size <= SINGLE_COPY_LIMIT {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(format!("{}/{}", self.bucket, from))
                .key(&to)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;
        } else {
            self.copy_multipart(&from, &to, size).await?;
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&from)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(&e))?;
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> VaultResult<bool> {
        let key = Self::object_key(key)?;
        match self.head_size(&key).await {
            Ok(_) => Ok(true),
            Err(VaultError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_metadata(&self, key: &str) -> VaultResult<HashMap<String, String>> {
        let key = Self::object_key(key)?;
        let output = self.client.head_object().bucket(&self.bucket).key(&key).send().await.map_err(|e| {
            if let aws_sdk_s3::error::SdkError::ServiceError(ref err) = e
                && err.err().is_not_found()
            {
                return VaultError::NotFound;
            }
            Self::map_sdk_error(&e)
        })?;

        Ok(output.metadata().cloned().unwrap_or_default())
    }

    async fn list_files(&self, prefix: &str) -> VaultResult<Vec<VaultFileMetadata>> {
        let prefix = if prefix.is_empty() { String::new() } else { format!("{}/", Self::object_key(prefix)?) };
        let mut entries = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(token.clone())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;

            for folder in output.common_prefixes() {
                if let Some(path) = folder.prefix() {
                    let path = path.trim_end_matches('/').to_string();
                    let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                    entries.push(VaultFileMetadata { name, path, is_folder: true, size: 0, modified: None });
                }
            }

            for object in output.contents() {
                let Some(path) = object.key() else { continue };
                let name = path.rsplit('/').next().unwrap_or(path).to_string();
                entries.push(VaultFileMetadata {
                    name,
                    path: path.to_string(),
                    is_folder: false,
                    size: object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    modified: object
                        .last_modified()
                        .and_then(|d| OffsetDateTime::from_unix_timestamp(d.secs()).ok()),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                token = output.next_continuation_token().map(ToString::to_string);
            } else {
                break;
            }
        }
        Ok(entries)
    }

    async fn list_all_files(&self) -> VaultResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(token.clone())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;

            keys.extend(output.contents().iter().filter_map(|o| o.key().map(ToString::to_string)));

            if output.is_truncated().unwrap_or(false) {
                token = output.next_continuation_token().map(ToString::to_string);
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn wipe(&self, prefix: &str) -> VaultResult<()> {
        let prefix = if prefix.is_empty() { String::new() } else { format!("{}/", Self::object_key(prefix)?) };
        let mut token: Option<String> = None;
        let mut doomed: Vec<String> = Vec::new();

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(token.clone())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;

            doomed.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .filter(|k| *k != IDENTITY_FILE_NAME && *k != LEGACY_IDENTITY_FILE_NAME)
                    .map(ToString::to_string),
            );

            if output.is_truncated().unwrap_or(false) {
                token = output.next_continuation_token().map(ToString::to_string);
            } else {
                break;
            }
        }

        for batch in doomed.chunks(DELETE_BATCH) {
            let objects: Vec<ObjectIdentifier> = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<_, _>>()
                .map_err(|e| VaultError::Internal(e.to_string()))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(
                    Delete::builder()
                        .set_objects(Some(objects))
                        .build()
                        .map_err(|e| VaultError::Internal(e.to_string()))?,
                )
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(&e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn small_files_use_minimum_part_size() {
        let (part_size, total) = plan_parts(20 * MIB);
        assert_eq!(part_size, 5 * MIB);
        assert_eq!(total, 4);
    }

    #[test]
    fn uneven_sizes_round_the_last_part_up() {
        let (part_size, total) = plan_parts(12 * MIB + 1);
        assert_eq!(part_size, 5 * MIB);
        assert_eq!(total, 3);
    }

    #[test]
    fn part_size_grows_to_respect_the_part_cap() {
        let size = 100 * 1024 * MIB; // 100 GiB
        let (part_size, total) = plan_parts(size);
        assert!(part_size > 5 * MIB);
        assert!(u64::try_from(total).unwrap() <= MAX_PARTS);
        assert!(part_size * u64::try_from(total).unwrap() >= size);
    }

    #[test]
    fn zero_byte_plan_still_has_one_part() {
        let (part_size, total) = plan_parts(0);
        assert_eq!(part_size, 5 * MIB);
        assert_eq!(total, 1);
    }
}
