#![allow(clippy::needless_raw_string_hashes)]
pub mod file_repo;
pub mod records;
pub mod upload_repo;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub type LedgerPool = Pool<Sqlite>;

/// Connection pools for the ledger file: a single-connection writer that
/// serializes all mutations, and a wider pool for concurrent reads.
#[derive(Clone, Debug)]
pub struct LedgerPools {
    pub writer: LedgerPool,
    pub reader: LedgerPool,
}

/// Opens (or re-creates) the ledger database at `path`.
///
/// The file runs in write-ahead journaling mode with `synchronous=NORMAL` so
/// that a successful write is durable before control returns to the transfer
/// pipeline. On open a `PRAGMA quick_check` self-check runs; an unreadable or
/// corrupt file is deleted together with its WAL sidecars and re-created
/// empty. The returned flag reports whether that reset happened, so the
/// caller can surface it and trigger a full reprocess on the next scan.
///
/// # Errors
/// Returns `sqlx::Error` if the database cannot be opened even after a reset.
pub async fn open(path: &Path) -> Result<(LedgerPools, bool), sqlx::Error> {
    match try_open(path).await {
        Ok(pools) => Ok((pools, false)),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Ledger failed self-check, resetting");
            remove_with_sidecars(path);
            let pools = try_open(path).await?;
            Ok((pools, true))
        }
    }
}

async fn try_open(path: &Path) -> Result<LedgerPools, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let writer = SqlitePoolOptions::new().max_connections(1).connect_with(options.clone()).await?;
    let reader = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

    // Self-check before anything trusts this file.
    let verdict: String = sqlx::query_scalar("PRAGMA quick_check").fetch_one(&writer).await?;
    if verdict != "ok" {
        return Err(sqlx::Error::Protocol(format!("quick_check reported: {verdict}")));
    }

    sqlx::migrate!().run(&writer).await.map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

    Ok(LedgerPools { writer, reader })
}

fn remove_with_sidecars(path: &Path) {
    for sidecar in [PathBuf::from(path), sidecar_path(path, "-wal"), sidecar_path(path, "-shm")] {
        if let Err(e) = std::fs::remove_file(&sidecar)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, path = %sidecar.display(), "Failed to remove ledger sidecar");
        }
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
