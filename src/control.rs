use std::time::{Duration, UNIX_EPOCH};

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::db::{DbHandle, StoreError};
use crate::models::file_record::UploadStatus;

#[derive(Debug, Error)]
pub enum RequeueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("bad timestamp {0:?}, expected \"YYYY-MM-DD HH:MM:SS\"")]
    BadTimestamp(String),

    #[error("requeue window is empty: start is after end")]
    EmptyWindow,

    #[error("{0} is not tracked and does not exist under the source root")]
    UnknownFile(String),
}

/// Parse an operator-supplied UTC timestamp.
pub fn parse_timestamp(raw: &str) -> Result<i64, RequeueError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| RequeueError::BadTimestamp(raw.to_string()))
}

/// One-shot: flip every record whose last transition falls inside
/// `[start, end]` back to pending, honoring the quiescence filter. The
/// transition time is kept so the filter does not hide the row from the
/// next service pass. Returns the number of records flipped.
pub async fn requeue_range(
    db: &DbHandle,
    config: &Config,
    start: i64,
    end: i64,
) -> Result<u64, RequeueError> {
    if start > end {
        return Err(RequeueError::EmptyWindow);
    }

    let rows = db.query_by_modified_range(start, end).await?;
    let now = chrono::Utc::now().timestamp();
    let mut requeued = 0u64;

    for rec in rows {
        if rec.age_secs(now) < config.min_file_age_secs {
            info!(path = %rec.path, "skipped re-queue, modified too recently");
            continue;
        }
        db.set_status(&rec.path, UploadStatus::Pending, rec.last_modified)
            .await?;
        info!(path = %rec.path, "re-queued for upload");
        requeued += 1;
    }

    Ok(requeued)
}

/// One-shot: re-queue a single file by its path relative to the source
/// root, optionally after a delay. Untracked files are accepted as long
/// as they exist on disk.
pub async fn requeue_file(
    db: &DbHandle,
    config: &Config,
    path: &str,
    delay_secs: Option<u64>,
) -> Result<(), RequeueError> {
    if let Some(secs) = delay_secs {
        info!(path, delay_secs = secs, "delaying re-queue");
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    match db.get_record(path).await? {
        Some(rec) => {
            db.set_status(path, UploadStatus::Pending, rec.last_modified)
                .await?;
        }
        None => {
            let local = config.source_root.join(path);
            let meta = std::fs::metadata(&local)
                .map_err(|_| RequeueError::UnknownFile(path.to_string()))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            db.upsert_pending(path, mtime).await?;
        }
    }

    info!(path, "re-queued for upload");
    Ok(())
}
