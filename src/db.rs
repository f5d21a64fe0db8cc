use std::path::Path;

use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;
use thiserror::Error;

use crate::models::file_record::{FileRecord, UploadStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open state store: {0}")]
    Open(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
    db: Surreal<Db>,
}

impl DbHandle {
    /// Open (or create) the on-disk store and run migrations.
    /// Failure here is fatal to startup.
    pub async fn open(path: &Path) -> Result<DbHandle, StoreError> {
        let db = Surreal::new::<SurrealKv>(path.to_path_buf())
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Self::bootstrap(db).await
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<DbHandle, StoreError> {
        let db = Surreal::new::<Mem>(())
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Self::bootstrap(db).await
    }

    async fn bootstrap(db: Surreal<Db>) -> Result<DbHandle, StoreError> {
        db.use_ns("uplink")
            .use_db("uplink")
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;

        // DEFINE statements are idempotent.
        db.query(SCHEMA_V1)
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?
            .check()
            .map_err(|e| StoreError::Open(e.to_string()))?;

        Ok(DbHandle { db })
    }

    /// Insert-if-absent: a rediscovered file keeps whatever status it already
    /// has, so a terminal `uploaded` is never reset by a re-scan.
    pub async fn upsert_pending(&self, path: &str, mtime: i64) -> Result<(), StoreError> {
        // last_modified is guarded first: once status is assigned the
        // new-record test would no longer hold.
        self.db
            .query(
                "UPSERT type::record('file', $path) SET
                    last_modified = IF status = NONE THEN $mtime ELSE last_modified END,
                    status = IF status = NONE THEN 'pending' ELSE status END,
                    path = $path",
            )
            .bind(("path", path.to_string()))
            .bind(("mtime", mtime))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_record(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let mut response = self
            .db
            .query("SELECT path, status, last_modified FROM type::record('file', $path)")
            .bind(("path", path.to_string()))
            .await
            .map_err(db_err)?;

        let row: Option<serde_json::Value> = response.take(0).map_err(db_err)?;
        row.map(|r| parse_row(&r)).transpose()
    }

    pub async fn get_status(&self, path: &str) -> Result<Option<UploadStatus>, StoreError> {
        Ok(self.get_record(path).await?.map(|r| r.status))
    }

    /// Write the new status and transition time in one statement. Persisted
    /// before this returns; a no-op for untracked paths.
    pub async fn set_status(
        &self,
        path: &str,
        status: UploadStatus,
        time: i64,
    ) -> Result<(), StoreError> {
        self.db
            .query("UPDATE type::record('file', $path) SET status = $status, last_modified = $time")
            .bind(("path", path.to_string()))
            .bind(("status", status.as_str().to_string()))
            .bind(("time", time))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn query_by_status(
        &self,
        statuses: &[UploadStatus],
    ) -> Result<Vec<FileRecord>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let mut response = self
            .db
            .query("SELECT path, status, last_modified FROM file WHERE status IN $statuses")
            .bind(("statuses", statuses))
            .await
            .map_err(db_err)?;

        let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        rows.iter().map(parse_row).collect()
    }

    /// Records whose last transition falls in `[start, end]`, both inclusive.
    pub async fn query_by_modified_range(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let mut response = self
            .db
            .query(
                "SELECT path, status, last_modified FROM file
                 WHERE last_modified >= $start AND last_modified <= $end",
            )
            .bind(("start", start))
            .bind(("end", end))
            .await
            .map_err(db_err)?;

        let rows: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        rows.iter().map(parse_row).collect()
    }

    /// Purge rows with `last_modified < cutoff`, regardless of status.
    /// Returns the number of rows removed.
    pub async fn delete_older_than(&self, cutoff: i64) -> Result<usize, StoreError> {
        let mut response = self
            .db
            .query("DELETE file WHERE last_modified < $cutoff RETURN BEFORE")
            .bind(("cutoff", cutoff))
            .await
            .map_err(db_err)?;

        let removed: Vec<serde_json::Value> = response.take(0).map_err(db_err)?;
        Ok(removed.len())
    }
}

fn db_err(e: surrealdb::Error) -> StoreError {
    StoreError::Db(e.to_string())
}

fn parse_row(row: &serde_json::Value) -> Result<FileRecord, StoreError> {
    let path = row["path"]
        .as_str()
        .ok_or_else(|| StoreError::Malformed(format!("missing path: {row}")))?
        .to_string();
    let status = row["status"]
        .as_str()
        .and_then(UploadStatus::parse)
        .ok_or_else(|| StoreError::Malformed(format!("bad status: {row}")))?;
    let last_modified = row["last_modified"]
        .as_i64()
        .ok_or_else(|| StoreError::Malformed(format!("bad last_modified: {row}")))?;

    Ok(FileRecord { path, status, last_modified })
}

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE file SCHEMAFULL;
    DEFINE FIELD OVERWRITE path ON file TYPE string;
    DEFINE FIELD OVERWRITE status ON file TYPE string;
    DEFINE FIELD OVERWRITE last_modified ON file TYPE int;
    DEFINE INDEX OVERWRITE idx_file_status ON file FIELDS status;
    DEFINE INDEX OVERWRITE idx_file_modified ON file FIELDS last_modified;
";
