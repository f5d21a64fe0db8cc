use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::db::StoreError;
use crate::engine::worker::WorkQueue;
use crate::models::file_record::UploadStatus;
use crate::service::PipelineContext;

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("source root does not exist: {0}")]
	SourceMissing(String),

	#[error("source root is not a directory: {0}")]
	SourceNotDir(String),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("scan task failed: {0}")]
	Join(String),
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
	pub files_seen: u64,
	pub recorded: u64,
	pub skipped_young: u64,
	pub skipped_entries: u64,
}

#[derive(Debug)]
struct FileEntry {
	relative_path: String,
	/// Unix epoch seconds of the file's last write.
	modified: i64,
}

/// Startup scan: record every quiescent file as pending. Files younger
/// than the minimum age are presumed still being written and get no row
/// yet; re-discovery of tracked files is a no-op upsert.
pub async fn initial_scan(ctx: &PipelineContext) -> Result<ScanOutcome, ScanError> {
	let root = ctx.config.source_root.clone();

	// Walking the tree is blocking I/O — offload to the thread pool.
	let (entries, skipped_entries) = tokio::task::spawn_blocking(move || walk_source(&root))
		.await
		.map_err(|e| ScanError::Join(e.to_string()))??;

	let now = Utc::now().timestamp();
	let mut recorded = 0u64;
	let mut skipped_young = 0u64;

	for entry in &entries {
		if now - entry.modified < ctx.config.min_file_age_secs {
			debug!(path = %entry.relative_path, "too young, skipping this pass");
			skipped_young += 1;
			continue;
		}
		ctx.db
			.upsert_pending(&entry.relative_path, entry.modified)
			.await?;
		recorded += 1;
	}

	Ok(ScanOutcome {
		files_seen: entries.len() as u64,
		recorded,
		skipped_young,
		skipped_entries,
	})
}

/// Enqueue every pending or errored record that has gone quiet. Runs at
/// startup after the scan and again on the daily batch, which gives
/// abandoned failures another pass.
pub async fn queue_pending(ctx: &PipelineContext, queue: &WorkQueue) -> Result<u64, ScanError> {
	let rows = ctx
		.db
		.query_by_status(&[UploadStatus::Pending, UploadStatus::Error])
		.await?;

	let now = Utc::now().timestamp();
	let mut queued = 0u64;
	for rec in rows {
		if rec.age_secs(now) < ctx.config.min_file_age_secs {
			debug!(path = %rec.path, "modified recently, not queued");
			continue;
		}
		debug!(path = %rec.path, "queued for upload");
		queue.push(rec.path);
		queued += 1;
	}

	Ok(queued)
}

fn walk_source(root: &Path) -> Result<(Vec<FileEntry>, u64), ScanError> {
	if !root.exists() {
		return Err(ScanError::SourceMissing(root.display().to_string()));
	}
	if !root.is_dir() {
		return Err(ScanError::SourceNotDir(root.display().to_string()));
	}

	let mut entries = Vec::new();
	let mut skipped = 0u64;

	for result in WalkDir::new(root).follow_links(false) {
		let entry = match result {
			Ok(e) => e,
			Err(_) => {
				skipped += 1;
				continue;
			}
		};

		if entry.file_type().is_dir() || entry.file_type().is_symlink() {
			if entry.file_type().is_symlink() {
				skipped += 1;
			}
			continue;
		}

		let metadata = match entry.metadata() {
			Ok(m) => m,
			Err(_) => {
				skipped += 1;
				continue;
			}
		};

		let relative_path = entry
			.path()
			.strip_prefix(root)
			.expect("walkdir entry must be under root")
			.to_string_lossy()
			.to_string();

		let modified = metadata
			.modified()
			.ok()
			.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0);

		entries.push(FileEntry { relative_path, modified });
	}

	Ok((entries, skipped))
}
