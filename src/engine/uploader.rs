use std::path::Path;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::StoreError;
use crate::engine::pool::PooledSession;
use crate::engine::transport::{RemoteFs, TransportError};
use crate::models::file_record::UploadStatus;
use crate::service::PipelineContext;

#[derive(Debug, Error)]
pub enum UploadError {
	#[error("transfer failed: {0}")]
	Transfer(#[from] TransportError),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("transfer task failed: {0}")]
	Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Uploaded,
	AlreadyUploaded,
}

/// Execute one upload with a checked-out session. The outcome is
/// committed to the state store before this returns, success or not;
/// the session is released on success and discarded on failure.
pub async fn execute(
	ctx: &PipelineContext,
	session: PooledSession,
	path: &str,
) -> Result<Outcome, UploadError> {
	// 1. Idempotence guard: duplicate enqueues and restarts must not
	//    transfer twice.
	if ctx.db.get_status(path).await? == Some(UploadStatus::Uploaded) {
		debug!(path, "already uploaded, skipping");
		session.release();
		return Ok(Outcome::AlreadyUploaded);
	}

	// 2. Mark in-flight before the wire is touched.
	ctx.db
		.set_status(path, UploadStatus::Uploading, Utc::now().timestamp())
		.await?;

	// 3+4. Remote directories and the byte transfer are blocking ssh2
	//      calls; take the session guard onto the blocking pool and back.
	let local = ctx.config.source_root.join(path);
	let remote = path.to_string();
	let (session, transferred) = tokio::task::spawn_blocking(move || {
		let mut session = session;
		let result = transfer_one(session.remote(), &local, &remote);
		(session, result)
	})
	.await
	.map_err(|e| UploadError::Join(e.to_string()))?;

	// 5. Commit the outcome, then dispose of the session.
	match transferred {
		Ok(()) => {
			ctx.db
				.set_status(path, UploadStatus::Uploaded, Utc::now().timestamp())
				.await?;
			session.release();
			info!(path, "uploaded");
			Ok(Outcome::Uploaded)
		}
		Err(err) => {
			ctx.db
				.set_status(path, UploadStatus::Error, Utc::now().timestamp())
				.await?;
			session.discard();
			Err(err.into())
		}
	}
}

fn transfer_one(
	remote: &mut dyn RemoteFs,
	local: &Path,
	remote_path: &str,
) -> Result<(), TransportError> {
	ensure_remote_dirs(remote, remote_path)?;
	remote.put(local, remote_path)
}

/// Create the destination's parent directories, outermost first.
/// Another task may create the same directory between the probe and the
/// mkdir; that race is benign, so mkdir failures only count when the
/// directory still does not exist.
fn ensure_remote_dirs(remote: &mut dyn RemoteFs, remote_path: &str) -> Result<(), TransportError> {
	for dir in remote_parents(remote_path) {
		if remote.exists(&dir)? {
			continue;
		}
		if let Err(err) = remote.mkdir(&dir) {
			if !remote.exists(&dir)? {
				return Err(err);
			}
		}
	}
	Ok(())
}

/// Parent prefixes of a relative path: "a/b/c.txt" -> ["a", "a/b"].
fn remote_parents(remote_path: &str) -> Vec<String> {
	let mut parents = Vec::new();
	let Some((dirs, _file)) = remote_path.rsplit_once('/') else {
		return parents;
	};
	let mut prefix = String::new();
	for part in dirs.split('/').filter(|p| !p.is_empty()) {
		if prefix.is_empty() {
			prefix.push_str(part);
		} else {
			prefix = format!("{prefix}/{part}");
		}
		parents.push(prefix.clone());
	}
	parents
}
