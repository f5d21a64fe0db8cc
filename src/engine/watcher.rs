use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, UNIX_EPOCH};

use chrono::Utc;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::worker::WorkQueue;
use crate::models::file_record::UploadStatus;
use crate::service::PipelineContext;

const RECV_TIMEOUT: Duration = Duration::from_millis(500);
/// How often deferred (too-young) files are re-examined.
const DEFER_TICK: Duration = Duration::from_secs(30);

/// Live discovery: a notify watcher on a blocking thread feeds an async
/// dispatcher that applies the quiescence filter, records the file, and
/// enqueues it. Runs until the token is cancelled.
pub async fn run_watcher(ctx: PipelineContext, queue: WorkQueue, token: CancellationToken) {
	let (tx, rx) = mpsc::unbounded_channel();
	let root = ctx.config.source_root.clone();
	let watch_token = token.clone();

	let watch = tokio::task::spawn_blocking(move || watch_source_blocking(&root, tx, watch_token));
	dispatch_events(&ctx, &queue, rx, &token).await;
	let _ = watch.await;
}

/// Watch loop on the blocking pool. The notify callback hands events to
/// a std channel; the timeout on recv keeps the cancellation flag
/// checked twice a second.
fn watch_source_blocking(root: &Path, tx: mpsc::UnboundedSender<PathBuf>, token: CancellationToken) {
	let (tx_notify, rx_notify) = std_mpsc::channel();

	let mut watcher: RecommendedWatcher = match notify::recommended_watcher(move |res| {
		let _ = tx_notify.send(res);
	}) {
		Ok(w) => w,
		Err(e) => {
			error!("failed to create filesystem watcher for {}: {e}", root.display());
			return;
		}
	};

	if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
		error!("failed to watch {}: {e}", root.display());
		return;
	}
	info!("watching {}", root.display());

	loop {
		if token.is_cancelled() {
			break;
		}

		let event = match rx_notify.recv_timeout(RECV_TIMEOUT) {
			Ok(Ok(event)) => event,
			Ok(Err(e)) => {
				error!("watch error on {}: {e}", root.display());
				continue;
			}
			Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
			Err(std_mpsc::RecvTimeoutError::Disconnected) => {
				warn!("watcher channel closed for {}", root.display());
				break;
			}
		};

		if !is_write_event(&event.kind) {
			continue;
		}
		for path in event.paths {
			if path.is_file() {
				let _ = tx.send(path);
			}
		}
	}
}

/// Creation, data writes, and rename targets change file content.
/// Reads, metadata touches, removals, and rename sources do not.
fn is_write_event(kind: &EventKind) -> bool {
	match kind {
		EventKind::Create(_) => true,
		EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => true,
		EventKind::Modify(ModifyKind::Name(mode)) => {
			matches!(mode, RenameMode::To | RenameMode::Both)
		}
		_ => false,
	}
}

async fn dispatch_events(
	ctx: &PipelineContext,
	queue: &WorkQueue,
	mut rx: mpsc::UnboundedReceiver<PathBuf>,
	token: &CancellationToken,
) {
	// path -> epoch at which its age crosses the threshold
	let mut deferred: HashMap<PathBuf, i64> = HashMap::new();
	let mut ticker = tokio::time::interval(DEFER_TICK);

	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			maybe = rx.recv() => {
				let Some(path) = maybe else { break };
				consider(ctx, queue, &mut deferred, path).await;
			}
			_ = ticker.tick() => {
				let now = Utc::now().timestamp();
				let due: Vec<PathBuf> = deferred
					.iter()
					.filter(|(_, ready)| **ready <= now)
					.map(|(p, _)| p.clone())
					.collect();
				for path in due {
					deferred.remove(&path);
					consider(ctx, queue, &mut deferred, path).await;
				}
			}
		}
	}
}

/// Decide what to do with one touched file: defer it while young,
/// ignore it when it is already uploaded and unchanged (notify delivers
/// at-least-once), otherwise record it as pending and enqueue it.
/// Store errors are contained to the event.
async fn consider(
	ctx: &PipelineContext,
	queue: &WorkQueue,
	deferred: &mut HashMap<PathBuf, i64>,
	path: PathBuf,
) {
	let Ok(meta) = std::fs::metadata(&path) else {
		// gone before we got to it
		deferred.remove(&path);
		return;
	};
	let mtime = meta
		.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0);

	let now = Utc::now().timestamp();
	if now - mtime < ctx.config.min_file_age_secs {
		deferred.insert(path, mtime + ctx.config.min_file_age_secs);
		return;
	}

	let rel = match path.strip_prefix(&ctx.config.source_root) {
		Ok(rel) => rel.to_string_lossy().to_string(),
		Err(_) => {
			warn!(path = %path.display(), "event outside source root, ignoring");
			return;
		}
	};

	let record = match ctx.db.get_record(&rel).await {
		Ok(record) => record,
		Err(err) => {
			warn!(path = %rel, %err, "state store unavailable for watch event");
			return;
		}
	};

	if let Some(rec) = &record {
		if rec.status == UploadStatus::Uploaded && rec.last_modified >= mtime {
			debug!(path = %rel, "already uploaded and unchanged, ignoring");
			return;
		}
	}

	let result = if record.is_some() {
		// fresh content: the old outcome no longer applies
		ctx.db.set_status(&rel, UploadStatus::Pending, mtime).await
	} else {
		ctx.db.upsert_pending(&rel, mtime).await
	};
	if let Err(err) = result {
		warn!(path = %rel, %err, "failed to record watch event");
		return;
	}

	debug!(path = %rel, "queued from watch event");
	queue.push(rel);
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

	use super::*;
	use crate::config::Config;
	use crate::db::DbHandle;
	use crate::engine::pool::SessionPool;
	use crate::engine::transport::testing::{MockConnect, RemoteState};
	use crate::engine::worker::WorkItem;

	async fn test_ctx(config: Config) -> PipelineContext {
		let db = DbHandle::open_in_memory().await.unwrap();
		let pool = SessionPool::new(Arc::new(MockConnect::new(RemoteState::new())), 1);
		PipelineContext {
			db,
			pool,
			config: Arc::new(config),
		}
	}

	#[test]
	fn write_events_are_recognized() {
		assert!(is_write_event(&EventKind::Create(CreateKind::File)));
		assert!(is_write_event(&EventKind::Modify(ModifyKind::Data(DataChange::Any))));
		assert!(is_write_event(&EventKind::Modify(ModifyKind::Any)));
		assert!(is_write_event(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
	}

	#[test]
	fn non_write_events_are_ignored() {
		assert!(!is_write_event(&EventKind::Remove(RemoveKind::File)));
		assert!(!is_write_event(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))));
		assert!(!is_write_event(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
		assert!(!is_write_event(&EventKind::Access(notify::event::AccessKind::Any)));
	}

	#[tokio::test]
	async fn quiescent_file_is_recorded_and_queued() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("new.txt");
		std::fs::write(&path, "data").unwrap();

		let ctx = test_ctx(Config {
			source_root: tmp.path().to_path_buf(),
			min_file_age_secs: 0,
			..Config::default()
		})
		.await;
		let queue = WorkQueue::new();
		let mut deferred = HashMap::new();

		consider(&ctx, &queue, &mut deferred, path).await;

		assert!(deferred.is_empty());
		assert_eq!(
			ctx.db.get_status("new.txt").await.unwrap(),
			Some(UploadStatus::Pending)
		);
		assert!(matches!(queue.try_next(), Some(WorkItem::File(p)) if p == "new.txt"));
	}

	#[tokio::test]
	async fn young_file_is_deferred_without_a_row() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("fresh.txt");
		std::fs::write(&path, "data").unwrap();

		let ctx = test_ctx(Config {
			source_root: tmp.path().to_path_buf(),
			min_file_age_secs: 300,
			..Config::default()
		})
		.await;
		let queue = WorkQueue::new();
		let mut deferred = HashMap::new();

		consider(&ctx, &queue, &mut deferred, path.clone()).await;

		assert!(deferred.contains_key(&path));
		assert!(ctx.db.get_record("fresh.txt").await.unwrap().is_none());
		assert!(queue.try_next().is_none());
	}

	#[tokio::test]
	async fn duplicate_event_for_unchanged_upload_is_ignored() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("done.txt");
		std::fs::write(&path, "data").unwrap();
		let mtime = std::fs::metadata(&path)
			.unwrap()
			.modified()
			.unwrap()
			.duration_since(UNIX_EPOCH)
			.unwrap()
			.as_secs() as i64;

		let ctx = test_ctx(Config {
			source_root: tmp.path().to_path_buf(),
			min_file_age_secs: 0,
			..Config::default()
		})
		.await;
		ctx.db.upsert_pending("done.txt", mtime).await.unwrap();
		ctx.db
			.set_status("done.txt", UploadStatus::Uploaded, mtime)
			.await
			.unwrap();

		let queue = WorkQueue::new();
		let mut deferred = HashMap::new();
		consider(&ctx, &queue, &mut deferred, path).await;

		assert_eq!(
			ctx.db.get_status("done.txt").await.unwrap(),
			Some(UploadStatus::Uploaded)
		);
		assert!(queue.try_next().is_none());
	}

	#[tokio::test]
	async fn modified_uploaded_file_goes_back_to_pending() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("changed.txt");
		std::fs::write(&path, "v2").unwrap();
		let mtime = std::fs::metadata(&path)
			.unwrap()
			.modified()
			.unwrap()
			.duration_since(UNIX_EPOCH)
			.unwrap()
			.as_secs() as i64;

		let ctx = test_ctx(Config {
			source_root: tmp.path().to_path_buf(),
			min_file_age_secs: 0,
			..Config::default()
		})
		.await;
		// uploaded before the latest write
		ctx.db.upsert_pending("changed.txt", mtime - 100).await.unwrap();
		ctx.db
			.set_status("changed.txt", UploadStatus::Uploaded, mtime - 100)
			.await
			.unwrap();

		let queue = WorkQueue::new();
		let mut deferred = HashMap::new();
		consider(&ctx, &queue, &mut deferred, path).await;

		assert_eq!(
			ctx.db.get_status("changed.txt").await.unwrap(),
			Some(UploadStatus::Pending)
		);
		assert!(matches!(queue.try_next(), Some(WorkItem::File(p)) if p == "changed.txt"));
	}

	#[tokio::test]
	async fn vanished_file_is_dropped() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("ghost.txt");

		let ctx = test_ctx(Config {
			source_root: tmp.path().to_path_buf(),
			..Config::default()
		})
		.await;
		let queue = WorkQueue::new();
		let mut deferred = HashMap::new();
		deferred.insert(path.clone(), 0);

		consider(&ctx, &queue, &mut deferred, path).await;

		assert!(deferred.is_empty());
		assert!(queue.try_next().is_none());
	}
}
