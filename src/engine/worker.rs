use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::engine::uploader::{self, UploadError};
use crate::service::PipelineContext;

/// Unit of work handed to the worker pool. `Stop` is the shutdown
/// sentinel; the controller pushes exactly one per worker.
#[derive(Debug)]
pub enum WorkItem {
	File(String),
	Stop,
}

/// Thread-safe FIFO feeding the worker pool. `push` never blocks.
/// Ephemeral by design: contents are reconstructed from the state store
/// on restart, so losing the queue in a crash is recoverable.
#[derive(Clone)]
pub struct WorkQueue {
	tx: mpsc::UnboundedSender<WorkItem>,
	rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
}

impl WorkQueue {
	pub fn new() -> WorkQueue {
		let (tx, rx) = mpsc::unbounded_channel();
		WorkQueue {
			tx,
			rx: Arc::new(Mutex::new(rx)),
		}
	}

	pub fn push(&self, path: String) {
		let _ = self.tx.send(WorkItem::File(path));
	}

	pub fn push_stop(&self) {
		let _ = self.tx.send(WorkItem::Stop);
	}

	async fn next(&self) -> Option<WorkItem> {
		self.rx.lock().await.recv().await
	}

	#[cfg(test)]
	pub fn try_next(&self) -> Option<WorkItem> {
		self.rx
			.try_lock()
			.expect("queue receiver busy")
			.try_recv()
			.ok()
	}
}

impl Default for WorkQueue {
	fn default() -> Self {
		WorkQueue::new()
	}
}

/// One worker: dequeue, upload with bounded retries, repeat until the
/// stop sentinel arrives. An item already dequeued is always finished
/// before the sentinel is observed.
pub async fn run_worker(ctx: PipelineContext, queue: WorkQueue, id: usize) {
	debug!(worker = id, "worker started");
	while let Some(item) = queue.next().await {
		match item {
			WorkItem::Stop => break,
			WorkItem::File(path) => upload_with_retry(&ctx, &path).await,
		}
	}
	debug!(worker = id, "worker stopped");
}

/// Bounded retry loop with exponential backoff. Each attempt checks out
/// a fresh session; backoff sleeps hold the worker slot, which caps
/// in-flight concurrency at the worker count even under sustained
/// failure. After the retries are spent the row stays `error` for the
/// daily batch or a manual re-queue.
async fn upload_with_retry(ctx: &PipelineContext, path: &str) {
	let mut attempt: u32 = 0;
	loop {
		let result = match ctx.pool.acquire().await {
			Ok(session) => uploader::execute(ctx, session, path).await,
			Err(err) => Err(UploadError::Transfer(err)),
		};

		let err = match result {
			Ok(_) => return,
			Err(err) => err,
		};

		if attempt >= ctx.config.max_retries {
			error!(path, attempts = attempt + 1, %err, "upload abandoned after exhausting retries");
			return;
		}

		let delay = ctx.config.retry_delay_base_secs.saturating_pow(attempt);
		warn!(path, attempt = attempt + 1, delay_secs = delay, %err, "upload failed, backing off");
		tokio::time::sleep(Duration::from_secs(delay)).await;
		attempt += 1;
	}
}
