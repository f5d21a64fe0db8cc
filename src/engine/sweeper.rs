use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::service::PipelineContext;

const SWEEP_PERIOD: Duration = Duration::from_secs(86_400);
const SECS_PER_DAY: i64 = 86_400;

/// Daily retention sweep. The first tick fires immediately, so stale
/// rows from before a restart are purged at startup. Pure housekeeping:
/// failures are logged and never stop the service.
pub async fn run_sweeper(ctx: PipelineContext, token: CancellationToken) {
	let mut ticker = tokio::time::interval(SWEEP_PERIOD);
	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			_ = ticker.tick() => {}
		}
		sweep_once(&ctx).await;
	}
}

pub async fn sweep_once(ctx: &PipelineContext) {
	let cutoff = Utc::now().timestamp() - ctx.config.data_retention_days * SECS_PER_DAY;
	match ctx.db.delete_older_than(cutoff).await {
		Ok(0) => {}
		Ok(removed) => info!(removed, "purged file records past retention"),
		Err(err) => error!(%err, "retention sweep failed"),
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::config::Config;
	use crate::db::DbHandle;
	use crate::engine::pool::SessionPool;
	use crate::engine::transport::testing::{MockConnect, RemoteState};
	use crate::models::file_record::UploadStatus;

	#[tokio::test]
	async fn sweep_purges_expired_rows_regardless_of_status() {
		let db = DbHandle::open_in_memory().await.unwrap();
		let pool = SessionPool::new(Arc::new(MockConnect::new(RemoteState::new())), 1);
		let ctx = PipelineContext {
			db,
			pool,
			config: Arc::new(Config {
				data_retention_days: 1,
				..Config::default()
			}),
		};

		let now = Utc::now().timestamp();
		ctx.db
			.upsert_pending("expired.txt", now - 3 * SECS_PER_DAY)
			.await
			.unwrap();
		ctx.db
			.upsert_pending("expired-done.txt", now - 3 * SECS_PER_DAY)
			.await
			.unwrap();
		ctx.db
			.set_status("expired-done.txt", UploadStatus::Uploaded, now - 2 * SECS_PER_DAY)
			.await
			.unwrap();
		ctx.db.upsert_pending("fresh.txt", now).await.unwrap();

		sweep_once(&ctx).await;

		assert!(ctx.db.get_record("expired.txt").await.unwrap().is_none());
		assert!(ctx.db.get_record("expired-done.txt").await.unwrap().is_none());
		assert!(ctx.db.get_record("fresh.txt").await.unwrap().is_some());
	}
}
