use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::db::DbHandle;
use crate::engine::pool::SessionPool;
use crate::engine::transport::SftpConnector;
use crate::engine::worker::WorkQueue;
use crate::engine::{scanner, sweeper, watcher, worker};

const BATCH_PERIOD: Duration = Duration::from_secs(86_400);

/// Everything a pipeline stage needs, passed explicitly. No globals:
/// the store handle, the session pool, and the configuration travel
/// together.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: DbHandle,
    pub pool: Arc<SessionPool>,
    pub config: Arc<Config>,
}

/// Run the long-lived service until interrupted: startup scan, backlog
/// queue, worker pool, live watch, retention sweeper, daily batch.
pub async fn run(mut config: Config) -> anyhow::Result<()> {
    config.source_root = config
        .source_root
        .canonicalize()
        .with_context(|| format!("source root {} not accessible", config.source_root.display()))?;

    let db = DbHandle::open(&config.db_path)
        .await
        .context("cannot open state store")?;
    let connector = Arc::new(SftpConnector::new(&config));
    let pool = SessionPool::new(connector, config.pool_size());
    let config = Arc::new(config);
    let ctx = PipelineContext {
        db,
        pool,
        config: config.clone(),
    };
    let queue = WorkQueue::new();

    let scan = scanner::initial_scan(&ctx).await?;
    info!(
        files = scan.files_seen,
        recorded = scan.recorded,
        skipped_young = scan.skipped_young,
        unreadable = scan.skipped_entries,
        "initial scan complete"
    );
    let queued = scanner::queue_pending(&ctx, &queue).await?;
    info!(queued, "startup backlog queued");

    let token = CancellationToken::new();

    let mut workers = Vec::with_capacity(config.num_workers);
    for id in 0..config.num_workers {
        workers.push(tokio::spawn(worker::run_worker(
            ctx.clone(),
            queue.clone(),
            id,
        )));
    }
    let watch = tokio::spawn(watcher::run_watcher(ctx.clone(), queue.clone(), token.clone()));
    let sweep = tokio::spawn(sweeper::run_sweeper(ctx.clone(), token.clone()));
    let batch = tokio::spawn(run_daily_batch(ctx.clone(), queue.clone(), token.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Discovery and housekeeping stop first so nothing lands on the
    // queue after the sentinels.
    token.cancel();
    let _ = watch.await;
    let _ = sweep.await;
    let _ = batch.await;

    for _ in 0..config.num_workers {
        queue.push_stop();
    }
    for handle in workers {
        let _ = handle.await;
    }

    info!("all workers drained, shutdown complete");
    Ok(())
}

/// Re-queues quiescent pending/error rows once a day, giving abandoned
/// failures another pass without operator involvement.
async fn run_daily_batch(ctx: PipelineContext, queue: WorkQueue, token: CancellationToken) {
    let mut ticker = tokio::time::interval(BATCH_PERIOD);
    // the startup pass already queued the backlog
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match scanner::queue_pending(&ctx, &queue).await {
            Ok(0) => {}
            Ok(queued) => info!(queued, "daily batch queued files"),
            Err(err) => error!(%err, "daily batch failed"),
        }
    }
}
