use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{error, info};

use shelfsync_core::{DmsClient, WorkspaceClient};

use crate::config::DaemonConfig;
use crate::sync::engine::{CycleStats, DatabaseIds, SyncEngine};
use crate::sync::tracker::TrackerStore;

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> Result<Self> {
        let source = DmsClient::with_timeout(
            &config.source_url,
            config.source_token.clone(),
            config.http_timeout,
        )
        .context("failed to build source client")?;
        let target = WorkspaceClient::with_timeout(
            &config.target_url,
            config.target_token.clone(),
            config.http_timeout,
        )
        .context("failed to build target client")?;
        let tracker = match &config.state_db {
            Some(path) => TrackerStore::open(path).await,
            None => TrackerStore::open_default().await,
        }
        .context("failed to open tracker database")?;

        let databases = DatabaseIds {
            documents: config.documents_db.clone(),
            tags: config.tags_db.clone(),
            correspondents: config.correspondents_db.clone(),
        };
        let engine = SyncEngine::new(source, target, tracker, databases)
            .with_concurrency(config.concurrency);

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    /// Runs a single cycle and exits. Used by `--once`.
    pub async fn run_once(&self) -> Result<()> {
        let stop = AtomicBool::new(false);
        let stats = self.engine.run_cycle(&stop).await?;
        log_cycle(&stats);
        Ok(())
    }

    /// Runs cycles on the configured interval until SIGINT. The cycle in
    /// flight finishes before the daemon exits.
    pub async fn run(&self) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let engine = Arc::clone(&self.engine);
        let interval = self.config.interval;
        let loop_stop = Arc::clone(&stop);
        let loop_wake = Arc::clone(&wake);
        let handle = tokio::spawn(async move {
            loop {
                match engine.run_cycle(&loop_stop).await {
                    Ok(stats) => log_cycle(&stats),
                    Err(err) => error!(error = %err, "cycle aborted"),
                }
                if loop_stop.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = loop_wake.notified() => {}
                }
                if loop_stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for SIGINT")?;
        info!("shutdown requested, letting the current cycle finish");
        stop.store(true, Ordering::SeqCst);
        wake.notify_one();
        handle.await.context("sync loop panicked")?;
        Ok(())
    }
}

fn log_cycle(stats: &CycleStats) {
    info!(
        created = stats.created,
        updated = stats.updated,
        archived = stats.archived,
        unchanged = stats.unchanged,
        skipped = stats.skipped,
        failed = stats.failed,
        "cycle finished"
    );
}
