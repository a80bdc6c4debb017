use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::util::db::Db;
use crate::database_ops::memory::MemoryStore;
use crate::database_ops::steam::SteamStoreFetcher;
use crate::database_ops::store::CatalogStore;
use crate::ingest::{CrawlOverrides, CrawlSettings, IngestionPipeline, RunReport};
use crate::util::env as env_util;

#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    /// Sync into an in-process store instead of Postgres.
    pub dry_run: bool,
    pub overrides: CrawlOverrides,
}

/// One full crawl of the Steam listing into the catalog.
pub async fn run(opts: CrawlOptions) -> Result<RunReport> {
    env_util::init_env();
    let settings = CrawlSettings::from_env().apply(&opts.overrides);
    env_util::log_config_snapshot(
        "crawl",
        &[
            "STEAM_PAGE_SIZE",
            "STEAM_DETAIL_CONCURRENCY",
            "STEAM_SEARCH_FILTER",
            "STEAM_FETCH_RETRIES",
            "STEAM_MAX_PAGES",
            "DB_HOST",
            "DB_DATABASE",
            "DB_USERNAME",
            "DB_PASSWORD",
        ],
    );
    info!(
        page_size = settings.page_size,
        detail_concurrency = settings.detail_concurrency,
        filter = %settings.search_filter,
        max_pages = ?settings.pipeline.max_pages,
        dry_run = opts.dry_run,
        "starting crawl"
    );

    let store: Arc<dyn CatalogStore> = if opts.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let url = env_util::db_url()?;
        let max_connections = env_util::env_parse("DB_MAX_CONNS", 5u32);
        Arc::new(Db::connect(&url, max_connections).await?)
    };

    let fetcher = SteamStoreFetcher::new(&settings)?;
    let pipeline = IngestionPipeline::prepare(store, settings.pipeline.clone())
        .await
        .context("prepare ingestion run")?;

    // Time-based progress alongside the per-N-records log in the pipeline.
    let progress = pipeline.progress();
    let tick_secs = env_util::env_parse("PROGRESS_LOG_SECS", 30u64).max(1);
    let ticker = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                processed = progress.processed(),
                total = ?progress.total_expected(),
                synced = progress.synced(),
                failed = progress.failed(),
                duplicates = progress.duplicates(),
                "crawl heartbeat"
            );
        }
    });

    let result = pipeline.run(Box::new(fetcher)).await;
    ticker.abort();
    result
}
