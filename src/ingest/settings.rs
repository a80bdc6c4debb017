use clap::Args;
use std::time::Duration;

use crate::ingest::pipeline::PipelineSettings;
use crate::util::env::{env_opt, env_parse, env_parse_opt};

/// Everything one crawl needs besides the database.
///
/// Env: STEAM_PAGE_SIZE (50), STEAM_DETAIL_CONCURRENCY (8), STEAM_SEARCH_FILTER
/// (topsellers), STEAM_FETCH_RETRIES (3), STEAM_FETCH_BACKOFF_MS (1000),
/// STEAM_MAX_PAGES (unset), PROGRESS_EVERY (250)
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub page_size: u32,
    pub detail_concurrency: usize,
    pub search_filter: String,
    pub pipeline: PipelineSettings,
}

impl CrawlSettings {
    pub fn from_env() -> Self {
        Self {
            page_size: env_parse("STEAM_PAGE_SIZE", 50u32).clamp(1, 100),
            detail_concurrency: env_parse("STEAM_DETAIL_CONCURRENCY", 8usize).max(1),
            search_filter: env_opt("STEAM_SEARCH_FILTER").unwrap_or_else(|| "topsellers".into()),
            pipeline: PipelineSettings {
                fetch_retries: env_parse("STEAM_FETCH_RETRIES", 3u32),
                retry_backoff: Duration::from_millis(env_parse("STEAM_FETCH_BACKOFF_MS", 1000u64)),
                max_pages: env_parse_opt("STEAM_MAX_PAGES"),
                progress_every: env_parse("PROGRESS_EVERY", 250u64).max(1),
            },
        }
    }

    /// Command-line flags win over the environment.
    pub fn apply(mut self, o: &CrawlOverrides) -> Self {
        if let Some(v) = o.page_size {
            self.page_size = v.clamp(1, 100);
        }
        if let Some(v) = o.detail_concurrency {
            self.detail_concurrency = v.max(1);
        }
        if let Some(v) = &o.filter {
            self.search_filter = v.clone();
        }
        if let Some(v) = o.fetch_retries {
            self.pipeline.fetch_retries = v;
        }
        if let Some(v) = o.max_pages {
            self.pipeline.max_pages = Some(v);
        }
        if let Some(v) = o.progress_every {
            self.pipeline.progress_every = v.max(1);
        }
        self
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct CrawlOverrides {
    /// Listing rows requested per page (max 100)
    #[arg(long)]
    pub page_size: Option<u32>,
    /// Detail pages fetched in parallel
    #[arg(long)]
    pub detail_concurrency: Option<usize>,
    /// Steam search filter (topsellers, popularnew, ...)
    #[arg(long)]
    pub filter: Option<String>,
    #[arg(long)]
    pub fetch_retries: Option<u32>,
    /// Stop after N pages; missing games are not marked unavailable
    #[arg(long)]
    pub max_pages: Option<u32>,
    #[arg(long)]
    pub progress_every: Option<u64>,
}
