use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::database_ops::store::CatalogStore;
use crate::ingest::engine::DiffSyncEngine;
use crate::ingest::error::{SyncError, SyncOutcome};
use crate::ingest::record::RawRecord;
use crate::ingest::snapshot::AssociationSnapshot;
use crate::ingest::source::PageFetcher;
use crate::ingest::translator::IdentifierTranslator;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Attempts per page after the first failure before the page is skipped.
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    /// Stop producing after this many pages. A capped run skips finalization.
    pub max_pages: Option<u32>,
    /// Log progress every N processed records.
    pub progress_every: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_retries: 3,
            retry_backoff: Duration::from_millis(1000),
            max_pages: None,
            progress_every: 250,
        }
    }
}

/// Counters shared between producer, consumer and observers.
#[derive(Debug, Default)]
pub struct Progress {
    total_expected: OnceLock<u64>,
    processed: AtomicU64,
    synced: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    capped: AtomicBool,
}

impl Progress {
    /// Keeps the first estimate; later ones are ignored.
    fn set_total(&self, total: u64) -> u64 {
        *self.total_expected.get_or_init(|| total)
    }

    pub fn total_expected(&self) -> Option<u64> {
        self.total_expected.get().copied()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn synced(&self) -> u64 {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.total_expected()
            .is_some_and(|total| self.processed() >= total)
    }

    fn record(&self, outcome: &SyncOutcome) {
        let counter = match outcome {
            SyncOutcome::Synced { .. } => &self.synced,
            SyncOutcome::Duplicate => &self.duplicates,
            SyncOutcome::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Summary of one finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub total_expected: Option<u64>,
    pub processed: u64,
    pub synced: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub marked_unavailable: u64,
    /// Production stopped at `max_pages`; finalization was skipped.
    pub capped: bool,
    pub finalization_error: Option<String>,
    pub elapsed_ms: u128,
}

/// One ingestion run: fetch pages, sync every record, flag games that vanished.
///
/// All run state (dictionaries, snapshot, id sets, counters) is owned here and
/// built fresh by [`IngestionPipeline::prepare`].
pub struct IngestionPipeline {
    store: Arc<dyn CatalogStore>,
    engine: DiffSyncEngine,
    translator: IdentifierTranslator,
    snapshot: AssociationSnapshot,
    previously_known: HashSet<i64>,
    seen: HashSet<i64>,
    progress: Arc<Progress>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    /// Load everything the run needs from storage. Any error here is fatal.
    #[instrument(skip_all)]
    pub async fn prepare(store: Arc<dyn CatalogStore>, settings: PipelineSettings) -> Result<Self> {
        let previously_known = store
            .load_known_steam_ids()
            .await
            .context("load known steam ids")?;
        let translator = IdentifierTranslator::load(store.as_ref()).await?;
        let snapshot = AssociationSnapshot::warm(store.as_ref()).await?;
        info!(known_games = previously_known.len(), "pipeline prepared");
        Ok(Self {
            engine: DiffSyncEngine::new(store.clone()),
            store,
            translator,
            snapshot,
            previously_known,
            seen: HashSet::new(),
            progress: Arc::new(Progress::default()),
            settings,
        })
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    /// Drive the run to completion.
    ///
    /// Returns `Err` only for a fatal logic error; per-record failures are
    /// counted and logged.
    pub async fn run(mut self, fetcher: Box<dyn PageFetcher>) -> Result<RunReport> {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<RawRecord>();
        let producer = tokio::spawn(produce(
            fetcher,
            tx,
            self.progress.clone(),
            self.settings.clone(),
        ));

        while let Some(record) = rx.recv().await {
            let outcome = self.consume(record).await?;
            debug!(outcome = ?outcome, "record consumed");
            let processed = self.progress.processed();
            if processed % self.settings.progress_every.max(1) == 0 {
                info!(
                    processed,
                    total = ?self.progress.total_expected(),
                    synced = self.progress.synced(),
                    failed = self.progress.failed(),
                    "ingestion progress"
                );
            }
            if self.progress.is_complete() {
                break;
            }
        }
        drop(rx);
        // Every expected record is in; a fetch still in flight is not needed.
        if self.progress.is_complete() {
            producer.abort();
        }
        if let Err(e) = producer.await {
            if e.is_panic() {
                error!(error = %e, "producer task panicked");
            }
        }

        let mut report = RunReport {
            total_expected: self.progress.total_expected(),
            processed: self.progress.processed(),
            synced: self.progress.synced(),
            failed: self.progress.failed(),
            duplicates: self.progress.duplicates(),
            capped: self.progress.capped.load(Ordering::SeqCst),
            ..RunReport::default()
        };
        if report.capped {
            warn!("run stopped at max_pages; not marking missing games unavailable");
        } else {
            match self.finalize().await {
                Ok(n) => report.marked_unavailable = n,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "failed to mark missing games unavailable");
                    report.finalization_error = Some(format!("{e:#}"));
                }
            }
        }
        report.elapsed_ms = started.elapsed().as_millis();
        info!(
            processed = report.processed,
            total = ?report.total_expected,
            synced = report.synced,
            failed = report.failed,
            duplicates = report.duplicates,
            marked_unavailable = report.marked_unavailable,
            elapsed_ms = report.elapsed_ms as u64,
            "ingestion run finished"
        );
        Ok(report)
    }

    /// Handle one dequeued record. Every call counts as processed.
    pub async fn consume(&mut self, record: RawRecord) -> Result<SyncOutcome, SyncError> {
        let outcome = if self.seen.contains(&record.steam_id) {
            debug!(steam_id = record.steam_id, "duplicate record skipped");
            SyncOutcome::Duplicate
        } else {
            match self.sync_one(&record).await {
                Ok(game_id) => {
                    self.seen.insert(record.steam_id);
                    SyncOutcome::Synced { game_id }
                }
                Err(e) if e.is_fatal() => {
                    error!(steam_id = record.steam_id, error = %e, "fatal sync error");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        op = e.op(),
                        steam_id = record.steam_id,
                        title = %record.title,
                        error = %e,
                        "record sync failed"
                    );
                    SyncOutcome::Failed { reason: e }
                }
            }
        };
        self.progress.record(&outcome);
        Ok(outcome)
    }

    async fn sync_one(&mut self, record: &RawRecord) -> Result<i64, SyncError> {
        self.translator
            .register_missing(self.store.as_ref(), &record.attributes)
            .await
            .map_err(|e| SyncError::storage("register_missing", record.steam_id, e))?;
        let report = self
            .engine
            .sync_item(&self.translator, &mut self.snapshot, record)
            .await?;
        Ok(report.game_id)
    }

    /// Ids known before the run that were not synced during it.
    pub fn missing_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .previously_known
            .difference(&self.seen)
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    async fn finalize(&self) -> Result<u64> {
        let missing = self.missing_ids();
        if missing.is_empty() {
            return Ok(0);
        }
        info!(count = missing.len(), "marking games missing from this run unavailable");
        self.store.mark_unavailable(&missing).await
    }
}

/// Producer side: page through the source into the channel.
async fn produce(
    mut fetcher: Box<dyn PageFetcher>,
    tx: mpsc::UnboundedSender<RawRecord>,
    progress: Arc<Progress>,
    settings: PipelineSettings,
) {
    let mut fetched: u64 = 0;
    let mut pages: u32 = 0;
    let mut failures: u32 = 0;
    loop {
        if settings.max_pages.is_some_and(|max| pages >= max) {
            progress.capped.store(true, Ordering::SeqCst);
            info!(pages, "max_pages reached; producer stopping");
            break;
        }
        match fetcher.next_page().await {
            Ok(page) => {
                failures = 0;
                pages += 1;
                let total = progress.set_total(page.total_estimate);
                if page.total_estimate != total {
                    debug!(first = total, latest = page.total_estimate, "total estimate drifted");
                }
                fetched += page.scanned;
                debug!(
                    page = pages,
                    records = page.records.len(),
                    scanned = page.scanned,
                    fetched,
                    total,
                    "page fetched"
                );
                for record in page.records {
                    if tx.send(record).is_err() {
                        debug!("consumer finished; producer stopping");
                        return;
                    }
                }
                if page.scanned == 0 || fetched >= total {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                if failures > settings.fetch_retries {
                    let skipped = fetcher.skip_page();
                    fetched += skipped;
                    pages += 1;
                    failures = 0;
                    warn!(error = %format!("{e:#}"), skipped, "page failed repeatedly; skipping it");
                    if progress.total_expected().is_some_and(|total| fetched >= total) {
                        break;
                    }
                } else {
                    warn!(
                        error = %format!("{e:#}"),
                        attempt = failures,
                        "page fetch failed; retrying"
                    );
                    tokio::time::sleep(settings.retry_backoff).await;
                }
            }
        }
    }
    debug!(fetched, pages, "producer done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::attribute::AttributeKind;
    use crate::database_ops::memory::MemoryStore;
    use crate::ingest::record::fixtures::record;
    use crate::ingest::source::FetchedPage;
    use std::collections::VecDeque;

    /// Serves prepared pages in order; `Err` entries fail once each.
    struct ScriptedFetcher {
        script: VecDeque<Result<FetchedPage, String>>,
        page_size: u64,
    }

    impl ScriptedFetcher {
        fn pages(total: u64, pages: Vec<Vec<RawRecord>>) -> Box<Self> {
            Box::new(Self {
                script: pages
                    .into_iter()
                    .map(|records| {
                        Ok(FetchedPage {
                            scanned: records.len() as u64,
                            records,
                            total_estimate: total,
                        })
                    })
                    .collect(),
                page_size: 2,
            })
        }
    }

    #[async_trait::async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn next_page(&mut self) -> anyhow::Result<FetchedPage> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Ok(FetchedPage::default()))
                .map_err(|msg| anyhow::anyhow!(msg))
        }

        // Failed entries are consumed by `next_page`, so there is nothing to drop here.
        fn skip_page(&mut self) -> u64 {
            self.page_size
        }
    }

    /// Holds every page after the first until the test releases it.
    struct GatedFetcher {
        pages: VecDeque<FetchedPage>,
        gate: Arc<tokio::sync::Notify>,
        served: usize,
    }

    #[async_trait::async_trait]
    impl PageFetcher for GatedFetcher {
        async fn next_page(&mut self) -> anyhow::Result<FetchedPage> {
            if self.served > 0 {
                self.gate.notified().await;
            }
            self.served += 1;
            Ok(self.pages.pop_front().unwrap_or_default())
        }

        fn skip_page(&mut self) -> u64 {
            0
        }
    }

    fn fast_settings() -> PipelineSettings {
        PipelineSettings {
            fetch_retries: 1,
            retry_backoff: Duration::from_millis(1),
            max_pages: None,
            progress_every: 1,
        }
    }

    async fn pipeline(store: &Arc<MemoryStore>) -> IngestionPipeline {
        IngestionPipeline::prepare(store.clone(), fast_settings())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn run_syncs_all_pages_and_terminates_at_total() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = ScriptedFetcher::pages(
            3,
            vec![
                vec![record(1, &["Action"], &[]), record(2, &["Roguelike"], &[])],
                vec![record(3, &["Roguelike"], &["Indie"])],
            ],
        );
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.total_expected, Some(3));
        assert_eq!((report.processed, report.synced, report.failed), (3, 3, 0));

        // "Roguelike" registered once and shared by both games.
        assert_eq!(store.attribute_count(AttributeKind::Genre), 2);
        let roguelike = store.attribute_id(AttributeKind::Genre, "Roguelike").unwrap();
        for steam_id in [2, 3] {
            let game_id = store.game(steam_id).unwrap().game_id;
            assert!(store.links(AttributeKind::Genre, game_id).contains(&roguelike));
        }
    }

    #[tokio::test]
    async fn consumer_waits_for_slow_producer() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let page = |ids: &[i64]| FetchedPage {
            records: ids.iter().map(|&id| record(id, &["A"], &[])).collect(),
            total_estimate: 5,
            scanned: ids.len() as u64,
        };
        let fetcher = Box::new(GatedFetcher {
            pages: VecDeque::from([page(&[30, 10]), page(&[50, 20]), page(&[40])]),
            gate: gate.clone(),
            served: 0,
        });
        let p = pipeline(&store).await;
        let progress = p.progress();
        let run = tokio::spawn(p.run(fetcher));

        for drained in [2, 4] {
            tokio::time::timeout(Duration::from_secs(5), async {
                while progress.processed() < drained {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            // Buffer is empty and work remains: the run must still be waiting.
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(progress.processed(), drained);
            assert!(!run.is_finished());
            gate.notify_one();
        }

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.total_expected, Some(5));
        assert_eq!((report.processed, report.synced), (5, 5));

        // Game ids are assigned in sync order.
        let order: Vec<i64> = [30, 10, 50, 20, 40]
            .iter()
            .map(|&steam_id| store.game(steam_id).unwrap().game_id)
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");
    }

    #[tokio::test]
    async fn duplicate_across_pages_is_synced_once() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = ScriptedFetcher::pages(
            4,
            vec![
                vec![record(1, &["A"], &[]), record(2, &["A"], &[])],
                vec![record(2, &["A"], &[]), record(3, &["B"], &[])],
            ],
        );
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.synced, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.prices(store.game(2).unwrap().game_id).len(), 1);
    }

    #[tokio::test]
    async fn failed_records_still_count_toward_termination() {
        let store = Arc::new(MemoryStore::new());
        store.fail_on("upsert_game");
        let fetcher = ScriptedFetcher::pages(2, vec![vec![record(1, &[], &[]), record(2, &[], &[])]]);
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!((report.processed, report.synced, report.failed), (2, 0, 2));
    }

    #[tokio::test]
    async fn games_missing_from_run_are_marked_unavailable() {
        let store = Arc::new(MemoryStore::new());
        for steam_id in [1, 2, 3] {
            store.seed_game(record(steam_id, &[], &[]).to_upsert());
        }
        let fetcher =
            ScriptedFetcher::pages(2, vec![vec![record(1, &[], &[]), record(2, &[], &[])]]);
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.marked_unavailable, 1);
        assert!(store.game(1).unwrap().available);
        assert!(store.game(2).unwrap().available);
        assert!(!store.game(3).unwrap().available);
    }

    #[tokio::test]
    async fn failed_sync_counts_as_missing_at_finalization() {
        let store = Arc::new(MemoryStore::new());
        store.seed_game(record(1, &[], &[]).to_upsert());
        store.fail_on("latest_price");
        let fetcher = ScriptedFetcher::pages(1, vec![vec![record(1, &[], &[])]]);
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.marked_unavailable, 1);
    }

    #[tokio::test]
    async fn finalization_failure_does_not_fail_the_run() {
        let store = Arc::new(MemoryStore::new());
        store.seed_game(record(9, &[], &[]).to_upsert());
        store.fail_on("mark_unavailable");
        let fetcher = ScriptedFetcher::pages(1, vec![vec![record(1, &[], &[])]]);
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.finalization_error.is_some());
        assert!(store.game(9).unwrap().available);
    }

    #[tokio::test]
    async fn transient_page_error_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = ScriptedFetcher::pages(2, vec![vec![record(1, &[], &[]), record(2, &[], &[])]]);
        fetcher.script.push_front(Err("HTTP 503".into()));
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.synced, 2);
    }

    #[tokio::test]
    async fn persistently_failing_page_is_skipped_and_run_ends() {
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = ScriptedFetcher::pages(4, vec![vec![record(3, &[], &[]), record(4, &[], &[])]]);
        // fetch_retries = 1: two failures in a row skip the first page.
        fetcher.script.push_front(Err("still down".into()));
        fetcher.script.push_front(Err("down".into()));
        fetcher.script.push_front(Ok(FetchedPage {
            records: vec![record(1, &[], &[]), record(2, &[], &[])],
            total_estimate: 6,
            scanned: 2,
        }));
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.total_expected, Some(6));
        assert_eq!(report.processed, 2 + 2);
        assert!(store.game(1).is_some());
        assert!(store.game(4).is_some());
    }

    #[tokio::test]
    async fn empty_catalog_finishes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = ScriptedFetcher::pages(0, vec![vec![]]);
        let report = pipeline(&store).await.run(fetcher).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.total_expected, Some(0));
    }

    #[tokio::test]
    async fn capped_run_skips_finalization() {
        let store = Arc::new(MemoryStore::new());
        store.seed_game(record(50, &[], &[]).to_upsert());
        let fetcher = ScriptedFetcher::pages(
            4,
            vec![
                vec![record(1, &[], &[]), record(2, &[], &[])],
                vec![record(3, &[], &[]), record(4, &[], &[])],
            ],
        );
        let settings = PipelineSettings {
            max_pages: Some(1),
            ..fast_settings()
        };
        let report = IngestionPipeline::prepare(store.clone(), settings)
            .await
            .unwrap()
            .run(fetcher)
            .await
            .unwrap();
        assert!(report.capped);
        assert_eq!(report.processed, 2);
        assert!(store.game(50).unwrap().available);
    }

    #[tokio::test]
    async fn consume_reports_typed_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let mut p = pipeline(&store).await;
        assert!(p.consume(record(1, &["A"], &[])).await.unwrap().is_synced());
        assert!(matches!(
            p.consume(record(1, &["A"], &[])).await.unwrap(),
            SyncOutcome::Duplicate
        ));
        store.fail_on("upsert_game");
        assert!(matches!(
            p.consume(record(2, &[], &[])).await.unwrap(),
            SyncOutcome::Failed { .. }
        ));
        // A record whose earlier occurrence failed gets another attempt.
        store.clear_failures();
        assert!(p.consume(record(2, &[], &[])).await.unwrap().is_synced());
        assert_eq!(p.progress().processed(), 4);
        assert_eq!(p.missing_ids(), Vec::<i64>::new());
    }
}
