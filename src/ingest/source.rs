use anyhow::Result;

use crate::ingest::record::RawRecord;

/// One page of listing results.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub records: Vec<RawRecord>,
    /// Source's current estimate of the catalog size.
    pub total_estimate: u64,
    /// Listing rows on this page, including rows dropped because their
    /// detail page could not be read. Zero means the listing is exhausted.
    pub scanned: u64,
}

/// Paginated catalog source feeding the ingestion pipeline.
///
/// A failed `next_page` must leave the cursor where it was so the same page
/// is requested again on the next call.
#[async_trait::async_trait]
pub trait PageFetcher: Send {
    async fn next_page(&mut self) -> Result<FetchedPage>;

    /// Give up on the current page and move past it. Returns the number of
    /// listing rows skipped.
    fn skip_page(&mut self) -> u64;
}
