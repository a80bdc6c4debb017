use anyhow::{bail, Context, Result};
use futures::{stream, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::parse::{ListingRow, SteamSelectors};
use crate::ingest::record::RawRecord;
use crate::ingest::settings::CrawlSettings;
use crate::ingest::source::{FetchedPage, PageFetcher};
use crate::util::env::{env_opt, env_parse};

pub const STORE_BASE: &str = "https://store.steampowered.com";

/// JSON envelope of the infinite-scroll search endpoint.
#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(default)]
    success: Value,
    #[serde(default)]
    results_html: String,
    #[serde(default)]
    total_count: u64,
}

impl ScrollResponse {
    // Steam sends either `true` or `1`.
    fn ok(&self) -> bool {
        matches!(&self.success, Value::Bool(true)) || self.success.as_i64() == Some(1)
    }
}

/// Pages through the Steam store search and enriches each row from its app page.
///
/// Env: STEAM_HTTP_TIMEOUT_SECS (30), STEAM_BASE_URL (store.steampowered.com)
pub struct SteamStoreFetcher {
    client: Client,
    jar: Arc<Jar>,
    selectors: Arc<SteamSelectors>,
    base: Url,
    filter: String,
    page_size: u32,
    detail_concurrency: usize,
    start: u64,
}

impl SteamStoreFetcher {
    pub fn new(settings: &CrawlSettings) -> Result<Self> {
        let base = env_opt("STEAM_BASE_URL").unwrap_or_else(|| STORE_BASE.to_string());
        let base = Url::parse(&base).with_context(|| format!("invalid STEAM_BASE_URL {base:?}"))?;

        // Pre-seeded birthtime lets most age-gated pages through without the form post.
        let jar = Arc::new(Jar::default());
        jar.add_cookie_str("birthtime=470703601; path=/", &base);
        jar.add_cookie_str("wants_mature_content=1; path=/", &base);

        let client = Client::builder()
            .timeout(Duration::from_secs(env_parse("STEAM_HTTP_TIMEOUT_SECS", 30u64)))
            .cookie_provider(jar.clone())
            .user_agent(concat!("steam-catalog/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build steam http client")?;

        Ok(Self {
            client,
            jar,
            selectors: Arc::new(SteamSelectors::new()?),
            base,
            filter: settings.search_filter.clone(),
            page_size: settings.page_size,
            detail_concurrency: settings.detail_concurrency,
            start: 0,
        })
    }

    fn listing_url(&self, start: u64) -> Result<Url> {
        let mut url = self.base.join("search/results/")?;
        url.query_pairs_mut()
            .append_pair("query", "")
            .append_pair("start", &start.to_string())
            .append_pair("count", &self.page_size.to_string())
            .append_pair("filter", &self.filter)
            .append_pair("infinite", "1");
        Ok(url)
    }

    async fn fetch_listing(&self, start: u64) -> Result<ScrollResponse> {
        let url = self.listing_url(start)?;
        let resp = get_with_backoff(&self.client, &url).await?;
        let body: ScrollResponse = resp
            .json()
            .await
            .with_context(|| format!("decode listing at start={start}"))?;
        if !body.ok() {
            bail!("listing at start={start} returned success={}", body.success);
        }
        Ok(body)
    }

    /// Fetch detail pages for one listing page, keeping listing order.
    async fn fetch_details(&self, rows: Vec<ListingRow>) -> Vec<RawRecord> {
        let results: Vec<Option<RawRecord>> = stream::iter(rows)
            .map(|row| async move {
                let steam_id = row.steam_id;
                match self.detail_record(row).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(steam_id, error = %format!("{e:#}"), "detail page unusable; game dropped");
                        None
                    }
                }
            })
            .buffered(self.detail_concurrency.max(1))
            .collect()
            .await;
        results.into_iter().flatten().collect()
    }

    async fn detail_record(&self, row: ListingRow) -> Result<RawRecord> {
        let link = Url::parse(&row.link).with_context(|| format!("bad app link {:?}", row.link))?;
        let mut html = self.get_text(&link).await?;
        if self.selectors.is_age_gate(&html) {
            debug!(steam_id = row.steam_id, "age gate; submitting birth date");
            self.pass_age_gate(row.steam_id).await?;
            html = self.get_text(&link).await?;
        }
        let detail = self.selectors.parse_detail(&html)?;
        Ok(row.into_record(detail))
    }

    async fn get_text(&self, url: &Url) -> Result<String> {
        let resp = get_with_backoff(&self.client, url).await?;
        resp.text()
            .await
            .with_context(|| format!("read body of {url}"))
    }

    /// Post the age-check form with the store session cookie.
    async fn pass_age_gate(&self, steam_id: i64) -> Result<()> {
        let session_id = self
            .jar
            .cookies(&self.base)
            .and_then(|h| h.to_str().ok().and_then(session_id_from_cookies))
            .context("no sessionid cookie for age gate")?;
        let url = self.base.join(&format!("agecheckset/app/{steam_id}/"))?;
        let resp = self
            .client
            .post(url)
            .form(&[
                ("sessionid", session_id.as_str()),
                ("ageDay", "13"),
                ("ageMonth", "January"),
                ("ageYear", "1985"),
            ])
            .send()
            .await
            .context("post agecheckset")?;
        if !resp.status().is_success() {
            bail!("agecheckset for {steam_id} returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PageFetcher for SteamStoreFetcher {
    #[instrument(skip(self), fields(start = self.start))]
    async fn next_page(&mut self) -> Result<FetchedPage> {
        let listing = self.fetch_listing(self.start).await?;
        let (rows, scanned) = self.selectors.parse_listing(&listing.results_html);
        let records = self.fetch_details(rows).await;
        info!(
            start = self.start,
            scanned,
            kept = records.len(),
            total = listing.total_count,
            "steam page fetched"
        );
        self.start += u64::from(self.page_size);
        Ok(FetchedPage {
            records,
            total_estimate: listing.total_count,
            scanned,
        })
    }

    fn skip_page(&mut self) -> u64 {
        self.start += u64::from(self.page_size);
        u64::from(self.page_size)
    }
}

/// GET with retries on 429, honoring `Retry-After`. Other non-success
/// statuses are returned as errors.
async fn get_with_backoff(client: &Client, url: &Url) -> Result<Response> {
    let delays = [5u64, 10, 15, 20];
    let mut attempt: usize = 0;
    loop {
        let resp = client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if status != StatusCode::TOO_MANY_REQUESTS {
            if !status.is_success() {
                bail!("GET {url} returned {status}");
            }
            return Ok(resp);
        }
        let Some(&base_delay) = delays.get(attempt) else {
            bail!("GET {url} still rate limited after {attempt} retries");
        };
        let sleep_secs = resp
            .headers()
            .get("Retry-After")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map_or(base_delay, |ra| ra.max(base_delay));
        attempt += 1;
        debug!(%url, sleep_secs, attempt, "rate limited");
        tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
    }
}

/// Pull `sessionid` out of a `Cookie` header value.
fn session_id_from_cookies(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "sessionid" && !value.is_empty()).then(|| value.to_string())
    })
}
