use anyhow::{anyhow, Context, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::database_ops::attribute::AttributeNames;
use crate::ingest::record::RawRecord;

/// One row of the search listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRow {
    pub steam_id: i64,
    pub title: String,
    pub link: String,
    pub supports_win: bool,
    pub supports_mac: bool,
    pub supports_linux: bool,
    pub price_wo_discount: f64,
    pub price_w_discount: f64,
}

/// Fields only available on the game's own store page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailInfo {
    pub release_date: Option<String>,
    pub attributes: AttributeNames,
    pub positive_reviews: Option<i64>,
    pub total_reviews: Option<i64>,
}

impl ListingRow {
    pub fn into_record(self, detail: DetailInfo) -> RawRecord {
        RawRecord {
            steam_id: self.steam_id,
            title: self.title,
            link: self.link,
            release_date: detail.release_date,
            supports_win: self.supports_win,
            supports_mac: self.supports_mac,
            supports_linux: self.supports_linux,
            positive_reviews: detail.positive_reviews,
            total_reviews: detail.total_reviews,
            attributes: detail.attributes,
            price_wo_discount: self.price_wo_discount,
            price_w_discount: self.price_w_discount,
        }
    }
}

/// Compiled selectors for the search listing and the app detail page.
pub struct SteamSelectors {
    row: Selector,
    title: Selector,
    win: Selector,
    mac: Selector,
    linux: Selector,
    original_price: Selector,
    final_price: Selector,
    age_gate: Selector,
    glance: Selector,
    date: Selector,
    dev_row: Selector,
    link: Selector,
    tags: Selector,
    genres: Selector,
    review_counts: Selector,
}

fn compile(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {css:?}: {e}"))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

impl SteamSelectors {
    pub fn new() -> Result<Self> {
        Ok(Self {
            row: compile("a.search_result_row")?,
            title: compile("span.title")?,
            win: compile("span.platform_img.win")?,
            mac: compile("span.platform_img.mac")?,
            linux: compile("span.platform_img.linux")?,
            original_price: compile(".discount_original_price")?,
            final_price: compile(".discount_final_price")?,
            age_gate: compile("div.age_gate, #app_agegate")?,
            glance: compile("div.glance_ctn")?,
            date: compile("div.date")?,
            dev_row: compile("div.dev_row")?,
            link: compile("a")?,
            tags: compile(".glance_tags_ctn a")?,
            genres: compile("#genresAndManufacturer span a")?,
            review_counts: compile("#reviews_filter_options span.user_reviews_count")?,
        })
    }

    /// Parse the `results_html` fragment of one listing page.
    ///
    /// Returns the usable rows and the number of rows present on the page.
    pub fn parse_listing(&self, html: &str) -> (Vec<ListingRow>, u64) {
        let doc = Html::parse_fragment(html);
        let mut rows = Vec::new();
        let mut scanned = 0u64;
        for el in doc.select(&self.row) {
            scanned += 1;
            match self.listing_row(el) {
                Some(row) => rows.push(row),
                None => debug!(
                    href = el.value().attr("href").unwrap_or_default(),
                    "listing row without app id or price skipped"
                ),
            }
        }
        (rows, scanned)
    }

    fn listing_row(&self, el: ElementRef<'_>) -> Option<ListingRow> {
        let href = el.value().attr("href")?;
        let steam_id = el
            .value()
            .attr("data-ds-appid")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .or_else(|| app_id_from_link(href))?;
        let title = el.select(&self.title).next().map(text_of)?;
        let final_price = el
            .select(&self.final_price)
            .next()
            .map(text_of)
            .and_then(|t| parse_price(&t))?;
        let original_price = el
            .select(&self.original_price)
            .next()
            .map(text_of)
            .and_then(|t| parse_price(&t))
            .unwrap_or(final_price);
        Some(ListingRow {
            steam_id,
            title,
            link: href.to_string(),
            supports_win: el.select(&self.win).next().is_some(),
            supports_mac: el.select(&self.mac).next().is_some(),
            supports_linux: el.select(&self.linux).next().is_some(),
            price_wo_discount: original_price,
            price_w_discount: final_price,
        })
    }

    pub fn is_age_gate(&self, html: &str) -> bool {
        Html::parse_document(html).select(&self.age_gate).next().is_some()
    }

    /// Parse an app page. Fails when the "glance" block is missing, which is
    /// what Steam serves for region locks, removed apps and error pages.
    pub fn parse_detail(&self, html: &str) -> Result<DetailInfo> {
        let doc = Html::parse_document(html);
        let glance = doc
            .select(&self.glance)
            .next()
            .context("no glance block on app page")?;

        let mut detail = DetailInfo {
            release_date: glance
                .select(&self.date)
                .next()
                .map(text_of)
                .filter(|s| !s.is_empty()),
            ..DetailInfo::default()
        };

        // First dev_row lists developers, second publishers.
        let mut dev_rows = glance.select(&self.dev_row);
        if let Some(row) = dev_rows.next() {
            detail.attributes.developers = self.link_texts(row);
        }
        if let Some(row) = dev_rows.next() {
            detail.attributes.publishers = self.link_texts(row);
        }
        detail.attributes.tags = glance
            .select(&self.tags)
            .map(text_of)
            .filter(|t| !t.is_empty() && t != "+")
            .collect();
        detail.attributes.genres = doc
            .select(&self.genres)
            .map(text_of)
            .filter(|t| !t.is_empty())
            .collect();

        // "All reviews" count comes first, "Positive" second.
        let mut counts = doc
            .select(&self.review_counts)
            .map(|el| parse_count(&text_of(el)));
        if let (Some(total), Some(positive)) = (counts.next().flatten(), counts.next().flatten()) {
            detail.total_reviews = Some(total);
            detail.positive_reviews = Some(positive);
        }
        Ok(detail)
    }

    fn link_texts(&self, el: ElementRef<'_>) -> Vec<String> {
        el.select(&self.link)
            .map(text_of)
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// `https://store.steampowered.com/app/620/Portal_2/?snr=...` -> 620
pub fn app_id_from_link(href: &str) -> Option<i64> {
    let url = Url::parse(href).ok()?;
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "app")?;
    segments.next()?.parse().ok()
}

/// Store price text to a number. "Free" / "Free to Play" is 0.
///
/// Handles "$19.99", "19,99€", "1.234,56 zł" and "CDN$ 1,234.56".
pub fn parse_price(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.to_ascii_lowercase().starts_with("free") {
        return Some(0.0);
    }
    let kept: String = t
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let kept = kept.trim_matches(|c| c == ',' || c == '.');
    if kept.is_empty() {
        return None;
    }
    let normalized = match (kept.rfind(','), kept.rfind('.')) {
        (Some(c), Some(d)) if c > d => kept.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => kept.replace(',', ""),
        (Some(c), None) if kept.len() - c - 1 == 2 => kept.replace(',', "."),
        (Some(_), None) => kept.replace(',', ""),
        _ => kept.to_string(),
    };
    normalized.parse().ok()
}

/// "(1,234)" -> 1234
pub fn parse_count(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}
