use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::database_ops::attribute::AttributeNames;
use crate::database_ops::store::{GameUpsert, PricePoint};
use crate::normalization::release_date::parse_release_date;

/// One game as scraped from the store, before any id translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub steam_id: i64,
    pub title: String,
    pub link: String,
    /// Free-form text from the store page ("12 Mar, 2021", "Q3 2025", "Coming soon").
    pub release_date: Option<String>,
    pub supports_win: bool,
    pub supports_mac: bool,
    pub supports_linux: bool,
    pub positive_reviews: Option<i64>,
    pub total_reviews: Option<i64>,
    #[serde(flatten)]
    pub attributes: AttributeNames,
    pub price_wo_discount: f64,
    pub price_w_discount: f64,
}

impl RawRecord {
    /// Scalar row for the `games` upsert.
    ///
    /// Unparseable release dates become NULL. A review pair with
    /// `positive > total` (or a negative count) is dropped as a whole.
    pub fn to_upsert(&self) -> GameUpsert {
        let (positive_reviews, total_reviews) =
            match (self.positive_reviews, self.total_reviews) {
                (Some(p), Some(t)) if p >= 0 && t >= p => (Some(p), Some(t)),
                (None, None) => (None, None),
                (p, t) => {
                    warn!(
                        steam_id = self.steam_id,
                        positive = ?p,
                        total = ?t,
                        "inconsistent review counts; storing none"
                    );
                    (None, None)
                }
            };
        GameUpsert {
            steam_id: self.steam_id,
            title: self.title.clone(),
            link: self.link.clone(),
            release_date: self.release_date.as_deref().and_then(parse_release_date),
            supports_win: self.supports_win,
            supports_mac: self.supports_mac,
            supports_linux: self.supports_linux,
            positive_reviews,
            total_reviews,
        }
    }

    pub fn price(&self) -> PricePoint {
        PricePoint::new(self.price_wo_discount, self.price_w_discount)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Minimal record with the given attribute names.
    pub fn record(steam_id: i64, genres: &[&str], tags: &[&str]) -> RawRecord {
        RawRecord {
            steam_id,
            title: format!("Game {steam_id}"),
            link: format!("https://store.steampowered.com/app/{steam_id}/"),
            release_date: Some("12 Mar, 2021".into()),
            supports_win: true,
            supports_mac: false,
            supports_linux: true,
            positive_reviews: Some(90),
            total_reviews: Some(100),
            attributes: AttributeNames {
                genres: genres.iter().map(|s| s.to_string()).collect(),
                tags: tags.iter().map(|s| s.to_string()).collect(),
                developers: vec!["Studio".into()],
                publishers: vec!["Publisher".into()],
            },
            price_wo_discount: 19.99,
            price_w_discount: 9.99,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use chrono::NaiveDate;

    #[test]
    fn upsert_parses_release_date() {
        let row = record(10, &["Action"], &[]).to_upsert();
        assert_eq!(row.release_date, NaiveDate::from_ymd_opt(2021, 3, 12));
        assert_eq!(row.positive_reviews, Some(90));
        assert_eq!(row.total_reviews, Some(100));
    }

    #[test]
    fn unparseable_release_date_is_null() {
        let mut r = record(10, &[], &[]);
        r.release_date = Some("Coming soon".into());
        assert_eq!(r.to_upsert().release_date, None);
    }

    #[test]
    fn inconsistent_review_pair_is_dropped() {
        let mut r = record(10, &[], &[]);
        r.positive_reviews = Some(120);
        let row = r.to_upsert();
        assert_eq!((row.positive_reviews, row.total_reviews), (None, None));

        r.positive_reviews = None;
        let row = r.to_upsert();
        assert_eq!((row.positive_reviews, row.total_reviews), (None, None));
    }

    #[test]
    fn zero_reviews_are_kept() {
        let mut r = record(10, &[], &[]);
        r.positive_reviews = Some(0);
        r.total_reviews = Some(0);
        let row = r.to_upsert();
        assert_eq!((row.positive_reviews, row.total_reviews), (Some(0), Some(0)));
    }
}
