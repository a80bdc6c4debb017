use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::database_ops::attribute::AttributeKind;

/// Scalar columns of a `games` row written on every sync.
#[derive(Debug, Clone, PartialEq)]
pub struct GameUpsert {
    pub steam_id: i64,
    pub title: String,
    pub link: String,
    pub release_date: Option<NaiveDate>,
    pub supports_win: bool,
    pub supports_mac: bool,
    pub supports_linux: bool,
    pub positive_reviews: Option<i64>,
    pub total_reviews: Option<i64>,
}

/// One `(price without discount, price with discount)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price_wo_discount: f64,
    pub price_w_discount: f64,
}

impl PricePoint {
    /// Both values are rounded to cents, the precision `price_history` stores,
    /// so a value read back compares equal to the one written.
    pub fn new(price_wo_discount: f64, price_w_discount: f64) -> Self {
        Self {
            price_wo_discount: to_cents(price_wo_discount),
            price_w_discount: to_cents(price_w_discount),
        }
    }
}

fn to_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Rows to add to and remove from one link table for one game.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationDelta {
    pub add: BTreeSet<i64>,
    pub remove: BTreeSet<i64>,
}

impl AssociationDelta {
    /// Plain set difference between the last known ids and the new ones.
    pub fn between(old: &BTreeSet<i64>, new: &BTreeSet<i64>) -> Self {
        Self {
            add: new.difference(old).copied().collect(),
            remove: old.difference(new).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Storage backend consumed by the sync engine.
///
/// Writes must be idempotent at the statement level: re-applying the same
/// insert set may not create duplicates.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    /// Full `name -> id` dictionary for one kind.
    async fn load_attributes(&self, kind: AttributeKind) -> Result<HashMap<String, i64>>;

    /// Batch-insert new names; names that already exist are left alone.
    /// Returns the number of rows actually inserted.
    async fn insert_attributes(&self, kind: AttributeKind, names: &[String]) -> Result<u64>;

    /// Every current association of one kind, grouped by `game_id`.
    async fn load_associations(&self, kind: AttributeKind)
        -> Result<HashMap<i64, BTreeSet<i64>>>;

    /// Insert-or-update by `steam_id`, marking the game available. Returns `game_id`.
    async fn upsert_game(&self, game: &GameUpsert) -> Result<i64>;

    /// Apply one add/remove pair atomically.
    async fn apply_association_delta(
        &self,
        kind: AttributeKind,
        game_id: i64,
        delta: &AssociationDelta,
    ) -> Result<()>;

    async fn latest_price(&self, game_id: i64) -> Result<Option<PricePoint>>;

    async fn append_price(
        &self,
        game_id: i64,
        price: PricePoint,
        observed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// `steam_id` of every game stored so far.
    async fn load_known_steam_ids(&self) -> Result<HashSet<i64>>;

    /// Flag the given games unavailable in one statement. Returns rows touched.
    async fn mark_unavailable(&self, steam_ids: &[i64]) -> Result<u64>;
}
