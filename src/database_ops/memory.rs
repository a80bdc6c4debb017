//! In-process `CatalogStore`.
//!
//! Backs `crawl --dry-run` and doubles as the storage fake in unit tests. It
//! keeps the same uniqueness rules as the Postgres schema (one id per name,
//! one row per `(game, attribute)` pair, one game per `steam_id`) and counts
//! the writes it receives so callers can check that no-op syncs stay no-ops.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use crate::database_ops::attribute::AttributeKind;
use crate::database_ops::store::{AssociationDelta, CatalogStore, GameUpsert, PricePoint};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredGame {
    pub game_id: i64,
    pub available: bool,
    pub row: GameUpsert,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredPrice {
    pub game_id: i64,
    pub price: PricePoint,
    pub observed_at: DateTime<Utc>,
}

/// Write counters, reset never.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub attribute_inserts: u64,
    pub association_writes: u64,
    pub price_appends: u64,
    pub unavailable_updates: u64,
}

#[derive(Default)]
struct State {
    next_attribute_id: i64,
    next_game_id: i64,
    attributes: HashMap<AttributeKind, HashMap<String, i64>>,
    links: HashMap<AttributeKind, HashMap<i64, BTreeSet<i64>>>,
    games: HashMap<i64, StoredGame>,
    prices: Vec<StoredPrice>,
    failing: HashSet<&'static str>,
    stats: WriteStats,
}

impl State {
    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(anyhow!("injected failure in {op}"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    /// Make every call of `op` (a `CatalogStore` method name) fail until cleared.
    pub fn fail_on(&self, op: &'static str) {
        if let Ok(mut s) = self.lock() {
            s.failing.insert(op);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut s) = self.lock() {
            s.failing.clear();
        }
    }

    /// Pre-existing game, as if synced by an earlier run.
    pub fn seed_game(&self, row: GameUpsert) -> i64 {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.next_game_id += 1;
        let game_id = s.next_game_id;
        s.games.insert(
            row.steam_id,
            StoredGame {
                game_id,
                available: true,
                row,
            },
        );
        game_id
    }

    pub fn game(&self, steam_id: i64) -> Option<StoredGame> {
        self.lock().ok()?.games.get(&steam_id).cloned()
    }

    /// Current linked ids for a game, empty when none.
    pub fn links(&self, kind: AttributeKind, game_id: i64) -> BTreeSet<i64> {
        self.lock()
            .ok()
            .and_then(|s| s.links.get(&kind).and_then(|m| m.get(&game_id)).cloned())
            .unwrap_or_default()
    }

    pub fn attribute_id(&self, kind: AttributeKind, name: &str) -> Option<i64> {
        self.lock()
            .ok()?
            .attributes
            .get(&kind)
            .and_then(|m| m.get(name))
            .copied()
    }

    pub fn attribute_count(&self, kind: AttributeKind) -> usize {
        self.lock()
            .map(|s| s.attributes.get(&kind).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn prices(&self, game_id: i64) -> Vec<StoredPrice> {
        self.lock()
            .map(|s| {
                s.prices
                    .iter()
                    .filter(|p| p.game_id == game_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> WriteStats {
        self.lock().map(|s| s.stats).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CatalogStore for MemoryStore {
    async fn load_attributes(&self, kind: AttributeKind) -> Result<HashMap<String, i64>> {
        let s = self.lock()?;
        s.check("load_attributes")?;
        Ok(s.attributes.get(&kind).cloned().unwrap_or_default())
    }

    async fn insert_attributes(&self, kind: AttributeKind, names: &[String]) -> Result<u64> {
        let mut s = self.lock()?;
        s.check("insert_attributes")?;
        let mut inserted = 0;
        for name in names {
            if s.attributes.get(&kind).is_some_and(|m| m.contains_key(name)) {
                continue;
            }
            s.next_attribute_id += 1;
            let id = s.next_attribute_id;
            s.attributes.entry(kind).or_default().insert(name.clone(), id);
            inserted += 1;
        }
        s.stats.attribute_inserts += 1;
        Ok(inserted)
    }

    async fn load_associations(
        &self,
        kind: AttributeKind,
    ) -> Result<HashMap<i64, BTreeSet<i64>>> {
        let s = self.lock()?;
        s.check("load_associations")?;
        let mut out = s.links.get(&kind).cloned().unwrap_or_default();
        out.retain(|_, ids| !ids.is_empty());
        Ok(out)
    }

    async fn upsert_game(&self, game: &GameUpsert) -> Result<i64> {
        let mut s = self.lock()?;
        s.check("upsert_game")?;
        if let Some(existing) = s.games.get_mut(&game.steam_id) {
            existing.row = game.clone();
            existing.available = true;
            return Ok(existing.game_id);
        }
        s.next_game_id += 1;
        let game_id = s.next_game_id;
        s.games.insert(
            game.steam_id,
            StoredGame {
                game_id,
                available: true,
                row: game.clone(),
            },
        );
        Ok(game_id)
    }

    async fn apply_association_delta(
        &self,
        kind: AttributeKind,
        game_id: i64,
        delta: &AssociationDelta,
    ) -> Result<()> {
        let mut s = self.lock()?;
        s.check("apply_association_delta")?;
        let linked = s.links.entry(kind).or_default().entry(game_id).or_default();
        linked.extend(delta.add.iter().copied());
        linked.retain(|id| !delta.remove.contains(id));
        s.stats.association_writes += 1;
        Ok(())
    }

    async fn latest_price(&self, game_id: i64) -> Result<Option<PricePoint>> {
        let s = self.lock()?;
        s.check("latest_price")?;
        Ok(s.prices
            .iter()
            .filter(|p| p.game_id == game_id)
            .max_by_key(|p| p.observed_at)
            .map(|p| p.price))
    }

    async fn append_price(
        &self,
        game_id: i64,
        price: PricePoint,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut s = self.lock()?;
        s.check("append_price")?;
        s.prices.push(StoredPrice {
            game_id,
            price,
            observed_at,
        });
        s.stats.price_appends += 1;
        Ok(())
    }

    async fn load_known_steam_ids(&self) -> Result<HashSet<i64>> {
        let s = self.lock()?;
        s.check("load_known_steam_ids")?;
        Ok(s.games.keys().copied().collect())
    }

    async fn mark_unavailable(&self, steam_ids: &[i64]) -> Result<u64> {
        let mut s = self.lock()?;
        s.check("mark_unavailable")?;
        let mut touched = 0;
        for steam_id in steam_ids {
            if let Some(g) = s.games.get_mut(steam_id) {
                g.available = false;
                touched += 1;
            }
        }
        s.stats.unavailable_updates += 1;
        Ok(touched)
    }
}
