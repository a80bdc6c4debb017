use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::database_ops::attribute::AttributeKind;
use crate::database_ops::store::{AssociationDelta, CatalogStore};
use crate::ingest::error::SyncError;
use crate::ingest::record::RawRecord;
use crate::ingest::snapshot::AssociationSnapshot;
use crate::ingest::translator::IdentifierTranslator;

/// What one successful `sync_item` call wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub game_id: i64,
    pub added: usize,
    pub removed: usize,
    pub price_appended: bool,
}

/// Applies one scraped record to storage as a minimal delta.
pub struct DiffSyncEngine {
    store: Arc<dyn CatalogStore>,
}

impl DiffSyncEngine {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Upsert the game row, reconcile the four link tables against the
    /// snapshot, then record the price if it moved.
    ///
    /// The caller must have run `register_missing` for this record first.
    /// The snapshot is only updated for kinds whose delta reached storage, so
    /// a failure halfway leaves it consistent with the link tables.
    #[instrument(skip_all, fields(steam_id = record.steam_id))]
    pub async fn sync_item(
        &self,
        translator: &IdentifierTranslator,
        snapshot: &mut AssociationSnapshot,
        record: &RawRecord,
    ) -> Result<SyncReport, SyncError> {
        let steam_id = record.steam_id;

        // Resolve before touching storage so a gap never leaves a half-written game.
        let mut wanted: Vec<(AttributeKind, BTreeSet<i64>)> = Vec::with_capacity(4);
        for kind in AttributeKind::ALL {
            wanted.push((kind, translator.resolve_all(kind, record.attributes.get(kind))?));
        }

        let game_id = self
            .store
            .upsert_game(&record.to_upsert())
            .await
            .map_err(|e| SyncError::storage("upsert_game", steam_id, e))?;

        let mut report = SyncReport {
            game_id,
            ..SyncReport::default()
        };

        for (kind, new_ids) in wanted {
            let delta = AssociationDelta::between(snapshot.get(game_id, kind), &new_ids);
            if !delta.is_empty() {
                self.store
                    .apply_association_delta(kind, game_id, &delta)
                    .await
                    .map_err(|e| {
                        SyncError::storage(
                            "apply_association_delta",
                            steam_id,
                            e.context(format!(
                                "{} game_id={game_id} add={:?} remove={:?}",
                                kind.link_table(),
                                delta.add,
                                delta.remove
                            )),
                        )
                    })?;
                report.added += delta.add.len();
                report.removed += delta.remove.len();
            }
            snapshot.put(game_id, kind, new_ids);
        }

        report.price_appended = self.sync_price(game_id, record).await?;
        debug!(
            game_id,
            added = report.added,
            removed = report.removed,
            price_appended = report.price_appended,
            "game synced"
        );
        Ok(report)
    }

    /// Append a price observation unless it equals the latest stored one.
    async fn sync_price(&self, game_id: i64, record: &RawRecord) -> Result<bool, SyncError> {
        let price = record.price();
        let latest = self
            .store
            .latest_price(game_id)
            .await
            .map_err(|e| SyncError::storage("latest_price", record.steam_id, e))?;
        if latest == Some(price) {
            return Ok(false);
        }
        self.store
            .append_price(game_id, price, Utc::now())
            .await
            .map_err(|e| {
                SyncError::storage(
                    "append_price",
                    record.steam_id,
                    e.context(format!("game_id={game_id} price={price:?}")),
                )
            })?;
        Ok(true)
    }
}
