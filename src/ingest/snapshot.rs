use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

use crate::database_ops::attribute::AttributeKind;
use crate::database_ops::store::CatalogStore;

static EMPTY: BTreeSet<i64> = BTreeSet::new();

/// Last known attribute ids per `(game_id, kind)` for the current run.
///
/// A derived view of the link tables: warmed with one bulk read per kind,
/// then kept in step with every delta the engine applies.
#[derive(Debug, Default)]
pub struct AssociationSnapshot {
    sets: HashMap<(i64, AttributeKind), BTreeSet<i64>>,
}

impl AssociationSnapshot {
    pub async fn warm(store: &dyn CatalogStore) -> Result<Self> {
        let mut snapshot = Self::default();
        for kind in AttributeKind::ALL {
            let grouped = store
                .load_associations(kind)
                .await
                .with_context(|| format!("load {}", kind.link_table()))?;
            for (game_id, ids) in grouped {
                snapshot.sets.insert((game_id, kind), ids);
            }
        }
        info!(entries = snapshot.sets.len(), "association snapshot warmed");
        Ok(snapshot)
    }

    /// Empty for a game never seen before.
    pub fn get(&self, game_id: i64, kind: AttributeKind) -> &BTreeSet<i64> {
        self.sets.get(&(game_id, kind)).unwrap_or(&EMPTY)
    }

    pub fn put(&mut self, game_id: i64, kind: AttributeKind, ids: BTreeSet<i64>) {
        self.sets.insert((game_id, kind), ids);
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::store::AssociationDelta;

    #[test]
    fn unseen_game_has_empty_sets() {
        let snapshot = AssociationSnapshot::default();
        assert!(snapshot.get(42, AttributeKind::Tag).is_empty());
    }

    #[test]
    fn put_overwrites_only_that_kind() {
        let mut snapshot = AssociationSnapshot::default();
        snapshot.put(1, AttributeKind::Genre, [1, 2].into());
        snapshot.put(1, AttributeKind::Tag, [9].into());
        snapshot.put(1, AttributeKind::Genre, [3].into());
        assert_eq!(snapshot.get(1, AttributeKind::Genre), &BTreeSet::from([3]));
        assert_eq!(snapshot.get(1, AttributeKind::Tag), &BTreeSet::from([9]));
    }

    #[tokio::test]
    async fn warm_groups_links_by_game_and_kind() {
        let store = MemoryStore::new();
        let delta = AssociationDelta {
            add: [10, 11].into(),
            remove: BTreeSet::new(),
        };
        store
            .apply_association_delta(AttributeKind::Developer, 7, &delta)
            .await
            .unwrap();

        let snapshot = AssociationSnapshot::warm(&store).await.unwrap();
        assert_eq!(
            snapshot.get(7, AttributeKind::Developer),
            &BTreeSet::from([10, 11])
        );
        assert!(snapshot.get(7, AttributeKind::Publisher).is_empty());
        assert_eq!(snapshot.len(), 1);
    }
}
