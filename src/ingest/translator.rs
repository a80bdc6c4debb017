use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, instrument};

use crate::database_ops::attribute::{AttributeKind, AttributeNames};
use crate::database_ops::store::CatalogStore;
use crate::ingest::error::SyncError;

/// Name -> id dictionaries for all attribute kinds.
///
/// Loaded in full on construction and refreshed in full whenever a record
/// brings names that were not known yet.
#[derive(Debug, Default)]
pub struct IdentifierTranslator {
    dictionaries: HashMap<AttributeKind, HashMap<String, i64>>,
}

impl IdentifierTranslator {
    pub async fn load(store: &dyn CatalogStore) -> Result<Self> {
        let mut translator = Self::default();
        translator.reload(store).await?;
        info!(
            genres = translator.len(AttributeKind::Genre),
            tags = translator.len(AttributeKind::Tag),
            developers = translator.len(AttributeKind::Developer),
            publishers = translator.len(AttributeKind::Publisher),
            "attribute dictionaries loaded"
        );
        Ok(translator)
    }

    async fn reload(&mut self, store: &dyn CatalogStore) -> Result<()> {
        for kind in AttributeKind::ALL {
            let dict = store
                .load_attributes(kind)
                .await
                .with_context(|| format!("load {} dictionary", kind.table()))?;
            self.dictionaries.insert(kind, dict);
        }
        Ok(())
    }

    pub fn len(&self, kind: AttributeKind) -> usize {
        self.dictionaries.get(&kind).map_or(0, HashMap::len)
    }

    pub fn resolve(&self, kind: AttributeKind, name: &str) -> Option<i64> {
        self.dictionaries.get(&kind)?.get(name).copied()
    }

    /// Resolve every name of one kind. Duplicate names collapse.
    pub fn resolve_all(&self, kind: AttributeKind, names: &[String]) -> Result<BTreeSet<i64>, SyncError> {
        names
            .iter()
            .map(|name| {
                self.resolve(kind, name)
                    .ok_or_else(|| SyncError::TranslationGap {
                        kind,
                        name: name.clone(),
                    })
            })
            .collect()
    }

    /// Names referenced by `names` that have no id yet, per kind, deduplicated.
    pub fn missing(&self, names: &AttributeNames) -> Vec<(AttributeKind, Vec<String>)> {
        let mut out = Vec::new();
        for kind in AttributeKind::ALL {
            let mut seen = HashSet::new();
            let fresh: Vec<String> = names
                .get(kind)
                .iter()
                .filter(|n| self.resolve(kind, n).is_none() && seen.insert(n.as_str()))
                .cloned()
                .collect();
            if !fresh.is_empty() {
                out.push((kind, fresh));
            }
        }
        out
    }

    /// Register every unknown name of one record, one batch insert per kind.
    ///
    /// All dictionaries are then reloaded, so names another writer inserted
    /// since the last load (which conflict and insert nothing here) resolve
    /// too. Returns the number of rows this call inserted.
    #[instrument(skip(self, store, names))]
    pub async fn register_missing(
        &mut self,
        store: &dyn CatalogStore,
        names: &AttributeNames,
    ) -> Result<u64> {
        let missing = self.missing(names);
        if missing.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0;
        for (kind, fresh) in &missing {
            let n = store
                .insert_attributes(*kind, fresh)
                .await
                .with_context(|| format!("insert {} {:?}", kind.table(), fresh))?;
            debug!(%kind, requested = fresh.len(), inserted = n, "registered attribute names");
            inserted += n;
        }
        self.reload(store).await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;

    fn names(genres: &[&str], tags: &[&str]) -> AttributeNames {
        AttributeNames {
            genres: genres.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn registers_unknown_names_once() {
        let store = MemoryStore::new();
        let mut t = IdentifierTranslator::load(&store).await.unwrap();

        let first = names(&["Roguelike", "Action"], &["Indie"]);
        assert_eq!(t.register_missing(&store, &first).await.unwrap(), 3);
        let id = t.resolve(AttributeKind::Genre, "Roguelike").unwrap();

        let second = names(&["Roguelike"], &["Indie"]);
        assert_eq!(t.register_missing(&store, &second).await.unwrap(), 0);
        assert_eq!(t.resolve(AttributeKind::Genre, "Roguelike"), Some(id));
        assert_eq!(store.attribute_count(AttributeKind::Genre), 2);
        assert_eq!(store.stats().attribute_inserts, 2);
    }

    #[tokio::test]
    async fn names_are_case_sensitive() {
        let store = MemoryStore::new();
        let mut t = IdentifierTranslator::load(&store).await.unwrap();
        t.register_missing(&store, &names(&["RPG", "rpg"], &[]))
            .await
            .unwrap();
        assert_ne!(
            t.resolve(AttributeKind::Genre, "RPG"),
            t.resolve(AttributeKind::Genre, "rpg")
        );
    }

    #[tokio::test]
    async fn duplicate_names_in_one_record_are_inserted_once() {
        let store = MemoryStore::new();
        let mut t = IdentifierTranslator::load(&store).await.unwrap();
        let n = t
            .register_missing(&store, &names(&["Puzzle", "Puzzle"], &[]))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let ids = t
            .resolve_all(AttributeKind::Genre, &["Puzzle".into(), "Puzzle".into()])
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn picks_up_names_registered_by_another_writer() {
        let store = MemoryStore::new();
        let mut t = IdentifierTranslator::load(&store).await.unwrap();
        store
            .insert_attributes(AttributeKind::Tag, &["Co-op".into()])
            .await
            .unwrap();
        assert_eq!(t.resolve(AttributeKind::Tag, "Co-op"), None);

        t.register_missing(&store, &names(&["Strategy"], &[]))
            .await
            .unwrap();
        assert!(t.resolve(AttributeKind::Tag, "Co-op").is_some());
    }

    #[tokio::test]
    async fn resolves_name_inserted_concurrently_with_no_new_rows() {
        let store = MemoryStore::new();
        let mut t = IdentifierTranslator::load(&store).await.unwrap();
        store
            .insert_attributes(AttributeKind::Genre, &["Roguelike".into()])
            .await
            .unwrap();

        let record = names(&["Roguelike"], &[]);
        assert_eq!(t.register_missing(&store, &record).await.unwrap(), 0);
        let ids = t
            .resolve_all(AttributeKind::Genre, &record.genres)
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.attribute_count(AttributeKind::Genre), 1);
    }

    #[test]
    fn unresolved_name_is_a_translation_gap() {
        let t = IdentifierTranslator::default();
        let err = t
            .resolve_all(AttributeKind::Developer, &["Valve".into()])
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
