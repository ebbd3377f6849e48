use dashmap::DashMap;

use quark_core::{Collection, KeyValueStore, StoreError};

/// Process-local store. Each collection is a sharded map, so writers to
/// different ids only contend when they hash to the same shard.
#[derive(Default)]
pub struct MemoryStore {
    services: DashMap<String, String>,
    modules: DashMap<String, String>,
    health: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, collection: Collection) -> &DashMap<String, String> {
        match collection {
            Collection::Services => &self.services,
            Collection::Modules => &self.modules,
            Collection::Health => &self.health,
        }
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.map(collection).len()
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|c| self.map(*c).is_empty())
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, collection: Collection, id: &str, document: &str) -> Result<(), StoreError> {
        self.map(collection).insert(id.to_string(), document.to_string());
        Ok(())
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map(collection).get(id).map(|doc| doc.value().clone()))
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        Ok(self.map(collection).remove(id).is_some())
    }

    fn update(
        &self,
        collection: Collection,
        id: &str,
        apply: &mut dyn FnMut(&str) -> Result<Option<String>, StoreError>,
    ) -> Result<bool, StoreError> {
        // The entry guard holds the shard lock, so a concurrent remove waits.
        let Some(mut entry) = self.map(collection).get_mut(id) else {
            return Ok(false);
        };
        if let Some(replacement) = apply(entry.value())? {
            *entry.value_mut() = replacement;
        }
        Ok(true)
    }

    fn all(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError> {
        let mut docs: Vec<(String, String)> = self
            .map(collection)
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(docs)
    }
}
