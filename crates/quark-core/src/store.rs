use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StoreError;

/// The three independent keyed collections the hub persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Services,
    Modules,
    Health,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Services, Collection::Modules, Collection::Health];

    pub fn key(&self) -> &'static str {
        match self {
            Collection::Services => "quark:services",
            Collection::Modules => "quark:modules",
            Collection::Health => "quark:health",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A shared map of JSON documents addressed by `(collection, id)`.
///
/// Every call is a single-key operation. There are no multi-key transactions;
/// a separate `get` then `put` races under last-write-wins, so in-place edits
/// go through `update`.
/// Writes for different ids must not block each other.
pub trait KeyValueStore: Send + Sync {
    fn put(&self, collection: Collection, id: &str, document: &str) -> Result<(), StoreError>;
    fn get(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError>;
    /// Returns whether a document was removed.
    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError>;
    fn all(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError>;
    /// Rewrites an existing document in place. `apply` receives the current
    /// body and returns the replacement, or `None` to keep it. Runs atomically
    /// with respect to `delete`, and never creates a document. Returns whether
    /// the document existed.
    fn update(
        &self,
        collection: Collection,
        id: &str,
        apply: &mut dyn FnMut(&str) -> Result<Option<String>, StoreError>,
    ) -> Result<bool, StoreError>;
}

/// Typed JSON access on top of any [`KeyValueStore`].
pub trait DocumentStore {
    fn put_doc<T: Serialize>(&self, collection: Collection, id: &str, value: &T) -> Result<(), StoreError>;
    fn get_doc<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Result<Option<T>, StoreError>;
    fn all_docs<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StoreError>;
    /// Read-modify-write of an existing document. `modify` returns whether it
    /// changed anything; unchanged documents are not written back. Returns the
    /// resulting document, or `None` if the id is absent.
    fn update_doc<T, F>(&self, collection: Collection, id: &str, modify: F) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool;
}

impl<S: KeyValueStore + ?Sized> DocumentStore for S {
    fn put_doc<T: Serialize>(&self, collection: Collection, id: &str, value: &T) -> Result<(), StoreError> {
        let document = encode(collection, id, value)?;
        self.put(collection, id, &document)
    }

    fn get_doc<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Result<Option<T>, StoreError> {
        match self.get(collection, id)? {
            Some(document) => decode(collection, id, &document).map(Some),
            None => Ok(None),
        }
    }

    fn all_docs<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StoreError> {
        self.all(collection)?
            .iter()
            .map(|(id, document)| decode(collection, id, document))
            .collect()
    }

    fn update_doc<T, F>(&self, collection: Collection, id: &str, modify: F) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let mut modify = Some(modify);
        let mut updated = None;
        self.update(collection, id, &mut |document: &str| {
            let mut value: T = decode(collection, id, document)?;
            let changed = modify.take().is_some_and(|modify| modify(&mut value));
            let replacement = if changed { Some(encode(collection, id, &value)?) } else { None };
            updated = Some(value);
            Ok(replacement)
        })?;
        Ok(updated)
    }
}

fn encode<T: Serialize>(collection: Collection, id: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Corrupt {
        collection,
        id: id.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(collection: Collection, id: &str, document: &str) -> Result<T, StoreError> {
    serde_json::from_str(document).map_err(|source| StoreError::Corrupt {
        collection,
        id: id.to_string(),
        source,
    })
}
