use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

use quark_core::{Collection, KeyValueStore, StoreError};

/// Documents persisted in a single SQLite table keyed by `(collection, id)`.
///
/// One connection guarded by a mutex, so writes are serialized. Fine for the
/// hub's dataset (tens to low thousands of services).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &str) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_tables()?;
        Ok(db)
    }

    pub fn in_memory() -> SqlResult<Self> {
        Self::new(":memory:")
    }

    fn init_tables(&self) -> SqlResult<()> {
        self.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (collection, id)
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl KeyValueStore for SqliteStore {
    fn put(&self, collection: Collection, id: &str, document: &str) -> Result<(), StoreError> {
        self.lock()
            .execute(
                "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    body = excluded.body,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                params![collection.key(), id, document],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError> {
        self.lock()
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.key(), id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .lock()
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.key(), id],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }

    fn update(
        &self,
        collection: Collection,
        id: &str,
        apply: &mut dyn FnMut(&str) -> Result<Option<String>, StoreError>,
    ) -> Result<bool, StoreError> {
        // Held across read and write; every other call goes through the same lock.
        let conn = self.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.key(), id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let Some(current) = current else {
            return Ok(false);
        };

        if let Some(replacement) = apply(&current)? {
            conn.execute(
                "UPDATE documents SET body = ?3, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE collection = ?1 AND id = ?2",
                params![collection.key(), id, replacement],
            )
            .map_err(backend)?;
        }
        Ok(true)
    }

    fn all(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map([collection.key()], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(backend)?;

        rows.collect::<SqlResult<Vec<_>>>().map_err(backend)
    }
}
