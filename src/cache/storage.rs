//! Cache storage trait plus in-memory and SQLite implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::http::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores. A store springs into existence
/// on its first `put` and only goes away through `delete_store`.
pub trait CacheStorage: Send + Sync + 'static {
  /// Names of every store currently present.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Drop a store and all its entries. Returns whether it existed.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Look up an entry by request key.
  fn get(&self, store: &str, key: &str) -> Result<Option<Response>>;

  /// Insert or overwrite an entry.
  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()>;
}

impl<S: CacheStorage> CacheStorage for Arc<S> {
  fn store_names(&self) -> Result<Vec<String>> {
    (**self).store_names()
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    (**self).delete_store(name)
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<Response>> {
    (**self).get(store, key)
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    (**self).put(store, key, response)
  }
}

/// Process-local storage; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<BTreeMap<String, HashMap<String, Response>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn stores(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, HashMap<String, Response>>>> {
    self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn store_names(&self) -> Result<Vec<String>> {
    Ok(self.stores()?.keys().cloned().collect())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    Ok(self.stores()?.remove(name).is_some())
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<Response>> {
    Ok(
      self
        .stores()?
        .get(store)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    self
      .stores()?
      .entry(store.to_string())
      .or_default()
      .insert(key.to_string(), response.clone());
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

/// SHA256 of the request key for stable, fixed-length primary keys.
fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

impl CacheStorage for SqliteStorage {
  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, store: &str, key: &str) -> Result<Option<Response>> {
    let conn = self.db.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE store_name = ? AND key_hash = ?",
        params![store, key_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to parse cached headers for {}: {}", key, e))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &str, key: &str, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (store_name, key_hash, request_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![store, key_hash(key), key, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(storage: &dyn CacheStorage) {
    assert!(storage.store_names().unwrap().is_empty());
    assert_eq!(storage.get("static-v1", "GET /a").unwrap(), None);

    let response = Response::ok("hello").with_header("content-type", "text/plain");
    storage.put("static-v1", "GET /a", &response).unwrap();
    storage.put("api-v1", "GET /api/x", &Response::ok("{}")).unwrap();

    assert_eq!(storage.get("static-v1", "GET /a").unwrap(), Some(response));
    // Same key in another store is a different entry
    assert_eq!(storage.get("api-v1", "GET /a").unwrap(), None);
    assert_eq!(
      storage.store_names().unwrap(),
      vec!["api-v1".to_string(), "static-v1".to_string()]
    );

    storage
      .put("static-v1", "GET /a", &Response::ok("replaced"))
      .unwrap();
    assert_eq!(
      storage.get("static-v1", "GET /a").unwrap().unwrap().body,
      b"replaced".to_vec()
    );

    assert!(storage.delete_store("static-v1").unwrap());
    assert!(!storage.delete_store("static-v1").unwrap());
    assert_eq!(storage.get("static-v1", "GET /a").unwrap(), None);
    assert_eq!(storage.store_names().unwrap(), vec!["api-v1".to_string()]);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    exercise(&SqliteStorage::new(db));
  }

  #[test]
  fn test_sqlite_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::new(Arc::new(Database::open_at(&path).unwrap()));
      storage
        .put("static-v2", "GET http://app.test/logo.png", &Response::ok(vec![0u8, 159, 146, 150]))
        .unwrap();
    }

    let storage = SqliteStorage::new(Arc::new(Database::open_at(&path).unwrap()));
    let cached = storage
      .get("static-v2", "GET http://app.test/logo.png")
      .unwrap()
      .unwrap();
    assert_eq!(cached.body, vec![0u8, 159, 146, 150]);
  }
}
