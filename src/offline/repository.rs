//! Durable storage for the pending mutation list.
//!
//! The whole list is stored as one JSON array under a single key so status
//! displays can read it without going through the queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::mutation::PendingMutation;
use crate::db::Database;

/// Key holding the serialized list.
pub const QUEUE_KEY: &str = "pending-mutations";

/// Key holding the next id to hand out, so ids are never reused once the
/// list drains.
pub const SEQUENCE_KEY: &str = "pending-mutations-next-id";

/// Load/save of the full list and the id high-water mark. A missing list
/// loads as empty and a missing mark as 0; unreadable contents are an error.
pub trait QueueRepository: Send + Sync + 'static {
  fn load(&self) -> Result<Vec<PendingMutation>>;
  fn save(&self, mutations: &[PendingMutation]) -> Result<()>;
  fn load_next_id(&self) -> Result<u64>;
  fn save_next_id(&self, next_id: u64) -> Result<()>;
}

impl<T: QueueRepository + ?Sized> QueueRepository for Box<T> {
  fn load(&self) -> Result<Vec<PendingMutation>> {
    (**self).load()
  }

  fn save(&self, mutations: &[PendingMutation]) -> Result<()> {
    (**self).save(mutations)
  }

  fn load_next_id(&self) -> Result<u64> {
    (**self).load_next_id()
  }

  fn save_next_id(&self, next_id: u64) -> Result<()> {
    (**self).save_next_id(next_id)
  }
}

impl<T: QueueRepository + ?Sized> QueueRepository for Arc<T> {
  fn load(&self) -> Result<Vec<PendingMutation>> {
    (**self).load()
  }

  fn save(&self, mutations: &[PendingMutation]) -> Result<()> {
    (**self).save(mutations)
  }

  fn load_next_id(&self) -> Result<u64> {
    (**self).load_next_id()
  }

  fn save_next_id(&self, next_id: u64) -> Result<()> {
    (**self).save_next_id(next_id)
  }
}

fn parse_next_id(raw: &str, source: &str) -> Result<u64> {
  raw
    .trim()
    .parse()
    .map_err(|e| eyre!("Failed to parse mutation id mark in {}: {}", source, e))
}

fn decode(raw: &str, source: &str) -> Result<Vec<PendingMutation>> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse mutation queue in {}: {}", source, e))
}

fn encode(mutations: &[PendingMutation]) -> Result<String> {
  serde_json::to_string(mutations).map_err(|e| eyre!("Failed to serialize mutation queue: {}", e))
}

/// Queue list in the `kv` table of the shared database.
pub struct SqliteQueueRepository {
  db: Arc<Database>,
}

impl SqliteQueueRepository {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl SqliteQueueRepository {
  fn read(&self, key: &str) -> Result<Option<String>> {
    let conn = self.db.lock()?;

    conn
      .query_row(
        "SELECT value FROM kv WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.db.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }
}

impl QueueRepository for SqliteQueueRepository {
  fn load(&self) -> Result<Vec<PendingMutation>> {
    match self.read(QUEUE_KEY)? {
      Some(raw) => decode(&raw, "database"),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, mutations: &[PendingMutation]) -> Result<()> {
    self.write(QUEUE_KEY, &encode(mutations)?)
  }

  fn load_next_id(&self) -> Result<u64> {
    match self.read(SEQUENCE_KEY)? {
      Some(raw) => parse_next_id(&raw, "database"),
      None => Ok(0),
    }
  }

  fn save_next_id(&self, next_id: u64) -> Result<()> {
    self.write(SEQUENCE_KEY, &next_id.to_string())
  }
}

/// Queue list in a standalone JSON file, with the id mark in a `.seq`
/// file beside it.
pub struct JsonFileRepository {
  path: PathBuf,
}

impl JsonFileRepository {
  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }

  fn sequence_path(&self) -> PathBuf {
    self.path.with_extension("seq")
  }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
  if !path.exists() {
    return Ok(None);
  }

  std::fs::read_to_string(path)
    .map(Some)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))
}

// Write-then-rename so a crash never leaves a half-written file behind
fn replace_file(path: &Path, contents: &str) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
  }

  let mut tmp = path.as_os_str().to_owned();
  tmp.push(".tmp");
  let tmp = PathBuf::from(tmp);
  std::fs::write(&tmp, contents)
    .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
  std::fs::rename(&tmp, path)
    .map_err(|e| eyre!("Failed to replace {}: {}", path.display(), e))?;

  Ok(())
}

impl QueueRepository for JsonFileRepository {
  fn load(&self) -> Result<Vec<PendingMutation>> {
    match read_optional(&self.path)? {
      Some(contents) => decode(&contents, &self.path.display().to_string()),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, mutations: &[PendingMutation]) -> Result<()> {
    replace_file(&self.path, &encode(mutations)?)
  }

  fn load_next_id(&self) -> Result<u64> {
    let path = self.sequence_path();
    match read_optional(&path)? {
      Some(raw) => parse_next_id(&raw, &path.display().to_string()),
      None => Ok(0),
    }
  }

  fn save_next_id(&self, next_id: u64) -> Result<()> {
    replace_file(&self.sequence_path(), &next_id.to_string())
  }
}

/// Process-local repository holding the raw JSON, like the real backends.
#[derive(Default)]
pub struct MemoryQueueRepository {
  raw: Mutex<Option<String>>,
  next_id: Mutex<u64>,
}

impl MemoryQueueRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start from arbitrary stored text, e.g. to simulate corruption.
  pub fn with_raw(raw: impl Into<String>) -> Self {
    Self {
      raw: Mutex::new(Some(raw.into())),
      ..Self::default()
    }
  }

  pub fn raw(&self) -> Option<String> {
    self.raw.lock().ok().and_then(|raw| raw.clone())
  }
}

impl QueueRepository for MemoryQueueRepository {
  fn load(&self) -> Result<Vec<PendingMutation>> {
    match self.raw() {
      Some(raw) => decode(&raw, "memory"),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, mutations: &[PendingMutation]) -> Result<()> {
    let raw = encode(mutations)?;
    *self.raw.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = Some(raw);
    Ok(())
  }

  fn load_next_id(&self) -> Result<u64> {
    Ok(*self.next_id.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?)
  }

  fn save_next_id(&self, next_id: u64) -> Result<()> {
    *self.next_id.lock().map_err(|e| eyre!("Lock poisoned: {}", e))? = next_id;
    Ok(())
  }
}
