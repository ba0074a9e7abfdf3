//! Cache store trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::net::Response;

/// A cached response snapshot. Entries are immutable once written; a `put`
/// for an existing key replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub captured_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(response: &Response) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      captured_at: Utc::now(),
    }
  }

  pub fn into_response(self) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
    }
  }
}

/// Trait for cache storage backends.
///
/// Namespaces are flat string names; the registry layers versioning on top.
pub trait CacheStore: Send + Sync {
  /// Create a namespace if it does not exist yet.
  fn ensure(&self, namespace: &str) -> Result<()>;

  /// Write an entry, replacing any previous entry under the same key.
  fn put(&self, namespace: &str, key: &str, entry: &CacheEntry) -> Result<()>;

  /// Read an entry, `None` on miss.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Remove a single entry. No-op if absent.
  fn delete(&self, namespace: &str, key: &str) -> Result<()>;

  /// All namespace names currently present, including empty ones.
  fn list_namespaces(&self) -> Result<BTreeSet<String>>;

  /// Drop a namespace and all its entries. Idempotent; a no-op on unknown
  /// names.
  fn purge(&self, namespace: &str) -> Result<()>;
}

/// SQLite-backed cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL,
    PRIMARY KEY (namespace, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace
    ON cache_entries(namespace);
"#;

impl SqliteStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| EngineError::Storage(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      EngineError::Storage(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    // The retry queue holds its own connection to this file; wait out
    // writer contention instead of surfacing SQLITE_BUSY.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::Storage(format!("lock poisoned: {}", e)))
  }
}

impl CacheStore for SqliteStore {
  fn ensure(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![namespace],
    )?;
    Ok(())
  }

  fn put(&self, namespace: &str, key: &str, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)?;
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![namespace],
    )?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, entry_key, status, headers, body, captured_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        key,
        entry.status,
        headers,
        entry.body,
        entry.captured_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT status, headers, body, captured_at FROM cache_entries
       WHERE namespace = ? AND entry_key = ?",
    )?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![namespace, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, captured_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)?;
        let captured_at = parse_datetime(&captured_at)?;
        Ok(Some(CacheEntry {
          status,
          headers,
          body,
          captured_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM cache_entries WHERE namespace = ? AND entry_key = ?",
      params![namespace, key],
    )?;
    Ok(())
  }

  fn list_namespaces(&self) -> Result<BTreeSet<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM namespaces")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(names)
  }

  fn purge(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("BEGIN TRANSACTION", [])?;
    conn.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )?;
    conn.execute("DELETE FROM namespaces WHERE name = ?", params![namespace])?;
    conn.execute("COMMIT", [])?;
    Ok(())
  }
}

/// In-memory cache store. Backs tests and cache-disabled operation; contents
/// do not survive restarts.
#[derive(Default)]
pub struct MemoryStore {
  namespaces: Mutex<BTreeMap<String, BTreeMap<String, CacheEntry>>>,
}

type NamespaceMap = BTreeMap<String, BTreeMap<String, CacheEntry>>;

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, NamespaceMap>> {
    self
      .namespaces
      .lock()
      .map_err(|e| EngineError::Storage(format!("lock poisoned: {}", e)))
  }
}

impl CacheStore for MemoryStore {
  fn ensure(&self, namespace: &str) -> Result<()> {
    self.lock()?.entry(namespace.to_string()).or_default();
    Ok(())
  }

  fn put(&self, namespace: &str, key: &str, entry: &CacheEntry) -> Result<()> {
    self
      .lock()?
      .entry(namespace.to_string())
      .or_default()
      .insert(key.to_string(), entry.clone());
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    if let Some(entries) = self.lock()?.get_mut(namespace) {
      entries.remove(key);
    }
    Ok(())
  }

  fn list_namespaces(&self) -> Result<BTreeSet<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn purge(&self, namespace: &str) -> Result<()> {
    self.lock()?.remove(namespace);
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp stored in an entry row.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| EngineError::Storage(format!("failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(body: &[u8]) -> CacheEntry {
    CacheEntry {
      status: 200,
      headers: vec![("content-type".into(), "text/plain".into())],
      body: body.to_vec(),
      captured_at: Utc::now(),
    }
  }

  fn exercise_store(store: &dyn CacheStore) {
    store.ensure("static-v1").unwrap();
    assert!(store.list_namespaces().unwrap().contains("static-v1"));

    // Miss before write
    assert!(store.get("static-v1", "k1").unwrap().is_none());

    // Write, read back
    store.put("static-v1", "k1", &entry(b"hello")).unwrap();
    let got = store.get("static-v1", "k1").unwrap().unwrap();
    assert_eq!(got.status, 200);
    assert_eq!(got.body, b"hello");
    assert_eq!(got.headers[0].0, "content-type");

    // Replace, not mutate
    store.put("static-v1", "k1", &entry(b"replaced")).unwrap();
    let got = store.get("static-v1", "k1").unwrap().unwrap();
    assert_eq!(got.body, b"replaced");

    // Delete
    store.delete("static-v1", "k1").unwrap();
    assert!(store.get("static-v1", "k1").unwrap().is_none());

    // put creates the namespace implicitly
    store.put("api-v1", "k2", &entry(b"x")).unwrap();
    assert!(store.list_namespaces().unwrap().contains("api-v1"));

    // Purge drops entries and the name
    store.purge("api-v1").unwrap();
    assert!(!store.list_namespaces().unwrap().contains("api-v1"));
    assert!(store.get("api-v1", "k2").unwrap().is_none());

    // Purge is idempotent and safe on unknown names
    store.purge("api-v1").unwrap();
    store.purge("never-existed").unwrap();
  }

  #[test]
  fn sqlite_store_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    exercise_store(&store);
  }

  #[test]
  fn memory_store_round_trip() {
    let store = MemoryStore::new();
    exercise_store(&store);
  }

  #[test]
  fn sqlite_preserves_capture_timestamp() {
    let store = SqliteStore::open_in_memory().unwrap();
    let e = entry(b"body");
    store.put("ns", "k", &e).unwrap();
    let got = store.get("ns", "k").unwrap().unwrap();
    // RFC 3339 round trip is second-precise or better
    assert!((got.captured_at - e.captured_at).num_seconds().abs() <= 1);
  }
}
