//! Durable retry queue for failed mutating requests.
//!
//! Tasks are persisted in SQLite in enqueue order and replayed FIFO by
//! `drain`. A task is removed only after a confirmed successful replay, or
//! once its attempt count reaches the ceiling (surfaced to the caller as an
//! abandoned task, never dropped silently).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{EngineError, Result};
use crate::net::{Method, Request, Transport};

/// A persisted, replayable record of a failed mutating request.
#[derive(Debug, Clone)]
pub struct RetryTask {
  pub id: i64,
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
}

impl RetryTask {
  fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url)
      .map_err(|e| EngineError::Replay(format!("task {} has malformed url: {}", self.id, e)))?;
    Ok(Request {
      method: self.method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
      navigation: false,
    })
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
  pub succeeded: u32,
  pub failed_permanently: u32,
  /// Tasks still queued after the pass (failures below the ceiling plus any
  /// tasks enqueued during the pass).
  pub remaining: u32,
  /// The tasks that hit the ceiling this pass, for event emission.
  pub abandoned: Vec<RetryTask>,
}

/// Bounds for the queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
  /// Replay attempts per task before it is abandoned.
  pub max_attempts: u32,
  /// Queue length bound; on overflow the oldest task is evicted (and
  /// reported back so the eviction is loud).
  pub max_tasks: u32,
}

impl Default for QueueLimits {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      max_tasks: 1000,
    }
  }
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS retry_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite-backed FIFO retry queue.
pub struct RetryQueue {
  conn: Mutex<Connection>,
  limits: QueueLimits,
}

impl RetryQueue {
  /// Open or create the queue at the given path.
  pub fn open(path: &Path, limits: QueueLimits) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| EngineError::Storage(format!("failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      EngineError::Storage(format!(
        "failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;
    // The cache store holds its own connection to this file; wait out
    // writer contention instead of surfacing SQLITE_BUSY.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    Self::with_connection(conn, limits)
  }

  /// Open an in-memory queue, used by tests.
  pub fn open_in_memory(limits: QueueLimits) -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?, limits)
  }

  fn with_connection(conn: Connection, limits: QueueLimits) -> Result<Self> {
    let queue = Self {
      conn: Mutex::new(conn),
      limits,
    };
    queue.lock()?.execute_batch(QUEUE_SCHEMA)?;
    Ok(queue)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::Storage(format!("lock poisoned: {}", e)))
  }

  /// Append a failed mutation. Never overwrites an existing task. If the
  /// queue is at its bound, the oldest task is evicted and returned so the
  /// caller can surface it as a permanent failure.
  pub fn enqueue(&self, request: &Request) -> Result<Option<RetryTask>> {
    let headers = serde_json::to_string(&request.headers)?;
    let evicted = {
      let conn = self.lock()?;
      let len: u32 = conn.query_row("SELECT COUNT(*) FROM retry_queue", [], |row| row.get(0))?;
      let evicted = if len >= self.limits.max_tasks {
        let oldest = read_task(
          &conn,
          "SELECT id, method, url, headers, body, enqueued_at, attempts
           FROM retry_queue ORDER BY id LIMIT 1",
        )?;
        if let Some(task) = &oldest {
          conn.execute("DELETE FROM retry_queue WHERE id = ?", params![task.id])?;
          warn!(url = %task.url, "retry queue full, evicting oldest task");
        }
        oldest
      } else {
        None
      };

      conn.execute(
        "INSERT INTO retry_queue (method, url, headers, body, enqueued_at, attempts)
         VALUES (?, ?, ?, ?, ?, 0)",
        params![
          request.method.as_str(),
          request.url.as_str(),
          headers,
          request.body,
          Utc::now().to_rfc3339()
        ],
      )?;
      evicted
    };
    Ok(evicted)
  }

  /// Number of queued tasks.
  pub fn len(&self) -> Result<u32> {
    let conn = self.lock()?;
    Ok(conn.query_row("SELECT COUNT(*) FROM retry_queue", [], |row| row.get(0))?)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// FIFO snapshot of queued tasks.
  pub fn tasks(&self) -> Result<Vec<RetryTask>> {
    let conn = self.lock()?;
    read_tasks(
      &conn,
      "SELECT id, method, url, headers, body, enqueued_at, attempts
       FROM retry_queue ORDER BY id",
      [],
    )
  }

  /// Replay queued tasks in FIFO order.
  ///
  /// Processes a snapshot fenced at the highest id present when the pass
  /// starts; tasks enqueued mid-drain wait for the next pass. Serialization
  /// against concurrent drains is the caller's job (the engine ignores
  /// overlapping drain triggers).
  pub async fn drain(&self, transport: &dyn Transport) -> Result<DrainReport> {
    let snapshot = self.tasks()?;
    let mut report = DrainReport::default();

    for task in snapshot {
      let request = match task.to_request() {
        Ok(request) => request,
        Err(err) => {
          // Malformed tasks can never succeed; abandon immediately
          warn!(id = task.id, "{}", err);
          self.remove(task.id)?;
          report.failed_permanently += 1;
          report.abandoned.push(task);
          continue;
        }
      };

      match transport.fetch(&request).await {
        Ok(response) if response.is_success() => {
          self.remove(task.id)?;
          report.succeeded += 1;
          debug!(url = %task.url, "replayed queued mutation");
        }
        _ => {
          let attempts = task.attempts + 1;
          if attempts >= self.limits.max_attempts {
            self.remove(task.id)?;
            warn!(
              "{}",
              EngineError::PermanentFailure {
                url: task.url.clone(),
                attempts,
              }
            );
            report.failed_permanently += 1;
            report.abandoned.push(RetryTask { attempts, ..task });
          } else {
            self.bump_attempts(task.id, attempts)?;
          }
        }
      }
    }

    report.remaining = self.len()?;
    Ok(report)
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM retry_queue WHERE id = ?", params![id])?;
    Ok(())
  }

  fn bump_attempts(&self, id: i64, attempts: u32) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE retry_queue SET attempts = ? WHERE id = ?",
      params![attempts, id],
    )?;
    Ok(())
  }
}

fn read_task(conn: &Connection, sql: &str) -> Result<Option<RetryTask>> {
  let tasks = read_tasks(conn, sql, [])?;
  Ok(tasks.into_iter().next())
}

fn read_tasks(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<RetryTask>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map(params, |row| {
    Ok((
      row.get::<_, i64>(0)?,
      row.get::<_, String>(1)?,
      row.get::<_, String>(2)?,
      row.get::<_, String>(3)?,
      row.get::<_, Option<Vec<u8>>>(4)?,
      row.get::<_, String>(5)?,
      row.get::<_, u32>(6)?,
    ))
  })?;

  let mut tasks = Vec::new();
  for row in rows {
    let (id, method, url, headers, body, enqueued_at, attempts) = row?;
    let method = Method::parse(&method)
      .ok_or_else(|| EngineError::Storage(format!("task {} has unknown method {}", id, method)))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)?;
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| EngineError::Storage(format!("task {} has malformed timestamp: {}", id, e)))?;
    tasks.push(RetryTask {
      id,
      method,
      url,
      headers,
      body,
      enqueued_at,
      attempts,
    });
  }
  Ok(tasks)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::FakeTransport;
  use crate::net::Response;

  fn post(url: &str, body: &[u8]) -> Request {
    Request {
      method: Method::Post,
      url: Url::parse(url).unwrap(),
      headers: vec![("content-type".into(), "application/json".into())],
      body: Some(body.to_vec()),
      navigation: false,
    }
  }

  fn queue() -> RetryQueue {
    RetryQueue::open_in_memory(QueueLimits::default()).unwrap()
  }

  #[test]
  fn enqueue_preserves_fifo_order_and_payload() {
    let q = queue();
    q.enqueue(&post("https://app.example.com/api/orders", b"{\"n\":1}"))
      .unwrap();
    q.enqueue(&post("https://app.example.com/api/orders", b"{\"n\":2}"))
      .unwrap();

    let tasks = q.tasks().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks[0].id < tasks[1].id);
    assert_eq!(tasks[0].body.as_deref(), Some(&b"{\"n\":1}"[..]));
    assert_eq!(tasks[0].method, Method::Post);
    assert_eq!(tasks[0].attempts, 0);
    assert_eq!(tasks[0].headers[0].0, "content-type");
  }

  #[tokio::test]
  async fn drain_removes_only_the_task_that_succeeds() {
    let q = queue();
    q.enqueue(&post("https://app.example.com/api/a", b"1")).unwrap();
    q.enqueue(&post("https://app.example.com/api/b", b"2")).unwrap();
    q.enqueue(&post("https://app.example.com/api/c", b"3")).unwrap();

    // Network only lets task #2 through
    let transport = FakeTransport::new();
    transport.respond("https://app.example.com/api/b", Response::new(201, vec![]));

    let report = q.drain(&transport).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed_permanently, 0);
    assert_eq!(report.remaining, 2);

    let tasks = q.tasks().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].url, "https://app.example.com/api/a");
    assert_eq!(tasks[1].url, "https://app.example.com/api/c");
    assert_eq!(tasks[0].attempts, 1);
    assert_eq!(tasks[1].attempts, 1);
  }

  #[tokio::test]
  async fn drain_report_counts_add_up() {
    let q = queue();
    q.enqueue(&post("https://app.example.com/api/a", b"1")).unwrap();
    q.enqueue(&post("https://app.example.com/api/b", b"2")).unwrap();
    q.enqueue(&post("https://app.example.com/api/c", b"3")).unwrap();

    let transport = FakeTransport::new();
    transport.respond("https://app.example.com/api/a", Response::new(200, vec![]));

    let report = q.drain(&transport).await.unwrap();
    // remaining == enqueued - succeeded - permanently failed
    assert_eq!(
      report.remaining,
      3 - report.succeeded - report.failed_permanently
    );
  }

  #[tokio::test]
  async fn task_is_abandoned_at_the_attempt_ceiling() {
    let q = RetryQueue::open_in_memory(QueueLimits {
      max_attempts: 2,
      max_tasks: 1000,
    })
    .unwrap();
    q.enqueue(&post("https://app.example.com/api/orders", b"x"))
      .unwrap();

    let transport = FakeTransport::new();

    // First failure is retained
    let report = q.drain(&transport).await.unwrap();
    assert_eq!(report.failed_permanently, 0);
    assert_eq!(report.remaining, 1);
    assert_eq!(q.tasks().unwrap()[0].attempts, 1);

    // Second failure hits the ceiling
    let report = q.drain(&transport).await.unwrap();
    assert_eq!(report.failed_permanently, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].attempts, 2);
    assert!(q.is_empty().unwrap());
  }

  #[tokio::test]
  async fn drain_on_empty_queue_is_a_no_op() {
    let q = queue();
    let transport = FakeTransport::new();

    let report = q.drain(&transport).await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed_permanently, 0);
    assert_eq!(report.remaining, 0);
    assert_eq!(transport.fetch_count(), 0);

    // Back-to-back drains stay no-ops
    let report = q.drain(&transport).await.unwrap();
    assert_eq!(report.remaining, 0);
  }

  #[tokio::test]
  async fn replay_failure_counts_non_2xx_as_failed() {
    let q = queue();
    q.enqueue(&post("https://app.example.com/api/orders", b"x"))
      .unwrap();

    let transport = FakeTransport::new();
    transport.respond(
      "https://app.example.com/api/orders",
      Response::new(500, vec![]),
    );

    let report = q.drain(&transport).await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.remaining, 1);
    assert_eq!(q.tasks().unwrap()[0].attempts, 1);
  }

  #[test]
  fn shares_a_database_file_with_the_cache_store() {
    use crate::cache::{CacheEntry, CacheStore, SqliteStore};

    let dir = std::env::temp_dir().join(format!("offsync-queue-test-{}", std::process::id()));
    let path = dir.join("offsync.db");
    let store = SqliteStore::open(&path).unwrap();
    let q = RetryQueue::open(&path, QueueLimits::default()).unwrap();

    // Interleaved writes over the two connections to the same file
    let entry = CacheEntry {
      status: 200,
      headers: Vec::new(),
      body: b"x".to_vec(),
      captured_at: Utc::now(),
    };
    store.put("static-v1", "k1", &entry).unwrap();
    q.enqueue(&post("https://app.example.com/api/orders", b"1"))
      .unwrap();
    store.put("static-v1", "k2", &entry).unwrap();

    assert_eq!(q.len().unwrap(), 1);
    assert!(store.get("static-v1", "k1").unwrap().is_some());

    drop(store);
    drop(q);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn overflow_evicts_the_oldest_task() {
    let q = RetryQueue::open_in_memory(QueueLimits {
      max_attempts: 5,
      max_tasks: 2,
    })
    .unwrap();

    assert!(q
      .enqueue(&post("https://app.example.com/api/1", b"1"))
      .unwrap()
      .is_none());
    assert!(q
      .enqueue(&post("https://app.example.com/api/2", b"2"))
      .unwrap()
      .is_none());

    let evicted = q
      .enqueue(&post("https://app.example.com/api/3", b"3"))
      .unwrap()
      .expect("oldest task should be evicted");
    assert_eq!(evicted.url, "https://app.example.com/api/1");

    let tasks = q.tasks().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].url, "https://app.example.com/api/2");
    assert_eq!(tasks[1].url, "https://app.example.com/api/3");
  }
}
