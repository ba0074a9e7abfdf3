//! Engine error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the caching and sync engine.
#[derive(Debug, Error)]
pub enum EngineError {
  /// No network and no cached copy; the strategy cannot satisfy the request.
  #[error("unavailable: {0}")]
  Unavailable(String),

  /// Namespace setup or precaching failed during install.
  #[error("provisioning failed: {0}")]
  Provisioning(String),

  /// A queued mutation could not be replayed.
  #[error("replay failed: {0}")]
  Replay(String),

  /// A queued mutation exceeded the replay ceiling and was abandoned.
  #[error("replay of {url} abandoned after {attempts} attempts")]
  PermanentFailure { url: String, attempts: u32 },

  /// Persistent store failure (SQLite or lock poisoning).
  #[error("storage error: {0}")]
  Storage(String),

  /// Network transport failure (connection error, timeout).
  #[error("network error: {0}")]
  Network(String),

  /// Entry or payload (de)serialization failure.
  #[error("serialization error: {0}")]
  Serialize(String),
}

impl From<rusqlite::Error> for EngineError {
  fn from(err: rusqlite::Error) -> Self {
    EngineError::Storage(err.to_string())
  }
}

impl From<serde_json::Error> for EngineError {
  fn from(err: serde_json::Error) -> Self {
    EngineError::Serialize(err.to_string())
  }
}

impl From<reqwest::Error> for EngineError {
  fn from(err: reqwest::Error) -> Self {
    EngineError::Network(err.to_string())
  }
}
