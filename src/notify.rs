//! Best-effort broadcast channel to controlling application instances.
//!
//! Delivery is fire-and-forget: the engine never blocks on acknowledgment
//! and never retries delivery. Disconnected clients are pruned on the next
//! broadcast.

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle and sync-result events delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientEvent {
  ActivationComplete {
    version: String,
  },
  SyncComplete {
    succeeded: u32,
    remaining: u32,
  },
  SyncFailedPermanently {
    url: String,
    attempts: u32,
  },
  DataAvailable {
    detail: String,
  },
}

/// Fan-out broadcaster over unbounded channels.
#[derive(Default)]
pub struct Broadcaster {
  clients: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
}

impl Broadcaster {
  pub fn new() -> Self {
    Self::default()
  }

  /// Connect a client; it receives every subsequent broadcast.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut clients) = self.clients.lock() {
      clients.push(tx);
    }
    rx
  }

  /// Deliver an event to every connected client, dropping the disconnected.
  pub fn broadcast(&self, event: ClientEvent) {
    let Ok(mut clients) = self.clients.lock() else {
      return;
    };
    clients.retain(|tx| tx.send(event.clone()).is_ok());
    debug!(?event, clients = clients.len(), "broadcast");
  }

  pub fn client_count(&self) -> usize {
    self.clients.lock().map(|c| c.len()).unwrap_or(0)
  }
}
