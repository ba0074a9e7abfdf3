//! The interception engine: lifecycle state machine and trigger dispatch.
//!
//! Every host trigger (install, activate, fetch, sync tick, push, client
//! message) flows through [`Engine::handle`], keeping the state machine in
//! one place instead of scattered across independent listeners. All shared
//! state lives in the engine context; nothing is process-global.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheRegistry, NamespaceHandle};
use crate::error::{EngineError, Result};
use crate::net::{Request, Response, Transport};
use crate::notify::{Broadcaster, ClientEvent};
use crate::queue::RetryQueue;
use crate::routes::{Namespace, RouteDecision, RouteRules, Strategy};
use crate::strategy::{self, NetContext};

/// Engine lifecycle. No state is terminal; the host may tear the process
/// down at any point and only persisted state survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Provisioning namespaces and precaching; not serving.
  Installing,
  /// Provisioned, waiting for activation.
  Installed,
  /// Promoting the new generation and purging superseded ones.
  Activating,
  /// Serving requests and accepting background triggers.
  Active,
}

/// Commands a controlling application may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
  /// Activate a waiting install immediately.
  SkipWaiting,
  /// Warm the static namespace with the given URLs (relative to the base).
  CacheUrls(Vec<String>),
  /// Force a retry-queue drain.
  Replay,
}

/// Host runtime entry points.
pub enum Trigger {
  Install,
  Activate,
  /// The only trigger with a reply: the intercepted request must resolve to
  /// a response (or an error) for the caller.
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
  },
  SyncTick,
  ConnectivityRestored,
  Push {
    payload: String,
  },
  ClientMessage(ClientCommand),
}

/// Static engine configuration, resolved from the config file.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub rules: RouteRules,
  /// Origin that relative precache/fallback paths resolve against.
  pub base_url: Url,
  /// Paths fetched into the static namespace during install.
  pub precache: Vec<String>,
  /// Fallback document served for failed navigations.
  pub fallback_document: String,
  /// Optional per-prefix fallback documents; first matching prefix wins.
  pub fallback_overrides: Vec<(String, String)>,
  pub network_timeout: Duration,
}

/// Namespace handles provisioned during install.
#[derive(Clone)]
struct Handles {
  statics: NamespaceHandle,
  dynamic: NamespaceHandle,
  api: NamespaceHandle,
}

impl Handles {
  fn get(&self, namespace: Namespace) -> &NamespaceHandle {
    match namespace {
      Namespace::Static => &self.statics,
      Namespace::Dynamic => &self.dynamic,
      Namespace::Api => &self.api,
    }
  }
}

/// The interception engine.
pub struct Engine {
  state: RwLock<LifecycleState>,
  registry: CacheRegistry,
  queue: RetryQueue,
  transport: Arc<dyn Transport>,
  broadcaster: Arc<Broadcaster>,
  options: EngineOptions,
  handles: RwLock<Option<Handles>>,
  /// Single-flight guard: an overlapping drain request is ignored, not
  /// queued.
  drain_guard: tokio::sync::Mutex<()>,
}

impl Engine {
  pub fn new(
    registry: CacheRegistry,
    queue: RetryQueue,
    transport: Arc<dyn Transport>,
    broadcaster: Arc<Broadcaster>,
    options: EngineOptions,
  ) -> Self {
    Self {
      state: RwLock::new(LifecycleState::Installing),
      registry,
      queue,
      transport,
      broadcaster,
      options,
      handles: RwLock::new(None),
      drain_guard: tokio::sync::Mutex::new(()),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, next: LifecycleState) {
    *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
  }

  /// Drive the engine from a trigger channel until the host closes it.
  ///
  /// Each intercepted request and background trigger runs as its own task,
  /// so a fetch stuck on a dead connection never stalls an unrelated cached
  /// request. Lifecycle transitions stay on the driver loop so they remain
  /// ordered relative to each other.
  pub async fn run(self: Arc<Self>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
    while let Some(trigger) = triggers.recv().await {
      match trigger {
        lifecycle @ (Trigger::Install
        | Trigger::Activate
        | Trigger::ClientMessage(ClientCommand::SkipWaiting)) => self.handle(lifecycle).await,
        concurrent => {
          let engine = Arc::clone(&self);
          tokio::spawn(async move { engine.handle(concurrent).await });
        }
      }
    }
  }

  /// Dispatch one trigger.
  pub async fn handle(&self, trigger: Trigger) {
    match trigger {
      Trigger::Install => {
        if self.state() != LifecycleState::Installing {
          debug!(state = ?self.state(), "install ignored");
          return;
        }
        match self.install().await {
          Ok(()) => {
            self.set_state(LifecycleState::Installed);
            info!(version = self.registry.version(), "install complete");
          }
          Err(err) => {
            // Fail closed: stay Installing rather than serve a partial cache
            warn!("install failed, remaining in installing state: {}", err);
          }
        }
      }
      Trigger::Activate => self.activate().await,
      Trigger::Fetch { request, reply } => {
        let result = self.serve(&request).await;
        let _ = reply.send(result);
      }
      Trigger::SyncTick => self.drain("sync-tick").await,
      Trigger::ConnectivityRestored => self.drain("connectivity-restored").await,
      Trigger::Push { payload } => {
        self
          .broadcaster
          .broadcast(ClientEvent::DataAvailable { detail: payload });
      }
      Trigger::ClientMessage(command) => self.client_message(command).await,
    }
  }

  /// Provision every namespace the route rules can name and pre-populate
  /// the static namespace from the precache manifest (including the
  /// fallback documents, which must be available offline).
  async fn install(&self) -> Result<()> {
    let provision = |ns| {
      self
        .registry
        .open(ns)
        .map_err(|e: EngineError| EngineError::Provisioning(e.to_string()))
    };
    let statics = provision(Namespace::Static)?;
    let dynamic = provision(Namespace::Dynamic)?;
    let api = provision(Namespace::Api)?;

    let mut manifest: Vec<&str> = self.options.precache.iter().map(String::as_str).collect();
    manifest.push(self.options.fallback_document.as_str());
    manifest.extend(self.options.fallback_overrides.iter().map(|(_, doc)| doc.as_str()));
    manifest.sort_unstable();
    manifest.dedup();

    for path in manifest {
      let url = self
        .options
        .base_url
        .join(path)
        .map_err(|e| EngineError::Provisioning(format!("malformed precache path {}: {}", path, e)))?;
      let request = Request::get(url);
      let response = self
        .transport
        .fetch(&request)
        .await
        .map_err(|e| EngineError::Provisioning(format!("precache {} failed: {}", path, e)))?;
      if !response.is_success() {
        return Err(EngineError::Provisioning(format!(
          "precache {} returned {}",
          path, response.status
        )));
      }
      statics
        .put(&request.canonical_key(), &CacheEntry::from_response(&response))
        .map_err(|e| EngineError::Provisioning(e.to_string()))?;
    }

    *self.handles.write().unwrap_or_else(PoisonError::into_inner) = Some(Handles {
      statics,
      dynamic,
      api,
    });
    Ok(())
  }

  /// Promote the current generation and purge superseded ones.
  async fn activate(&self) {
    if self.state() != LifecycleState::Installed {
      debug!(state = ?self.state(), "activate ignored");
      return;
    }
    self.set_state(LifecycleState::Activating);
    match self.registry.activate() {
      Ok(purged) => {
        self.set_state(LifecycleState::Active);
        info!(?purged, version = self.registry.version(), "activated");
        self.broadcaster.broadcast(ClientEvent::ActivationComplete {
          version: self.registry.version().to_string(),
        });
      }
      Err(err) => {
        warn!("activation failed: {}", err);
        self.set_state(LifecycleState::Installed);
      }
    }
  }

  /// Resolve one intercepted request. Only the Active state serves.
  async fn serve(&self, request: &Request) -> Result<Response> {
    let state = self.state();
    if state != LifecycleState::Active {
      return Err(EngineError::Unavailable(format!(
        "engine not active (state {:?})",
        state
      )));
    }
    let handles = self
      .handles
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
      .ok_or_else(|| EngineError::Unavailable("namespaces not provisioned".into()))?;

    match self.options.rules.classify(request) {
      RouteDecision::PassThrough => self.transport.fetch(request).await,
      RouteDecision::Defer => self.forward_mutation(request).await,
      RouteDecision::Serve(route) => {
        let handle = handles.get(route.namespace);
        let net = NetContext {
          transport: Arc::clone(&self.transport),
          timeout: self.options.network_timeout,
        };
        match route.strategy {
          Strategy::CacheFirst => strategy::cache_first(request, handle, &net).await,
          Strategy::NetworkFirst => {
            strategy::network_first(request, handle, &net, route.namespace == Namespace::Api).await
          }
          Strategy::StaleWhileRevalidate => {
            strategy::stale_while_revalidate(request, handle, &net).await
          }
          Strategy::NavigationFallback => {
            let fallback = self.fallback_url_for(request.url.path())?;
            strategy::navigation_fallback(request, handle, &handles.statics, &fallback, &net).await
          }
        }
      }
    }
  }

  /// Forward a mutating request. If the server cannot be reached the
  /// request is queued for replay and the caller gets the offline payload;
  /// any response the server did produce is returned as-is.
  async fn forward_mutation(&self, request: &Request) -> Result<Response> {
    let outcome = match tokio::time::timeout(
      self.options.network_timeout,
      self.transport.fetch(request),
    )
    .await
    {
      Err(_) => Err(EngineError::Network(format!(
        "fetch timed out after {:?}",
        self.options.network_timeout
      ))),
      Ok(result) => result,
    };

    match outcome {
      Ok(response) => Ok(response),
      Err(err) => {
        warn!(url = %request.url, "mutation failed, queueing for replay: {}", err);
        if let Some(evicted) = self.queue.enqueue(request)? {
          self
            .broadcaster
            .broadcast(ClientEvent::SyncFailedPermanently {
              url: evicted.url,
              attempts: evicted.attempts,
            });
        }
        Ok(strategy::offline_response("request queued for background sync"))
      }
    }
  }

  /// Drain the retry queue. No-op outside Active, on an empty queue, or
  /// while another drain is running.
  async fn drain(&self, reason: &str) {
    if self.state() != LifecycleState::Active {
      debug!(reason, state = ?self.state(), "drain ignored");
      return;
    }
    let Ok(_guard) = self.drain_guard.try_lock() else {
      debug!(reason, "drain already in progress, ignoring");
      return;
    };
    match self.queue.is_empty() {
      Ok(true) => return,
      Ok(false) => {}
      Err(err) => {
        warn!("queue inspection failed: {}", err);
        return;
      }
    }

    match self.queue.drain(self.transport.as_ref()).await {
      Ok(report) => {
        for task in &report.abandoned {
          self
            .broadcaster
            .broadcast(ClientEvent::SyncFailedPermanently {
              url: task.url.clone(),
              attempts: task.attempts,
            });
        }
        self.broadcaster.broadcast(ClientEvent::SyncComplete {
          succeeded: report.succeeded,
          remaining: report.remaining,
        });
        info!(
          reason,
          succeeded = report.succeeded,
          failed_permanently = report.failed_permanently,
          remaining = report.remaining,
          "drain complete"
        );
      }
      Err(err) => warn!(reason, "drain failed: {}", err),
    }
  }

  async fn client_message(&self, command: ClientCommand) {
    match command {
      ClientCommand::SkipWaiting => {
        if self.state() == LifecycleState::Installed {
          self.activate().await;
        } else {
          debug!(state = ?self.state(), "skip-waiting ignored");
        }
      }
      ClientCommand::Replay => self.drain("client-replay").await,
      ClientCommand::CacheUrls(urls) => self.cache_urls(urls).await,
    }
  }

  /// Warm the static namespace with client-requested URLs, concurrently.
  async fn cache_urls(&self, urls: Vec<String>) {
    let handles = self
      .handles
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    let Some(handles) = handles else {
      debug!("cache-urls before install, ignoring");
      return;
    };
    let statics = &handles.statics;

    let fetches = urls.iter().filter_map(|raw| {
      let url = match self.options.base_url.join(raw) {
        Ok(url) => url,
        Err(err) => {
          warn!(path = %raw, "skipping malformed cache-urls entry: {}", err);
          return None;
        }
      };
      let transport = Arc::clone(&self.transport);
      Some(async move {
        let request = Request::get(url);
        match transport.fetch(&request).await {
          Ok(response) if response.is_success() => statics
            .put(&request.canonical_key(), &CacheEntry::from_response(&response))
            .is_ok(),
          Ok(response) => {
            debug!(url = %request.url, status = response.status, "cache-urls fetch not stored");
            false
          }
          Err(err) => {
            debug!(url = %request.url, "cache-urls fetch failed: {}", err);
            false
          }
        }
      })
    });

    let results = futures::future::join_all(fetches).await;
    let cached = results.into_iter().filter(|ok| *ok).count();
    self.broadcaster.broadcast(ClientEvent::DataAvailable {
      detail: format!("cached {} of {} urls", cached, urls.len()),
    });
  }

  fn fallback_url_for(&self, path: &str) -> Result<Url> {
    let document = self
      .options
      .fallback_overrides
      .iter()
      .find(|(prefix, _)| path.starts_with(prefix.as_str()))
      .map(|(_, doc)| doc.as_str())
      .unwrap_or(self.options.fallback_document.as_str());
    self.options.base_url.join(document).map_err(|e| {
      EngineError::Unavailable(format!("malformed fallback document path {}: {}", document, e))
    })
  }
}
