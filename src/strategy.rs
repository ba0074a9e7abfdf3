//! The four fetch strategies.
//!
//! Each strategy is a pure function of (request, namespace handle, network)
//! with side effects only on the cache. Only successful (2xx) responses are
//! written back; entries replace, never mutate.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{CacheEntry, NamespaceHandle};
use crate::error::{EngineError, Result};
use crate::net::{Request, Response, Transport};

/// Network half of a strategy invocation.
#[derive(Clone)]
pub struct NetContext {
  pub transport: Arc<dyn Transport>,
  /// Bound on network-first fetches; on expiry the strategy takes its
  /// fallback path instead of retrying.
  pub timeout: Duration,
}

/// Synthesized offline response for API routes, status 503. The body shape
/// is stable and relied upon by callers.
pub fn offline_response(message: &str) -> Response {
  #[derive(serde::Serialize)]
  struct OfflinePayload<'a> {
    error: &'a str,
    message: &'a str,
    cached: bool,
  }

  let body = serde_json::to_vec(&OfflinePayload {
    error: "Offline",
    message,
    cached: false,
  })
  .unwrap_or_default();

  let mut response = Response::new(503, body);
  response
    .headers
    .push(("content-type".into(), "application/json".into()));
  response
}

/// Cache-first: return the cached entry if present, otherwise fetch, store
/// and return. A fetch failure with no cached copy is unavailable.
pub async fn cache_first(
  request: &Request,
  handle: &NamespaceHandle,
  net: &NetContext,
) -> Result<Response> {
  let key = request.canonical_key();
  if let Some(entry) = handle.get(&key)? {
    return Ok(entry.into_response());
  }

  match net.transport.fetch(request).await {
    Ok(response) => {
      if response.is_success() {
        handle.put(&key, &CacheEntry::from_response(&response))?;
      }
      Ok(response)
    }
    Err(err) => Err(EngineError::Unavailable(format!(
      "{}: no cached copy and fetch failed: {}",
      request.url, err
    ))),
  }
}

/// Network-first: fetch under a bounded timeout; on success store and return
/// the fresh response. On failure fall back to the cached entry, else the
/// synthesized offline payload for API routes, else re-raise.
pub async fn network_first(
  request: &Request,
  handle: &NamespaceHandle,
  net: &NetContext,
  api: bool,
) -> Result<Response> {
  let key = request.canonical_key();

  let outcome = match tokio::time::timeout(net.timeout, net.transport.fetch(request)).await {
    Err(_) => Err(EngineError::Network(format!(
      "fetch timed out after {:?}",
      net.timeout
    ))),
    Ok(Err(err)) => Err(err),
    Ok(Ok(response)) if response.is_server_error() => Err(EngineError::Network(format!(
      "upstream returned {}",
      response.status
    ))),
    Ok(Ok(response)) => Ok(response),
  };

  match outcome {
    Ok(response) => {
      if response.is_success() {
        handle.put(&key, &CacheEntry::from_response(&response))?;
      }
      Ok(response)
    }
    Err(err) => {
      if let Some(entry) = handle.get(&key)? {
        debug!(url = %request.url, "network failed, serving cached entry");
        return Ok(entry.into_response());
      }
      if api {
        Ok(offline_response(&err.to_string()))
      } else {
        Err(EngineError::Unavailable(format!("{}: {}", request.url, err)))
      }
    }
  }
}

/// Stale-while-revalidate: return the cached entry immediately and refresh
/// it in the background; the caller is never blocked on the network when a
/// cached copy exists. On a miss, behaves like network-first.
pub async fn stale_while_revalidate(
  request: &Request,
  handle: &NamespaceHandle,
  net: &NetContext,
) -> Result<Response> {
  let key = request.canonical_key();

  if let Some(entry) = handle.get(&key)? {
    let transport = Arc::clone(&net.transport);
    let handle = handle.clone();
    let request = request.clone();
    tokio::spawn(async move {
      match transport.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(err) = handle.put(&key, &CacheEntry::from_response(&response)) {
            debug!(url = %request.url, "background refresh store failed: {}", err);
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "background refresh not stored");
        }
        Err(err) => {
          debug!(url = %request.url, "background refresh failed: {}", err);
        }
      }
    });
    return Ok(entry.into_response());
  }

  network_first(request, handle, net, false).await
}

/// Navigation fallback: network-first, and when ultimately unavailable serve
/// the designated fallback document from the static namespace.
pub async fn navigation_fallback(
  request: &Request,
  handle: &NamespaceHandle,
  statics: &NamespaceHandle,
  fallback_url: &Url,
  net: &NetContext,
) -> Result<Response> {
  match network_first(request, handle, net, false).await {
    Ok(response) => Ok(response),
    Err(_) => {
      let fallback_key = Request::get(fallback_url.clone()).canonical_key();
      match statics.get(&fallback_key)? {
        Some(entry) => Ok(entry.into_response()),
        None => Err(EngineError::Unavailable(format!(
          "{}: offline and fallback document {} is not cached",
          request.url, fallback_url
        ))),
      }
    }
  }
}
