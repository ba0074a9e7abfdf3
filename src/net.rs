//! Request/response model and the network transport seam.
//!
//! Every outgoing request is described by a [`Request`] and resolved to a
//! [`Response`] through the [`Transport`] trait. Cacheable requests are keyed
//! by a canonical signature (method + normalized URL) hashed to a stable,
//! fixed-length key.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use crate::error::{EngineError, Result};

/// HTTP method subset the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  pub fn parse(s: &str) -> Option<Method> {
    match s {
      "GET" => Some(Method::Get),
      "HEAD" => Some(Method::Head),
      "OPTIONS" => Some(Method::Options),
      "POST" => Some(Method::Post),
      "PUT" => Some(Method::Put),
      "PATCH" => Some(Method::Patch),
      "DELETE" => Some(Method::Delete),
      _ => None,
    }
  }

  /// Mutating methods are never cached; their failures are queued for replay.
  pub fn is_mutating(&self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Top-level document load, as flagged by the host runtime.
  pub navigation: bool,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      headers: Vec::new(),
      body: None,
      navigation: false,
    }
  }

  pub fn navigation(url: Url) -> Self {
    Self {
      navigation: true,
      ..Self::get(url)
    }
  }

  /// Human-readable request descriptor: method + URL with the fragment
  /// stripped. Two requests with the same signature are interchangeable for
  /// caching purposes.
  pub fn signature(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method.as_str(), url)
  }

  /// SHA-256 hash of the signature, for stable fixed-length storage keys.
  pub fn canonical_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.signature().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response snapshot: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    self.status >= 500
  }
}

/// Network seam. The engine never talks to the wire directly; strategies and
/// the retry queue go through this trait so tests can script the network.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed transport with a client-level request timeout.
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| EngineError::Network(format!("invalid method: {}", e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
