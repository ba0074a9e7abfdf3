//! Route classification: maps an intercepted request to a cache namespace
//! and a fetch strategy.
//!
//! Rules are static configuration, evaluated in priority order with first
//! match winning. Mutating requests are never cached; they are deferred to
//! the retry queue on failure instead.

use std::collections::BTreeSet;

use crate::net::{Method, Request};

/// Logical cache namespace identifiers.
///
/// Kept as an enum rather than bare strings so a typo cannot silently create
/// an orphan namespace; physical (versioned) names are derived by the
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
  Static,
  Dynamic,
  Api,
}

impl Namespace {
  pub const ALL: [Namespace; 3] = [Namespace::Static, Namespace::Dynamic, Namespace::Api];

  pub fn as_str(&self) -> &'static str {
    match self {
      Namespace::Static => "static",
      Namespace::Dynamic => "dynamic",
      Namespace::Api => "api",
    }
  }
}

/// Fetch strategies. Selection is static per route; there is no runtime
/// heuristic switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  /// Network-first with a designated cached fallback document; used for
  /// navigation requests.
  NavigationFallback,
}

/// A matched route: where responses are cached and how fetches resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub namespace: Namespace,
  pub strategy: Strategy,
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
  /// Cacheable; serve through the given route.
  Serve(Route),
  /// Mutating; fetch directly and enqueue for replay on failure.
  Defer,
  /// Not ours to handle (e.g. protocol-internal methods); forward untouched.
  PassThrough,
}

/// Static routing configuration.
#[derive(Debug, Clone, Default)]
pub struct RouteRules {
  /// Path prefixes served by the API backend.
  pub api_prefixes: Vec<String>,
  /// Allow-listed third-party asset hosts (lowercase).
  pub asset_hosts: BTreeSet<String>,
  /// Known application bundle paths. Entries starting with `.` match by
  /// extension (e.g. `.css`); anything else matches the exact path.
  pub bundle_paths: Vec<String>,
}

impl RouteRules {
  /// Classify a request. Rules in priority order, first match wins.
  pub fn classify(&self, request: &Request) -> RouteDecision {
    match request.method {
      Method::Get => {}
      m if m.is_mutating() => return RouteDecision::Defer,
      _ => return RouteDecision::PassThrough,
    }

    let path = request.url.path();

    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return RouteDecision::Serve(Route {
        namespace: Namespace::Api,
        strategy: Strategy::NetworkFirst,
      });
    }

    if let Some(host) = request.url.host_str() {
      if self.asset_hosts.contains(&host.to_lowercase()) {
        return RouteDecision::Serve(Route {
          namespace: Namespace::Static,
          strategy: Strategy::CacheFirst,
        });
      }
    }

    if self.matches_bundle(path) {
      return RouteDecision::Serve(Route {
        namespace: Namespace::Static,
        strategy: Strategy::StaleWhileRevalidate,
      });
    }

    if request.navigation {
      return RouteDecision::Serve(Route {
        namespace: Namespace::Dynamic,
        strategy: Strategy::NavigationFallback,
      });
    }

    RouteDecision::Serve(Route {
      namespace: Namespace::Dynamic,
      strategy: Strategy::NetworkFirst,
    })
  }

  fn matches_bundle(&self, path: &str) -> bool {
    self.bundle_paths.iter().any(|pattern| {
      if let Some(ext) = pattern.strip_prefix('.') {
        path
          .rsplit_once('.')
          .is_some_and(|(_, tail)| tail == ext)
      } else {
        path == pattern
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn rules() -> RouteRules {
    RouteRules {
      api_prefixes: vec!["/api/".into()],
      asset_hosts: ["cdn.example.net".to_string()].into_iter().collect(),
      bundle_paths: vec!["/app.js".into(), "/styles/main.css".into(), ".woff2".into()],
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn mutating_methods_are_deferred() {
    let mut request = get("https://app.example.com/api/orders");
    request.method = Method::Post;
    assert_eq!(rules().classify(&request), RouteDecision::Defer);

    request.method = Method::Delete;
    assert_eq!(rules().classify(&request), RouteDecision::Defer);
  }

  #[test]
  fn unmatched_methods_pass_through() {
    let mut request = get("https://app.example.com/api/orders");
    request.method = Method::Options;
    assert_eq!(rules().classify(&request), RouteDecision::PassThrough);

    request.method = Method::Head;
    assert_eq!(rules().classify(&request), RouteDecision::PassThrough);
  }

  #[test]
  fn api_prefix_routes_network_first() {
    let decision = rules().classify(&get("https://app.example.com/api/products"));
    assert_eq!(
      decision,
      RouteDecision::Serve(Route {
        namespace: Namespace::Api,
        strategy: Strategy::NetworkFirst,
      })
    );
  }

  #[test]
  fn api_prefix_wins_over_asset_host() {
    // Rule 2 outranks rule 3 even when the host is allow-listed
    let decision = rules().classify(&get("https://cdn.example.net/api/version"));
    assert_eq!(
      decision,
      RouteDecision::Serve(Route {
        namespace: Namespace::Api,
        strategy: Strategy::NetworkFirst,
      })
    );
  }

  #[test]
  fn asset_host_routes_cache_first() {
    let decision = rules().classify(&get("https://cdn.example.net/fonts/roboto.css"));
    assert_eq!(
      decision,
      RouteDecision::Serve(Route {
        namespace: Namespace::Static,
        strategy: Strategy::CacheFirst,
      })
    );
  }

  #[test]
  fn bundle_path_routes_stale_while_revalidate() {
    let exact = rules().classify(&get("https://app.example.com/app.js"));
    assert_eq!(
      exact,
      RouteDecision::Serve(Route {
        namespace: Namespace::Static,
        strategy: Strategy::StaleWhileRevalidate,
      })
    );

    let by_extension = rules().classify(&get("https://app.example.com/fonts/inter.woff2"));
    assert_eq!(
      by_extension,
      RouteDecision::Serve(Route {
        namespace: Namespace::Static,
        strategy: Strategy::StaleWhileRevalidate,
      })
    );
  }

  #[test]
  fn navigation_gets_fallback_strategy() {
    let request = Request::navigation(Url::parse("https://app.example.com/dashboard").unwrap());
    assert_eq!(
      rules().classify(&request),
      RouteDecision::Serve(Route {
        namespace: Namespace::Dynamic,
        strategy: Strategy::NavigationFallback,
      })
    );
  }

  #[test]
  fn everything_else_is_dynamic_network_first() {
    let decision = rules().classify(&get("https://app.example.com/media/banner.png"));
    assert_eq!(
      decision,
      RouteDecision::Serve(Route {
        namespace: Namespace::Dynamic,
        strategy: Strategy::NetworkFirst,
      })
    );
  }
}
