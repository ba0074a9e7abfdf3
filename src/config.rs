use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::routes::RouteRules;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that relative precache and fallback paths resolve against.
  pub base_url: String,
  /// Cache generation tag; bump it to supersede previous generations.
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  #[serde(default)]
  pub routes: RoutesConfig,
  /// Paths fetched into the static namespace during install.
  #[serde(default)]
  pub precache: Vec<String>,
  #[serde(default)]
  pub fallback: FallbackConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default = "default_network_timeout_secs")]
  pub network_timeout_secs: u64,
  /// Where the cache/queue database lives (defaults to the user data dir).
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutesConfig {
  /// Path prefixes served by the API backend.
  #[serde(default)]
  pub api_prefixes: Vec<String>,
  /// Allow-listed third-party asset hosts (case-insensitive).
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub asset_hosts: BTreeSet<String>,
  /// Application bundle paths; entries starting with `.` match by extension.
  #[serde(default)]
  pub bundle_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
  /// Document served for failed navigations.
  #[serde(default = "default_fallback_document")]
  pub document: String,
  /// Optional per-prefix fallback documents.
  #[serde(default)]
  pub overrides: Vec<FallbackOverride>,
}

impl Default for FallbackConfig {
  fn default() -> Self {
    Self {
      document: default_fallback_document(),
      overrides: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackOverride {
  pub prefix: String,
  pub document: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
  /// Replay attempts per task before it is abandoned.
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Queue length bound; the oldest task is evicted on overflow.
  #[serde(default = "default_max_tasks")]
  pub max_tasks: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      max_tasks: default_max_tasks(),
    }
  }
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_fallback_document() -> String {
  "/offline.html".to_string()
}

fn default_network_timeout_secs() -> u64 {
  10
}

fn default_max_attempts() -> u32 {
  5
}

fn default_max_tasks() -> u32 {
  1000
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Route rules for the classifier.
  pub fn route_rules(&self) -> RouteRules {
    RouteRules {
      api_prefixes: self.routes.api_prefixes.clone(),
      asset_hosts: self.routes.asset_hosts.clone(),
      bundle_paths: self.routes.bundle_paths.clone(),
    }
  }

  /// Database location for the cache registry and retry queue.
  pub fn database_path(&self) -> Result<PathBuf> {
    let dir = match &self.data_dir {
      Some(dir) => dir.clone(),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .ok_or_else(|| eyre!("Could not determine data directory"))?
        .join("offsync"),
    };
    Ok(dir.join("offsync.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_a_full_config() {
    let yaml = r#"
base_url: https://app.example.com
cache_version: v7
routes:
  api_prefixes: ["/api/"]
  asset_hosts: ["CDN.Example.NET"]
  bundle_paths: ["/app.js", ".css"]
precache: ["/app.js", "/index.html"]
fallback:
  document: /offline.html
  overrides:
    - prefix: /admin/
      document: /admin/offline.html
retry:
  max_attempts: 3
  max_tasks: 50
network_timeout_secs: 4
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.cache_version, "v7");
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.network_timeout_secs, 4);
    assert_eq!(config.fallback.overrides[0].prefix, "/admin/");

    // Hosts are lowercased on load
    let rules = config.route_rules();
    assert!(rules.asset_hosts.contains("cdn.example.net"));
  }

  #[test]
  fn minimal_config_gets_defaults() {
    let config: Config = serde_yaml::from_str("base_url: https://app.example.com\n").unwrap();
    assert_eq!(config.cache_version, "v1");
    assert_eq!(config.fallback.document, "/offline.html");
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.max_tasks, 1000);
    assert_eq!(config.network_timeout_secs, 10);
    assert!(config.precache.is_empty());
  }
}
