//! Versioned cache namespace registry.
//!
//! Logical namespaces (`static`, `dynamic`, `api`) are bound to physical,
//! version-tagged cache names like `offsync-static-v3`. Activation is the
//! only place stale data is reclaimed: every physical name absent from the
//! current version set is purged.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::routes::Namespace;

use super::storage::{CacheEntry, CacheStore};

/// Prefix shared by every physical cache name this engine owns.
const NAME_PREFIX: &str = "offsync";

/// Registry of named, versioned cache namespaces.
pub struct CacheRegistry {
  store: Arc<dyn CacheStore>,
  version: String,
}

impl CacheRegistry {
  pub fn new(store: Arc<dyn CacheStore>, version: impl Into<String>) -> Self {
    Self {
      store,
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Physical cache name for a logical namespace at the current version.
  pub fn physical_name(&self, namespace: Namespace) -> String {
    format!("{}-{}-{}", NAME_PREFIX, namespace.as_str(), self.version)
  }

  /// Open a namespace at the current version, creating it if needed.
  pub fn open(&self, namespace: Namespace) -> Result<NamespaceHandle> {
    let name = self.physical_name(namespace);
    self.store.ensure(&name)?;
    Ok(NamespaceHandle {
      name,
      store: Arc::clone(&self.store),
    })
  }

  /// The set of physical names belonging to the current version.
  pub fn current_set(&self) -> BTreeSet<String> {
    Namespace::ALL
      .iter()
      .map(|ns| self.physical_name(*ns))
      .collect()
  }

  pub fn list_namespaces(&self) -> Result<BTreeSet<String>> {
    self.store.list_namespaces()
  }

  /// Idempotent; safe to call on a non-existent namespace.
  pub fn purge(&self, name: &str) -> Result<()> {
    self.store.purge(name)
  }

  /// Promote the current generation: purge every namespace not in the
  /// current version set. Returns the purged names.
  ///
  /// Must only run once the current generation's namespaces exist, so the
  /// new binding has fully replaced the old name before anything is deleted.
  pub fn activate(&self) -> Result<Vec<String>> {
    let current = self.current_set();
    let mut purged = Vec::new();
    for name in self.list_namespaces()? {
      if !current.contains(&name) {
        self.purge(&name)?;
        purged.push(name);
      }
    }
    Ok(purged)
  }
}

/// Handle to one physical namespace; cheap to clone.
#[derive(Clone)]
pub struct NamespaceHandle {
  name: String,
  store: Arc<dyn CacheStore>,
}

impl NamespaceHandle {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
    self.store.put(&self.name, key, entry)
  }

  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.store.get(&self.name, key)
  }

  pub fn delete(&self, key: &str) -> Result<()> {
    self.store.delete(&self.name, key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use chrono::Utc;

  fn entry(body: &[u8]) -> CacheEntry {
    CacheEntry {
      status: 200,
      headers: Vec::new(),
      body: body.to_vec(),
      captured_at: Utc::now(),
    }
  }

  #[test]
  fn open_creates_versioned_namespace() {
    let store = Arc::new(MemoryStore::new());
    let registry = CacheRegistry::new(store, "v2");

    let handle = registry.open(Namespace::Static).unwrap();
    assert_eq!(handle.name(), "offsync-static-v2");
    assert!(registry
      .list_namespaces()
      .unwrap()
      .contains("offsync-static-v2"));

    handle.put("k", &entry(b"body")).unwrap();
    assert_eq!(handle.get("k").unwrap().unwrap().body, b"body");
    handle.delete("k").unwrap();
    assert!(handle.get("k").unwrap().is_none());
  }

  #[test]
  fn activation_purges_exactly_the_stale_generations() {
    let store = Arc::new(MemoryStore::new());

    // Previous generation with data
    let old = CacheRegistry::new(Arc::clone(&store) as Arc<dyn CacheStore>, "v1");
    for ns in Namespace::ALL {
      old.open(ns).unwrap();
    }
    old
      .open(Namespace::Static)
      .unwrap()
      .put("k", &entry(b"old"))
      .unwrap();

    // New generation provisions, writes, then activates
    let new = CacheRegistry::new(Arc::clone(&store) as Arc<dyn CacheStore>, "v2");
    for ns in Namespace::ALL {
      new.open(ns).unwrap();
    }
    let statics = new.open(Namespace::Static).unwrap();
    statics.put("k", &entry(b"new")).unwrap();

    let mut purged = new.activate().unwrap();
    purged.sort();
    assert_eq!(
      purged,
      vec![
        "offsync-api-v1".to_string(),
        "offsync-dynamic-v1".to_string(),
        "offsync-static-v1".to_string(),
      ]
    );

    // Current generation is untouched
    assert_eq!(statics.get("k").unwrap().unwrap().body, b"new");
    assert_eq!(registry_names(&new), new.current_set());
  }

  #[test]
  fn activation_with_no_stale_generations_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let registry = CacheRegistry::new(store, "v1");
    for ns in Namespace::ALL {
      registry.open(ns).unwrap();
    }

    assert!(registry.activate().unwrap().is_empty());
    assert!(registry.activate().unwrap().is_empty());
  }

  #[test]
  fn purge_unknown_namespace_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let registry = CacheRegistry::new(store, "v1");
    registry.purge("offsync-static-v0").unwrap();
  }

  fn registry_names(registry: &CacheRegistry) -> BTreeSet<String> {
    registry.list_namespaces().unwrap()
  }
}
