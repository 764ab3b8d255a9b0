// Discovery result cache
//
// Last discovered resource set per provider. A successful discovery
// replaces the provider's entry wholesale; resources that disappeared
// upstream disappear here too.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::model::Resource;

#[derive(Debug, Clone)]
struct CachedResources {
    resources: Arc<HashSet<Resource>>,
    discovered_at: DateTime<Utc>,
}

/// Provider ID -> last discovered resource set
///
/// Readers get a shared snapshot (`Arc`), so a concurrent `replace` never
/// exposes a half-written set.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: DashMap<String, CachedResources>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<HashSet<Resource>>> {
        self.entries
            .get(provider_id)
            .map(|entry| Arc::clone(&entry.resources))
    }

    /// Cached set, treating an empty set the same as no entry
    pub fn get_non_empty(&self, provider_id: &str) -> Option<Arc<HashSet<Resource>>> {
        self.get(provider_id).filter(|resources| !resources.is_empty())
    }

    /// Overwrites the provider's entry with a fresh discovery result
    pub fn replace(&self, provider_id: &str, resources: HashSet<Resource>) -> Arc<HashSet<Resource>> {
        let resources = Arc::new(resources);
        self.entries.insert(
            provider_id.to_string(),
            CachedResources {
                resources: Arc::clone(&resources),
                discovered_at: Utc::now(),
            },
        );
        resources
    }

    pub fn remove(&self, provider_id: &str) -> bool {
        self.entries.remove(provider_id).is_some()
    }

    pub fn discovered_at(&self, provider_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(provider_id).map(|entry| entry.discovered_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
