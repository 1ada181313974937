//! Shared catalog snapshot with failed/blocked bookkeeping.
//!
//! Membership in the failed-set (by endpoint name) and the blocked-set (by
//! country) is kept here, not on the records. Selection and mutation go through
//! one lock so a reader never sees a half-applied update.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use super::EndpointRecord;

#[derive(Debug, Default)]
struct StoreState {
    endpoints: Arc<Vec<EndpointRecord>>,
    failed: HashSet<String>,
    blocked: BTreeSet<String>,
    generation: u64,
}

/// Read-only view handed to selection code.
pub struct CatalogView<'a> {
    pub endpoints: &'a [EndpointRecord],
    pub failed: &'a HashSet<String>,
    pub blocked: &'a BTreeSet<String>,
    pub generation: u64,
}

impl CatalogView<'_> {
    pub fn is_eligible(&self, endpoint: &EndpointRecord) -> bool {
        !self.failed.contains(&endpoint.name) && !self.blocked.contains(&endpoint.country)
    }

    /// True when there is nothing left worth trying without a refresh.
    pub fn is_exhausted(&self) -> bool {
        self.endpoints.is_empty()
            || self
                .endpoints
                .iter()
                .all(|e| self.failed.contains(&e.name))
    }
}

#[derive(Debug, Default)]
pub struct CatalogStore {
    state: RwLock<StoreState>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(endpoints: Vec<EndpointRecord>) -> Self {
        let store = Self::new();
        store.replace(endpoints);
        store
    }

    /// Install a freshly fetched catalog. Bumps the generation and returns it.
    pub fn replace(&self, endpoints: Vec<EndpointRecord>) -> u64 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.endpoints = Arc::new(endpoints);
        state.generation += 1;
        let generation = state.generation;
        let count = state.endpoints.len();
        drop(state);
        log::info!("Catalog replaced: {} endpoints (generation {})", count, generation);
        generation
    }

    pub fn endpoints(&self) -> Arc<Vec<EndpointRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&state.endpoints)
    }

    pub fn find(&self, name: &str) -> Option<EndpointRecord> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.endpoints.iter().find(|e| e.name == name).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Run `f` against a consistent view of catalog and both sets.
    pub fn with_view<T>(&self, f: impl FnOnce(&CatalogView<'_>) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let view = CatalogView {
            endpoints: &state.endpoints,
            failed: &state.failed,
            blocked: &state.blocked,
            generation: state.generation,
        };
        f(&view)
    }

    pub fn mark_failed(&self, name: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.failed.insert(name.to_string())
    }

    pub fn is_failed(&self, name: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.failed.contains(name)
    }

    pub fn failed(&self) -> HashSet<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.failed.clone()
    }

    pub fn clear_failed(&self) -> usize {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let cleared = state.failed.len();
        state.failed.clear();
        cleared
    }

    pub fn set_blocked(&self, countries: impl IntoIterator<Item = String>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.blocked = countries.into_iter().collect();
    }

    pub fn block(&self, country: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.blocked.insert(country.to_string())
    }

    pub fn unblock(&self, country: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.blocked.remove(country)
    }

    pub fn blocked(&self) -> BTreeSet<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.blocked.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::endpoint;

    #[test]
    fn test_replace_bumps_generation() {
        let store = CatalogStore::new();
        assert_eq!(store.generation(), 0);
        assert_eq!(store.replace(vec![endpoint("a", "JP", 1.0)]), 1);
        assert_eq!(store.replace(vec![]), 2);
        assert!(store.endpoints().is_empty());
    }

    #[test]
    fn test_eligibility_respects_both_sets() {
        let store = CatalogStore::with_endpoints(vec![
            endpoint("a", "JP", 3.0),
            endpoint("b", "KR", 2.0),
            endpoint("c", "US", 1.0),
        ]);
        store.mark_failed("a");
        store.block("KR");

        let eligible: Vec<String> = store.with_view(|view| {
            view.endpoints
                .iter()
                .filter(|e| view.is_eligible(e))
                .map(|e| e.name.clone())
                .collect()
        });
        assert_eq!(eligible, ["c"]);
    }

    #[test]
    fn test_exhausted_when_empty_or_all_failed() {
        let store = CatalogStore::new();
        assert!(store.with_view(|v| v.is_exhausted()));

        store.replace(vec![endpoint("a", "JP", 1.0), endpoint("b", "JP", 1.0)]);
        store.mark_failed("a");
        assert!(!store.with_view(|v| v.is_exhausted()));
        store.mark_failed("b");
        assert!(store.with_view(|v| v.is_exhausted()));

        assert_eq!(store.clear_failed(), 2);
        assert!(!store.is_failed("a"));
    }

    #[test]
    fn test_block_and_unblock() {
        let store = CatalogStore::new();
        assert!(store.block("JP"));
        assert!(!store.block("JP"));
        assert!(store.unblock("JP"));
        assert!(store.blocked().is_empty());
    }
}
