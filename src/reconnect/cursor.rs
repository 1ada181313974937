use std::time::Duration;

use serde::Serialize;

use crate::catalog::{CatalogView, EndpointRecord};

/// Where the controller is in its walk over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectCursor {
    /// Next index to consider; `None` until the first selection after a reset.
    pub index: Option<usize>,
    /// Attempts since the last stable connection.
    pub attempts: u32,
    /// Endpoint currently being tried or held.
    pub target: Option<String>,
    /// Catalog generation the index refers to.
    pub generation: u64,
}

impl ReconnectCursor {
    pub fn reset(&mut self, generation: u64) {
        *self = Self {
            generation,
            ..Self::default()
        };
    }

    /// Move past `index` after it failed.
    pub fn advance_past(&mut self, index: usize) {
        self.index = Some(index + 1);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Candidate {
        index: usize,
        endpoint: EndpointRecord,
    },
    /// Nothing eligible at or after the cursor.
    Exhausted,
}

/// Pick the first eligible endpoint at or after `start`.
///
/// The catalog is ordered best-first, so this is a greedy walk that skips
/// failed names and blocked countries.
pub fn select_candidate(view: &CatalogView<'_>, start: usize) -> Selection {
    if view.is_exhausted() {
        return Selection::Exhausted;
    }
    view.endpoints
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, endpoint)| view.is_eligible(endpoint))
        .map_or(Selection::Exhausted, |(index, endpoint)| {
            Selection::Candidate {
                index,
                endpoint: endpoint.clone(),
            }
        })
}

/// Delay before the next catalog refresh after `streak` refreshes that did
/// not lead to a connection: 1, 2, 4, ... seconds up to `max`.
pub fn refresh_backoff(streak: u32, max: Duration) -> Duration {
    let secs = 1u64 << streak.min(5);
    Duration::from_secs(secs).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::endpoint;
    use crate::catalog::CatalogStore;

    fn names(n: usize) -> Vec<EndpointRecord> {
        (1..=n)
            .map(|i| endpoint(&format!("S{i}"), "JP", (100 - i) as f64))
            .collect()
    }

    fn selected_name(selection: &Selection) -> Option<&str> {
        match selection {
            Selection::Candidate { endpoint, .. } => Some(endpoint.name.as_str()),
            Selection::Exhausted => None,
        }
    }

    #[test]
    fn test_only_unfailed_candidate_is_selected() {
        let store = CatalogStore::with_endpoints(names(5));
        for i in 1..5 {
            store.mark_failed(&format!("S{i}"));
        }
        let selection = store.with_view(|view| select_candidate(view, 0));
        assert_eq!(selected_name(&selection), Some("S5"));
        assert!(matches!(selection, Selection::Candidate { index: 4, .. }));
    }

    #[test]
    fn test_best_first_order() {
        let store = CatalogStore::with_endpoints(names(3));
        let selection = store.with_view(|view| select_candidate(view, 0));
        assert_eq!(selected_name(&selection), Some("S1"));
        let selection = store.with_view(|view| select_candidate(view, 1));
        assert_eq!(selected_name(&selection), Some("S2"));
    }

    #[test]
    fn test_blocked_countries_are_skipped() {
        let store = CatalogStore::with_endpoints(vec![
            endpoint("a", "China", 90.0),
            endpoint("b", "Japan", 50.0),
        ]);
        store.block("China");
        let selection = store.with_view(|view| select_candidate(view, 0));
        assert_eq!(selected_name(&selection), Some("b"));

        store.block("Japan");
        let selection = store.with_view(|view| select_candidate(view, 0));
        assert_eq!(selection, Selection::Exhausted);
    }

    #[test]
    fn test_all_failed_or_empty_is_exhausted() {
        let store = CatalogStore::new();
        assert_eq!(
            store.with_view(|view| select_candidate(view, 0)),
            Selection::Exhausted
        );

        store.replace(names(2));
        store.mark_failed("S1");
        store.mark_failed("S2");
        assert_eq!(
            store.with_view(|view| select_candidate(view, 0)),
            Selection::Exhausted
        );
    }

    #[test]
    fn test_cursor_past_end_is_exhausted() {
        let store = CatalogStore::with_endpoints(names(2));
        assert_eq!(
            store.with_view(|view| select_candidate(view, 2)),
            Selection::Exhausted
        );
    }

    #[test]
    fn test_cursor_reset_keeps_generation() {
        let mut cursor = ReconnectCursor {
            index: Some(3),
            attempts: 2,
            target: Some("S3".to_string()),
            generation: 1,
        };
        cursor.advance_past(3);
        assert_eq!(cursor.index, Some(4));
        cursor.reset(7);
        assert_eq!(
            cursor,
            ReconnectCursor {
                generation: 7,
                ..ReconnectCursor::default()
            }
        );
    }

    #[test]
    fn test_refresh_backoff_is_capped() {
        let max = Duration::from_secs(30);
        assert_eq!(refresh_backoff(0, max), Duration::from_secs(1));
        assert_eq!(refresh_backoff(3, max), Duration::from_secs(8));
        assert_eq!(refresh_backoff(9, max), max);
    }
}
