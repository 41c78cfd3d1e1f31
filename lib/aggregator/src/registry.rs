//! Process-wide map from correlation id to live aggregation state.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{event::CorrelationId, state::AggregationState};

/// Concurrent registry of in-flight correlations.
///
/// `remove` is the serialization point for termination: of the callback,
/// deadline, and client-disconnect paths, only the caller whose `remove`
/// returns the state may emit the summary and close the channel.
#[derive(Default)]
pub struct CorrelationRegistry {
    inner: DashMap<CorrelationId, Arc<AggregationState>>,
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id and inserts fresh state for it.
    pub fn create(&self, patient_id: &str) -> (CorrelationId, Arc<AggregationState>) {
        let id = CorrelationId::generate();
        let state = Arc::new(AggregationState::new(patient_id));
        self.inner.insert(id, Arc::clone(&state));
        (id, state)
    }

    #[must_use]
    pub fn get(&self, id: &CorrelationId) -> Option<Arc<AggregationState>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Atomic remove-and-return. Returns `None` if another path already
    /// effected termination.
    pub fn remove(&self, id: &CorrelationId) -> Option<Arc<AggregationState>> {
        self.inner.remove(id).map(|(_, state)| state)
    }

    /// Empties the registry, returning every live correlation. Used on
    /// shutdown to flush pending work.
    pub fn drain(&self) -> Vec<(CorrelationId, Arc<AggregationState>)> {
        let ids: Vec<_> = self.inner.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(&id).map(|state| (id, state)))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_allocates_distinct_ids() {
        let registry = CorrelationRegistry::new();
        let (first, _) = registry.create("p");
        let (second, _) = registry.create("p");
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_returns_the_state_exactly_once() {
        let registry = CorrelationRegistry::new();
        let (id, _) = registry.create("p");

        assert!(registry.get(&id).is_some());
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = CorrelationRegistry::new();
        registry.create("a");
        registry.create("b");

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
