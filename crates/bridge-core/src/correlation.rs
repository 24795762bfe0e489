use bytes::Bytes;
use std::collections::HashMap;

/// CorrelationRegistry maps opaque correlation ids to the in-flight session
/// (typically the key of a proxy) which awaits asynchronous replies bearing it.
/// Ids are matched by exact byte equality, and are never parsed.
/// The registry doesn't own the lifecycle of its sessions: its owner
/// releases a session's resources before removing it.
#[derive(Debug)]
pub struct CorrelationRegistry<K> {
    entries: HashMap<Bytes, K>,
}

impl<K> Default for CorrelationRegistry<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K> CorrelationRegistry<K> {
    pub fn lookup(&self, correlation_id: &[u8]) -> Option<&K> {
        self.entries.get(correlation_id)
    }

    pub fn lookup_mut(&mut self, correlation_id: &[u8]) -> Option<&mut K> {
        self.entries.get_mut(correlation_id)
    }

    /// Insert a session under `correlation_id`. An existing session of the
    /// same id is displaced (last writer wins) and returned.
    pub fn insert(&mut self, correlation_id: Bytes, session: K) -> Option<K> {
        let prior = self.entries.insert(correlation_id, session);

        if prior.is_some() {
            tracing::warn!("displaced an in-flight session having the same correlation id");
        }
        prior
    }

    /// Remove the session of `correlation_id` if `is_closed` reports both of
    /// its directions are closed. Removing an absent id is a no-op.
    pub fn remove_if_closed(
        &mut self,
        correlation_id: &[u8],
        is_closed: impl FnOnce(&K) -> bool,
    ) -> Option<K> {
        if !is_closed(self.entries.get(correlation_id)?) {
            return None;
        }
        self.entries.remove(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain all sessions, as when their binding is detached.
    pub fn drain(&mut self) -> impl Iterator<Item = (Bytes, K)> + '_ {
        self.entries.drain()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::{Direction, Phase, StreamState};

    #[test]
    #[tracing_test::traced_test]
    fn test_registry_lifecycle() {
        let mut registry = CorrelationRegistry::<StreamState>::default();
        let opened = StreamState::default()
            .to(Direction::Initial, Phase::Opened)
            .to(Direction::Reply, Phase::Opened);

        assert!(registry
            .insert(Bytes::from_static(b"abc"), opened)
            .is_none());
        assert!(registry.lookup(b"abc").is_some());
        // Exact match only.
        assert!(registry.lookup(b"ABC").is_none());
        assert!(registry.lookup(b"abc ").is_none());

        // Not yet closed.
        assert!(registry
            .remove_if_closed(b"abc", |state| state.is_closed())
            .is_none());

        let closed = registry.lookup_mut(b"abc").unwrap();
        *closed = closed
            .to(Direction::Initial, Phase::Closed)
            .to(Direction::Reply, Phase::Closed);

        assert!(registry
            .remove_if_closed(b"abc", |state| state.is_closed())
            .is_some());
        assert!(registry
            .remove_if_closed(b"abc", |state| state.is_closed())
            .is_none());
        assert!(registry.is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_duplicate_insert_displaces() {
        let mut registry = CorrelationRegistry::default();
        registry.insert(Bytes::from_static(b"id"), 1);
        assert_eq!(registry.insert(Bytes::from_static(b"id"), 2), Some(1));
        assert_eq!(registry.lookup(b"id"), Some(&2));
        assert!(logs_contain("displaced an in-flight session"));

        assert_eq!(registry.drain().count(), 1);
        assert_eq!(registry.len(), 0);
    }
}
