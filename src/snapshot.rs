//! In-memory snapshots that carry entity state across actor restarts.
//!
//! An actor may shut down when idle. Before it does, and after every state
//! change, its latest state is recorded here so the next actor spawned for
//! the same id resumes exactly where the previous one stopped. Durable
//! persistence is the host's concern; this map only outlives actors, not
//! the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A point-in-time copy of one entity's state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot<S> {
    /// The entity state at the time of the snapshot.
    pub state: S,
    /// Number of state replacements folded into `state`.
    pub version: u64,
    /// Number of commands that had reached a handler.
    pub commands_handled: u64,
}

/// Snapshots for every instance of one entity type, keyed by entity id.
///
/// `Clone` is cheap -- the map is `Arc`-wrapped and shared between the
/// store and the actors it spawns.
#[derive(Debug)]
pub(crate) struct SnapshotMap<S> {
    inner: Arc<RwLock<HashMap<String, Snapshot<S>>>>,
}

// Manual `Clone` because `S` need not be `Clone` to share the `Arc`.
impl<S> Clone for SnapshotMap<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Clone> SnapshotMap<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record `snapshot` for `entity_id`, unless a newer one is already
    /// stored.
    pub(crate) fn save(&self, entity_id: &str, snapshot: Snapshot<S>) {
        let mut map = self.inner.write().expect("snapshot map poisoned");
        match map.get(entity_id) {
            Some(existing) if existing.version > snapshot.version => {
                tracing::warn!(
                    entity_id,
                    stored = existing.version,
                    offered = snapshot.version,
                    "ignoring stale snapshot"
                );
            }
            _ => {
                map.insert(entity_id.to_owned(), snapshot);
            }
        }
    }

    /// The latest snapshot for `entity_id`, if the entity has ever been
    /// saved.
    pub(crate) fn load(&self, entity_id: &str) -> Option<Snapshot<S>> {
        self.inner
            .read()
            .expect("snapshot map poisoned")
            .get(entity_id)
            .cloned()
    }

    /// Number of entity ids with a stored snapshot.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().expect("snapshot map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(state: i64, version: u64) -> Snapshot<i64> {
        Snapshot {
            state,
            version,
            commands_handled: version,
        }
    }

    #[test]
    fn load_missing_returns_none() {
        let map = SnapshotMap::<i64>::new();
        assert_eq!(map.load("nope"), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn save_then_load() {
        let map = SnapshotMap::new();
        map.save("c-1", snap(10, 1));
        assert_eq!(map.load("c-1"), Some(snap(10, 1)));
        assert_eq!(map.load("c-2"), None);
    }

    #[test]
    fn newer_snapshot_replaces_older() {
        let map = SnapshotMap::new();
        map.save("c-1", snap(10, 1));
        map.save("c-1", snap(6, 2));
        assert_eq!(map.load("c-1"), Some(snap(6, 2)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let map = SnapshotMap::new();
        map.save("c-1", snap(6, 2));
        map.save("c-1", snap(10, 1));
        assert_eq!(map.load("c-1"), Some(snap(6, 2)));
    }

    #[test]
    fn clones_share_storage() {
        let map = SnapshotMap::new();
        let other = map.clone();
        other.save("c-1", snap(3, 1));
        assert_eq!(map.load("c-1"), Some(snap(3, 1)));
    }
}
