//! Write-ahead-log contract and the log-anchor registry.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Result};

use super::types::OpId;

/// Map from the highest op index contained in a WAL segment to that
/// segment's size in bytes.
pub type MaxIdxToSegmentSizeMap = BTreeMap<i64, u64>;

/// Write-ahead log as consumed by a tablet peer: GC accounting and teardown.
/// Appending entries is the replication engine's business.
pub trait Log: Send + Sync {
    /// Op-id of the newest entry, `OpId::invalid()` when the log has never
    /// been written.
    fn latest_entry_op_id(&self) -> OpId;

    /// Removes whole segments whose entries all fall below `min_index`.
    /// Returns the number of segments deleted.
    fn gc(&self, min_index: i64) -> Result<usize>;

    /// Per-segment size map for segments at or above `min_index`, used by
    /// maintenance scoring.
    fn max_indexes_to_segment_size_map(&self, min_index: i64) -> MaxIdxToSegmentSizeMap;

    /// Bytes that a GC at `min_index` would reclaim.
    fn gcable_data_size(&self, min_index: i64) -> u64;

    fn close(&self) -> Result<()>;

    fn on_disk_size(&self) -> u64;
}

/// Handle for one registered anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnchorId(u64);

#[derive(Debug, Default)]
struct AnchorInner {
    next_id: u64,
    anchors: BTreeMap<u64, Anchor>,
}

#[derive(Debug)]
struct Anchor {
    index: i64,
    owner: String,
}

/// Registry of minimum log indexes that must survive GC.
///
/// Components that still need old entries (snapshots in progress, lagging
/// readers) register an anchor; GC never collects below the earliest one.
#[derive(Debug, Default)]
pub struct LogAnchorRegistry {
    inner: Mutex<AnchorInner>,
}

impl LogAnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, index: i64, owner: impl Into<String>) -> AnchorId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.anchors.insert(
            id,
            Anchor {
                index,
                owner: owner.into(),
            },
        );
        AnchorId(id)
    }

    /// Moves an existing anchor to a new index.
    pub fn update(&self, id: AnchorId, index: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.anchors.get_mut(&id.0) {
            Some(anchor) => {
                anchor.index = index;
                Ok(())
            }
            None => bail!("log anchor {:?} is not registered", id),
        }
    }

    pub fn unregister(&self, id: AnchorId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.anchors.remove(&id.0) {
            Some(_) => Ok(()),
            None => bail!("log anchor {:?} is not registered", id),
        }
    }

    /// Smallest registered index, `None` when nothing is anchored.
    pub fn earliest_anchor_index(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.anchors.values().map(|anchor| anchor.index).min()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().anchors.len()
    }

    /// Owners of anchors at or below `index`, for diagnostics.
    pub fn owners_at_or_below(&self, index: i64) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .anchors
            .values()
            .filter(|anchor| anchor.index <= index)
            .map(|anchor| anchor.owner.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_anchor_tracks_register_update_unregister() {
        let registry = LogAnchorRegistry::new();
        assert_eq!(registry.earliest_anchor_index(), None);

        let a = registry.register(40, "snapshot");
        let b = registry.register(25, "reader");
        assert_eq!(registry.earliest_anchor_index(), Some(25));

        registry.update(b, 60).expect("update anchor");
        assert_eq!(registry.earliest_anchor_index(), Some(40));

        registry.unregister(a).expect("unregister anchor");
        assert_eq!(registry.earliest_anchor_index(), Some(60));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_twice_is_an_error() {
        let registry = LogAnchorRegistry::new();
        let id = registry.register(1, "x");
        registry.unregister(id).expect("first unregister");
        assert!(registry.unregister(id).is_err());
    }

    #[test]
    fn owners_at_or_below_filters_by_index() {
        let registry = LogAnchorRegistry::new();
        registry.register(10, "low");
        registry.register(100, "high");
        let owners = registry.owners_at_or_below(50);
        assert_eq!(owners, vec!["low".to_string()]);
    }
}
