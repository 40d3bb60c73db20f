//! In-memory inventory tracker: one per instance, holding the durable record
//! of every object the engine has applied or adopted on its behalf.
use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use pequod_core::{gvk::ObjectIdentity, hash::ContentHash, InventoryItem, InventoryStatus};

/// Thread-safe store of [`InventoryItem`]s keyed by node id, with a
/// monotonic generation counter bumped on every mutation so callers can
/// detect whether a snapshot is stale without diffing it.
#[derive(Default)]
pub struct InventoryTracker {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<String, InventoryItem>,
    generation: u64,
}

impl InventoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the tracker from a durable snapshot (e.g. an instance's
    /// `status.inventory`), as read at reconciler startup.
    pub fn from_items(items: Vec<InventoryItem>) -> Self {
        let items = items.into_iter().map(|item| (item.id.clone(), item)).collect();
        Self {
            inner: RwLock::new(Inner { items, generation: 0 }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn record(&self, item: InventoryItem) {
        let mut inner = self.inner.write();
        inner.items.insert(item.id.clone(), item);
        inner.generation += 1;
    }

    pub fn get(&self, id: &str) -> Option<InventoryItem> {
        self.inner.read().items.get(id).cloned()
    }

    pub fn set_status(&self, id: &str, status: InventoryStatus) {
        let mut inner = self.inner.write();
        if let Some(item) = inner.items.get_mut(id) {
            item.status = status;
            inner.generation += 1;
        }
    }

    pub fn remove(&self, id: &str) -> Option<InventoryItem> {
        let mut inner = self.inner.write();
        let removed = inner.items.remove(id);
        if removed.is_some() {
            inner.generation += 1;
        }
        removed
    }

    /// Ids present in the inventory but not in `current_ids`.
    pub fn orphaned_ids(&self, current_ids: &std::collections::BTreeSet<String>) -> Vec<String> {
        self.inner
            .read()
            .items
            .values()
            .filter(|item| !current_ids.contains(&item.id) && item.status != InventoryStatus::Pruned)
            .map(|item| item.id.clone())
            .collect()
    }

    /// Drop items already in `Orphaned`/`Pruned` status, per the pruner's
    /// `CleanupOrphaned` helper.
    pub fn cleanup_orphaned(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.items.len();
        inner
            .items
            .retain(|_, item| !matches!(item.status, InventoryStatus::Orphaned | InventoryStatus::Pruned));
        let removed = before - inner.items.len();
        if removed > 0 {
            inner.generation += 1;
        }
        removed
    }

    /// A durable snapshot suitable for writing back to `status.inventory`.
    pub fn snapshot(&self) -> Vec<InventoryItem> {
        self.inner.read().items.values().cloned().collect()
    }

    pub fn identity_of(&self, id: &str) -> Option<ObjectIdentity> {
        self.inner.read().items.get(id).map(|item| item.identity.clone())
    }

    pub fn hash_of(&self, id: &str) -> Option<ContentHash> {
        self.inner.read().items.get(id).map(|item| item.hash.clone())
    }
}

/// Keeps one [`InventoryTracker`] per owning instance (keyed by UID), so
/// inventory survives across re-renders as long as the instance itself does.
#[derive(Default)]
pub struct InventoryRegistry {
    trackers: RwLock<BTreeMap<String, Arc<InventoryTracker>>>,
}

impl InventoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a tracker for this instance is already warm in memory, so
    /// callers can skip re-reading a durable seed they'd just discard.
    pub fn contains(&self, instance_uid: &str) -> bool {
        self.trackers.read().contains_key(instance_uid)
    }

    pub fn tracker_for(&self, instance_uid: &str, seed: impl FnOnce() -> Vec<InventoryItem>) -> Arc<InventoryTracker> {
        if let Some(tracker) = self.trackers.read().get(instance_uid) {
            return tracker.clone();
        }
        let mut trackers = self.trackers.write();
        trackers
            .entry(instance_uid.to_string())
            .or_insert_with(|| Arc::new(InventoryTracker::from_items(seed())))
            .clone()
    }

    pub fn remove(&self, instance_uid: &str) {
        self.trackers.write().remove(instance_uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pequod_core::gvk::GroupVersionKind;

    fn item(id: &str) -> InventoryItem {
        InventoryItem::new(
            id,
            ObjectIdentity::new(GroupVersionKind::gvk("apps", "v1", "Deployment"), Some("default".into()), id),
            ContentHash::of_object(&serde_json::json!({"spec": {}})),
            InventoryStatus::Applied,
        )
    }

    #[test]
    fn round_trips_through_a_snapshot() {
        let tracker = InventoryTracker::new();
        tracker.record(item("a"));
        tracker.record(item("b"));
        let snapshot = tracker.snapshot();
        let restored = InventoryTracker::from_items(snapshot.clone());
        let mut restored_snapshot = restored.snapshot();
        let mut original_snapshot = snapshot;
        restored_snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        original_snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(restored_snapshot, original_snapshot);
    }

    #[test]
    fn orphaned_ids_excludes_current_and_already_pruned() {
        let tracker = InventoryTracker::new();
        tracker.record(item("keep"));
        tracker.record(item("drop"));
        let mut pruned = item("already-pruned");
        pruned.status = InventoryStatus::Pruned;
        tracker.record(pruned);

        let current = std::collections::BTreeSet::from(["keep".to_string()]);
        let orphaned = tracker.orphaned_ids(&current);
        assert_eq!(orphaned, vec!["drop".to_string()]);
    }

    #[test]
    fn generation_advances_on_mutation() {
        let tracker = InventoryTracker::new();
        let g0 = tracker.generation();
        tracker.record(item("a"));
        assert!(tracker.generation() > g0);
    }
}
