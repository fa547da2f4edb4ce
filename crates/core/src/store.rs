use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::models::MappingSnapshot;

/// Persists one complete mapping per account key.
///
/// `save` is a full replace. Writers for the same key must be serialized by the
/// caller; nothing here merges concurrent saves.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &MappingSnapshot) -> Result<()>;

    fn load(&self, account_key: &str) -> Result<Option<MappingSnapshot>>;

    fn clear(&self, account_key: &str) -> Result<()>;

    /// A missing snapshot counts as stale.
    fn is_stale(&self, account_key: &str, max_age: Duration) -> Result<bool> {
        Ok(match self.load(account_key)? {
            Some(snapshot) => snapshot_is_stale(&snapshot, max_age),
            None => true,
        })
    }
}

pub fn snapshot_is_stale(snapshot: &MappingSnapshot, max_age: Duration) -> bool {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    snapshot.age(Utc::now()) > max_age
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, MappingSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &MappingSnapshot) -> Result<()> {
        let mut guard = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(snapshot.owner_account_key.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, account_key: &str) -> Result<Option<MappingSnapshot>> {
        let guard = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(account_key).cloned())
    }

    fn clear(&self, account_key: &str) -> Result<()> {
        let mut guard = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(account_key);
        Ok(())
    }
}

impl<T: SnapshotStore + ?Sized> SnapshotStore for std::sync::Arc<T> {
    fn save(&self, snapshot: &MappingSnapshot) -> Result<()> {
        (**self).save(snapshot)
    }

    fn load(&self, account_key: &str) -> Result<Option<MappingSnapshot>> {
        (**self).load(account_key)
    }

    fn clear(&self, account_key: &str) -> Result<()> {
        (**self).clear(account_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(key: &str, count: usize) -> MappingSnapshot {
        let records = (0..count)
            .map(|i| crate::models::FileRecord {
                id: format!("file-{i}"),
                name: format!("f{i}"),
                mime_type: "text/plain".into(),
                is_container: false,
                parent_id: None,
                path: format!("f{i}"),
                is_shared: false,
                access_entries: Vec::new(),
                external_link: None,
                last_modified: None,
                size_bytes: None,
                owner_identity: None,
            })
            .collect();
        MappingSnapshot::new(key, records, false)
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let store = MemorySnapshotStore::new();
        store.save(&snapshot("a@example.com", 3)).unwrap();
        store.save(&snapshot("a@example.com", 1)).unwrap();
        let loaded = store.load("a@example.com").unwrap().unwrap();
        assert_eq!(loaded.record_count, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keys_are_isolated() {
        let store = MemorySnapshotStore::new();
        store.save(&snapshot("a@example.com", 2)).unwrap();
        assert!(store.load("b@example.com").unwrap().is_none());
        store.clear("b@example.com").unwrap();
        assert!(store.load("a@example.com").unwrap().is_some());
    }

    #[test]
    fn missing_snapshot_is_stale() {
        let store = MemorySnapshotStore::new();
        assert!(store.is_stale("nobody", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn staleness_compares_capture_time() {
        let store = MemorySnapshotStore::new();
        let mut snap = snapshot("a@example.com", 1);
        store.save(&snap).unwrap();
        assert!(!store.is_stale("a@example.com", Duration::from_secs(60)).unwrap());

        snap.captured_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&snap).unwrap();
        assert!(store.is_stale("a@example.com", Duration::from_secs(3600)).unwrap());
    }
}
