use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::backend::{BackendReader, BackendWriter};

/// Stream state of one open file. Lives behind a `tokio::sync::Mutex`
/// because backend I/O is awaited while it is borrowed; the striped guard
/// in `locks.rs` provides the per-handle ordering on top.
pub struct EntryIo {
    pub reader: Option<Box<dyn BackendReader>>,
    pub writer: Option<Box<dyn BackendWriter>>,
    /// Highest offset written so far. Advisory: writes below it are
    /// treated as already-applied retries.
    pub write_cursor: u64,
}

/// One open file: a handle id, the logical (FUSE-side) path it was opened
/// under, and its backend streams.
pub struct OpenFileEntry {
    id: u64,
    path: RwLock<String>,
    pub io: Mutex<EntryIo>,
}

impl OpenFileEntry {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current logical path; follows renames of the underlying object.
    pub fn path(&self) -> String {
        self.path.read().clone()
    }
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<u64, Arc<OpenFileEntry>>,
    by_path: HashMap<String, u64>,
}

/// Registry of active file handles, indexed by handle id and by current
/// logical path. Both views live under one lock so rename propagation can
/// never be observed half-applied.
#[derive(Default)]
pub struct OpenFileTable {
    next_id: AtomicU64,
    tables: RwLock<Tables>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new entry and returns its handle id. Ids are unique for
    /// the table's lifetime.
    pub fn allocate(
        &self,
        path: &str,
        reader: Option<Box<dyn BackendReader>>,
        writer: Option<Box<dyn BackendWriter>>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(OpenFileEntry {
            id,
            path: RwLock::new(path.to_string()),
            io: Mutex::new(EntryIo {
                reader,
                writer,
                write_cursor: 0,
            }),
        });
        let mut tables = self.tables.write();
        tables.by_id.insert(id, entry);
        tables.by_path.insert(path.to_string(), id);
        id
    }

    /// Lookup by handle id; `None` means the handle is stale.
    pub fn get(&self, id: u64) -> Option<Arc<OpenFileEntry>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Lookup by current logical path. Used only by rename propagation;
    /// with several handles open on one path this sees the newest.
    pub fn get_by_path(&self, path: &str) -> Option<Arc<OpenFileEntry>> {
        let tables = self.tables.read();
        let id = tables.by_path.get(path)?;
        tables.by_id.get(id).cloned()
    }

    /// Atomically removes and returns the entry; `None` means stale.
    pub fn remove(&self, id: u64) -> Option<Arc<OpenFileEntry>> {
        let mut tables = self.tables.write();
        let entry = tables.by_id.remove(&id)?;
        let path = entry.path.read().clone();
        if tables.by_path.get(&path) == Some(&id) {
            tables.by_path.remove(&path);
        }
        Some(entry)
    }

    /// Retargets the entry currently registered under `old_path` so that
    /// operations addressing the handle keep working after the backend
    /// object moved.
    pub fn rename_path(&self, old_path: &str, new_path: &str) {
        let mut tables = self.tables.write();
        let Some(id) = tables.by_path.remove(old_path) else {
            return;
        };
        if let Some(entry) = tables.by_id.get(&id) {
            *entry.path.write() = new_path.to_string();
            tables.by_path.insert(new_path.to_string(), id);
        }
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let table = OpenFileTable::new();
        let a = table.allocate("/a", None, None);
        let b = table.allocate("/b", None, None);
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn get_and_remove_by_id() {
        let table = OpenFileTable::new();
        let id = table.allocate("/a", None, None);
        assert_eq!(table.get(id).unwrap().path(), "/a");

        let removed = table.remove(id).unwrap();
        assert_eq!(removed.id(), id);
        assert!(table.get(id).is_none());
        assert!(table.remove(id).is_none());
        assert!(table.get_by_path("/a").is_none());
    }

    #[test]
    fn rename_updates_both_views() {
        let table = OpenFileTable::new();
        let id = table.allocate("/a", None, None);
        table.rename_path("/a", "/b");

        assert_eq!(table.get(id).unwrap().path(), "/b");
        assert!(table.get_by_path("/a").is_none());
        assert_eq!(table.get_by_path("/b").unwrap().id(), id);
    }

    #[test]
    fn rename_of_unopened_path_is_a_no_op() {
        let table = OpenFileTable::new();
        let id = table.allocate("/a", None, None);
        table.rename_path("/zzz", "/b");
        assert_eq!(table.get(id).unwrap().path(), "/a");
    }

    #[test]
    fn remove_keeps_unrelated_path_entries() {
        let table = OpenFileTable::new();
        let first = table.allocate("/a", None, None);
        let second = table.allocate("/a", None, None);

        // The path index points at the newest handle for "/a"; removing
        // the older one must not disturb it.
        table.remove(first);
        assert_eq!(table.get_by_path("/a").unwrap().id(), second);
    }

    #[tokio::test]
    async fn write_cursor_starts_at_zero() {
        let table = OpenFileTable::new();
        let id = table.allocate("/a", None, None);
        let entry = table.get(id).unwrap();
        assert_eq!(entry.io.lock().await.write_cursor, 0);
    }
}
