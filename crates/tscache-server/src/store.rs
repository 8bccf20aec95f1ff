use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use imbl::OrdMap;

/// Entries sort by key, then window start, then window end, so one key's
/// windows are a contiguous range in ascending start order.
type EntryKey = (String, i64, i64);

#[derive(Debug, Clone)]
struct Entry {
    table_count: i64,
    payload: Arc<[u8]>,
}

/// In-memory entry store keyed by `(key, window)`.
///
/// Readers work on a lock-free snapshot; writers are serialised by a mutex
/// and publish a new map.
pub struct MemoryCache {
    entries: ArcSwap<OrdMap<EntryKey, Entry>>,
    write_lock: Mutex<()>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(OrdMap::new())),
            write_lock: Mutex::new(()),
        }
    }

    /// Store `payload` for `key` over `start..=end`, replacing an entry with
    /// the same window.
    pub fn set(&self, key: &str, start: i64, end: i64, table_count: i64, payload: Vec<u8>) {
        self.update(|entries| {
            entries.insert(
                (key.to_string(), start, end),
                Entry {
                    table_count,
                    payload: payload.into(),
                },
            );
        });
    }

    /// Concatenated payloads of every entry for `key` whose window intersects
    /// `start..=end`, ascending by window start.
    pub fn get(&self, key: &str, start: i64, end: i64) -> Vec<u8> {
        let entries = self.entries.load();
        let mut out = Vec::new();
        for ((_, from, to), entry) in entries.range(key_range(key)) {
            if *from <= end && start <= *to {
                out.extend_from_slice(&entry.payload);
            }
        }
        out
    }

    /// Remove every window of `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        self.update(|entries| {
            let keys: Vec<EntryKey> = entries
                .range(key_range(key))
                .map(|(k, _)| k.clone())
                .collect();
            removed = !keys.is_empty();
            for k in keys {
                entries.remove(&k);
            }
        });
        removed
    }

    /// Sum of the table counts recorded for `key`.
    pub fn table_count(&self, key: &str) -> i64 {
        self.entries
            .load()
            .range(key_range(key))
            .map(|(_, e)| e.table_count)
            .sum()
    }

    /// Number of stored windows across all keys.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, f: impl FnOnce(&mut OrdMap<EntryKey, Entry>)) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = (**self.entries.load()).clone();
        f(&mut data);
        self.entries.store(Arc::new(data));
    }
}

fn key_range(key: &str) -> RangeInclusive<EntryKey> {
    (key.to_string(), i64::MIN, i64::MIN)..=(key.to_string(), i64::MAX, i64::MAX)
}
