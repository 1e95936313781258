use std::collections::HashMap;

/// Byte-bounded LFU cache for small file payloads.
///
/// Eviction removes the least-frequently-used entry, breaking ties by
/// least-recent access. Capacity counts payload bytes, not entries; a
/// `put` that overflows the budget evicts until the budget holds again,
/// which can include the entry just inserted when it is the coldest.
#[derive(Debug)]
pub struct LfuCache {
    capacity: usize,
    size: usize,
    tick: u64,
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    freq: u64,
    touched: u64,
}

impl LfuCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            size: 0,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        entry.freq += 1;
        entry.touched = tick;
        Some(entry.value.clone())
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }

        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.size = self.size - entry.value.len() + value.len();
                entry.value = value;
                entry.freq += 1;
                entry.touched = tick;
            }
            None => {
                self.size += value.len();
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value,
                        freq: 1,
                        touched: tick,
                    },
                );
            }
        }

        self.recycle();
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.size -= entry.value.len();
        }
    }

    fn recycle(&mut self) {
        while self.size > self.capacity && !self.entries.is_empty() {
            let coldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.freq, entry.touched))
                .map(|(key, _)| key.clone());

            if let Some(key) = coldest {
                self.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_frequent_first() {
        let mut cache = LfuCache::new(3);
        cache.put("a", vec![0]);
        cache.put("b", vec![0]);
        cache.put("c", vec![0]);

        // Warm a and c; b stays at frequency 1.
        cache.get("a");
        cache.get("c");

        cache.put("d", vec![0]);
        assert!(!cache.contains("b"));
        assert!(cache.contains("a") && cache.contains("c") && cache.contains("d"));
    }

    #[test]
    fn ties_break_least_recently_used() {
        let mut cache = LfuCache::new(2);
        cache.put("old", vec![0]);
        cache.put("new", vec![0]);

        // Both at frequency 1; "old" was touched earlier.
        cache.put("next", vec![0]);
        assert!(!cache.contains("old"));
        assert!(cache.contains("new") && cache.contains("next"));
    }

    #[test]
    fn capacity_counts_bytes() {
        let mut cache = LfuCache::new(10);
        cache.put("a", vec![0; 6]);
        cache.put("b", vec![0; 4]);
        assert_eq!(cache.size_bytes(), 10);

        cache.put("c", vec![0; 3]);
        assert!(cache.size_bytes() <= 10);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replacing_adjusts_size() {
        let mut cache = LfuCache::new(10);
        cache.put("a", vec![0; 8]);
        cache.put("a", vec![0; 2]);
        assert_eq!(cache.size_bytes(), 2);
        assert_eq!(cache.get("a").expect("entry").len(), 2);
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = LfuCache::new(0);
        cache.put("a", vec![0]);
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn oversized_entry_does_not_wedge_the_cache() {
        let mut cache = LfuCache::new(4);
        cache.put("big", vec![0; 100]);
        assert!(cache.is_empty());

        cache.put("fits", vec![0; 3]);
        assert!(cache.contains("fits"));
    }
}
