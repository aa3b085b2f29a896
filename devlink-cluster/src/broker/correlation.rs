use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

/// What to do with an entry after [`CorrelationTable::update`] touched it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
    Keep,
    Remove,
}

/// Concurrent table of outstanding correlations, at most one per key
///
/// Every operation is atomic with respect to its key: callers never look an
/// entry up and act on it in two separate steps.
pub struct CorrelationTable<K, V>
where
    K: Eq + Hash,
{
    entries: Arc<DashMap<K, V>>,
}

impl<K, V> Clone for CorrelationTable<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K, V> CorrelationTable<K, V>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Insert `value` unless `key` is taken; hands the value back on conflict
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<(), V> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                Ok(())
            }
        }
    }

    pub fn remove_if_present(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Remove the entry for `key` only if `predicate` holds for it
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }

    /// Run `f` on the live entry for `key` while holding it exclusively
    ///
    /// Returns `None` without calling `f` when no entry exists. When `f`
    /// answers [`Retain::Remove`] the entry is dropped before any other caller
    /// can observe it again.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> (R, Retain)) -> Option<R> {
        // Cheap read first so misses never take the shard write lock
        if !self.entries.contains_key(key) {
            return None;
        }
        match self.entries.entry(key.clone()) {
            Entry::Vacant(_) => None,
            Entry::Occupied(mut occupied) => {
                let (result, retain) = f(occupied.get_mut());
                if retain == Retain::Remove {
                    occupied.remove();
                }
                Some(result)
            }
        }
    }

    /// Keep only the entries for which `keep` answers true
    pub fn retain(&self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.entries.retain(keep);
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for CorrelationTable<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let table = CorrelationTable::new();
        assert!(table.insert_if_absent("m1".to_string(), 1).is_ok());
        assert_eq!(table.insert_if_absent("m1".to_string(), 2), Err(2));
        assert_eq!(table.remove_if_present(&"m1".to_string()), Some(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_removes_atomically() {
        let table = CorrelationTable::new();
        table.insert_if_absent("g".to_string(), 2_i64).unwrap();

        let first = table.update(&"g".to_string(), |remaining| {
            *remaining -= 1;
            (*remaining, if *remaining <= 0 { Retain::Remove } else { Retain::Keep })
        });
        assert_eq!(first, Some(1));
        assert!(table.contains(&"g".to_string()));

        let second = table.update(&"g".to_string(), |remaining| {
            *remaining -= 1;
            (*remaining, if *remaining <= 0 { Retain::Remove } else { Retain::Keep })
        });
        assert_eq!(second, Some(0));
        assert!(!table.contains(&"g".to_string()));

        assert_eq!(table.update(&"g".to_string(), |_| ((), Retain::Keep)), None);
    }

    #[test]
    fn test_remove_if_checks_predicate() {
        let table = CorrelationTable::new();
        table.insert_if_absent("m1".to_string(), 7_u64).unwrap();

        assert_eq!(table.remove_if(&"m1".to_string(), |token| *token == 8), None);
        assert_eq!(table.remove_if(&"m1".to_string(), |token| *token == 7), Some(7));
    }

    #[test]
    fn test_retain_drops_rejected_entries() {
        let table = CorrelationTable::new();
        table.insert_if_absent("m1".to_string(), 1_u64).unwrap();
        table.insert_if_absent("m2".to_string(), 2_u64).unwrap();

        table.retain(|_, value| *value % 2 == 0);
        assert!(!table.contains(&"m1".to_string()));
        assert!(table.contains(&"m2".to_string()));
    }

    #[test]
    fn test_concurrent_first_touch_shares_one_entry() {
        let table = CorrelationTable::new();
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let table = table.clone();
                    scope.spawn(move || usize::from(table.insert_if_absent("m1".to_string(), i).is_ok()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(table.len(), 1);
    }
}
