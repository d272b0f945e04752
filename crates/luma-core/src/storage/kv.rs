use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

/// Ordered key-value store owned by one partition task.
///
/// Writes come from the owning task only. Interactive reads may run
/// concurrently and can observe a write half-way through a multi-key update.
pub trait KeyValueStore<K, V>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    fn put(&self, key: K, value: V);

    /// Removing an absent key is not an error.
    fn delete(&self, key: &K) -> Option<V>;

    fn range(&self, from: Bound<K>, to: Bound<K>) -> Vec<(K, V)>;

    fn all(&self) -> Vec<(K, V)>;

    fn approximate_num_entries(&self) -> usize;
}

/// Lock-free ordered store backed by a concurrent skip list.
pub struct SkipMapStore<K, V> {
    name: String,
    map: SkipMap<K, V>,
}

impl<K, V> SkipMapStore<K, V>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: SkipMap::new(),
        }
    }
}

impl<K, V> KeyValueStore<K, V> for SkipMapStore<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|e| e.value().clone())
    }

    fn put(&self, key: K, value: V) {
        self.map.insert(key, value);
    }

    fn delete(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|e| e.value().clone())
    }

    fn range(&self, from: Bound<K>, to: Bound<K>) -> Vec<(K, V)> {
        self.map
            .range((from, to))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn all(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn approximate_num_entries(&self) -> usize {
        self.map.len()
    }
}
