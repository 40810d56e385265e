use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Process-local cache for session decisions.
///
/// Entries share a single expiry deadline that starts with the first insert
/// after the cache was empty; once it passes, the whole cache is dropped.
/// A capacity bound evicts least-recently-used entries. A zero TTL or zero
/// capacity disables caching.
#[derive(Debug)]
pub struct DecisionCache<K, V> {
    inner: Mutex<CacheState<K, V>>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    expires_at: Option<Instant>,
}

impl<K, V> DecisionCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                expires_at: None,
            }),
            capacity,
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.ttl.is_zero()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.inner.lock();
        Self::expire(&mut state, now);
        let value = state.entries.get(key).cloned();
        if value.is_some() {
            Self::touch(&mut state, key);
        }
        value
    }

    fn insert_at(&self, key: K, value: V, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.inner.lock();
        Self::expire(&mut state, now);
        if state.expires_at.is_none() {
            state.expires_at = Some(now + self.ttl);
        }
        state.entries.insert(key.clone(), value);
        Self::touch(&mut state, &key);
        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drops every entry and resets the expiry deadline.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.order.clear();
        state.expires_at = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(state: &mut CacheState<K, V>, now: Instant) {
        if state.expires_at.is_some_and(|deadline| now >= deadline) {
            state.entries.clear();
            state.order.clear();
            state.expires_at = None;
        }
    }

    fn touch(state: &mut CacheState<K, V>, key: &K) {
        state.order.retain(|existing| existing != key);
        state.order.push_back(key.clone());
    }
}
