use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
};

use crate::{error::DbError, utils::HandyRwLock};

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, DbError>;
pub type DbResult = Result<(), DbError>;

/// A coarse-grained concurrent map: one RwLock around a HashMap. Claims
/// through this map are short (lookup/insert only); long-lived ownership
/// of the values is expressed through the claim tables, not here.
pub struct ConcurrentHashMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.rl().get(key).cloned()
    }

    pub fn get_or_insert<F>(&self, key: &K, f: F) -> Result<V, DbError>
    where
        F: FnOnce(&K) -> Result<V, DbError>,
    {
        if let Some(v) = self.inner.rl().get(key) {
            return Ok(v.clone());
        }

        let mut inner = self.inner.wl();
        // re-check, another thread may have inserted while we waited
        if let Some(v) = inner.get(key) {
            return Ok(v.clone());
        }
        let v = f(key)?;
        inner.insert(key.clone(), v.clone());
        Ok(v)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.wl().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.wl().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.rl().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.rl().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.rl().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.rl().len()
    }

    pub fn clear(&self) {
        self.inner.wl().clear();
    }
}
