use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Transfers in progress, keyed by stream id.
pub(crate) struct InflightTable<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for InflightTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> InflightTable<T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a transfer. Returns `false` if the id is already taken.
    pub(crate) fn insert(&self, sid: &str, ctx: Arc<T>) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(sid) {
            return false;
        }
        entries.insert(sid.to_string(), ctx);
        true
    }

    pub(crate) fn get(&self, sid: &str) -> Option<Arc<T>> {
        self.entries().get(sid).cloned()
    }

    /// Remove `ctx` if it is still the entry for `sid`. Only the first of
    /// several competing teardown paths gets `true`.
    pub(crate) fn remove(&self, sid: &str, ctx: &Arc<T>) -> bool {
        let mut entries = self.entries();
        match entries.get(sid) {
            Some(current) if Arc::ptr_eq(current, ctx) => {
                entries.remove(sid);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}
