use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tracing::trace;

use super::ResultNode;
use super::arg::{CallArg, args_key};
use crate::scope::ScopeKey;

/// Identifies one completed call. The scope part keeps a shadowed function's results apart
/// from the ancestor definition it shadows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    function: String,
    scope: ScopeKey,
    args: String,
}

impl CacheKey {
    pub fn new(function: &str, scope: ScopeKey, args: &[CallArg]) -> Self {
        Self {
            function: function.to_string(),
            scope,
            args: args_key(args),
        }
    }
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<FxHashMap<CacheKey, ResultNode>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<ResultNode> {
        let found = self.lock().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: CacheKey, result: ResultNode) {
        self.lock().insert(key, result);
    }

    /// Drops every entry for `function`, in all scopes. Returns how many were removed.
    pub fn invalidate_function(&self, function: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| key.function != function);
        let removed = before - entries.len();
        trace!(function, removed, "Invalidated cached results");
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<CacheKey, ResultNode>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(function: &str, depth: u32, arg: f64) -> CacheKey {
        CacheKey::new(function, ScopeKey { depth, sequence: 0 }, &[CallArg::from(arg)])
    }

    #[test]
    fn test_get_and_stats() {
        let cache = ResultCache::new();
        assert!(cache.get(&key("f", 0, 1.0)).is_none());
        cache.insert(key("f", 0, 1.0), ResultNode::keyword("a"));
        assert_eq!(cache.get(&key("f", 0, 1.0)), Some(ResultNode::keyword("a")));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn test_scopes_do_not_share_entries() {
        let cache = ResultCache::new();
        cache.insert(key("f", 0, 1.0), ResultNode::keyword("root"));
        assert!(cache.get(&key("f", 1, 1.0)).is_none());
    }

    #[test]
    fn test_invalidate_function() {
        let cache = ResultCache::new();
        cache.insert(key("f", 0, 1.0), ResultNode::null());
        cache.insert(key("f", 1, 2.0), ResultNode::null());
        cache.insert(key("g", 0, 1.0), ResultNode::null());
        assert_eq!(cache.invalidate_function("f"), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
