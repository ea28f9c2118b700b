//! Build cache for programs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::program::CompiledProgram;

/// Successful builds keyed by source text and compiler options.
///
/// Identical source built with identical options reuses one native program.
/// Failed builds are never cached.
pub(crate) struct ProgramCache<P = CompiledProgram> {
    cache: Mutex<HashMap<(String, String), Arc<P>>>,
    hits: AtomicUsize,
}

impl<P> ProgramCache<P> {
    pub(crate) fn new() -> Self {
        ProgramCache {
            cache: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self, source: &str, options: &str) -> Option<Arc<P>> {
        let cache_key = (source.to_string(), options.to_string());
        let hit = self.entries().get(&cache_key).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Program cache hit ({})", options);
        }
        hit
    }

    pub(crate) fn insert(&self, source: &str, options: &str, program: Arc<P>) {
        self.entries()
            .insert((source.to_string(), options.to_string()), program);
    }

    pub(crate) fn clear(&self) {
        self.entries().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(String, String), Arc<P>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keyed_by_source_and_options() {
        let cache: ProgramCache<String> = ProgramCache::new();
        cache.insert("kernel void k() {}", "-I \".\"", Arc::new("a".into()));

        assert_eq!(
            cache.get("kernel void k() {}", "-I \".\"").as_deref(),
            Some(&"a".to_string())
        );
        assert!(cache.get("kernel void k() {}", "-I \".\" -DX").is_none());
        assert!(cache.get("kernel void j() {}", "-I \".\"").is_none());
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_cache_shares_entries() {
        let cache: ProgramCache<String> = ProgramCache::new();
        let entry = Arc::new("shared".to_string());
        cache.insert("src", "", entry.clone());

        let hit = cache.get("src", "").unwrap();
        assert!(Arc::ptr_eq(&hit, &entry));

        cache.clear();
        assert_eq!(cache.len(), 0);
        assert_eq!(Arc::strong_count(&entry), 2);
    }
}
