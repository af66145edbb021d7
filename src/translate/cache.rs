//! Content-addressed segment cache.
//! Key: blake3 hash of (segment lines | relevant glossary | backend identity).
//! Lookups and saves are best-effort from the orchestrator's point of view;
//! implementations report failures and the caller treats them as misses.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use super::glossary::Glossary;

pub type CacheKey = String;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(String),
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Compute the cache key for a segment. Any change to the lines, the relevant
/// glossary subset, or the backend identity yields a different key.
pub fn segment_cache_key(lines: &[String], glossary: &Glossary, identity: &str) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    for line in lines {
        hasher.update(&(line.len() as u64).to_le_bytes());
        hasher.update(line.as_bytes());
    }
    hasher.update(b"|");
    for (source, target) in glossary.iter() {
        hasher.update(&(source.len() as u64).to_le_bytes());
        hasher.update(source.as_bytes());
        hasher.update(&(target.len() as u64).to_le_bytes());
        hasher.update(target.as_bytes());
    }
    hasher.update(b"|");
    hasher.update(identity.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Storage for translated segments. Writers use disjoint keys; each `save`
/// must be atomic per key.
pub trait SegmentCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<String>>, CacheError>;
    fn save(&self, key: &str, lines: &[String]) -> Result<(), CacheError>;
}

/// Bounded in-memory LRU cache.
pub struct MemorySegmentCache {
    inner: Mutex<LruCache<CacheKey, Vec<String>>>,
}

impl MemorySegmentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl SegmentCache for MemorySegmentCache {
    fn get(&self, key: &str) -> Result<Option<Vec<String>>, CacheError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn save(&self, key: &str, lines: &[String]) -> Result<(), CacheError> {
        self.inner.lock().put(key.to_string(), lines.to_vec());
        Ok(())
    }
}

/// L1 memory cache in front of a slower persistent L2.
pub struct TieredSegmentCache {
    l1: MemorySegmentCache,
    l2: Arc<dyn SegmentCache>,
}

impl TieredSegmentCache {
    pub fn new(l1_capacity: usize, l2: Arc<dyn SegmentCache>) -> Self {
        Self {
            l1: MemorySegmentCache::new(l1_capacity),
            l2,
        }
    }
}

impl SegmentCache for TieredSegmentCache {
    fn get(&self, key: &str) -> Result<Option<Vec<String>>, CacheError> {
        if let Some(lines) = self.l1.get(key)? {
            return Ok(Some(lines));
        }
        let found = self.l2.get(key)?;
        if let Some(ref lines) = found {
            self.l1.save(key, lines)?;
        }
        Ok(found)
    }

    fn save(&self, key: &str, lines: &[String]) -> Result<(), CacheError> {
        self.l1.save(key, lines)?;
        self.l2.save(key, lines)
    }
}
