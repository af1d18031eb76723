//! Per-run content cache using moka
//!
//! Maps the store's hash of an image's first original file to the file-mode
//! identifier computed for it, so images sharing a file are hashed once per
//! run. Pixel-mode identifiers are never cached: images cut from one
//! multi-image file share its hash but not their pixels. Nothing here
//! survives a restart.

use crate::config::HashMode;
use biocode_core::ContentIdentifier;
use moka::future::Cache;

/// Cache key: store-side file hash and the mode the identifier was built in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Hash recorded by the store
    pub store_hash: String,
    /// Hash mode
    pub mode: HashMode,
}

impl CacheKey {
    /// Key for a file hash, or `None` when the store recorded no hash or
    /// the identifier does not depend on the file alone
    #[must_use]
    pub fn new(store_hash: Option<&str>, mode: HashMode) -> Option<Self> {
        if mode == HashMode::Pixels {
            return None;
        }
        store_hash.filter(|h| !h.is_empty()).map(|h| Self {
            store_hash: h.to_string(),
            mode,
        })
    }
}

/// Identifier cache
#[derive(Debug, Clone)]
pub struct ContentCache {
    inner: Cache<CacheKey, ContentIdentifier>,
}

impl ContentCache {
    /// Create cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Cached identifier
    pub async fn get(&self, key: &CacheKey) -> Option<ContentIdentifier> {
        self.inner.get(key).await
    }

    /// Store an identifier
    pub async fn insert(&self, key: CacheKey, id: ContentIdentifier) {
        self.inner.insert(key, id).await;
    }

    /// Approximate entry count
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_hash_gives_no_key() {
        assert!(CacheKey::new(None, HashMode::File).is_none());
        assert!(CacheKey::new(Some(""), HashMode::File).is_none());
        assert!(CacheKey::new(Some("sha1:ab"), HashMode::File).is_some());
    }

    #[test]
    fn pixel_mode_is_never_keyed() {
        assert!(CacheKey::new(Some("sha1:ab"), HashMode::Pixels).is_none());
    }

    #[tokio::test]
    async fn entries_are_keyed_by_store_hash() {
        let cache = ContentCache::new(16);
        let id = biocode_core::identify_chunks([b"file"]);
        let first = CacheKey::new(Some("h1"), HashMode::File).unwrap();
        let other = CacheKey::new(Some("h2"), HashMode::File).unwrap();

        cache.insert(first.clone(), id.clone()).await;
        assert_eq!(cache.get(&first).await, Some(id));
        assert_eq!(cache.get(&other).await, None);

        cache.inner.run_pending_tasks().await;
        assert_eq!(cache.entry_count(), 1);
    }
}
