use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::core::geo::CanonicalTileId;
use crate::tiles::entity::DataChannel;

type CacheKey = (DataChannel, CanonicalTileId);

/// In-memory payload cache with LRU eviction, keyed by channel and wrapped tile
#[derive(Debug)]
pub struct TileCache {
    cache: Arc<Mutex<LruCache<CacheKey, Arc<Vec<u8>>>>>,
}

impl TileCache {
    /// Create a new cache; a zero capacity is raised to one entry
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn get(&self, channel: DataChannel, id: CanonicalTileId) -> Option<Arc<Vec<u8>>> {
        self.cache.lock().ok()?.get(&(channel, id)).cloned()
    }

    pub fn insert(&self, channel: DataChannel, id: CanonicalTileId, data: Arc<Vec<u8>>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put((channel, id), data);
        }
    }

    pub fn contains(&self, channel: DataChannel, id: CanonicalTileId) -> bool {
        self.cache
            .lock()
            .ok()
            .map(|cache| cache.contains(&(channel, id)))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().ok().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for TileCache {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_are_separate_keys() {
        let cache = TileCache::new(4);
        let id = CanonicalTileId::new(3, 1, 2);

        cache.insert(DataChannel::Height, id, Arc::new(vec![1, 2, 3]));
        assert!(cache.contains(DataChannel::Height, id));
        assert!(!cache.contains(DataChannel::Raster, id));
        assert_eq!(*cache.get(DataChannel::Height, id).unwrap(), vec![1, 2, 3]);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TileCache::new(2);
        let a = CanonicalTileId::new(1, 0, 0);
        let b = CanonicalTileId::new(1, 1, 0);
        let c = CanonicalTileId::new(1, 1, 1);

        cache.insert(DataChannel::Raster, a, Arc::new(vec![1]));
        cache.insert(DataChannel::Raster, b, Arc::new(vec![2]));
        // Touch `a` so `b` becomes least recently used
        cache.get(DataChannel::Raster, a);
        cache.insert(DataChannel::Raster, c, Arc::new(vec![3]));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(DataChannel::Raster, a));
        assert!(!cache.contains(DataChannel::Raster, b));
        assert!(cache.contains(DataChannel::Raster, c));
    }
}
