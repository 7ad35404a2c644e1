//! Storage capacity cache.
//!
//! `statfs` is called far more often than the storage changes, and every
//! call costs a device round trip. The last answer is kept for a bounded
//! time and dropped whenever this session changes the device.

use super::error::{VfsError, VfsResult};
use crate::device::{Capacity, DeviceResult};
use moka::future::Cache;
use std::future::Future;
use std::time::Duration;

pub struct CapacityCache {
    // None when caching is disabled.
    cache: Option<Cache<(), Capacity>>,
}

impl CapacityCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = (!ttl.is_zero())
            .then(|| Cache::builder().max_capacity(1).time_to_live(ttl).build());
        Self { cache }
    }

    pub async fn get_or_fetch<F>(&self, fetch: F) -> VfsResult<Capacity>
    where
        F: Future<Output = DeviceResult<Capacity>>,
    {
        match &self.cache {
            None => Ok(fetch.await?),
            Some(cache) => cache
                .try_get_with((), fetch)
                .await
                .map_err(|e| VfsError::Device((*e).clone())),
        }
    }

    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, DeviceErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn counted(calls: &AtomicUsize, free_kb: u64) -> DeviceResult<Capacity> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Capacity {
            total_kb: 100,
            free_kb,
        })
    }

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let calls = AtomicUsize::new(0);
        let cache = CapacityCache::new(Duration::from_secs(60));
        assert_eq!(cache.get_or_fetch(counted(&calls, 10)).await.unwrap().free_kb, 10);
        assert_eq!(cache.get_or_fetch(counted(&calls, 20)).await.unwrap().free_kb, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert_eq!(cache.get_or_fetch(counted(&calls, 30)).await.unwrap().free_kb, 30);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_caching() {
        let calls = AtomicUsize::new(0);
        let cache = CapacityCache::new(Duration::ZERO);
        cache.get_or_fetch(counted(&calls, 1)).await.unwrap();
        cache.get_or_fetch(counted(&calls, 1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let calls = AtomicUsize::new(0);
        let cache = CapacityCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_fetch(async {
                Err(DeviceError::new(
                    DeviceErrorKind::CameraBusy,
                    "storage_capacity",
                    "",
                ))
            })
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);
        cache.get_or_fetch(counted(&calls, 5)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
