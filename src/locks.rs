use std::sync::Arc;

use tokio::sync::RwLock;

pub const LOCK_POOL_SIZE: usize = 2048;

/// Fixed pool of read/write locks striped over handle ids.
///
/// Backend streams are not safe under concurrent access, not even for
/// reads, so stream-touching operations take the write half for the whole
/// backend call. Two unrelated handles can land on the same stripe; that
/// false contention is the price of a bounded pool.
pub struct HandleLockPool {
    stripes: Vec<Arc<RwLock<()>>>,
}

impl HandleLockPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            stripes: (0..size).map(|_| Arc::new(RwLock::new(()))).collect(),
        }
    }

    pub fn lock_for(&self, handle_id: u64) -> Arc<RwLock<()>> {
        debug_assert!(self.stripes.len().is_power_of_two());
        let idx = (handle_id as usize) & (self.stripes.len() - 1);
        self.stripes[idx].clone()
    }
}

impl Default for HandleLockPool {
    fn default() -> Self {
        Self::new(LOCK_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_handle_maps_to_same_stripe() {
        let pool = HandleLockPool::new(8);
        assert!(Arc::ptr_eq(&pool.lock_for(5), &pool.lock_for(5)));
    }

    #[test]
    fn stripe_collision_wraps_by_pool_size() {
        let pool = HandleLockPool::new(8);
        assert!(Arc::ptr_eq(&pool.lock_for(1), &pool.lock_for(9)));
        assert!(!Arc::ptr_eq(&pool.lock_for(1), &pool.lock_for(2)));
    }

    #[test]
    fn size_is_rounded_up_to_a_power_of_two() {
        let pool = HandleLockPool::new(1000);
        assert_eq!(pool.stripes.len(), 1024);
    }

    #[tokio::test]
    async fn write_half_is_exclusive() {
        let pool = HandleLockPool::new(8);
        let lock = pool.lock_for(3);
        let guard = lock.write().await;
        assert!(pool.lock_for(3).try_write().is_err());
        drop(guard);
        assert!(pool.lock_for(3).try_write().is_ok());
    }

    #[tokio::test]
    async fn distinct_stripes_do_not_contend() {
        let pool = HandleLockPool::new(8);
        let a = pool.lock_for(1);
        let _ga = a.write().await;
        assert!(pool.lock_for(2).try_write().is_ok());
    }
}
