//! Process-wide index of live buffer pools.
//!
//! Pools register themselves at construction and deregister on drop. The
//! registry is purely observational: it holds weak references and never
//! keeps a pool alive. Use it to find a pool by name or to snapshot global
//! buffer usage for diagnostics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::SystemTime;

use tracing::warn;

use super::pool::BufferPool;

/// The process-wide registry instance.
pub fn registry() -> &'static PoolRegistry {
    static REGISTRY: OnceLock<PoolRegistry> = OnceLock::new();
    REGISTRY.get_or_init(PoolRegistry::new)
}

struct PoolEntry {
    pool: Weak<BufferPool>,
    name: String,
    category: String,
    created: SystemTime,
}

struct RegistryState {
    pools: HashMap<u64, PoolEntry>,
    name_to_id: HashMap<String, u64>,
    next_id: u64,
}

/// Aggregate usage across every registered pool.
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    /// Live registered pools.
    pub pools: usize,
    /// Buffers across all pools.
    pub buffers: usize,
    /// Free buffers across all pools.
    pub free: usize,
    /// Filled buffers across all pools.
    pub filled: usize,
    /// Total bytes across all pool buffers.
    pub bytes: usize,
}

/// Index of live pools by name and category. See [`registry`].
pub struct PoolRegistry {
    state: Mutex<RegistryState>,
}

impl PoolRegistry {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                pools: HashMap::new(),
                name_to_id: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a pool, returning its registry id.
    ///
    /// Called from pool constructors. A duplicate name is registered anyway
    /// with a warning; name lookup then resolves to the newest pool.
    pub fn register(&self, pool: &Arc<BufferPool>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        let name = pool.name().to_string();
        if state.name_to_id.contains_key(&name) {
            warn!(name = %name, "duplicate pool name registered");
        }
        state.name_to_id.insert(name.clone(), id);
        state.pools.insert(
            id,
            PoolEntry {
                pool: Arc::downgrade(pool),
                name,
                category: pool.category().to_string(),
                created: SystemTime::now(),
            },
        );
        id
    }

    /// Remove a pool by registry id. Called from the pool's drop.
    pub fn deregister(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.pools.remove(&id) {
            // Only clear the name mapping when it still points at us; a
            // newer pool may have taken the name.
            if state.name_to_id.get(&entry.name) == Some(&id) {
                state.name_to_id.remove(&entry.name);
            }
        }
    }

    /// Look a pool up by its registered name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<BufferPool>> {
        let state = self.state.lock().unwrap();
        let id = state.name_to_id.get(name)?;
        state.pools.get(id)?.pool.upgrade()
    }

    /// All live pools in a category.
    pub fn pools_in_category(&self, category: &str) -> Vec<Arc<BufferPool>> {
        let state = self.state.lock().unwrap();
        state
            .pools
            .values()
            .filter(|e| e.category == category)
            .filter_map(|e| e.pool.upgrade())
            .collect()
    }

    /// Number of registered pools (including any not yet deregistered whose
    /// strong count has reached zero).
    pub fn pool_count(&self) -> usize {
        self.state.lock().unwrap().pools.len()
    }

    /// Creation time of a registered pool.
    pub fn created_at(&self, id: u64) -> Option<SystemTime> {
        self.state.lock().unwrap().pools.get(&id).map(|e| e.created)
    }

    /// Snapshot aggregate usage across every live pool.
    pub fn global_stats(&self) -> GlobalStats {
        let pools: Vec<Arc<BufferPool>> = {
            let state = self.state.lock().unwrap();
            state.pools.values().filter_map(|e| e.pool.upgrade()).collect()
        };

        let mut stats = GlobalStats::default();
        for pool in pools {
            let s = pool.stats();
            stats.pools += 1;
            stats.buffers += s.total;
            stats.free += s.free;
            stats.filled += s.filled;
            stats.bytes += s.total * pool.buffer_size();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_deregister() {
        let pool = BufferPool::new_owned(2, 64, false, "registry-lookup", "reg-test").unwrap();
        let id = pool.registry_id();
        assert!(id > 0);

        let found = registry().find_by_name("registry-lookup").unwrap();
        assert!(Arc::ptr_eq(&found, &pool));
        assert!(registry().created_at(id).is_some());

        drop(found);
        drop(pool);
        assert!(registry().find_by_name("registry-lookup").is_none());
        assert!(registry().created_at(id).is_none());
    }

    #[test]
    fn test_category_listing() {
        let a = BufferPool::new_owned(1, 32, false, "registry-cat-a", "reg-cat").unwrap();
        let b = BufferPool::new_owned(1, 32, false, "registry-cat-b", "reg-cat").unwrap();
        let _c = BufferPool::new_owned(1, 32, false, "registry-cat-c", "reg-other").unwrap();

        let pools = registry().pools_in_category("reg-cat");
        assert_eq!(pools.len(), 2);
        assert!(pools.iter().any(|p| Arc::ptr_eq(p, &a)));
        assert!(pools.iter().any(|p| Arc::ptr_eq(p, &b)));
    }

    #[test]
    fn test_duplicate_name_resolves_to_newest() {
        let _old = BufferPool::new_owned(1, 32, false, "registry-dup", "reg-dup").unwrap();
        let new = BufferPool::new_owned(1, 32, false, "registry-dup", "reg-dup").unwrap();

        let found = registry().find_by_name("registry-dup").unwrap();
        assert!(Arc::ptr_eq(&found, &new));
    }

    #[test]
    fn test_global_stats_counts_this_pool() {
        let pool = BufferPool::new_owned(3, 128, false, "registry-stats", "reg-stats").unwrap();
        let buf = pool.acquire_free().unwrap();
        pool.submit_filled(&buf);

        let stats = registry().global_stats();
        assert!(stats.pools >= 1);
        assert!(stats.buffers >= 3);
        assert!(stats.filled >= 1);
        assert!(stats.bytes >= 3 * 128);
    }
}
