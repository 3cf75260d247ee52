use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{B256, Bytes};
use lru::LruCache;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{MerkleError, ProofPath, Trie, check_root, path_for};

pub const DEFAULT_TRIE_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_INLINE_ENTRY_LIMIT: usize = 256;
pub const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// `max(1, cores - 1)`, leaving one core for the async runtime.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|cores| cores.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

#[derive(Debug, Clone)]
pub struct ProofEngineConfig {
    pub cache_capacity: usize,
    pub workers: usize,
    /// Tries with fewer entries are built on the calling task.
    pub inline_entry_limit: usize,
    /// How long idle blocking workers linger; applied to the runtime builder.
    pub worker_idle_timeout: Duration,
}

impl Default for ProofEngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_TRIE_CACHE_CAPACITY,
            workers: default_worker_count(),
            inline_entry_limit: DEFAULT_INLINE_ENTRY_LIMIT,
            worker_idle_timeout: DEFAULT_WORKER_IDLE_TIMEOUT,
        }
    }
}

/// Bounded LRU of built tries keyed by root hash.
pub struct TrieCache {
    entries: Mutex<LruCache<B256, Arc<Trie>>>,
}

impl TrieCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, root: &B256) -> Result<Option<Arc<Trie>>, MerkleError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| MerkleError::CachePoisoned)?;
        Ok(entries.get(root).cloned())
    }

    pub fn insert(&self, trie: Arc<Trie>) -> Result<(), MerkleError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| MerkleError::CachePoisoned)?;
        entries.put(trie.root_hash(), trie);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, MerkleError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| MerkleError::CachePoisoned)?;
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, MerkleError> {
        Ok(self.len()? == 0)
    }
}

/// Semaphore-bounded access to the blocking thread pool.
pub struct TriePool {
    permits: Arc<Semaphore>,
    workers: usize,
    finished: AtomicU64,
}

impl TriePool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            finished: AtomicU64::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Jobs that ran to completion on a worker.
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    /// Runs `job` on a blocking worker once a permit frees up.
    pub async fn run<F, R>(&self, job: F) -> Result<R, MerkleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|error| MerkleError::Worker(error.to_string()))?;
        let handle = tokio::task::spawn_blocking(move || {
            let result = job();
            drop(permit);
            result
        });
        let result = handle
            .await
            .map_err(|error| MerkleError::Worker(error.to_string()))?;
        self.finished.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }
}

/// Builds and caches tries, offloading large ones to the worker pool.
pub struct ProofEngine {
    cache: TrieCache,
    pool: TriePool,
    inline_entry_limit: usize,
}

impl ProofEngine {
    pub fn new(config: &ProofEngineConfig) -> Self {
        Self {
            cache: TrieCache::new(config.cache_capacity),
            pool: TriePool::new(config.workers),
            inline_entry_limit: config.inline_entry_limit,
        }
    }

    pub fn cache(&self) -> &TrieCache {
        &self.cache
    }

    pub fn pool(&self) -> &TriePool {
        &self.pool
    }

    pub async fn build_proof(
        &self,
        entries: Vec<(Bytes, Bytes)>,
        target: &[u8],
        expected_root: Option<B256>,
    ) -> Result<ProofPath, MerkleError> {
        let trie = self.trie(entries, expected_root).await?;
        Ok(path_for(&trie, target))
    }

    /// Runs proof work sized at `items` inline when small, otherwise on the worker pool.
    pub async fn offload<F, R>(&self, items: usize, job: F) -> Result<R, MerkleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if items < self.inline_entry_limit {
            Ok(job())
        } else {
            self.pool.run(job).await
        }
    }

    /// Returns the trie for `entries`, reusing a cached one when `expected_root` is already known.
    pub async fn trie(
        &self,
        entries: Vec<(Bytes, Bytes)>,
        expected_root: Option<B256>,
    ) -> Result<Arc<Trie>, MerkleError> {
        if let Some(root) = expected_root
            && let Some(cached) = self.cache.get(&root)?
        {
            debug!(%root, "trie cache hit");
            return Ok(cached);
        }

        let trie = self
            .offload(entries.len(), move || Trie::from_entries(entries))
            .await?;
        check_root(&trie, expected_root)?;

        let trie = Arc::new(trie);
        self.cache.insert(Arc::clone(&trie))?;
        Ok(trie)
    }
}

impl Default for ProofEngine {
    fn default() -> Self {
        Self::new(&ProofEngineConfig::default())
    }
}
