use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bpf::{PageId, PageStore, StoreError, PAGES_PER_PART, PAGE_ENTRY_BYTES};
use crate::metrics::{UnwindTableMetrics, UnwindTableStats};
use crate::unwind::builder::PageTableBuilder;
use crate::unwind::cache::{AllocationCache, INVALID_CACHE_INDEX};
use crate::unwind::freelist::Freelist;
use crate::unwind::source::UnwindTable;
use crate::BinaryId;

/// Allocation lifecycle:
///
/// ```text
/// none --[add]--> Engaged --[move_to_cache]--> Cached
///                    ^                           | |
///                    +-------[move_from_cache]---+ |
///                                                  |
///            Evicting <---------[evict]------------+
///                |
///                +--> Released (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// In active use. Must not be evicted.
    Engaged,
    /// Not mapped by any live process, retained for reuse. Eligible for
    /// eviction.
    Cached,
    /// About to be released. Transient.
    Evicting,
    /// All pages returned to the pool, root pointer gone. Cannot be
    /// repaired.
    Released,
}

/// One binary's built unwind table: the pool pages it owns plus bookkeeping.
///
/// The page list of any two simultaneously non-released allocations is
/// disjoint; pages flow back to the freelist only through release.
#[derive(Debug)]
pub struct Allocation {
    binary_id: BinaryId,
    build_id: String,
    pages: Vec<PageId>,
    row_count: usize,
    node_count: usize,
    state: Mutex<AllocationState>,
    /// Position in the allocation cache heap; kept current by the heap.
    pub(crate) cache_index: AtomicUsize,
}

impl Allocation {
    pub fn binary_id(&self) -> BinaryId {
        self.binary_id
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn state(&self) -> AllocationState {
        *self.state.lock().expect("lock")
    }

    #[cfg(test)]
    pub(crate) fn for_cache_tests(pages: Vec<PageId>) -> Self {
        Allocation {
            binary_id: 0,
            build_id: String::new(),
            pages,
            row_count: 0,
            node_count: 0,
            state: Mutex::new(AllocationState::Cached),
            cache_index: AtomicUsize::new(INVALID_CACHE_INDEX),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// The pool is exhausted and no cached allocation is left to evict.
    #[error("no pages available")]
    NoPages,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct UnwindTableManagerConfig {
    pub total_pages: usize,
}

impl UnwindTableManagerConfig {
    /// Pool sized as a whole number of kernel map parts.
    pub fn from_part_count(parts: u32) -> Self {
        UnwindTableManagerConfig {
            total_pages: parts as usize * PAGES_PER_PART as usize,
        }
    }

    /// Pool sized from a memory budget, rounded down to whole parts. At
    /// least one part is always allocated.
    pub fn from_memory_budget(bytes: u64) -> Self {
        let parts = (bytes / (PAGE_ENTRY_BYTES * u64::from(PAGES_PER_PART))).max(1);
        Self::from_part_count(parts as u32)
    }
}

/// Owner of the unwind table page pool.
///
/// Builds page tables through the page store, hands allocations between the
/// engaged and cached states, and reclaims pages from cached allocations
/// when a build runs out. The freelist and the cache carry their own locks;
/// each allocation carries a state lock, so releasing one binary does not
/// serialize against state reads of another.
pub struct UnwindTableManager {
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) freelist: Freelist,
    pub(crate) cache: AllocationCache,
    pub(crate) metrics: UnwindTableMetrics,
}

impl UnwindTableManager {
    pub fn new(store: Arc<dyn PageStore>, config: UnwindTableManagerConfig) -> Self {
        debug!(
            "initialized unwind table manager with {} pages",
            config.total_pages
        );
        UnwindTableManager {
            store,
            freelist: Freelist::new(config.total_pages),
            cache: AllocationCache::new(),
            metrics: UnwindTableMetrics::default(),
        }
    }

    /// Build the page table for one binary and register its root under
    /// `binary_id`. The returned allocation starts out engaged.
    ///
    /// On failure every page grabbed for this build has already been
    /// returned to the pool; there are no surviving side effects.
    pub fn add(
        &self,
        build_id: &str,
        binary_id: BinaryId,
        table: &UnwindTable,
    ) -> Result<Arc<Allocation>, BuildError> {
        let built = match PageTableBuilder::new(self, binary_id, table).build() {
            Ok(built) => built,
            Err(err) => {
                self.metrics.tables_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "failed to allocate unwind table for build id {}: {}",
                    build_id, err
                );
                return Err(err);
            }
        };

        let allocation = Arc::new(Allocation {
            binary_id,
            build_id: build_id.to_string(),
            row_count: table.len(),
            node_count: built.node_count,
            pages: built.pages,
            state: Mutex::new(AllocationState::Engaged),
            cache_index: AtomicUsize::new(INVALID_CACHE_INDEX),
        });

        let pages = allocation.pages.len() as i64;
        let nodes = allocation.node_count as i64;
        self.metrics.tables_built.fetch_add(1, Ordering::Relaxed);
        self.metrics.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .live_rows
            .fetch_add(allocation.row_count as i64, Ordering::Relaxed);
        self.metrics
            .leaf_pages
            .fetch_add(pages - nodes, Ordering::Relaxed);
        self.metrics.node_pages.fetch_add(nodes, Ordering::Relaxed);

        debug!(
            "allocated unwind table for build id {}: binary={} pages={} rows={} nodes={}",
            build_id,
            binary_id,
            allocation.pages.len(),
            allocation.row_count,
            allocation.node_count,
        );

        Ok(allocation)
    }

    /// Return all pages to the pool and drop the root pointer. Valid from
    /// any state; releasing an already released allocation is a no-op.
    pub fn release(&self, allocation: &Allocation) {
        let mut state = allocation.state.lock().expect("lock");
        self.release_locked(allocation, &mut state);
    }

    fn release_locked(&self, allocation: &Allocation, state: &mut AllocationState) {
        if *state == AllocationState::Released {
            return;
        }

        debug!(
            "releasing allocation for build id {}: binary={} pages={} state={:?}",
            allocation.build_id,
            allocation.binary_id,
            allocation.pages.len(),
            *state,
        );

        self.uncache(allocation, *state);
        *state = AllocationState::Released;

        for &page in &allocation.pages {
            self.freelist.release(page);
        }

        if let Err(err) = self.store.delete_root(allocation.binary_id) {
            error!(
                "failed to delete unwind table root for build id {}: {}",
                allocation.build_id, err
            );
        }

        let pages = allocation.pages.len() as i64;
        let nodes = allocation.node_count as i64;
        self.metrics.tables_released.fetch_add(1, Ordering::Relaxed);
        self.metrics.live_allocations.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .live_rows
            .fetch_sub(allocation.row_count as i64, Ordering::Relaxed);
        self.metrics
            .leaf_pages
            .fetch_sub(pages - nodes, Ordering::Relaxed);
        self.metrics.node_pages.fetch_sub(nodes, Ordering::Relaxed);
    }

    /// Engaged -> Cached. Caching an already cached allocation succeeds;
    /// a releasing or released one cannot be cached.
    pub fn move_to_cache(&self, allocation: &Arc<Allocation>) -> bool {
        let mut state = allocation.state.lock().expect("lock");
        match *state {
            AllocationState::Engaged => {
                debug!(
                    "moving allocation for build id {} to cache",
                    allocation.build_id
                );
                *state = AllocationState::Cached;
                self.metrics
                    .cached_allocations
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .cached_pages
                    .fetch_add(allocation.pages.len() as i64, Ordering::Relaxed);
                self.metrics
                    .cached_rows
                    .fetch_add(allocation.row_count as i64, Ordering::Relaxed);
                self.cache.push(Arc::clone(allocation));
                true
            }
            AllocationState::Cached => true,
            _ => false,
        }
    }

    /// Cached -> Engaged, without rebuilding. An engaged allocation stays
    /// engaged; anything else cannot be revived.
    pub fn move_from_cache(&self, allocation: &Allocation) -> bool {
        let mut state = allocation.state.lock().expect("lock");
        match *state {
            AllocationState::Engaged => true,
            AllocationState::Cached => {
                debug!(
                    "moving allocation for build id {} from cache",
                    allocation.build_id
                );
                self.uncache(allocation, *state);
                *state = AllocationState::Engaged;
                true
            }
            _ => false,
        }
    }

    fn uncache(&self, allocation: &Allocation, state: AllocationState) {
        if matches!(state, AllocationState::Cached | AllocationState::Evicting) {
            self.metrics
                .cached_allocations
                .fetch_sub(1, Ordering::Relaxed);
            self.metrics
                .cached_pages
                .fetch_sub(allocation.pages.len() as i64, Ordering::Relaxed);
            self.metrics
                .cached_rows
                .fetch_sub(allocation.row_count as i64, Ordering::Relaxed);
        }
        if state == AllocationState::Cached {
            // The eviction path pops entries before taking their state lock,
            // so a still-Cached allocation may already be off the heap.
            self.cache.remove(allocation);
        }
    }

    /// Reclaim the pages of an allocation popped from the cache. Loses the
    /// race gracefully when the owner re-engaged it first.
    pub(crate) fn evict(&self, allocation: &Allocation) -> bool {
        let mut state = allocation.state.lock().expect("lock");
        if *state != AllocationState::Cached {
            return false;
        }
        debug!(
            "evicting allocation for build id {} ({} pages)",
            allocation.build_id,
            allocation.pages.len()
        );
        *state = AllocationState::Evicting;
        self.release_locked(allocation, &mut state);
        true
    }

    pub fn free_pages(&self) -> usize {
        self.freelist.free_items()
    }

    pub fn total_pages(&self) -> usize {
        self.freelist.total_items()
    }

    pub fn cached_allocations(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> UnwindTableStats {
        self.metrics
            .snapshot(self.freelist.total_items(), self.freelist.free_items())
    }
}
