//! Counters and gauges exported to the surrounding profiler's telemetry.
//!
//! The crate only accumulates values; scraping and shipping them is the
//! embedder's business. Gauges are signed so that underflow caused by a
//! bookkeeping bug shows up as a negative value instead of a wraparound.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Point-in-time view of the unwind table manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnwindTableStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub tables_built: u64,
    pub tables_failed: u64,
    pub tables_released: u64,
    pub rows_used: u64,
    pub rows_lost: u64,
    pub live_allocations: i64,
    pub live_rows: i64,
    pub cached_allocations: i64,
    pub cached_pages: i64,
    pub cached_rows: i64,
    pub leaf_pages: i64,
    pub node_pages: i64,
}

impl UnwindTableStats {
    /// Fraction of the pool currently handed out.
    pub fn pool_usage(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        (self.total_pages - self.free_pages) as f64 / self.total_pages as f64
    }
}

#[derive(Default)]
pub(crate) struct UnwindTableMetrics {
    pub(crate) tables_built: AtomicU64,
    pub(crate) tables_failed: AtomicU64,
    pub(crate) tables_released: AtomicU64,
    pub(crate) rows_used: AtomicU64,
    pub(crate) rows_lost: AtomicU64,
    pub(crate) live_allocations: AtomicI64,
    pub(crate) live_rows: AtomicI64,
    pub(crate) cached_allocations: AtomicI64,
    pub(crate) cached_pages: AtomicI64,
    pub(crate) cached_rows: AtomicI64,
    pub(crate) leaf_pages: AtomicI64,
    pub(crate) node_pages: AtomicI64,
}

impl UnwindTableMetrics {
    pub(crate) fn snapshot(&self, total_pages: usize, free_pages: usize) -> UnwindTableStats {
        UnwindTableStats {
            total_pages,
            free_pages,
            tables_built: self.tables_built.load(Ordering::Relaxed),
            tables_failed: self.tables_failed.load(Ordering::Relaxed),
            tables_released: self.tables_released.load(Ordering::Relaxed),
            rows_used: self.rows_used.load(Ordering::Relaxed),
            rows_lost: self.rows_lost.load(Ordering::Relaxed),
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
            live_rows: self.live_rows.load(Ordering::Relaxed),
            cached_allocations: self.cached_allocations.load(Ordering::Relaxed),
            cached_pages: self.cached_pages.load(Ordering::Relaxed),
            cached_rows: self.cached_rows.load(Ordering::Relaxed),
            leaf_pages: self.leaf_pages.load(Ordering::Relaxed),
            node_pages: self.node_pages.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the DSO registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Binaries currently mapped by at least one process.
    pub live_dsos: usize,
    /// Binaries kept warm in the reuse cache.
    pub cached_dsos: usize,
    /// Pool pages backing live binaries.
    pub used_pages: i64,
    /// Pool pages backing cache-only binaries; reclaimable under pressure.
    pub reclaimable_pages: i64,
    pub analyses_ok: u64,
    pub analyses_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tls_variables_discovered: u64,
}

#[derive(Default)]
pub(crate) struct RegistryMetrics {
    pub(crate) analyses_ok: AtomicU64,
    pub(crate) analyses_failed: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) tls_variables_discovered: AtomicU64,
}
