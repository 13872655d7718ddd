//! Deduplicates binary analysis across processes.
//!
//! A DSO is keyed by build ID and shared by every process mapping the same
//! binary. Two indices hold it: the live map, counting currently mapped
//! references, and the time-bounded reuse cache, which keeps recently
//! unreferenced DSOs warm so a short-lived process restart does not redo
//! analysis or rebuild unwind tables. Only the reuse cache dropping a DSO
//! finally frees its pool pages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::analysis::BinaryAnalyzer;
use crate::binary::{BinaryAllocation, BinaryManager};
use crate::file::SealedFile;
use crate::metrics::{RegistryMetrics, RegistryStats};
use crate::reuse_cache::ReuseCache;
use crate::BinaryId;

/// One analyzed binary, shared across processes.
pub struct Dso {
    id: BinaryId,
    build_id: String,
    /// Built lazily on first registration with an accessible file; absent
    /// when analysis failed or never ran. Guarded by its own lock so two
    /// processes mapping a never-seen binary trigger exactly one build.
    allocation: Mutex<Option<Arc<BinaryAllocation>>>,
}

impl Dso {
    pub fn id(&self) -> BinaryId {
        self.id
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn allocation(&self) -> Option<Arc<BinaryAllocation>> {
        self.allocation.lock().expect("lock").clone()
    }
}

struct RefCountedDso {
    dso: Arc<Dso>,
    /// Number of currently mapped occurrences across all processes.
    /// Guarded by the live map's lock.
    ref_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// How long an unreferenced DSO stays reusable.
    pub reuse_ttl: Duration,
    /// How many unreferenced DSOs stay reusable.
    pub reuse_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            reuse_ttl: Duration::from_secs(600),
            reuse_capacity: 4096,
        }
    }
}

#[derive(Default)]
struct PageUsage {
    used: i64,
    cached: i64,
}

pub struct Registry {
    live: RwLock<HashMap<String, RefCountedDso>>,
    cache: ReuseCache<String, Arc<Dso>>,
    next_id: AtomicU64,
    manager: Arc<BinaryManager>,
    analyzer: Arc<dyn BinaryAnalyzer>,
    usage: Arc<Mutex<PageUsage>>,
    metrics: RegistryMetrics,
}

impl Registry {
    pub fn new(
        manager: Arc<BinaryManager>,
        analyzer: Arc<dyn BinaryAnalyzer>,
        config: RegistryConfig,
    ) -> Self {
        let usage = Arc::new(Mutex::new(PageUsage::default()));

        let hook_manager = Arc::clone(&manager);
        let hook_usage = Arc::clone(&usage);
        let cache = ReuseCache::new(
            config.reuse_capacity,
            config.reuse_ttl,
            move |build_id: &String, dso: &Arc<Dso>| {
                debug!("dropping dso with build id {} from the reuse cache", build_id);
                release_evicted(&hook_manager, &hook_usage, dso);
            },
        );

        Registry {
            live: RwLock::new(HashMap::new()),
            cache,
            next_id: AtomicU64::new(0),
            manager,
            analyzer,
            usage,
            metrics: RegistryMetrics::default(),
        }
    }

    /// Register one mapped occurrence of a binary. Returns the shared DSO,
    /// creating and analyzing it if this build ID was never seen (or has
    /// aged out of the reuse cache). Analysis failures leave the DSO
    /// without an allocation; registration still succeeds and addresses
    /// from the binary stay unresolved.
    pub fn register(&self, build_id: &str, file: Option<&SealedFile>) -> Arc<Dso> {
        if let Some(dso) = self.acquire_if_live(build_id) {
            return dso;
        }

        // The reuse cache is the single point of DSO creation: concurrent
        // registrations of the same unseen build ID get the same record.
        let (dso, hit) = self.cache.fetch_or_insert_pinned(build_id.to_string(), || {
            Arc::new(Dso {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                build_id: build_id.to_string(),
                allocation: Mutex::new(None),
            })
        });
        if hit {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let (dso, inserted) = self.ensure_live(build_id, dso);
        if !inserted {
            // Lost the insertion race; the winner holds the pin.
            self.cache.unpin(&build_id.to_string());
            return dso;
        }

        if let Some(file) = file {
            self.populate(&dso, file);
        }

        debug!("processed new dso with build id {} (id {})", build_id, dso.id);
        dso
    }

    /// Drop one mapped occurrence. At zero the DSO leaves the live map and
    /// its allocation is demoted to the unwind-table cache; the DSO itself
    /// stays warm in the reuse cache until TTL or capacity takes it.
    /// Releasing an unknown build ID is a no-op.
    pub fn release(&self, build_id: &str) {
        self.cache.touch(&build_id.to_string());

        let mut live = self.live.write().expect("lock");
        let Some(entry) = live.get_mut(build_id) else {
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        let entry = live.remove(build_id).expect("entry just seen");
        drop(live);

        debug!("releasing dso with build id {}", build_id);
        self.demote(&entry.dso);
        self.cache.unpin(&build_id.to_string());
    }

    /// Look up a currently live DSO.
    pub fn get(&self, build_id: &str) -> Option<Arc<Dso>> {
        self.live
            .read()
            .expect("lock")
            .get(build_id)
            .map(|entry| Arc::clone(&entry.dso))
    }

    /// Number of distinct binaries currently mapped somewhere.
    pub fn live_count(&self) -> usize {
        self.live.read().expect("lock").len()
    }

    /// Drop expired entries from the reuse cache, releasing their pool
    /// pages. Driven by the embedder's maintenance scheduler.
    pub fn sweep(&self) -> usize {
        self.cache.sweep()
    }

    pub fn binary_manager(&self) -> &BinaryManager {
        &self.manager
    }

    pub fn stats(&self) -> RegistryStats {
        let usage = self.usage.lock().expect("lock");
        RegistryStats {
            live_dsos: self.live.read().expect("lock").len(),
            cached_dsos: self.cache.len(),
            used_pages: usage.used,
            reclaimable_pages: usage.cached,
            analyses_ok: self.metrics.analyses_ok.load(Ordering::Relaxed),
            analyses_failed: self.metrics.analyses_failed.load(Ordering::Relaxed),
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.metrics.cache_misses.load(Ordering::Relaxed),
            tls_variables_discovered: self
                .metrics
                .tls_variables_discovered
                .load(Ordering::Relaxed),
        }
    }

    fn acquire_if_live(&self, build_id: &str) -> Option<Arc<Dso>> {
        let mut live = self.live.write().expect("lock");
        let entry = live.get_mut(build_id)?;
        entry.ref_count += 1;
        Some(Arc::clone(&entry.dso))
    }

    fn ensure_live(&self, build_id: &str, dso: Arc<Dso>) -> (Arc<Dso>, bool) {
        let mut live = self.live.write().expect("lock");
        if let Some(entry) = live.get_mut(build_id) {
            entry.ref_count += 1;
            return (Arc::clone(&entry.dso), false);
        }
        live.insert(
            build_id.to_string(),
            RefCountedDso {
                dso: Arc::clone(&dso),
                ref_count: 1,
            },
        );
        (dso, true)
    }

    /// Attach a BPF allocation to a freshly (re)registered DSO: reuse the
    /// cached one when possible, otherwise analyze the binary and build.
    fn populate(&self, dso: &Dso, file: &SealedFile) {
        let mut slot = dso.allocation.lock().expect("lock");

        if let Some(allocation) = slot.as_ref() {
            if self.manager.move_from_cache(allocation) {
                self.on_pages_restored(allocation.unwind().page_count());
                return;
            }

            // The unwind-table cache evicted the allocation while the DSO
            // idled in the reuse cache; rebuild from a fresh analysis.
            let stale = slot.take().expect("allocation just seen");
            self.on_pages_dropped(stale.unwind().page_count());
            self.manager.release(&stale);
            debug!(
                "removed stale bpf allocation for build id {}",
                dso.build_id
            );
        }

        let opened = match file.unseal() {
            Ok(opened) => opened,
            Err(err) => {
                warn!(
                    "failed to reopen binary with build id {}: {}",
                    dso.build_id, err
                );
                return;
            }
        };

        let analysis = match self.analyzer.analyze(&opened) {
            Ok(analysis) => {
                self.metrics.analyses_ok.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "analyzed binary with build id {}: {} unwind rows, {} tls variables",
                    dso.build_id,
                    analysis.unwind_table.len(),
                    analysis.tls.variables.len()
                );
                analysis
            }
            Err(err) => {
                self.metrics.analyses_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "failed to analyze binary with build id {}: {}",
                    dso.build_id, err
                );
                return;
            }
        };

        match self.manager.add(&dso.build_id, dso.id, &analysis) {
            Ok(allocation) => {
                for variable in &analysis.tls.variables {
                    debug!(
                        "extracted tls variable from build id {}: {} at {:#x}",
                        dso.build_id, variable.name, variable.offset
                    );
                    allocation.insert_tls_name(variable.offset, variable.name.clone());
                    self.metrics
                        .tls_variables_discovered
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.on_pages_allocated(allocation.unwind().page_count());
                *slot = Some(allocation);
            }
            Err(err) => {
                error!(
                    "failed to install bpf allocation for build id {}: {}",
                    dso.build_id, err
                );
            }
        }
    }

    fn demote(&self, dso: &Dso) {
        let slot = dso.allocation.lock().expect("lock");
        if let Some(allocation) = slot.as_ref() {
            self.on_pages_demoted(allocation.unwind().page_count());
            self.manager.move_to_cache(allocation);
        }
    }

    fn on_pages_allocated(&self, pages: usize) {
        let mut usage = self.usage.lock().expect("lock");
        usage.used += pages as i64;
        check_usage(&usage);
    }

    fn on_pages_demoted(&self, pages: usize) {
        let mut usage = self.usage.lock().expect("lock");
        usage.used -= pages as i64;
        usage.cached += pages as i64;
        check_usage(&usage);
    }

    fn on_pages_restored(&self, pages: usize) {
        let mut usage = self.usage.lock().expect("lock");
        usage.cached -= pages as i64;
        usage.used += pages as i64;
        check_usage(&usage);
    }

    fn on_pages_dropped(&self, pages: usize) {
        let mut usage = self.usage.lock().expect("lock");
        usage.cached -= pages as i64;
        check_usage(&usage);
    }
}

fn check_usage(usage: &PageUsage) {
    if usage.used < 0 {
        error!("used pages gauge underflow: {}", usage.used);
    }
    if usage.cached < 0 {
        error!("reclaimable pages gauge underflow: {}", usage.cached);
    }
}

/// Reuse-cache eviction: the point of no return for a DSO's pages.
fn release_evicted(manager: &BinaryManager, usage: &Mutex<PageUsage>, dso: &Dso) {
    let mut slot = dso.allocation.lock().expect("lock");
    let Some(allocation) = slot.take() else {
        return;
    };

    let pages = allocation.unwind().page_count() as i64;
    let was_engaged =
        allocation.unwind().state() == crate::unwind::AllocationState::Engaged;
    manager.release(&allocation);

    let mut usage = usage.lock().expect("lock");
    if was_engaged {
        usage.used -= pages;
    } else {
        usage.cached -= pages;
    }
    check_usage(&usage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::atomic::AtomicUsize;

    use crate::analysis::{BinaryAnalysis, TlsConfig, TlsVariable};
    use crate::bpf::{MemoryStore, PageStore, PythonConfigStore, TlsConfigStore};
    use crate::unwind::{CfaRule, RbpRule, UnwindRow, UnwindTable, UnwindTableManagerConfig};

    struct StubAnalyzer {
        calls: AtomicUsize,
        rows: usize,
        fail: bool,
    }

    impl StubAnalyzer {
        fn new(rows: usize) -> Self {
            StubAnalyzer {
                calls: AtomicUsize::new(0),
                rows,
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl BinaryAnalyzer for StubAnalyzer {
        fn analyze(&self, _file: &File) -> anyhow::Result<BinaryAnalysis> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("unreadable dwarf");
            }
            let rows: Vec<UnwindRow> = (0..self.rows as u64)
                .map(|i| UnwindRow {
                    start_pc: 0x1000 + i * 16,
                    pc_range: 16,
                    cfa: CfaRule::RegisterOffset {
                        regno: 7,
                        offset: 16,
                    },
                    rbp: RbpRule::CfaPlusOffset { offset: -16 },
                })
                .collect();
            Ok(BinaryAnalysis {
                unwind_table: UnwindTable::from_rows(&rows).unwrap(),
                tls: TlsConfig {
                    variables: vec![TlsVariable {
                        offset: 0x10,
                        name: "tracer_id".into(),
                    }],
                },
                python: None,
            })
        }
    }

    fn registry_with(analyzer: Arc<StubAnalyzer>, config: RegistryConfig) -> Registry {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(BinaryManager::new(
            Arc::clone(&store) as Arc<dyn PageStore>,
            Arc::clone(&store) as Arc<dyn TlsConfigStore>,
            Arc::clone(&store) as Arc<dyn PythonConfigStore>,
            UnwindTableManagerConfig { total_pages: 64 },
        ));
        Registry::new(manager, analyzer, config)
    }

    fn registry() -> Registry {
        registry_with(Arc::new(StubAnalyzer::new(4)), RegistryConfig::default())
    }

    #[test]
    fn test_refcounting() {
        let registry = registry();

        let dso = registry.register("abacaba", None);
        assert_eq!(registry.get("abacaba").unwrap().build_id(), "abacaba");

        let again = registry.register("abacaba", None);
        assert_eq!(registry.live_count(), 1);
        assert!(Arc::ptr_eq(&dso, &again));

        registry.release("abacaba");
        assert_eq!(registry.live_count(), 1);
        assert!(registry.get("abacaba").is_some());

        registry.release("abacaba");
        assert_eq!(registry.live_count(), 0);
        assert!(registry.get("abacaba").is_none());

        // no-op
        registry.release("abacaba");
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let registry = registry();
        let a = registry.register("a", None);
        let b = registry.register("b", None);
        let c = registry.register("c", None);
        assert_eq!((a.id(), b.id(), c.id()), (0, 1, 2));
    }

    #[test]
    fn test_reuse_within_ttl_skips_analysis() {
        let analyzer = Arc::new(StubAnalyzer::new(4));
        let registry = registry_with(Arc::clone(&analyzer), RegistryConfig::default());

        let binary = tempfile::NamedTempFile::new().unwrap();
        let sealed = crate::file::SealedFile::Path(binary.path().to_path_buf());

        let dso = registry.register("X", Some(&sealed));
        assert_eq!(analyzer.calls(), 1);
        let allocation = dso.allocation().unwrap();
        let pages = allocation.unwind().page_count();
        assert_eq!(registry.stats().used_pages, pages as i64);

        registry.release("X");
        assert_eq!(registry.live_count(), 0);
        assert_eq!(
            allocation.unwind().state(),
            crate::unwind::AllocationState::Cached
        );
        assert_eq!(registry.stats().reclaimable_pages, pages as i64);

        // Within the TTL the same record comes back, already built.
        let revived = registry.register("X", Some(&sealed));
        assert_eq!(analyzer.calls(), 1);
        assert!(Arc::ptr_eq(&dso, &revived));
        assert_eq!(
            allocation.unwind().state(),
            crate::unwind::AllocationState::Engaged
        );
        assert_eq!(registry.stats().used_pages, pages as i64);
        assert_eq!(registry.stats().cache_hits, 1);
    }

    #[test]
    fn test_sweep_frees_pool_pages() {
        let analyzer = Arc::new(StubAnalyzer::new(4));
        let registry = registry_with(
            Arc::clone(&analyzer),
            RegistryConfig {
                reuse_ttl: Duration::ZERO,
                reuse_capacity: 16,
            },
        );
        let total = registry.binary_manager().unwind_tables().total_pages();

        let binary = tempfile::NamedTempFile::new().unwrap();
        let sealed = crate::file::SealedFile::Path(binary.path().to_path_buf());

        let dso = registry.register("X", Some(&sealed));
        let allocation = dso.allocation().unwrap();
        assert!(registry.binary_manager().unwind_tables().free_pages() < total);

        // Still live: the sweep must not touch it.
        assert_eq!(registry.sweep(), 0);

        registry.release("X");
        assert_eq!(registry.sweep(), 1);
        assert_eq!(
            allocation.unwind().state(),
            crate::unwind::AllocationState::Released
        );
        assert_eq!(registry.binary_manager().unwind_tables().free_pages(), total);
        assert_eq!(registry.stats().reclaimable_pages, 0);
        assert!(dso.allocation().is_none());

        // A new registration re-analyzes from scratch.
        let fresh = registry.register("X", Some(&sealed));
        assert_eq!(analyzer.calls(), 2);
        assert!(fresh.allocation().is_some());
    }

    #[test]
    fn test_analysis_failure_leaves_dso_without_allocation() {
        let analyzer = Arc::new(StubAnalyzer {
            calls: AtomicUsize::new(0),
            rows: 0,
            fail: true,
        });
        let registry = registry_with(Arc::clone(&analyzer), RegistryConfig::default());

        let binary = tempfile::NamedTempFile::new().unwrap();
        let sealed = crate::file::SealedFile::Path(binary.path().to_path_buf());

        let dso = registry.register("broken", Some(&sealed));
        assert_eq!(analyzer.calls(), 1);
        assert!(dso.allocation().is_none());
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.stats().analyses_failed, 1);
    }

    #[test]
    fn test_tls_names_attached_from_analysis() {
        let registry = registry();
        let binary = tempfile::NamedTempFile::new().unwrap();
        let sealed = crate::file::SealedFile::Path(binary.path().to_path_buf());

        let dso = registry.register("X", Some(&sealed));
        let allocation = dso.allocation().unwrap();
        assert_eq!(allocation.tls_name(0x10).as_deref(), Some("tracer_id"));
        assert_eq!(registry.stats().tls_variables_discovered, 1);
    }

    #[test]
    fn test_concurrent_register_release() {
        let registry = Arc::new(registry());
        let build_ids = ["a", "b", "c", "d", "e"];
        let iterations = 2_000;

        std::thread::scope(|scope| {
            for _ in 0..2 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for i in 0..iterations {
                        registry.register(build_ids[i % build_ids.len()], None);
                    }
                });
            }
        });
        for build_id in build_ids {
            assert_eq!(registry.get(build_id).unwrap().build_id(), build_id);
        }
        assert_eq!(registry.live_count(), build_ids.len());

        std::thread::scope(|scope| {
            for _ in 0..2 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for i in 0..iterations {
                        registry.release(build_ids[i % build_ids.len()]);
                    }
                });
            }
        });
        assert_eq!(registry.live_count(), 0);

        // Mixed registers and releases keep the count consistent.
        std::thread::scope(|scope| {
            for _ in 0..2 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for i in 0..iterations {
                        registry.register(build_ids[i % build_ids.len()], None);
                        registry.release(build_ids[i % build_ids.len()]);
                    }
                });
            }
        });
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_single_flight_analysis_under_races() {
        let analyzer = Arc::new(StubAnalyzer::new(4));
        let registry = Arc::new(registry_with(
            Arc::clone(&analyzer),
            RegistryConfig::default(),
        ));
        let binary = tempfile::NamedTempFile::new().unwrap();
        let sealed = Arc::new(crate::file::SealedFile::Path(binary.path().to_path_buf()));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = Arc::clone(&registry);
                let sealed = Arc::clone(&sealed);
                scope.spawn(move || registry.register("X", Some(&sealed)));
            }
        });

        // All eight registrations share one DSO and at most one analysis.
        assert_eq!(registry.live_count(), 1);
        assert_eq!(analyzer.calls(), 1);
        let dso = registry.get("X").unwrap();
        assert!(dso.allocation().is_some());
    }
}
