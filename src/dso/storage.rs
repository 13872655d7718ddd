//! Per-process executable mapping store.
//!
//! Discovery workers append mappings as they learn about them; nothing is
//! sorted or deduplicated on the way in. Read paths that need an ordered
//! view trigger a lazy sort-and-prune pass, which also drops mappings that
//! newer ones overlap (there is no reliable `munmap` signal, so stale
//! entries linger until then). Every pruned or removed mapping releases its
//! DSO reference.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use thiserror::Error;
use tracing::debug;

use crate::dso::registry::{Dso, Registry};
use crate::file::SealedFile;
use crate::segments::{prune_overlapping, Segment};
use crate::Pid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub id: u64,
    pub gen: u32,
}

/// One contiguous executable virtual-address range of a process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub begin: u64,
    pub end: u64,
    /// File offset the range was mapped at.
    pub offset: u64,
    pub path: PathBuf,
    pub inode: Inode,
    /// Absent for anonymous and synthetic mappings; those resolve to no
    /// binary.
    pub build_id: Option<String>,
}

/// A sampled address resolved to a file location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: PathBuf,
    pub inode: Inode,
    pub offset: u64,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("address points to unknown mapping")]
    UnknownMapping,
    #[error("no main mapping")]
    NoMainMapping,
    #[error("no dso for main mapping")]
    NoDsoMainMapping,
    #[error("no bpf allocation for main mapping")]
    NoBpfAllocation,
}

struct VersionedMapping {
    mapping: Mapping,
    dso: Option<Arc<Dso>>,
    /// Per-process insertion counter; the tiebreaker when mappings overlap.
    generation: u64,
}

impl Segment for VersionedMapping {
    fn begin(&self) -> u64 {
        self.mapping.begin
    }

    fn end(&self) -> u64 {
        self.mapping.end
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Default)]
struct MappingSet {
    maps: Vec<VersionedMapping>,
    generation: u64,
    sorted: bool,
}

struct ProcessMappings {
    inner: RwLock<MappingSet>,
}

/// All processes' mapping sets plus the registry deduplicating their
/// binaries. One lock guards the pid index; each process's set has its
/// own, so discovery of one process does not stall resolution in another.
pub struct Storage {
    processes: RwLock<HashMap<Pid, Arc<ProcessMappings>>>,
    registry: Registry,
}

impl Storage {
    pub fn new(registry: Registry) -> Self {
        Storage {
            processes: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn process_count(&self) -> usize {
        self.processes.read().expect("lock").len()
    }

    pub fn add_process(&self, pid: Pid) {
        self.ensure_process(pid);
    }

    /// Drop a process and release every retained mapping's DSO reference.
    pub fn remove_process(&self, pid: Pid) {
        let Some(process) = self.processes.write().expect("lock").remove(&pid) else {
            return;
        };
        debug!("removing process {}", pid);

        let mut set = process.inner.write().expect("lock");
        for stale in set.maps.drain(..) {
            self.release_mapping(&stale);
        }
    }

    /// Register the mapping's binary (if it has one) and append the mapping
    /// to the process's set. Ordering and overlap pruning are deferred to
    /// the next read or compaction.
    pub fn add_mapping(
        &self,
        pid: Pid,
        mapping: Mapping,
        file: Option<&SealedFile>,
    ) -> Option<Arc<Dso>> {
        let dso = mapping
            .build_id
            .as_deref()
            .map(|build_id| self.registry.register(build_id, file));

        let process = self.ensure_process(pid);
        let mut set = process.inner.write().expect("lock");
        set.sorted = false;
        let generation = set.generation;
        set.generation += 1;
        set.maps.push(VersionedMapping {
            mapping,
            dso: dso.clone(),
            generation,
        });

        dso
    }

    /// Force an immediate sort-and-prune pass. Returns the retained mapping
    /// count. Used after discovery bursts to bound the per-process set.
    pub fn compactify(&self, pid: Pid) -> usize {
        let process = self.ensure_process(pid);
        self.sort_and_prune(&process)
    }

    /// Find the mapping containing `address`.
    pub fn resolve_mapping(&self, pid: Pid, address: u64) -> Result<Mapping, ResolveError> {
        let process = self.find_process(pid).ok_or(ResolveError::NoSuchProcess)?;
        let set = self.sorted_read(&process);

        let index = set.maps.partition_point(|m| m.mapping.begin <= address);
        if index == 0 || set.maps[index - 1].mapping.end <= address {
            return Err(ResolveError::UnknownMapping);
        }
        Ok(set.maps[index - 1].mapping.clone())
    }

    /// Resolve `address` to a path, inode and file offset.
    pub fn resolve_address(&self, pid: Pid, address: u64) -> Result<Location, ResolveError> {
        let mapping = self.resolve_mapping(pid, address)?;
        Ok(Location {
            path: mapping.path.clone(),
            inode: mapping.inode,
            offset: mapping.offset + (address - mapping.begin),
        })
    }

    /// Resolve a TLS variable offset to its name through the process's main
    /// mapping (the lowest-addressed one, normally the executable itself).
    pub fn resolve_tls_name(&self, pid: Pid, offset: u64) -> Result<Option<String>, ResolveError> {
        let process = self.find_process(pid).ok_or(ResolveError::NoSuchProcess)?;
        let set = self.sorted_read(&process);

        let main = set.maps.first().ok_or(ResolveError::NoMainMapping)?;
        let dso = main.dso.as_ref().ok_or(ResolveError::NoDsoMainMapping)?;
        let allocation = dso.allocation().ok_or(ResolveError::NoBpfAllocation)?;
        Ok(allocation.tls_name(offset))
    }

    fn ensure_process(&self, pid: Pid) -> Arc<ProcessMappings> {
        let mut processes = self.processes.write().expect("lock");
        Arc::clone(processes.entry(pid).or_insert_with(|| {
            Arc::new(ProcessMappings {
                inner: RwLock::new(MappingSet::default()),
            })
        }))
    }

    fn find_process(&self, pid: Pid) -> Option<Arc<ProcessMappings>> {
        self.processes.read().expect("lock").get(&pid).cloned()
    }

    /// Take a read lock on a set that is guaranteed sorted and pruned at
    /// that moment. The upgrade path drops the read lock, so a concurrent
    /// insert may dirty the set again; in that case sorting simply reruns.
    fn sorted_read<'a>(
        &self,
        process: &'a ProcessMappings,
    ) -> RwLockReadGuard<'a, MappingSet> {
        loop {
            let set = process.inner.read().expect("lock");
            if set.sorted {
                return set;
            }
            drop(set);
            self.sort_and_prune(process);
        }
    }

    fn sort_and_prune(&self, process: &ProcessMappings) -> usize {
        let mut set = process.inner.write().expect("lock");
        set.maps.sort_by(|a, b| {
            a.mapping
                .begin
                .cmp(&b.mapping.begin)
                .then(a.mapping.end.cmp(&b.mapping.end))
        });
        set.sorted = true;

        let maps = std::mem::take(&mut set.maps);
        let (retained, pruned) = prune_overlapping(maps);
        set.maps = retained;
        for stale in &pruned {
            self.release_mapping(stale);
        }
        set.maps.len()
    }

    /// Mirror of removal: a mapping leaving the set gives up its DSO
    /// reference.
    fn release_mapping(&self, mapping: &VersionedMapping) {
        if let Some(build_id) = &mapping.mapping.build_id {
            self.registry.release(build_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    use crate::analysis::{BinaryAnalysis, BinaryAnalyzer, TlsConfig, TlsVariable};
    use crate::binary::BinaryManager;
    use crate::bpf::{MemoryStore, PageStore, PythonConfigStore, TlsConfigStore};
    use crate::dso::registry::RegistryConfig;
    use crate::unwind::{CfaRule, RbpRule, UnwindRow, UnwindTable, UnwindTableManagerConfig};

    struct StubAnalyzer;

    impl BinaryAnalyzer for StubAnalyzer {
        fn analyze(&self, _file: &File) -> anyhow::Result<BinaryAnalysis> {
            let rows = vec![UnwindRow {
                start_pc: 0x1000,
                pc_range: 0x100,
                cfa: CfaRule::RegisterOffset {
                    regno: 7,
                    offset: 16,
                },
                rbp: RbpRule::Undefined,
            }];
            Ok(BinaryAnalysis {
                unwind_table: UnwindTable::from_rows(&rows).unwrap(),
                tls: TlsConfig {
                    variables: vec![TlsVariable {
                        offset: 0x70,
                        name: "worker_id".into(),
                    }],
                },
                python: None,
            })
        }
    }

    fn storage() -> Storage {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(BinaryManager::new(
            Arc::clone(&store) as Arc<dyn PageStore>,
            Arc::clone(&store) as Arc<dyn TlsConfigStore>,
            Arc::clone(&store) as Arc<dyn PythonConfigStore>,
            UnwindTableManagerConfig { total_pages: 64 },
        ));
        Storage::new(Registry::new(
            manager,
            Arc::new(StubAnalyzer),
            RegistryConfig::default(),
        ))
    }

    fn mapping(begin: u64, end: u64, offset: u64, inode: u64, build_id: &str) -> Mapping {
        Mapping {
            begin,
            end,
            offset,
            path: PathBuf::from(format!("/lib/{build_id}.so")),
            inode: Inode { id: inode, gen: 0 },
            build_id: Some(build_id.to_string()),
        }
    }

    #[test]
    fn test_unknown_process_and_address() {
        let storage = storage();
        for pid in 0..4 {
            storage.add_process(pid);
        }
        assert_eq!(storage.process_count(), 4);

        assert_eq!(
            storage.resolve_address(15, 0),
            Err(ResolveError::NoSuchProcess)
        );
        assert_eq!(
            storage.resolve_address(0, 0xdeadadd7e55),
            Err(ResolveError::UnknownMapping)
        );
    }

    fn single_mapping_storage() -> Storage {
        let storage = storage();
        storage.add_mapping(
            123,
            Mapping {
                begin: 0,
                end: 1024,
                offset: 2048,
                path: PathBuf::from("legolas.elf"),
                inode: Inode { id: 0x140de, gen: 0 },
                build_id: None,
            },
            None,
        );
        storage
    }

    #[rstest::rstest]
    #[case(0, 2048)]
    #[case(512, 2048 + 512)]
    #[case(1023, 3071)]
    fn test_single_mapping_offsets(#[case] address: u64, #[case] offset: u64) {
        let storage = single_mapping_storage();
        let location = storage.resolve_address(123, address).unwrap();
        assert_eq!(
            location,
            Location {
                path: PathBuf::from("legolas.elf"),
                inode: Inode { id: 0x140de, gen: 0 },
                offset,
            }
        );
    }

    #[rstest::rstest]
    #[case(1024)]
    #[case(0xdeadadd7e55)]
    fn test_single_mapping_misses(#[case] address: u64) {
        let storage = single_mapping_storage();
        assert_eq!(
            storage.resolve_address(123, address),
            Err(ResolveError::UnknownMapping)
        );
    }

    #[test]
    fn test_mapping_resolution() {
        let storage = storage();
        storage.add_mapping(0, mapping(0, 1024, 0, 1, "a"), None);
        storage.add_mapping(0, mapping(8000, 10000, 0, 2, "c"), None);

        let location = storage.resolve_address(0, 600).unwrap();
        assert_eq!((location.inode.id, location.offset), (1, 600));

        let location = storage.resolve_address(0, 9000).unwrap();
        assert_eq!((location.inode.id, location.offset), (2, 1000));

        assert_eq!(
            storage.resolve_address(0, 200).map(|l| l.inode.id),
            Ok(1)
        );
    }

    #[test]
    fn test_overlap_pruning() {
        let storage = storage();
        storage.add_mapping(0, mapping(0, 1024, 0, 0, "a"), None);
        storage.add_mapping(0, mapping(8000, 10000, 0, 2, "c"), None);
        // Later generation, overlapping the first mapping.
        storage.add_mapping(0, mapping(512, 4096, 0, 1, "b"), None);

        let location = storage.resolve_address(0, 600).unwrap();
        assert_eq!((location.inode.id, location.offset), (1, 600 - 512));

        assert_eq!(
            storage.resolve_address(0, 200),
            Err(ResolveError::UnknownMapping)
        );

        let location = storage.resolve_address(0, 9000).unwrap();
        assert_eq!((location.inode.id, location.offset), (2, 9000 - 8000));

        // The pruned mapping gave back its registry reference.
        assert_eq!(storage.compactify(0), 2);
        assert!(storage.registry().get("a").is_none());
        assert_eq!(storage.registry().live_count(), 2);
    }

    #[test]
    fn test_multiple_processes_share_dsos() {
        let storage = storage();
        let mappings = [
            mapping(0, 1024, 1, 1, "a"),
            mapping(2048, 4096, 148, 2, "b"),
            mapping(8000, 10000, 73, 3, "c"),
        ];
        for m in &mappings {
            storage.add_mapping(0, m.clone(), None);
        }

        let location = storage.resolve_address(0, 8400).unwrap();
        assert_eq!((location.inode.id, location.offset), (3, 8400 - 8000 + 73));
        let location = storage.resolve_address(0, 512).unwrap();
        assert_eq!((location.inode.id, location.offset), (1, 512 + 1));
        let location = storage.resolve_address(0, 3000).unwrap();
        assert_eq!((location.inode.id, location.offset), (2, 3000 - 2048 + 148));

        assert_eq!(storage.registry().live_count(), 3);

        for m in &mappings[..2] {
            storage.add_mapping(1, m.clone(), None);
        }
        let location = storage.resolve_address(1, 3012).unwrap();
        assert_eq!((location.inode.id, location.offset), (2, 3012 - 2048 + 148));

        storage.remove_process(0);
        assert_eq!(storage.process_count(), 1);
        // "c" was only mapped by process 0.
        assert_eq!(storage.registry().live_count(), 2);
        assert!(storage.registry().get("a").is_some());
        assert!(storage.registry().get("b").is_some());

        let location = storage.resolve_address(1, 670).unwrap();
        assert_eq!((location.inode.id, location.offset), (1, 670 + 1));

        storage.remove_process(1);
        assert_eq!(storage.registry().live_count(), 0);
        assert_eq!(storage.process_count(), 0);
    }

    #[test]
    fn test_repeated_identical_mappings_compact_to_one() {
        let storage = storage();
        let first = mapping(0, 1024, 1, 1, "aaa");
        let second = mapping(1025, 2049, 1, 2, "bbb");

        for _ in 0..5 {
            storage.add_mapping(0, first.clone(), None);
            storage.add_mapping(0, second.clone(), None);
        }

        assert_eq!(storage.compactify(0), 2);
        // Each pruned duplicate released its reference; one per binary
        // remains.
        storage.remove_process(0);
        assert_eq!(storage.registry().live_count(), 0);
    }

    #[test]
    fn test_triple_release_is_a_noop() {
        let storage = storage();
        storage.add_mapping(0, mapping(0, 1024, 0, 1, "x"), None);
        storage.add_mapping(0, mapping(0, 1024, 0, 1, "x"), None);
        assert_eq!(storage.compactify(0), 1);
        assert_eq!(storage.registry().live_count(), 1);

        storage.registry().release("x");
        assert_eq!(storage.registry().live_count(), 0);
        storage.registry().release("x");
        assert_eq!(storage.registry().live_count(), 0);
    }

    #[test]
    fn test_resolve_tls_name_through_main_mapping() {
        let storage = storage();
        let binary = tempfile::NamedTempFile::new().unwrap();
        let sealed = SealedFile::Path(binary.path().to_path_buf());

        assert_eq!(
            storage.resolve_tls_name(7, 0x70),
            Err(ResolveError::NoSuchProcess)
        );

        storage.add_process(7);
        assert_eq!(
            storage.resolve_tls_name(7, 0x70),
            Err(ResolveError::NoMainMapping)
        );

        // An anonymous mapping below the executable becomes the main
        // mapping and has no DSO.
        storage.add_mapping(
            7,
            Mapping {
                begin: 0x1000,
                end: 0x2000,
                ..Mapping::default()
            },
            None,
        );
        assert_eq!(
            storage.resolve_tls_name(7, 0x70),
            Err(ResolveError::NoDsoMainMapping)
        );

        // Registered without a file: no allocation gets built.
        storage.add_mapping(7, mapping(0x800, 0x1000, 0, 1, "noalloc"), None);
        assert_eq!(
            storage.resolve_tls_name(7, 0x70),
            Err(ResolveError::NoBpfAllocation)
        );

        // A properly analyzed main mapping resolves names.
        storage.add_mapping(7, mapping(0x400, 0x800, 0, 2, "main"), Some(&sealed));
        assert_eq!(storage.resolve_tls_name(7, 0x70).unwrap().as_deref(), Some("worker_id"));
        assert_eq!(storage.resolve_tls_name(7, 0x71).unwrap(), None);
    }

    #[test]
    fn test_concurrent_discovery_and_removal() {
        let storage = Arc::new(storage());
        let mappings: Vec<Mapping> = (0..100)
            .map(|i| mapping(i * 1024, (i + 1) * 1024, 0, i, &format!("bid-{i}")))
            .collect();

        std::thread::scope(|scope| {
            for pid in 0..64i32 {
                let storage = Arc::clone(&storage);
                let mappings = &mappings;
                scope.spawn(move || {
                    let base = (pid as usize * 7) % 90;
                    for m in &mappings[base..base + 10] {
                        storage.add_mapping(pid, m.clone(), None);
                        assert!(storage
                            .registry()
                            .get(m.build_id.as_deref().unwrap())
                            .is_some());
                    }
                    storage.compactify(pid);
                    storage.remove_process(pid);
                });
            }
        });

        assert_eq!(storage.registry().live_count(), 0);
        assert_eq!(storage.process_count(), 0);
    }
}
