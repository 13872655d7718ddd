//! In-memory stand-in for the kernel-resident stores.
//!
//! Holds the same content the BPF maps would and mirrors the kernel's radix
//! walk in userspace, so built page tables can be inspected and verified
//! without loading a program. This is what the tests run against and what a
//! dry-run analysis tool can print from.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::bpf::bindings::{
    LeafPage, PageId, PageKind, UnwindRule, UnwindTablePage, INVALID_PAGE_ID, LEVEL_SHIFTS,
    NODE_FANOUT,
};
use crate::bpf::{PageStore, PythonConfigStore, StoreError, TlsConfigStore};
use crate::python::PythonBinaryConfig;
use crate::tls::TlsBinaryConfig;
use crate::BinaryId;

#[derive(Default)]
pub struct MemoryStore {
    pages: Mutex<HashMap<PageId, UnwindTablePage>>,
    roots: Mutex<HashMap<BinaryId, PageId>>,
    tls: Mutex<HashMap<BinaryId, TlsBinaryConfig>>,
    python: Mutex<HashMap<BinaryId, PythonBinaryConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages currently written. Released pages are not erased from
    /// the kernel maps either; they are simply overwritten on reuse.
    pub fn page_count(&self) -> usize {
        self.pages.lock().expect("lock").len()
    }

    pub fn root(&self, binary: BinaryId) -> Option<PageId> {
        self.roots.lock().expect("lock").get(&binary).copied()
    }

    pub fn tls_config(&self, binary: BinaryId) -> Option<TlsBinaryConfig> {
        self.tls.lock().expect("lock").get(&binary).copied()
    }

    pub fn python_config(&self, binary: BinaryId) -> Option<PythonBinaryConfig> {
        self.python.lock().expect("lock").get(&binary).copied()
    }

    /// Resolve `pc` through the registered root of `binary`, the same way the
    /// kernel-side unwinder does.
    pub fn lookup(&self, binary: BinaryId, pc: u64) -> Option<UnwindRule> {
        let root = self.root(binary)?;
        self.lookup_from(root, pc)
    }

    /// Walk the three node levels, hop to the next leaf when the stamped one
    /// ends before `pc`, then binary-search the leaf rows.
    pub fn lookup_from(&self, root: PageId, pc: u64) -> Option<UnwindRule> {
        let pages = self.pages.lock().expect("lock");

        let mut page_id = root;
        for shift in LEVEL_SHIFTS {
            let slot = ((pc >> shift) & (NODE_FANOUT as u64 - 1)) as usize;
            let page = pages.get(&page_id)?;
            let PageKind::Node(node) = &page.kind else {
                return None;
            };
            page_id = node.children[slot];
            if page_id == INVALID_PAGE_ID {
                return None;
            }
        }

        let mut page = pages.get(&page_id)?;
        if page.end_address <= pc {
            if page.next_page == INVALID_PAGE_ID {
                return None;
            }
            page = pages.get(&page.next_page)?;
        }
        let PageKind::Leaf(leaf) = &page.kind else {
            return None;
        };
        locate_rule(leaf, pc)
    }
}

fn locate_rule(leaf: &LeafPage, pc: u64) -> Option<UnwindRule> {
    let len = leaf.length as usize;
    let target = pc as u32;
    let idx = leaf.pc[..len].partition_point(|&start| start <= target);
    if idx == 0 {
        return None;
    }
    let row = idx - 1;
    if u64::from(leaf.pc[row]) + u64::from(leaf.ranges[row]) <= u64::from(target) {
        return None;
    }
    Some(leaf.rules[row])
}

impl PageStore for MemoryStore {
    fn put_page(&self, page: &UnwindTablePage) -> Result<(), StoreError> {
        self.pages
            .lock()
            .expect("lock")
            .insert(page.id, page.clone());
        Ok(())
    }

    fn put_root(&self, binary: BinaryId, root: PageId) -> Result<(), StoreError> {
        self.roots.lock().expect("lock").insert(binary, root);
        Ok(())
    }

    fn delete_root(&self, binary: BinaryId) -> Result<(), StoreError> {
        self.roots.lock().expect("lock").remove(&binary);
        Ok(())
    }
}

impl TlsConfigStore for MemoryStore {
    fn put(&self, binary: BinaryId, config: &TlsBinaryConfig) -> Result<(), StoreError> {
        self.tls.lock().expect("lock").insert(binary, *config);
        Ok(())
    }

    fn delete(&self, binary: BinaryId) -> Result<(), StoreError> {
        self.tls.lock().expect("lock").remove(&binary);
        Ok(())
    }
}

impl PythonConfigStore for MemoryStore {
    fn put(&self, binary: BinaryId, config: &PythonBinaryConfig) -> Result<(), StoreError> {
        self.python.lock().expect("lock").insert(binary, *config);
        Ok(())
    }

    fn delete(&self, binary: BinaryId) -> Result<(), StoreError> {
        self.python.lock().expect("lock").remove(&binary);
        Ok(())
    }
}
