//! Packs sorted unwind rows into leaf pages and indexes them with a
//! three-level radix tree of node pages.
//!
//! Leaves are packed sequentially and flushed through the page store as they
//! fill; every 256-byte slot of address space a leaf covers is stamped into
//! the radix index, first writer wins. Node pages are grabbed lazily on
//! first reference and compete with leaves for the same pool, so a build can
//! run the pool dry halfway through: every page request falls back to
//! evicting the largest cached allocation, and a build that still cannot be
//! satisfied is rolled back page by page.

use tracing::debug;

use crate::bpf::{
    CfaRuleKind, CfaUnwindRule, LeafPage, NodePage, PageId, PageKind, RbpUnwindRule, UnwindRule,
    UnwindTablePage, INVALID_PAGE_ID, LEAF_CAPACITY, LEAF_SPAN, LEVEL_SHIFTS, NODE_FANOUT,
    RBP_RULE_UNDEFINED,
};
use crate::unwind::manager::{BuildError, UnwindTableManager};
use crate::unwind::source::{CfaRule, RbpRule, UnwindRow, UnwindTable};
use crate::BinaryId;

use std::sync::atomic::Ordering;

pub(crate) struct BuiltTable {
    /// All owned pages: leaves first, then node pages in grab order.
    pub pages: Vec<PageId>,
    pub node_count: usize,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    /// Index into the node arena.
    Node(usize),
    Leaf(PageId),
}

struct Node {
    id: PageId,
    children: Vec<Slot>,
}

pub(crate) struct PageTableBuilder<'a> {
    manager: &'a UnwindTableManager,
    binary_id: BinaryId,
    table: &'a UnwindTable,

    leaves: Vec<PageId>,
    nodes: Vec<Node>,

    page: Box<LeafPage>,
    leaf_index: usize,
    row_index: usize,
    begin_pc: u64,
    next_pc: u64,
}

impl<'a> PageTableBuilder<'a> {
    pub fn new(
        manager: &'a UnwindTableManager,
        binary_id: BinaryId,
        table: &'a UnwindTable,
    ) -> Self {
        PageTableBuilder {
            manager,
            binary_id,
            table,
            leaves: Vec::new(),
            nodes: Vec::new(),
            page: Box::default(),
            leaf_index: 0,
            row_index: 0,
            begin_pc: 0,
            next_pc: 0,
        }
    }

    pub fn build(mut self) -> Result<BuiltTable, BuildError> {
        match self.try_build() {
            Ok(()) => {
                let mut pages = self.leaves;
                pages.extend(self.nodes.iter().map(|node| node.id));
                Ok(BuiltTable {
                    pages,
                    node_count: self.nodes.len(),
                })
            }
            Err(err) => {
                self.release_pages();
                Err(err)
            }
        }
    }

    fn try_build(&mut self) -> Result<(), BuildError> {
        self.alloc_leaves()?;
        let root = self.grab_node()?;
        debug_assert_eq!(root, 0);

        for index in 0..self.table.len() {
            if self.row_index >= LEAF_CAPACITY {
                self.flush_leaf()?;
            }
            let row = self.table.row(index);
            if self.row_index == 0 {
                self.begin_pc = row.start_pc;
            }
            self.next_pc = row.start_pc + u64::from(row.pc_range);
            self.fill_rule(&row);
            self.row_index += 1;
        }
        if self.row_index > 0 {
            self.flush_leaf()?;
        }

        self.flush_nodes()?;
        self.manager
            .store
            .put_root(self.binary_id, self.nodes[0].id)?;
        Ok(())
    }

    /// Grab every leaf up front; the row loop then only allocates nodes.
    fn alloc_leaves(&mut self) -> Result<(), BuildError> {
        let leaf_count = self.table.len().div_ceil(LEAF_CAPACITY);
        self.leaves.reserve(leaf_count);
        for _ in 0..leaf_count {
            let page = self.grab_page()?;
            self.leaves.push(page);
        }
        Ok(())
    }

    /// Take a page from the freelist, evicting the largest cached
    /// allocation on exhaustion until either a page frees up or nothing
    /// evictable remains.
    fn grab_page(&self) -> Result<PageId, BuildError> {
        loop {
            if let Some(id) = self.manager.freelist.acquire() {
                return Ok(id);
            }
            match self.manager.cache.pop() {
                // The eviction may lose the race against a concurrent
                // re-engage; keep going, the next pop sees fresh state.
                Some(victim) => {
                    self.manager.evict(&victim);
                }
                None => return Err(BuildError::NoPages),
            }
        }
    }

    fn grab_node(&mut self) -> Result<usize, BuildError> {
        let id = self.grab_page()?;
        self.nodes.push(Node {
            id,
            children: vec![Slot::Empty; NODE_FANOUT],
        });
        Ok(self.nodes.len() - 1)
    }

    fn release_pages(&mut self) {
        for &page in &self.leaves {
            self.manager.freelist.release(page);
        }
        for node in &self.nodes {
            self.manager.freelist.release(node.id);
        }
    }

    fn fill_rule(&mut self, row: &UnwindRow) {
        let rule = UnwindRule {
            cfa: match row.cfa {
                CfaRule::RegisterOffset { regno, offset } => CfaUnwindRule {
                    kind: CfaRuleKind::RegisterOffset as u8,
                    regno,
                    offset,
                },
                CfaRule::Unsupported => CfaUnwindRule {
                    kind: CfaRuleKind::Unsupported as u8,
                    regno: 0,
                    offset: 0,
                },
            },
            rbp: match row.rbp {
                RbpRule::CfaPlusOffset { offset } => RbpUnwindRule {
                    offset: offset as i8,
                },
                RbpRule::Undefined => RbpUnwindRule {
                    offset: RBP_RULE_UNDEFINED,
                },
            },
        };

        self.page.pc[self.row_index] = row.start_pc as u32;
        self.page.ranges[self.row_index] = row.pc_range;
        self.page.rules[self.row_index] = rule;
    }

    /// Write the current leaf through the store and stamp its address range
    /// into the radix index.
    fn flush_leaf(&mut self) -> Result<(), BuildError> {
        let page_id = self.leaves[self.leaf_index];
        let next_page = self
            .leaves
            .get(self.leaf_index + 1)
            .copied()
            .unwrap_or(INVALID_PAGE_ID);

        self.page.length = self.row_index as u32;
        let page = UnwindTablePage {
            id: page_id,
            begin_address: self.begin_pc,
            end_address: self.next_pc,
            next_page,
            kind: PageKind::Leaf(std::mem::take(&mut self.page)),
        };
        self.manager.store.put_page(&page)?;
        self.populate_radix(self.begin_pc, self.next_pc, page_id)?;

        self.manager
            .metrics
            .rows_used
            .fetch_add(self.row_index as u64, Ordering::Relaxed);
        self.manager
            .metrics
            .rows_lost
            .fetch_add((LEAF_CAPACITY - self.row_index) as u64, Ordering::Relaxed);

        self.leaf_index += 1;
        self.row_index = 0;
        self.begin_pc = 0;
        Ok(())
    }

    /// Stamp `leaf` into every innermost slot covered by `[from, to)`. The
    /// slot containing `to` is stamped as well; the kernel follows the
    /// next-leaf link when the stamped leaf ends before the queried pc.
    fn populate_radix(&mut self, from: u64, to: u64, leaf: PageId) -> Result<(), BuildError> {
        let from = from & !(LEAF_SPAN - 1);
        let to = to & !(LEAF_SPAN - 1);

        let mut pc = from;
        loop {
            self.insert_radix(pc, leaf)?;
            if pc >= to {
                return Ok(());
            }
            pc += LEAF_SPAN;
        }
    }

    fn insert_radix(&mut self, pc: u64, leaf: PageId) -> Result<(), BuildError> {
        let mask = NODE_FANOUT as u64 - 1;
        let slot0 = ((pc >> LEVEL_SHIFTS[0]) & mask) as usize;
        let slot1 = ((pc >> LEVEL_SHIFTS[1]) & mask) as usize;
        let slot2 = ((pc >> LEVEL_SHIFTS[2]) & mask) as usize;

        let level1 = self.child_node(0, slot0)?;
        let level2 = self.child_node(level1, slot1)?;
        if matches!(self.nodes[level2].children[slot2], Slot::Empty) {
            self.nodes[level2].children[slot2] = Slot::Leaf(leaf);
        }
        Ok(())
    }

    fn child_node(&mut self, parent: usize, slot: usize) -> Result<usize, BuildError> {
        let child = self.nodes[parent].children[slot];
        match child {
            Slot::Node(index) => Ok(index),
            Slot::Empty => {
                let index = self.grab_node()?;
                self.nodes[parent].children[slot] = Slot::Node(index);
                Ok(index)
            }
            Slot::Leaf(_) => unreachable!("leaf stamped into an outer radix level"),
        }
    }

    fn flush_nodes(&mut self) -> Result<(), BuildError> {
        debug!(
            "allocated {} intermediate nodes for binary {}",
            self.nodes.len(),
            self.binary_id
        );
        for node in &self.nodes {
            let mut page = Box::new(NodePage::default());
            for (slot, child) in node.children.iter().enumerate() {
                page.children[slot] = match child {
                    Slot::Node(index) => self.nodes[*index].id,
                    Slot::Leaf(leaf) => *leaf,
                    Slot::Empty => INVALID_PAGE_ID,
                };
            }
            let wrapper = UnwindTablePage {
                id: node.id,
                begin_address: 0,
                end_address: 0,
                next_page: INVALID_PAGE_ID,
                kind: PageKind::Node(page),
            };
            self.manager.store.put_page(&wrapper)?;
        }
        Ok(())
    }
}
