//! Layout of the kernel-resident unwind page table.
//!
//! These structures mirror the BPF-side definitions byte for byte; the
//! `Plain` impls let a concrete page store hand them to the kernel as raw
//! bytes. Any change here must be matched by the BPF program.

use plain::Plain;

/// Index of a page inside the fixed pool. Pages are spread over several
/// equally sized BPF array maps ("parts"); `id / PAGES_PER_PART` selects the
/// part and `id % PAGES_PER_PART` the slot within it.
pub type PageId = u32;

/// Sentinel meaning "no page": unset radix slots and the next-page link of
/// the last leaf.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Number of node levels walked before reaching a leaf.
pub const PAGE_TABLE_DEPTH: usize = 3;

/// Rows stored in one leaf page.
pub const LEAF_CAPACITY: usize = 256;

/// Bytes of address space covered by one innermost radix slot.
pub const LEAF_SPAN: u64 = 256;

/// Children per node page.
pub const NODE_FANOUT: usize = 1024;

/// Address-bit shifts selecting the child slot at each node level.
pub const LEVEL_SHIFTS: [u32; PAGE_TABLE_DEPTH] = [28, 18, 8];

/// Pages held by one BPF array map part.
pub const PAGES_PER_PART: u32 = 1 << 14;

/// Size of one page entry in the kernel map, including the header.
pub const PAGE_ENTRY_BYTES: u64 = 4128;

/// CFA rule kinds understood by the kernel-side unwinder.
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum CfaRuleKind {
    #[default]
    Unsupported = 0,
    CfaMinus8 = 1,
    CfaPlusOffset = 2,
    RegisterOffset = 3,
    RegisterDerefOffset = 4,
    PltSection = 5,
    Constant = 6,
}

/// RBP offset meaning "the frame does not restore RBP".
pub const RBP_RULE_UNDEFINED: i8 = 0x7f;

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CfaUnwindRule {
    pub kind: u8,
    pub regno: u8,
    pub offset: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RbpUnwindRule {
    /// Offset from the CFA to read the saved RBP from, or
    /// [`RBP_RULE_UNDEFINED`].
    pub offset: i8,
}

#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UnwindRule {
    pub cfa: CfaUnwindRule,
    pub rbp: RbpUnwindRule,
}

/// Rows of one leaf page. `pc` holds the low 32 bits of each row's start
/// address; entries past `length` are unused.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LeafPage {
    pub length: u32,
    pub pc: [u32; LEAF_CAPACITY],
    pub ranges: [u32; LEAF_CAPACITY],
    pub rules: [UnwindRule; LEAF_CAPACITY],
}

impl Default for LeafPage {
    fn default() -> Self {
        LeafPage {
            length: 0,
            pc: [0; LEAF_CAPACITY],
            ranges: [0; LEAF_CAPACITY],
            rules: [UnwindRule::default(); LEAF_CAPACITY],
        }
    }
}

/// Routing entries of one node page. Unset children hold
/// [`INVALID_PAGE_ID`].
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodePage {
    pub children: [PageId; NODE_FANOUT],
}

impl Default for NodePage {
    fn default() -> Self {
        NodePage {
            children: [INVALID_PAGE_ID; NODE_FANOUT],
        }
    }
}

unsafe impl Plain for CfaUnwindRule {}
unsafe impl Plain for RbpUnwindRule {}
unsafe impl Plain for UnwindRule {}
unsafe impl Plain for LeafPage {}
unsafe impl Plain for NodePage {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageKind {
    Leaf(Box<LeafPage>),
    Node(Box<NodePage>),
}

/// One page as written through the page store. The address range and the
/// next-page link are only meaningful for leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindTablePage {
    pub id: PageId,
    pub begin_address: u64,
    pub end_address: u64,
    pub next_page: PageId,
    pub kind: PageKind,
}
