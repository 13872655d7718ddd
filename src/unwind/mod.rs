//! The unwind table page allocator.
//!
//! Converts one binary's unwind rows into a three-level radix page table
//! backed by a bounded pool of fixed-size pages, with eviction of cached
//! tables when the pool runs dry.

mod builder;
mod cache;
mod freelist;
mod manager;
mod source;

pub use manager::{
    Allocation, AllocationState, BuildError, UnwindTableManager, UnwindTableManagerConfig,
};
pub use source::{CfaRule, RbpRule, SourceError, UnwindRow, UnwindTable};
