//! Interfaces to the kernel-resident stores.
//!
//! The profiler keeps its lookup structures in BPF maps; this crate only
//! produces their contents. Writing them is delegated to the traits below so
//! the resource-management logic stays independent of map plumbing, and so
//! everything can run against [`MemoryStore`] without a loaded program.

mod bindings;
mod memory;

pub use bindings::*;
pub use memory::MemoryStore;

use thiserror::Error;

use crate::python::PythonBinaryConfig;
use crate::tls::TlsBinaryConfig;
use crate::BinaryId;

/// A write to a kernel-resident store failed. Writes are synchronous;
/// a failure aborts the current build or teardown step.
#[derive(Debug, Error)]
#[error("store write failed: {0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        StoreError(message.into())
    }
}

/// The associative store holding unwind table pages and per-binary root
/// pointers.
pub trait PageStore: Send + Sync {
    /// Write one page. The slot is taken from `page.id`.
    fn put_page(&self, page: &UnwindTablePage) -> Result<(), StoreError>;

    /// Point `binary` at the root node page of its unwind table.
    fn put_root(&self, binary: BinaryId, root: PageId) -> Result<(), StoreError>;

    /// Remove the root pointer of `binary`. Removing an absent root is not
    /// an error.
    fn delete_root(&self, binary: BinaryId) -> Result<(), StoreError>;
}

/// Per-binary thread-local variable configuration store.
pub trait TlsConfigStore: Send + Sync {
    fn put(&self, binary: BinaryId, config: &TlsBinaryConfig) -> Result<(), StoreError>;
    fn delete(&self, binary: BinaryId) -> Result<(), StoreError>;
}

/// Per-binary Python interpreter configuration store.
pub trait PythonConfigStore: Send + Sync {
    fn put(&self, binary: BinaryId, config: &PythonBinaryConfig) -> Result<(), StoreError>;
    fn delete(&self, binary: BinaryId) -> Result<(), StoreError>;
}

/// Store that discards every write. Used when running without a loaded BPF
/// program, e.g. to dry-run table building against a binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl PageStore for NullStore {
    fn put_page(&self, _page: &UnwindTablePage) -> Result<(), StoreError> {
        Ok(())
    }

    fn put_root(&self, _binary: BinaryId, _root: PageId) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_root(&self, _binary: BinaryId) -> Result<(), StoreError> {
        Ok(())
    }
}

impl TlsConfigStore for NullStore {
    fn put(&self, _binary: BinaryId, _config: &TlsBinaryConfig) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete(&self, _binary: BinaryId) -> Result<(), StoreError> {
        Ok(())
    }
}

impl PythonConfigStore for NullStore {
    fn put(&self, _binary: BinaryId, _config: &PythonBinaryConfig) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete(&self, _binary: BinaryId) -> Result<(), StoreError> {
        Ok(())
    }
}
