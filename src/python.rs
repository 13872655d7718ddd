//! Per-binary Python interpreter layout, installed alongside the unwind
//! table so the kernel-side unwinder can walk interpreter frames.

use std::sync::Arc;

use plain::Plain;
use tracing::error;

use crate::bpf::{PythonConfigStore, StoreError};
use crate::BinaryId;

/// Interpreter offsets extracted by the analysis for binaries that embed
/// CPython. Field offsets shift between interpreter versions, hence the
/// version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonConfig {
    pub version_major: u8,
    pub version_minor: u8,
    pub runtime_state_offset: u64,
    pub thread_state_offset: u64,
}

/// Kernel-side layout of one binary's Python configuration.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PythonBinaryConfig {
    pub version_major: u8,
    pub version_minor: u8,
    pub runtime_state_offset: u64,
    pub thread_state_offset: u64,
}

unsafe impl Plain for PythonBinaryConfig {}

pub struct PythonManager {
    store: Arc<dyn PythonConfigStore>,
}

impl PythonManager {
    pub fn new(store: Arc<dyn PythonConfigStore>) -> Self {
        PythonManager { store }
    }

    /// Most binaries carry no interpreter; adding nothing is a success.
    pub fn add(&self, binary: BinaryId, config: Option<&PythonConfig>) -> Result<(), StoreError> {
        let Some(config) = config else {
            return Ok(());
        };
        let table = PythonBinaryConfig {
            version_major: config.version_major,
            version_minor: config.version_minor,
            runtime_state_offset: config.runtime_state_offset,
            thread_state_offset: config.thread_state_offset,
        };
        self.store.put(binary, &table)
    }

    pub fn release(&self, binary: BinaryId) {
        if let Err(err) = self.store.delete(binary) {
            error!(
                "failed to delete python config for binary {}: {}",
                binary, err
            );
        }
    }
}
