//! Per-binary thread-local variable table, installed alongside the unwind
//! table so the kernel-side collector can sample TLS values.

use std::sync::Arc;

use plain::Plain;
use tracing::{error, warn};

use crate::analysis::TlsConfig;
use crate::bpf::{StoreError, TlsConfigStore};
use crate::BinaryId;

/// Thread-local variables trackable per binary; fixed by the kernel-side
/// struct.
pub const MAX_TRACKED_TLS_VARIABLES: usize = 8;

/// Offset slot meaning "no variable here".
pub const TLS_OFFSET_UNSET: u64 = u64::MAX;

/// Kernel-side layout of one binary's TLS configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsBinaryConfig {
    pub offsets: [u64; MAX_TRACKED_TLS_VARIABLES],
}

unsafe impl Plain for TlsBinaryConfig {}

impl Default for TlsBinaryConfig {
    fn default() -> Self {
        TlsBinaryConfig {
            offsets: [TLS_OFFSET_UNSET; MAX_TRACKED_TLS_VARIABLES],
        }
    }
}

pub struct TlsManager {
    store: Arc<dyn TlsConfigStore>,
}

impl TlsManager {
    pub fn new(store: Arc<dyn TlsConfigStore>) -> Self {
        TlsManager { store }
    }

    pub fn add(&self, binary: BinaryId, config: &TlsConfig) -> Result<(), StoreError> {
        if config.variables.len() > MAX_TRACKED_TLS_VARIABLES {
            warn!(
                "binary {} exposes {} tls variables, tracking the first {}",
                binary,
                config.variables.len(),
                MAX_TRACKED_TLS_VARIABLES
            );
        }

        let mut table = TlsBinaryConfig::default();
        for (slot, variable) in config
            .variables
            .iter()
            .take(MAX_TRACKED_TLS_VARIABLES)
            .enumerate()
        {
            table.offsets[slot] = variable.offset;
        }
        self.store.put(binary, &table)
    }

    /// Delete failures are logged, not propagated: teardown keeps going.
    pub fn release(&self, binary: BinaryId) {
        if let Err(err) = self.store.delete(binary) {
            error!("failed to delete tls config for binary {}: {}", binary, err);
        }
    }
}
