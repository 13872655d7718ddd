//! Fan-out manager installing one binary's unwind table together with its
//! sibling config tables as a single logical unit.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::analysis::BinaryAnalysis;
use crate::bpf::{PageStore, PythonConfigStore, TlsConfigStore};
use crate::metrics::UnwindTableStats;
use crate::python::PythonManager;
use crate::tls::TlsManager;
use crate::unwind::{Allocation, BuildError, UnwindTableManager, UnwindTableManagerConfig};
use crate::BinaryId;

/// Everything installed kernel-side for one binary, plus the userspace
/// TLS offset-to-name table resolved from the same analysis.
#[derive(Debug)]
pub struct BinaryAllocation {
    build_id: String,
    binary_id: BinaryId,
    unwind: Arc<Allocation>,
    tls_names: RwLock<HashMap<u64, String>>,
}

impl BinaryAllocation {
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn binary_id(&self) -> BinaryId {
        self.binary_id
    }

    pub fn unwind(&self) -> &Arc<Allocation> {
        &self.unwind
    }

    pub fn tls_name(&self, offset: u64) -> Option<String> {
        self.tls_names.read().expect("lock").get(&offset).cloned()
    }

    pub(crate) fn insert_tls_name(&self, offset: u64, name: String) {
        self.tls_names.write().expect("lock").insert(offset, name);
    }
}

/// Adds and removes the unwind allocation and the TLS/Python side tables
/// together; a failure halfway through rolls back everything already
/// installed for the binary.
pub struct BinaryManager {
    tables: UnwindTableManager,
    tls: TlsManager,
    python: PythonManager,
}

impl BinaryManager {
    pub fn new(
        pages: Arc<dyn PageStore>,
        tls: Arc<dyn TlsConfigStore>,
        python: Arc<dyn PythonConfigStore>,
        config: UnwindTableManagerConfig,
    ) -> Self {
        BinaryManager {
            tables: UnwindTableManager::new(pages, config),
            tls: TlsManager::new(tls),
            python: PythonManager::new(python),
        }
    }

    pub fn add(
        &self,
        build_id: &str,
        binary_id: BinaryId,
        analysis: &BinaryAnalysis,
    ) -> Result<Arc<BinaryAllocation>, BuildError> {
        let unwind = self.tables.add(build_id, binary_id, &analysis.unwind_table)?;

        if let Err(err) = self.tls.add(binary_id, &analysis.tls) {
            self.tables.release(&unwind);
            return Err(err.into());
        }

        if let Err(err) = self.python.add(binary_id, analysis.python.as_ref()) {
            self.tls.release(binary_id);
            self.tables.release(&unwind);
            return Err(err.into());
        }

        Ok(Arc::new(BinaryAllocation {
            build_id: build_id.to_string(),
            binary_id,
            unwind,
            tls_names: RwLock::new(HashMap::new()),
        }))
    }

    pub fn release(&self, allocation: &BinaryAllocation) {
        self.tables.release(&allocation.unwind);
        self.tls.release(allocation.binary_id);
        self.python.release(allocation.binary_id);
    }

    pub fn move_to_cache(&self, allocation: &BinaryAllocation) -> bool {
        self.tables.move_to_cache(&allocation.unwind)
    }

    pub fn move_from_cache(&self, allocation: &BinaryAllocation) -> bool {
        self.tables.move_from_cache(&allocation.unwind)
    }

    pub fn unwind_tables(&self) -> &UnwindTableManager {
        &self.tables
    }

    pub fn stats(&self) -> UnwindTableStats {
        self.tables.stats()
    }
}
