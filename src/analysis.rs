//! Output of the external binary analysis step.
//!
//! Parsing ELF/DWARF into unwind rows happens outside this crate (and
//! outside this process's hot path); the registry only consumes the compact
//! bundle below through the [`BinaryAnalyzer`] trait.

use std::fs::File;

use crate::python::PythonConfig;
use crate::unwind::UnwindTable;

/// A thread-local variable worth tracking, resolved to its module offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsVariable {
    pub offset: u64,
    pub name: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub variables: Vec<TlsVariable>,
}

/// Everything the analysis extracts from one binary.
#[derive(Debug, Clone)]
pub struct BinaryAnalysis {
    pub unwind_table: UnwindTable,
    pub tls: TlsConfig,
    /// Present only for binaries embedding a Python interpreter.
    pub python: Option<PythonConfig>,
}

/// Parser of on-disk binaries into [`BinaryAnalysis`] bundles.
///
/// Failures are expected (stripped binaries, exotic DWARF, truncated
/// files); the registry logs them and leaves the binary unsymbolized rather
/// than failing registration.
pub trait BinaryAnalyzer: Send + Sync {
    fn analyze(&self, file: &File) -> anyhow::Result<BinaryAnalysis>;
}
