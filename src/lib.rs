//! In-process resource manager for a continuous eBPF stack-unwinding
//! profiler.
//!
//! This crate turns per-binary call-frame unwind information into the
//! fixed-size, page-organized lookup structure consumed by the kernel-resident
//! unwinder, and tracks which virtual-address ranges belong to which on-disk
//! binary across all profiled processes.
//!
//! The two main entry points are [`dso::Storage`], which maintains per-process
//! executable mappings and resolves sampled addresses, and
//! [`unwind::UnwindTableManager`], which owns the bounded page pool backing
//! the kernel-side unwind tables. Kernel map I/O and ELF/DWARF parsing are
//! reached through the traits in [`bpf`] and [`analysis`]; this crate never
//! talks to the kernel directly.

pub mod analysis;
pub mod binary;
pub mod bpf;
pub mod dso;
pub mod file;
pub mod metrics;
pub mod python;
pub mod reuse_cache;
pub mod segments;
pub mod tls;
pub mod unwind;

/// Process identifier as reported by the kernel.
pub type Pid = i32;

/// Process-wide unique identifier of an analyzed binary. Assigned from a
/// monotonic counter starting at zero; never reused within one profiler run.
pub type BinaryId = u64;
