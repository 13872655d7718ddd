//! Binary deduplication and per-process address-range tracking.

mod registry;
mod storage;

pub use registry::{Dso, Registry, RegistryConfig};
pub use storage::{Inode, Location, Mapping, ResolveError, Storage};
