//! Source adapters: the per-portal extraction logic the coordinator drives.

pub mod registry;
pub mod traits;

pub use registry::AdapterRegistry;
pub use traits::{RawDetail, RawTarget, SourceAdapter};
