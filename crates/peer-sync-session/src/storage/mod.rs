//! Context store implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "memory")]
pub use memory::MemoryContextStore;

#[cfg(feature = "file")]
pub use file::FileContextStore;

/// Name of the slot holding the shared context.
pub const CONTEXT_KEY: &str = "applicationContext";
