//! Session core and context storage for two-endpoint peer sync.
//!
//! Provides:
//! - `SessionManager` - Serialized session core with delivery fallback
//! - Context store implementations (memory, file)

mod actor;
pub mod delivery;
pub mod manager;
pub mod storage;
mod trace;

pub use delivery::Delivery;
pub use manager::{ContextSync, NotReadyReason, SessionError, SessionManager, SessionSnapshot};
