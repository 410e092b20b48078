//! Transport adapters for two-endpoint peer sync.
//!
//! Provides:
//! - Frame protocol (newline-delimited JSON)
//! - In-process loopback pair with fault injection (feature: loopback)
//! - Byte-stream transport over TCP or any duplex pipe (feature: stream)

pub mod protocol;

#[cfg(feature = "loopback")]
pub mod loopback;

#[cfg(feature = "stream")]
pub mod stream;

pub use protocol::{Frame, FrameError};

#[cfg(feature = "loopback")]
pub use loopback::{LoopbackConfig, LoopbackEndpoint, LoopbackTransport};

#[cfg(feature = "stream")]
pub use stream::{StreamConfig, StreamTransport};
