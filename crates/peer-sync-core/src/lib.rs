//! Core abstractions for a two-endpoint peer session layer.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` and `MessageCodec` - Command envelope and its wire form
//! - `Context` - Shared key/value state and the last-writer-wins merge
//! - `SessionConfig` and `Role` - Per-endpoint configuration
//! - Transport, context store and delegate traits

pub mod config;
pub mod context;
pub mod message;
pub mod traits;

pub use config::{Role, SessionConfig};
pub use context::{Context, MergeOutcome, merge};
pub use message::{CodecError, Message, MessageCodec, WireMessage};
pub use traits::{
    ActivationState, ContextStore, SessionDelegate, StorageError, Transport, TransportError,
    TransportEvent,
};
