//! Core traits for transports, context storage and delegates.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{Context, Message, WireMessage};

/// Activation state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    /// Activation has not happened or failed.
    #[default]
    NotActivated,
    /// Activating, or temporarily inactive.
    Inactive,
    /// Ready to send.
    Activated,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActivated => f.write_str("not_activated"),
            Self::Inactive => f.write_str("inactive"),
            Self::Activated => f.write_str("activated"),
        }
    }
}

/// Channel used to answer a message that expects a reply.
pub type ReplySender = oneshot::Sender<WireMessage>;

/// Inbound event from a transport adapter.
#[derive(Debug)]
pub enum TransportEvent {
    /// Activation state changed.
    ActivationChanged(ActivationState),
    /// The counterpart became reachable or unreachable.
    ReachabilityChanged(bool),
    /// The counterpart app was installed or removed.
    CounterpartInstallChanged(bool),
    /// An immediate message arrived.
    MessageReceived {
        message: WireMessage,
        reply: Option<ReplySender>,
    },
    /// A shared-context update arrived.
    ContextReceived(WireMessage),
    /// A best-effort transfer arrived.
    TransferReceived(WireMessage),
}

/// Transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Counterpart is not reachable")]
    Unreachable,
    #[error("Timed out waiting for reply")]
    Timeout,
    #[error("Transport closed")]
    Closed,
    #[error("Rejected by transport: {0}")]
    Rejected(String),
}

/// Trait for transport adapters connecting the two endpoints.
///
/// Inbound traffic is delivered separately as a stream of `TransportEvent`s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin activation. The outcome arrives as `TransportEvent::ActivationChanged`.
    fn activate(&self);

    /// Whether the two devices are paired.
    fn is_paired(&self) -> bool;

    /// Whether the counterpart app is installed.
    fn is_counterpart_installed(&self) -> bool;

    /// Send an immediate message and wait for the counterpart's reply.
    async fn send_message(&self, message: WireMessage) -> Result<WireMessage, TransportError>;

    /// Replace the shared context. Succeeds once the update is recorded locally.
    fn update_context(&self, message: WireMessage) -> Result<(), TransportError>;

    /// Enqueue a best-effort transfer. No outcome is reported.
    fn transfer(&self, message: WireMessage);
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for the persisted shared-context slot.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Read the current context. An empty slot reads as an empty context.
    async fn load(&self) -> Result<Context, StorageError>;

    /// Replace the stored context.
    async fn save(&self, context: &Context) -> Result<(), StorageError>;

    /// Compare a candidate against the stored context.
    async fn matches(&self, candidate: &Context) -> Result<bool, StorageError> {
        Ok(self.load().await? == *candidate)
    }
}

/// Application hooks invoked by the session.
///
/// `context_changed` and `became_reachable` run on the session's own task and
/// must not wait on the session. Calling session methods and dropping or
/// spawning the returned future is fine.
#[async_trait]
pub trait SessionDelegate: Send + Sync {
    /// A context merge finished. `changed` is false when the merge was a no-op.
    fn context_changed(&self, _context: &Context, _changed: bool) {}

    /// The counterpart became reachable.
    fn became_reachable(&self) {}

    /// Handle an application command. The returned mapping is the reply.
    async fn handle(&self, _message: Message) -> Context {
        Context::new()
    }
}
