//! Three-tier delivery: immediate message, shared context, queued transfer.

use peer_sync_core::{Context, Transport, WireMessage};

use crate::SessionError;

/// Which tier took an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered immediately; carries the counterpart's reply.
    Replied(Context),
    /// Written as the shared context. Reported as success, without a reply.
    Recorded,
    /// Handed to the best-effort transfer queue. Not a confirmation.
    Enqueued,
}

impl Delivery {
    /// Reply payload. Empty unless the message was delivered immediately.
    #[must_use]
    pub fn reply(&self) -> Context {
        match self {
            Self::Replied(reply) => reply.clone(),
            Self::Recorded | Self::Enqueued => Context::new(),
        }
    }

    /// Whether delivery counts as confirmed.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Replied(_) | Self::Recorded)
    }
}

/// Deliver an encoded message, escalating through the fallback tiers when allowed.
///
/// # Errors
/// Returns `TransportFailure` if immediate delivery fails and `fallthrough` is false.
pub async fn deliver(
    transport: &dyn Transport,
    command: &str,
    wire: WireMessage,
    fallthrough: bool,
) -> Result<Delivery, SessionError> {
    let error = match transport.send_message(wire.clone()).await {
        Ok(reply) => return Ok(Delivery::Replied(reply)),
        Err(e) => e,
    };

    if !fallthrough {
        tracing::warn!(operation = "send_message", command, error = %error, "delivery failed");
        return Err(SessionError::TransportFailure(error));
    }

    tracing::debug!(
        operation = "send_message",
        command,
        error = %error,
        "immediate delivery failed, falling back to shared context"
    );

    match transport.update_context(wire.clone()) {
        Ok(()) => Ok(Delivery::Recorded),
        Err(e) => {
            tracing::warn!(
                operation = "update_context",
                command,
                error = %e,
                "context update failed, enqueuing transfer"
            );
            transport.transfer(wire);
            Ok(Delivery::Enqueued)
        }
    }
}
