//! In-process transport pair with fault injection.
//!
//! Both endpoints live in the same process and exchange events over
//! channels. Reachability is shared by the link; faults are per side.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use peer_sync_core::{
    ActivationState, Transport, TransportError, TransportEvent, WireMessage,
};
use tokio::sync::{mpsc, oneshot};

/// Loopback configuration, applied to both sides.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Reported by `is_paired`.
    pub paired: bool,
    /// Reported by `is_counterpart_installed`.
    pub installed: bool,
    /// How long `send_message` waits for a reply.
    pub reply_timeout: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            paired: true,
            installed: true,
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters of outbound transport calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub messages: usize,
    pub context_updates: usize,
    pub transfers: usize,
}

/// One side of a loopback pair: the transport plus its inbound events.
pub struct LoopbackEndpoint {
    pub transport: Arc<LoopbackTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

struct Link {
    reachable: AtomicBool,
    events: [mpsc::UnboundedSender<TransportEvent>; 2],
}

impl Link {
    fn emit(&self, side: usize, event: TransportEvent) -> Result<(), TransportError> {
        self.events[side]
            .send(event)
            .map_err(|_| TransportError::Closed)
    }
}

/// One side of an in-process transport pair.
pub struct LoopbackTransport {
    side: usize,
    link: Arc<Link>,
    reply_timeout: Duration,
    paired: AtomicBool,
    installed: AtomicBool,
    fail_messages: AtomicBool,
    fail_context_updates: AtomicBool,
    messages: AtomicUsize,
    context_updates: AtomicUsize,
    transfers: AtomicUsize,
}

impl LoopbackTransport {
    /// Create a connected pair. The link starts unreachable.
    #[must_use]
    pub fn pair(config: &LoopbackConfig) -> (LoopbackEndpoint, LoopbackEndpoint) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            reachable: AtomicBool::new(false),
            events: [a_tx, b_tx],
        });

        let a = LoopbackEndpoint {
            transport: Arc::new(Self::new(0, Arc::clone(&link), config)),
            events: a_rx,
        };
        let b = LoopbackEndpoint {
            transport: Arc::new(Self::new(1, link, config)),
            events: b_rx,
        };
        (a, b)
    }

    fn new(side: usize, link: Arc<Link>, config: &LoopbackConfig) -> Self {
        Self {
            side,
            link,
            reply_timeout: config.reply_timeout,
            paired: AtomicBool::new(config.paired),
            installed: AtomicBool::new(config.installed),
            fail_messages: AtomicBool::new(false),
            fail_context_updates: AtomicBool::new(false),
            messages: AtomicUsize::new(0),
            context_updates: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
        }
    }

    const fn peer(&self) -> usize {
        1 - self.side
    }

    /// Change reachability for both sides and notify both.
    pub fn set_reachable(&self, reachable: bool) {
        self.link.reachable.store(reachable, Ordering::SeqCst);
        for side in [self.side, self.peer()] {
            let _ = self.link.emit(side, TransportEvent::ReachabilityChanged(reachable));
        }
    }

    /// Change this side's view of the counterpart install and notify it.
    pub fn set_counterpart_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::SeqCst);
        let _ = self
            .link
            .emit(self.side, TransportEvent::CounterpartInstallChanged(installed));
    }

    /// Report an activation state to this side.
    pub fn set_activation(&self, state: ActivationState) {
        let _ = self.link.emit(self.side, TransportEvent::ActivationChanged(state));
    }

    /// Make immediate messages fail.
    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    /// Make shared-context updates fail.
    pub fn fail_context_updates(&self, fail: bool) {
        self.fail_context_updates.store(fail, Ordering::SeqCst);
    }

    /// Outbound call counters.
    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            messages: self.messages.load(Ordering::SeqCst),
            context_updates: self.context_updates.load(Ordering::SeqCst),
            transfers: self.transfers.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn activate(&self) {
        self.set_activation(ActivationState::Activated);
    }

    fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    fn is_counterpart_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    async fn send_message(&self, message: WireMessage) -> Result<WireMessage, TransportError> {
        self.messages.fetch_add(1, Ordering::SeqCst);

        if self.fail_messages.load(Ordering::SeqCst) || !self.link.reachable.load(Ordering::SeqCst)
        {
            return Err(TransportError::Unreachable);
        }

        let (reply, rx) = oneshot::channel();
        self.link.emit(
            self.peer(),
            TransportEvent::MessageReceived {
                message,
                reply: Some(reply),
            },
        )?;

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn update_context(&self, message: WireMessage) -> Result<(), TransportError> {
        self.context_updates.fetch_add(1, Ordering::SeqCst);

        if self.fail_context_updates.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("context update rejected".to_string()));
        }

        self.link
            .emit(self.peer(), TransportEvent::ContextReceived(message))
    }

    fn transfer(&self, message: WireMessage) {
        self.transfers.fetch_add(1, Ordering::SeqCst);

        if self
            .link
            .emit(self.peer(), TransportEvent::TransferReceived(message))
            .is_err()
        {
            tracing::warn!(operation = "transfer", "peer gone, transfer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn wire(command: &str) -> WireMessage {
        let mut wire = WireMessage::new();
        wire.insert("command".to_string(), json!(command));
        wire
    }

    #[tokio::test]
    async fn test_unreachable_fails_fast() {
        let (a, _b) = LoopbackTransport::pair(&LoopbackConfig::default());
        let err = a.transport.send_message(wire("ping")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable));
        assert_eq!(a.transport.stats().messages, 1);
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (a, mut b) = LoopbackTransport::pair(&LoopbackConfig::default());
        a.transport.set_reachable(true);

        let responder = tokio::spawn(async move {
            loop {
                match b.events.recv().await {
                    Some(TransportEvent::MessageReceived { message, reply }) => {
                        reply.unwrap().send(message).unwrap();
                        break;
                    }
                    Some(_) => {}
                    None => panic!("link closed"),
                }
            }
        });

        let reply = a.transport.send_message(wire("ping")).await.unwrap();
        assert_eq!(reply, wire("ping"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_message_times_out() {
        let config = LoopbackConfig {
            reply_timeout: Duration::from_millis(20),
            ..LoopbackConfig::default()
        };
        let (a, _b) = LoopbackTransport::pair(&config);
        a.transport.set_reachable(true);

        let err = a.transport.send_message(wire("ping")).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_context_update_and_transfer_reach_peer() {
        let (a, mut b) = LoopbackTransport::pair(&LoopbackConfig::default());

        a.transport.update_context(wire("ctx")).unwrap();
        a.transport.transfer(wire("xfer"));

        assert!(matches!(
            b.events.recv().await,
            Some(TransportEvent::ContextReceived(m)) if m == wire("ctx")
        ));
        assert!(matches!(
            b.events.recv().await,
            Some(TransportEvent::TransferReceived(m)) if m == wire("xfer")
        ));
        assert_eq!(
            a.transport.stats(),
            LoopbackStats {
                messages: 0,
                context_updates: 1,
                transfers: 1
            }
        );
    }

    #[tokio::test]
    async fn test_injected_context_failure() {
        let (a, _b) = LoopbackTransport::pair(&LoopbackConfig::default());
        a.transport.fail_context_updates(true);
        assert!(matches!(
            a.transport.update_context(wire("ctx")),
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_reachability_notifies_both_sides() {
        let (mut a, mut b) = LoopbackTransport::pair(&LoopbackConfig::default());
        b.transport.set_reachable(true);

        assert!(matches!(
            a.events.recv().await,
            Some(TransportEvent::ReachabilityChanged(true))
        ));
        assert!(matches!(
            b.events.recv().await,
            Some(TransportEvent::ReachabilityChanged(true))
        ));
    }
}
