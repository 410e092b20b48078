//! Transport over any byte stream (TCP, pipes, in-memory duplex).
//!
//! Speaks the line-delimited `Frame` protocol. The counterpart counts as
//! reachable once both sides have activated and exchanged `Hello`; it becomes
//! unreachable when the stream closes. There is no reconnection: a new
//! connection means a new transport.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use peer_sync_core::{
    ActivationState, Transport, TransportError, TransportEvent, WireMessage,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
};
use uuid::Uuid;

use crate::protocol::Frame;

/// Stream transport configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Reported by `is_paired`.
    pub paired: bool,
    /// Announced to the counterpart in `Hello`.
    pub installed: bool,
    /// How long `send_message` waits for a reply.
    pub reply_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            paired: true,
            installed: true,
            reply_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct Handshake {
    activated: bool,
    peer_hello: bool,
    closed: bool,
}

type PendingReplies = HashMap<Uuid, oneshot::Sender<WireMessage>>;

struct Shared {
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<PendingReplies>,
    handshake: Mutex<Handshake>,
    reachable: AtomicBool,
    counterpart_installed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    fn take_pending(&self, id: &Uuid) -> Option<oneshot::Sender<WireMessage>> {
        self.pending.lock().ok()?.remove(id)
    }

    /// Update the handshake and report reachability once both halves are in.
    fn advance(&self, update: impl FnOnce(&mut Handshake)) {
        let became_reachable = {
            let Ok(mut handshake) = self.handshake.lock() else {
                return;
            };
            update(&mut handshake);
            handshake.activated
                && handshake.peer_hello
                && !handshake.closed
                && !self.reachable.swap(true, Ordering::SeqCst)
        };
        if became_reachable {
            self.emit(TransportEvent::ReachabilityChanged(true));
        }
    }

    fn close(&self) {
        if let Ok(mut handshake) = self.handshake.lock() {
            handshake.closed = true;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        if self.reachable.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::ReachabilityChanged(false));
        }
    }
}

/// Transport over a byte stream.
///
/// Dropping the transport shuts down the write side of the stream.
pub struct StreamTransport {
    shared: Arc<Shared>,
    _shutdown: oneshot::Sender<()>,
    paired: bool,
    installed: bool,
    reply_timeout: Duration,
}

impl StreamTransport {
    /// Start reading and writing frames on `io`.
    ///
    /// Returns the transport and its inbound events. Must be called inside a
    /// Tokio runtime.
    pub fn connect<S>(
        io: S,
        config: &StreamConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            events,
            outbound,
            pending: Mutex::new(HashMap::new()),
            handshake: Mutex::new(Handshake::default()),
            reachable: AtomicBool::new(false),
            counterpart_installed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(writer, outbound_rx, shutdown_rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        let transport = Arc::new(Self {
            shared,
            _shutdown: shutdown,
            paired: config.paired,
            installed: config.installed,
            reply_timeout: config.reply_timeout,
        });
        (transport, events_rx)
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: oneshot::Receiver<()>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = &mut shutdown => break,
        };
        let line = match frame.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize frame: {e}");
                continue;
            }
        };
        if let Err(e) = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await
        {
            tracing::warn!(error = %e, "stream write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.close();
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stream read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match Frame::from_line(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Invalid frame: {e}");
                continue;
            }
        };

        match frame {
            Frame::Hello { installed } => {
                shared
                    .counterpart_installed
                    .store(installed, Ordering::SeqCst);
                shared.emit(TransportEvent::CounterpartInstallChanged(installed));
                shared.advance(|h| h.peer_hello = true);
            }
            Frame::Message { id, body } => {
                let (reply, rx) = oneshot::channel();
                shared.emit(TransportEvent::MessageReceived {
                    message: body,
                    reply: Some(reply),
                });
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let body = rx.await.unwrap_or_default();
                    let _ = shared.send_frame(Frame::Reply { id, body });
                });
            }
            Frame::Reply { id, body } => match shared.take_pending(&id) {
                Some(waiter) => {
                    let _ = waiter.send(body);
                }
                None => tracing::debug!(%id, "reply for unknown or expired message"),
            },
            Frame::Context { body } => shared.emit(TransportEvent::ContextReceived(body)),
            Frame::Transfer { body } => shared.emit(TransportEvent::TransferReceived(body)),
        }
    }

    tracing::info!("stream closed");
    shared.close();
}

#[async_trait]
impl Transport for StreamTransport {
    fn activate(&self) {
        self.shared
            .emit(TransportEvent::ActivationChanged(ActivationState::Activated));
        if let Err(e) = self.shared.send_frame(Frame::Hello {
            installed: self.installed,
        }) {
            tracing::warn!(error = %e, "failed to announce activation");
        }
        self.shared.advance(|h| h.activated = true);
    }

    fn is_paired(&self) -> bool {
        self.paired
    }

    fn is_counterpart_installed(&self) -> bool {
        self.shared.counterpart_installed.load(Ordering::SeqCst)
    }

    async fn send_message(&self, message: WireMessage) -> Result<WireMessage, TransportError> {
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable);
        }

        let id = Uuid::new_v4();
        let (waiter, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .map_err(|e| TransportError::Rejected(e.to_string()))?
            .insert(id, waiter);

        if let Err(e) = self.shared.send_frame(Frame::Message { id, body: message }) {
            self.shared.take_pending(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.take_pending(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn update_context(&self, message: WireMessage) -> Result<(), TransportError> {
        self.shared.send_frame(Frame::Context { body: message })
    }

    fn transfer(&self, message: WireMessage) {
        if self
            .shared
            .send_frame(Frame::Transfer { body: message })
            .is_err()
        {
            tracing::warn!(operation = "transfer", "stream closed, transfer dropped");
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

    async fn next_reachability(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> bool {
        loop {
            match events.recv().await {
                Some(TransportEvent::ReachabilityChanged(reachable)) => return reachable,
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_reachable_after_both_activate() {
        let (left, right) = tokio::io::duplex(4096);
        let (a, mut a_events) = StreamTransport::connect(left, &StreamConfig::default());
        let (b, mut b_events) = StreamTransport::connect(right, &StreamConfig::default());

        a.activate();
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::ActivationChanged(ActivationState::Activated))
        ));
        b.activate();

        assert!(next_reachability(&mut a_events).await);
        assert!(next_reachability(&mut b_events).await);
        assert!(a.is_counterpart_installed());
        assert!(b.is_counterpart_installed());
    }

    #[tokio::test]
    async fn test_message_reply_over_stream() {
        let (left, right) = tokio::io::duplex(4096);
        let (a, mut a_events) = StreamTransport::connect(left, &StreamConfig::default());
        let (b, mut b_events) = StreamTransport::connect(right, &StreamConfig::default());
        a.activate();
        b.activate();
        assert!(next_reachability(&mut a_events).await);

        let responder = tokio::spawn(async move {
            loop {
                if let Some(TransportEvent::MessageReceived { message, reply }) =
                    b_events.recv().await
                {
                    assert_eq!(message, wire("ping"));
                    reply.unwrap().send(wire("pong")).unwrap();
                    break;
                }
            }
        });

        let reply = a.send_message(wire("ping")).await.unwrap();
        assert_eq!(reply, wire("pong"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_context_and_transfer_frames() {
        let (left, right) = tokio::io::duplex(4096);
        let (a, _a_events) = StreamTransport::connect(left, &StreamConfig::default());
        let (_b, mut b_events) = StreamTransport::connect(right, &StreamConfig::default());

        a.update_context(wire("ctx")).unwrap();
        a.transfer(wire("xfer"));

        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::ContextReceived(m)) if m == wire("ctx")
        ));
        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::TransferReceived(m)) if m == wire("xfer")
        ));
    }

    #[tokio::test]
    async fn test_close_reports_unreachable() {
        let (left, right) = tokio::io::duplex(4096);
        let (a, mut a_events) = StreamTransport::connect(left, &StreamConfig::default());
        let (b, b_events) = StreamTransport::connect(right, &StreamConfig::default());
        a.activate();
        b.activate();
        assert!(next_reachability(&mut a_events).await);

        drop(b);
        drop(b_events);

        assert!(!next_reachability(&mut a_events).await);
        let err = a.send_message(wire("ping")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable));
    }

    #[tokio::test]
    async fn test_send_before_handshake_is_unreachable() {
        let (left, _right) = tokio::io::duplex(4096);
        let (a, _events) = StreamTransport::connect(left, &StreamConfig::default());
        let err = a.send_message(wire("ping")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable));
    }
}
