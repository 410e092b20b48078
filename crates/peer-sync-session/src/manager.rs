//! Session manager: the application-facing handle to the session core.

use std::sync::Arc;

use futures::{FutureExt, future::BoxFuture};
use peer_sync_core::{
    ActivationState, CodecError, Context, ContextStore, Message, Role, SessionConfig,
    SessionDelegate, StorageError, Transport, TransportError, TransportEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::Instrument;

use crate::{Delivery, actor::SessionActor};

/// Why a send was refused before reaching the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotReadyReason {
    #[error("session not activated ({0})")]
    NotActivated(ActivationState),
    #[error("device is not paired with its counterpart")]
    NotPaired,
    #[error("counterpart app is not installed")]
    CounterpartNotInstalled,
}

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not ready: {0}")]
    NotReady(#[from] NotReadyReason),
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("Encoding failure: {0}")]
    EncodingFailure(#[from] CodecError),
    #[error("Context store error: {0}")]
    Storage(#[from] StorageError),
    #[error("Session closed")]
    Closed,
}

/// Outcome of `SessionManager::send_context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSync {
    /// The candidate equals the stored context; nothing was sent.
    Unchanged,
    /// The candidate was merged locally and handed to the transport.
    Delivered(Delivery),
}

/// Point-in-time view of the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub role: Role,
    pub activation: ActivationState,
    pub reachable: bool,
    /// Context update still awaiting confirmed delivery.
    pub pending_context: Option<Context>,
    /// Whether a companion has received the primary's context.
    pub has_latest_context: bool,
}

/// Future resolved when the session finishes a request.
pub type Reply<T> = BoxFuture<'static, Result<T, SessionError>>;

pub(crate) type Responder<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests processed by the session actor, in arrival order.
pub(crate) enum SessionCommand {
    Send {
        message: Message,
        fallthrough: bool,
        reply: Responder<Delivery>,
    },
    SendContext {
        context: Context,
        force: bool,
        reply: Option<Responder<ContextSync>>,
    },
    Context {
        reply: Responder<Context>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    ContextDelivered {
        generation: u64,
    },
    BootstrapFinished {
        outcome: Result<Delivery, SessionError>,
    },
}

/// Handle to a running session.
///
/// Cheap to clone. Every call is queued immediately, so the returned
/// future may be dropped when the outcome is not needed. The session
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct SessionManager {
    role: Role,
    commands: mpsc::UnboundedSender<SessionCommand>,
    context_rx: watch::Receiver<Context>,
    reachable_rx: watch::Receiver<bool>,
}

impl SessionManager {
    /// Start a session over `transport`, consuming its inbound `events`.
    ///
    /// Spawns the session task and asks the transport to activate.
    pub async fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ContextStore>,
        delegate: Option<Arc<dyn SessionDelegate>>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let initial = match store.load().await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(operation = "start", error = %e, "failed to load stored context");
                Context::new()
            }
        };

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (context_tx, context_rx) = watch::channel(initial);
        let (reachable_tx, reachable_rx) = watch::channel(false);

        let role = config.role;
        let actor = SessionActor::new(
            &config,
            Arc::clone(&transport),
            store,
            delegate,
            commands.downgrade(),
            context_tx,
            reachable_tx,
        );

        let span = tracing::info_span!("peer_session", %role);
        tokio::spawn(actor.run(commands_rx, events).instrument(span));

        transport.activate();

        Self {
            role,
            commands,
            context_rx,
            reachable_rx,
        }
    }

    /// Role of this endpoint.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Send a command to the counterpart.
    ///
    /// With `fallthrough`, a failed immediate delivery escalates to the shared
    /// context and then to a queued transfer.
    pub fn send(&self, message: Message, fallthrough: bool) -> Reply<Delivery> {
        self.request(|reply| SessionCommand::Send {
            message,
            fallthrough,
            reply,
        })
    }

    /// Send `command` with an optional payload.
    pub fn send_command(
        &self,
        command: impl Into<String>,
        payload: Option<Context>,
        fallthrough: bool,
    ) -> Reply<Delivery> {
        self.send(Message::new(command, payload), fallthrough)
    }

    /// Merge `context` locally and push it to the counterpart.
    ///
    /// Without `force`, a candidate equal to the stored context is skipped.
    /// The update stays pending until delivery is confirmed and is retried on
    /// activation, reachability and counterpart-install changes.
    pub fn send_context(&self, context: Context, force: bool) -> Reply<ContextSync> {
        self.request(|reply| SessionCommand::SendContext {
            context,
            force,
            reply: Some(reply),
        })
    }

    /// Read the stored context.
    pub fn context(&self) -> Reply<Context> {
        self.request(|reply| SessionCommand::Context { reply })
    }

    /// Current session state.
    pub fn snapshot(&self) -> BoxFuture<'static, Option<SessionSnapshot>> {
        let (reply, rx) = oneshot::channel();
        let queued = self.commands.send(SessionCommand::Snapshot { reply }).is_ok();
        async move {
            if queued { rx.await.ok() } else { None }
        }
        .boxed()
    }

    /// Receiver for externally-originated context changes.
    #[must_use]
    pub fn subscribe_context(&self) -> watch::Receiver<Context> {
        self.context_rx.clone()
    }

    /// Stream of externally-originated context changes.
    #[must_use]
    pub fn context_updates(&self) -> WatchStream<Context> {
        WatchStream::from_changes(self.context_rx.clone())
    }

    /// Receiver for reachability changes.
    #[must_use]
    pub fn subscribe_reachability(&self) -> watch::Receiver<bool> {
        self.reachable_rx.clone()
    }

    /// Last reported reachability.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        *self.reachable_rx.borrow()
    }

    fn request<T, F>(&self, build: F) -> Reply<T>
    where
        T: Send + 'static,
        F: FnOnce(Responder<T>) -> SessionCommand,
    {
        let (reply, rx) = oneshot::channel();
        let queued = self.commands.send(build(reply)).is_ok();
        async move {
            if !queued {
                return Err(SessionError::Closed);
            }
            rx.await.unwrap_or(Err(SessionError::Closed))
        }
        .boxed()
    }
}
