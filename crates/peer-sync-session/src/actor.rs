//! Serialized session state machine.
//!
//! All state lives here and is touched only from `run`, which drains
//! application commands and transport events one at a time. Transport round
//! trips are spawned and report back through the command queue.

use std::sync::Arc;

use peer_sync_core::{
    ActivationState, Context, ContextStore, Message, MessageCodec, MergeOutcome, Role,
    SessionConfig, SessionDelegate, StorageError, Transport, TransportEvent, WireMessage, context,
    message::{REQUEST_CURRENT_CONTEXT, SEND_CURRENT_CONTEXT},
    traits::ReplySender,
};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::{
    Delivery, NotReadyReason, SessionError, delivery,
    manager::{ContextSync, Responder, SessionCommand, SessionSnapshot},
    trace,
};

struct PendingContext {
    generation: u64,
    context: Context,
}

pub(crate) struct SessionActor {
    role: Role,
    codec: MessageCodec,
    bootstrap_context: bool,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ContextStore>,
    delegate: Option<Arc<dyn SessionDelegate>>,
    commands: mpsc::WeakUnboundedSender<SessionCommand>,
    context_tx: watch::Sender<Context>,
    reachable_tx: watch::Sender<bool>,
    activation: ActivationState,
    reachable: bool,
    pending: Option<PendingContext>,
    generation: u64,
    has_latest_context: bool,
    bootstrap_in_flight: bool,
}

impl SessionActor {
    pub(crate) fn new(
        config: &SessionConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ContextStore>,
        delegate: Option<Arc<dyn SessionDelegate>>,
        commands: mpsc::WeakUnboundedSender<SessionCommand>,
        context_tx: watch::Sender<Context>,
        reachable_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            role: config.role,
            codec: config.codec(),
            bootstrap_context: config.bootstrap_context,
            transport,
            store,
            delegate,
            commands,
            context_tx,
            reachable_tx,
            activation: ActivationState::NotActivated,
            reachable: false,
            pending: None,
            generation: 0,
            has_latest_context: false,
            bootstrap_in_flight: false,
        }
    }

    /// Drive the session until every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        tracing::debug!("transport event stream closed");
                        events_open = false;
                    }
                },
            }
        }

        tracing::debug!("session stopped");
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send {
                message,
                fallthrough,
                reply,
            } => self.send(message, fallthrough, move |outcome| {
                let _ = reply.send(outcome);
            }),
            SessionCommand::SendContext {
                context,
                force,
                reply,
            } => self.send_context(context, force, reply).await,
            SessionCommand::Context { reply } => {
                let _ = reply.send(self.store.load().await.map_err(SessionError::from));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::ContextDelivered { generation } => {
                self.on_context_delivered(generation);
            }
            SessionCommand::BootstrapFinished { outcome } => {
                self.on_bootstrap_finished(outcome).await;
            }
        }
    }

    async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ActivationChanged(state) => self.on_activation_changed(state).await,
            TransportEvent::ReachabilityChanged(reachable) => {
                self.on_reachability_changed(reachable).await;
            }
            TransportEvent::CounterpartInstallChanged(installed) => {
                tracing::info!(operation = "install_changed", installed, "counterpart install state changed");
                if installed {
                    self.retry_pending().await;
                }
            }
            TransportEvent::MessageReceived { message, reply } => {
                self.on_message(&message, reply).await;
            }
            TransportEvent::ContextReceived(wire) => {
                let Some(message) = self.decode("context_received", &wire) else {
                    return;
                };
                if self.role == Role::Companion && message.command_name() == SEND_CURRENT_CONTEXT {
                    self.has_latest_context = true;
                }
                self.absorb(message).await;
            }
            TransportEvent::TransferReceived(wire) => {
                if let Some(message) = self.decode("transfer_received", &wire) {
                    self.absorb(message).await;
                }
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            role: self.role,
            activation: self.activation,
            reachable: self.reachable,
            pending_context: self.pending.as_ref().map(|p| p.context.clone()),
            has_latest_context: self.has_latest_context,
        }
    }

    // --- send path

    fn check_ready(&self) -> Result<(), NotReadyReason> {
        if self.activation != ActivationState::Activated {
            return Err(NotReadyReason::NotActivated(self.activation));
        }
        if self.role == Role::Primary && !self.transport.is_paired() {
            return Err(NotReadyReason::NotPaired);
        }
        if !self.transport.is_counterpart_installed() {
            return Err(NotReadyReason::CounterpartNotInstalled);
        }
        Ok(())
    }

    fn prepare(&self, message: &Message) -> Result<WireMessage, SessionError> {
        self.check_ready()?;
        let wire = self.codec.encode(message)?;
        trace::log_message("send", message);
        Ok(wire)
    }

    /// Start delivering `message`; `done` runs once with the outcome.
    ///
    /// Refusals are reported synchronously. Transport work runs on a spawned
    /// task, so `done` must not touch actor state directly.
    fn send<F>(&self, message: Message, fallthrough: bool, done: F)
    where
        F: FnOnce(Result<Delivery, SessionError>) + Send + 'static,
    {
        let wire = match self.prepare(&message) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!(
                    operation = "send",
                    command = message.command_name(),
                    error = %e,
                    "send refused"
                );
                done(Err(e));
                return;
            }
        };

        let transport = Arc::clone(&self.transport);
        tokio::spawn(
            async move {
                let command = message.command_name();
                let outcome = delivery::deliver(transport.as_ref(), command, wire, fallthrough).await;
                done(outcome);
            }
            .in_current_span(),
        );
    }

    async fn send_context(
        &mut self,
        context: Context,
        force: bool,
        reply: Option<Responder<ContextSync>>,
    ) {
        if !force {
            match self.store.matches(&context).await {
                Ok(true) => {
                    tracing::debug!(operation = "send_context", "nothing to update, skipping send");
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(ContextSync::Unchanged));
                    }
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(operation = "send_context", error = %e, "failed to read context");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e.into()));
                    }
                    return;
                }
            }
        }

        // A context no tier can carry is refused before it touches the store or the slot.
        let message = Message::send_current_context(context.clone());
        if let Err(e) = self.codec.encode(&message) {
            tracing::warn!(operation = "send_context", error = %e, "context cannot be encoded");
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.into()));
            }
            return;
        }

        if let Err(e) = self.merge_context(&context, false).await {
            tracing::warn!(operation = "send_context", error = %e, "failed to merge context");
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.into()));
            }
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let replaced = self
            .pending
            .replace(PendingContext {
                generation,
                context,
            })
            .is_some();
        tracing::debug!(operation = "send_context", generation, replaced, "context pending");

        let commands = self.commands.clone();
        self.send(message, true, move |outcome| {
            if matches!(&outcome, Ok(delivery) if delivery.is_confirmed()) {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(SessionCommand::ContextDelivered { generation });
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(outcome.map(ContextSync::Delivered));
            }
        });
    }

    fn on_context_delivered(&mut self, generation: u64) {
        if self.pending.as_ref().is_some_and(|p| p.generation == generation) {
            tracing::debug!(operation = "send_context", generation, "pending context delivered");
            self.pending = None;
        } else {
            tracing::debug!(operation = "send_context", generation, "stale delivery confirmation");
        }
    }

    /// Resend the pending context. The slot stays occupied until the resend
    /// records a newer generation, so a failed merge keeps it for the next retry.
    async fn retry_pending(&mut self) {
        let Some(pending) = &self.pending else {
            return;
        };
        tracing::info!(
            operation = "retry_pending",
            generation = pending.generation,
            "retrying pending context"
        );
        let context = pending.context.clone();
        self.send_context(context, true, None).await;
    }

    // --- context merge

    async fn merge_context(
        &self,
        incoming: &Context,
        notify: bool,
    ) -> Result<MergeOutcome, StorageError> {
        let current = self.store.load().await?;
        let outcome = context::merge(&current, incoming);

        if outcome.changed {
            self.store.save(&outcome.context).await?;
        }

        tracing::debug!(
            operation = "merge_context",
            changed = outcome.changed,
            notify,
            context = %trace::render(&outcome.context),
            "context merged"
        );

        if let Some(delegate) = &self.delegate {
            delegate.context_changed(&outcome.context, outcome.changed);
        }

        if outcome.changed && notify {
            self.context_tx.send_replace(outcome.context.clone());
        }

        Ok(outcome)
    }

    async fn merge_inbound(&self, incoming: &Context) {
        if let Err(e) = self.merge_context(incoming, true).await {
            tracing::warn!(operation = "merge_context", error = %e, "failed to merge inbound context");
        }
    }

    // --- inbound dispatch

    fn decode(&self, operation: &'static str, wire: &WireMessage) -> Option<Message> {
        match self.codec.decode(wire) {
            Ok(message) => {
                trace::log_message(operation, &message);
                Some(message)
            }
            Err(e) => {
                tracing::debug!(operation, error = %e, "dropping undecodable message");
                None
            }
        }
    }

    async fn on_message(&self, wire: &WireMessage, reply: Option<ReplySender>) {
        let Some(message) = self.decode("message_received", wire) else {
            if let Some(reply) = reply {
                let _ = reply.send(WireMessage::new());
            }
            return;
        };

        if message.is_reserved() {
            let response = self.handle_reserved(&message).await;
            if let Some(reply) = reply {
                let _ = reply.send(response);
            }
        } else {
            self.forward_to_delegate(message, reply);
        }
    }

    async fn handle_reserved(&self, message: &Message) -> WireMessage {
        match message.command_name() {
            REQUEST_CURRENT_CONTEXT => {
                let context = match self.store.load().await {
                    Ok(context) => context,
                    Err(e) => {
                        tracing::warn!(operation = REQUEST_CURRENT_CONTEXT, error = %e, "failed to read context");
                        return WireMessage::new();
                    }
                };
                match self.codec.encode(&Message::send_current_context(context)) {
                    Ok(wire) => wire,
                    Err(e) => {
                        tracing::warn!(operation = REQUEST_CURRENT_CONTEXT, error = %e, "failed to encode reply");
                        WireMessage::new()
                    }
                }
            }
            SEND_CURRENT_CONTEXT => {
                if let Some(payload) = message.payload() {
                    self.merge_inbound(payload).await;
                }
                WireMessage::new()
            }
            _ => WireMessage::new(),
        }
    }

    /// Handle a message that arrived without a reply channel.
    async fn absorb(&self, message: Message) {
        match message.command_name() {
            SEND_CURRENT_CONTEXT => {
                if let Some(payload) = message.payload() {
                    self.merge_inbound(payload).await;
                }
            }
            REQUEST_CURRENT_CONTEXT => {
                tracing::debug!("context request arrived without a reply channel, ignoring");
            }
            _ => {
                if let Some(payload) = message.payload() {
                    self.merge_inbound(payload).await;
                }
                self.forward_to_delegate(message, None);
            }
        }
    }

    fn forward_to_delegate(&self, message: Message, reply: Option<ReplySender>) {
        let Some(delegate) = self.delegate.clone() else {
            tracing::debug!(
                command = message.command_name(),
                "no delegate registered, ignoring command"
            );
            if let Some(reply) = reply {
                let _ = reply.send(WireMessage::new());
            }
            return;
        };

        tokio::spawn(
            async move {
                let response = delegate.handle(message).await;
                if let Some(reply) = reply {
                    let _ = reply.send(response);
                }
            }
            .in_current_span(),
        );
    }

    // --- state changes

    async fn on_activation_changed(&mut self, state: ActivationState) {
        tracing::info!(operation = "activation_changed", %state, "activation state changed");
        self.activation = state;

        if state == ActivationState::Activated {
            self.retry_pending().await;
        }
    }

    async fn on_reachability_changed(&mut self, reachable: bool) {
        tracing::info!(operation = "reachability_changed", reachable, "reachability changed");
        self.reachable = reachable;
        self.reachable_tx.send_replace(reachable);

        if !reachable {
            return;
        }

        self.retry_pending().await;

        if self.role != Role::Companion {
            return;
        }

        if self.bootstrap_context && !self.has_latest_context {
            if !self.bootstrap_in_flight {
                self.request_current_context();
            }
        } else {
            self.notify_reachable();
        }
    }

    fn request_current_context(&mut self) {
        self.bootstrap_in_flight = true;
        let commands = self.commands.clone();
        self.send(Message::request_current_context(), false, move |outcome| {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(SessionCommand::BootstrapFinished { outcome });
            }
        });
    }

    async fn on_bootstrap_finished(&mut self, outcome: Result<Delivery, SessionError>) {
        self.bootstrap_in_flight = false;

        match outcome {
            Ok(Delivery::Replied(reply)) => {
                if let Some(message) = self.decode(REQUEST_CURRENT_CONTEXT, &reply) {
                    self.absorb(message).await;
                    self.has_latest_context = true;
                }
            }
            Ok(delivery) => {
                tracing::debug!(operation = REQUEST_CURRENT_CONTEXT, ?delivery, "no reply to bootstrap request");
            }
            Err(e) => {
                tracing::warn!(operation = REQUEST_CURRENT_CONTEXT, error = %e, "context bootstrap failed");
            }
        }

        if self.reachable {
            self.notify_reachable();
        }
    }

    fn notify_reachable(&self) {
        if let Some(delegate) = &self.delegate {
            delegate.became_reachable();
        }
    }
}
