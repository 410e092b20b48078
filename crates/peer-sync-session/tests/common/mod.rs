//! Shared fixtures for session integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use peer_sync_core::{Context, Message, Role, SessionConfig, SessionDelegate};
use peer_sync_session::{SessionManager, SessionSnapshot, storage::MemoryContextStore};
use peer_sync_transport::{LoopbackConfig, LoopbackEndpoint, LoopbackTransport};
use serde_json::{Value, json};

/// Delegate that records every callback.
#[derive(Default)]
pub struct Recorder {
    pub changes: Mutex<Vec<(Context, bool)>>,
    pub handled: Mutex<Vec<Message>>,
    pub reachable: AtomicUsize,
}

impl Recorder {
    pub fn changes(&self) -> Vec<(Context, bool)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn handled(&self) -> Vec<Message> {
        self.handled.lock().unwrap().clone()
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionDelegate for Recorder {
    fn context_changed(&self, context: &Context, changed: bool) {
        self.changes.lock().unwrap().push((context.clone(), changed));
    }

    fn became_reachable(&self) {
        self.reachable.fetch_add(1, Ordering::SeqCst);
    }

    async fn handle(&self, message: Message) -> Context {
        let mut reply = Context::new();
        reply.insert("echo".to_string(), json!(message.command_name()));
        self.handled.lock().unwrap().push(message);
        reply
    }
}

/// A running session plus the handles tests poke at.
pub struct Endpoint {
    pub session: SessionManager,
    pub transport: Arc<LoopbackTransport>,
    pub store: Arc<MemoryContextStore>,
    pub delegate: Arc<Recorder>,
}

pub fn ctx(value: Value) -> Context {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

pub async fn start(
    endpoint: LoopbackEndpoint,
    config: SessionConfig,
    store: MemoryContextStore,
) -> Endpoint {
    let store = Arc::new(store);
    let delegate = Arc::new(Recorder::default());
    let session = SessionManager::start(
        config,
        endpoint.transport.clone(),
        store.clone(),
        Some(delegate.clone()),
        endpoint.events,
    )
    .await;

    Endpoint {
        session,
        transport: endpoint.transport,
        store,
        delegate,
    }
}

/// A primary/companion pair over loopback, both activated, link unreachable.
pub async fn pair(config: &LoopbackConfig) -> (Endpoint, Endpoint) {
    let (a, b) = LoopbackTransport::pair(config);
    let primary = start(a, SessionConfig::new(Role::Primary), MemoryContextStore::new()).await;
    let companion = start(b, SessionConfig::new(Role::Companion), MemoryContextStore::new()).await;
    wait_activated(&primary.session).await;
    wait_activated(&companion.session).await;
    (primary, companion)
}

/// Poll the session until `check` holds, or panic after two seconds.
pub async fn wait_for<F>(session: &SessionManager, mut check: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = session.snapshot().await.expect("session stopped");
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

pub async fn wait_activated(session: &SessionManager) {
    wait_for(session, |s| {
        s.activation == peer_sync_core::ActivationState::Activated
    })
    .await;
}

/// Poll an arbitrary condition, or panic after two seconds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
