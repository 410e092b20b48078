//! Two endpoints syncing over a local TCP connection.
//!
//! Run with: cargo run -p paired-endpoints-demo
//!
//! Set `RUST_LOG=peer_sync_session=debug` to trace every message.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt;
use peer_sync_core::{Context, Message, Role, SessionConfig, SessionDelegate};
use peer_sync_session::{
    SessionManager,
    storage::{FileContextStore, MemoryContextStore},
};
use peer_sync_transport::{StreamConfig, StreamTransport};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs callbacks and answers `greet`.
struct Companion;

#[async_trait]
impl SessionDelegate for Companion {
    fn context_changed(&self, context: &Context, changed: bool) {
        tracing::info!(changed, keys = context.len(), "companion context merged");
    }

    fn became_reachable(&self) {
        tracing::info!("primary reachable");
    }

    async fn handle(&self, message: Message) -> Context {
        let mut reply = Context::new();
        if message.command_name() == "greet" {
            reply.insert("reply".to_string(), json!("hello from the companion"));
        }
        reply
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    tracing::info!("Primary listening on {addr}");

    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (primary_io, _) = accepted.context("accept failed")?;
    let companion_io = connected.context("connect failed")?;

    // The demo keeps its own slot so it never touches a real application context.
    let store = match FileContextStore::default_location() {
        Ok(store) => store.with_key("pairedEndpointsDemo"),
        Err(e) => {
            tracing::warn!(error = %e, "no data directory, using the temp dir");
            FileContextStore::new(std::env::temp_dir().join("peer-sync-demo").join("context.json"))
        }
    };
    tracing::info!(path = %store.path().display(), "primary context store");

    let (transport, events) = StreamTransport::connect(primary_io, &StreamConfig::default());
    let primary = SessionManager::start(
        SessionConfig::new(Role::Primary),
        transport,
        Arc::new(store),
        None,
        events,
    )
    .await;

    let (transport, events) = StreamTransport::connect(companion_io, &StreamConfig::default());
    let companion = SessionManager::start(
        SessionConfig::new(Role::Companion),
        transport,
        Arc::new(MemoryContextStore::new()),
        Some(Arc::new(Companion)),
        events,
    )
    .await;

    let mut reachable = primary.subscribe_reachability();
    tokio::time::timeout(Duration::from_secs(5), reachable.wait_for(|r| *r))
        .await
        .context("companion never became reachable")??;

    let delivery = primary
        .send(Message::command("greet"), true)
        .await
        .context("greet failed")?;
    tracing::info!(?delivery, "greet delivered");

    let mut updates = companion.context_updates();
    let mut update = Context::new();
    update.insert("theme".to_string(), json!("dark"));
    update.insert("updatedAt".to_string(), json!(unix_timestamp()));
    let sync = primary.send_context(update, false).await?;
    tracing::info!(?sync, "context sent");

    match tokio::time::timeout(Duration::from_secs(5), updates.next()).await {
        Ok(Some(context)) => {
            let context = serde_json::Value::Object(context);
            tracing::info!(%context, "companion observed context");
        }
        Ok(None) => tracing::warn!("companion session stopped"),
        Err(_) => tracing::warn!("no context update observed"),
    }

    Ok(())
}

/// Seconds since the epoch, so every run changes the stored context.
fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
