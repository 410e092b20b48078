//! In-memory context store.

use std::sync::{
    RwLock,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use peer_sync_core::{Context, ContextStore, StorageError, context::strip_absent};

/// In-memory context store.
///
/// Useful for tests and endpoints that re-bootstrap on every launch.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryContextStore {
    context: RwLock<Context>,
    writes: AtomicUsize,
}

impl MemoryContextStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `context`, stripped of absent values.
    #[must_use]
    pub fn with_context(mut context: Context) -> Self {
        strip_absent(&mut context);
        Self {
            context: RwLock::new(context),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of writes since creation.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn load(&self) -> Result<Context, StorageError> {
        Ok(self
            .context
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn save(&self, context: &Context) -> Result<(), StorageError> {
        *self
            .context
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = context.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
