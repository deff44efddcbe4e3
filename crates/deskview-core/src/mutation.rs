use crate::loader::{CollectionLoader, RecordPatch, StoreError, ViewRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Applies optimistic local mutations against the loaded collection and the
/// backing store.
///
/// Store first, then the in-memory patch: on success the cached record is
/// patched by identity key with no refetch; on failure the error is
/// surfaced on the shared error channel and nothing changes locally, so
/// store and view stay consistent with each other. There is no rollback to
/// perform because nothing was optimistically shown before the store write.
///
/// Mutations on the same identity key are serialized; different keys run
/// concurrently.
pub struct MutationCoordinator<R: ViewRecord> {
    loader: CollectionLoader<R>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<R: ViewRecord> MutationCoordinator<R> {
    pub fn new(loader: CollectionLoader<R>) -> Self {
        Self {
            loader,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn apply(&self, key: &str, patch: RecordPatch) -> Result<(), StoreError> {
        let lock = self.lock_for(key);
        let _serialized = lock.lock().await;

        match self.loader.store().mutate(key, &patch).await {
            Ok(()) => {
                if !self.loader.patch_entry(key, &patch) {
                    tracing::debug!(key, "mutated record is no longer loaded");
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(key, %err, "mutation failed; local state unchanged");
                self.loader.push_error(err.to_string());
                Err(err)
            }
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}
