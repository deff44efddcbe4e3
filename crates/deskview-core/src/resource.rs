use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobError(pub String);

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BlobError {}

/// Fetches stored bytes for a derived asset (thumbnail, preview). A failure
/// here is per-item and never fails the surrounding collection load.
#[async_trait]
pub trait BlobRetriever: Send + Sync {
    async fn retrieve(&self, path: &str) -> Result<Vec<u8>, BlobError>;
}

/// A materialized, revocable URI for one record's derived asset.
///
/// The handle is not `Clone` and `ResourceRegistry::release` consumes it, so
/// a successful materialization is released exactly once by construction.
#[derive(Debug)]
pub struct ResourceHandle {
    source: String,
    uri: String,
}

impl ResourceHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Process-wide table of live ephemeral URIs. Overlapping fetch attempts
/// allocate and release concurrently; `live_count` lets tests assert that
/// allocations balance out after a reset.
#[derive(Default)]
pub struct ResourceRegistry {
    live: Mutex<HashMap<String, String>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieves the asset bytes and allocates a revocable URI for them.
    /// Fails soft: a retrieval failure logs and yields `None`, never an
    /// error to the caller.
    pub async fn materialize(
        &self,
        retriever: &dyn BlobRetriever,
        source: &str,
    ) -> Option<ResourceHandle> {
        let bytes = match retriever.retrieve(source).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(source, %err, "asset retrieval failed; record keeps a null asset");
                return None;
            }
        };

        let uri = format!("blob:deskview/{}", Uuid::new_v4());
        self.lock_live().insert(uri.clone(), source.to_string());
        tracing::trace!(source, uri, bytes = bytes.len(), "materialized asset");
        Some(ResourceHandle {
            source: source.to_string(),
            uri,
        })
    }

    /// Frees the registry entry behind `handle`. A URI the registry does not
    /// know (already-freed or foreign) is logged and ignored.
    pub fn release(&self, handle: ResourceHandle) {
        if self.lock_live().remove(&handle.uri).is_none() {
            tracing::warn!(uri = handle.uri, "released an unknown asset uri");
        }
    }

    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
