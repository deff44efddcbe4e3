//! Instance-scoped, race-safe, incrementally-loaded data view controller.
//!
//! The orchestration layer between a switchable record store and a
//! presentation layer: it fetches typed record collections, survives the
//! active instance changing mid-fetch, materializes and releases per-record
//! ephemeral assets, paginates under a virtualized viewport, and exposes a
//! single `{items, status, error}` projection. Storage, key material, blob
//! retrieval, and the virtualizer are collaborator traits implemented by
//! the host application.

pub mod instance;
pub mod loader;
pub mod mutation;
pub mod resource;
pub mod viewport;

#[cfg(test)]
pub(crate) mod testkit;

pub use instance::{ActiveInstance, InstanceToken, StaleGuard};
pub use loader::{
    CollectionLoader, KeyProvider, LoadState, LoaderConfig, PageCursor, RecordPatch, RecordQuery,
    RecordStore, Status, StoreError, ViewItem, ViewRecord, ViewSnapshot,
};
pub use mutation::MutationCoordinator;
pub use resource::{BlobError, BlobRetriever, ResourceHandle, ResourceRegistry};
pub use viewport::{ViewportWindow, DEFAULT_OVERSCAN};
