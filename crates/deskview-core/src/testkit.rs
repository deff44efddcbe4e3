//! Shared mock collaborators for the loader and mutation tests. Query
//! responses are scripted and can be held at a gate so tests can interleave
//! completions deterministically.

use crate::instance::ActiveInstance;
use crate::loader::{
    CollectionLoader, KeyProvider, LoaderConfig, RecordPatch, RecordQuery, RecordStore, StoreError,
    ViewRecord,
};
use crate::resource::{BlobError, BlobRetriever, ResourceRegistry};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TestRecord {
    pub id: String,
    pub name: String,
    pub thumb: Option<String>,
    pub deleted: bool,
}

impl TestRecord {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            thumb: None,
            deleted: false,
        }
    }

    pub fn with_thumb(id: &str, name: &str, thumb: &str) -> Self {
        Self {
            thumb: Some(thumb.to_string()),
            ..Self::new(id, name)
        }
    }
}

impl ViewRecord for TestRecord {
    fn key(&self) -> &str {
        &self.id
    }

    fn asset_source(&self) -> Option<&str> {
        self.thumb.as_deref()
    }

    fn apply_patch(&mut self, patch: &RecordPatch) {
        match patch {
            RecordPatch::SoftDelete => self.deleted = true,
            RecordPatch::Restore => self.deleted = false,
            RecordPatch::FieldEdit { field, value } => {
                if field == "name" {
                    if let Some(name) = value.as_str() {
                        self.name = name.to_string();
                    }
                }
            }
        }
    }
}

struct QueryStep {
    gate: Option<Arc<Notify>>,
    result: Result<Vec<TestRecord>, StoreError>,
}

/// Record store whose query responses are scripted per call.
#[derive(Default)]
pub(crate) struct ScriptedStore {
    queries: Mutex<VecDeque<QueryStep>>,
    total: AtomicUsize,
    mutate_result: Mutex<Option<StoreError>>,
    mutate_gate: Mutex<Option<Arc<Notify>>>,
    pub query_calls: AtomicUsize,
    pub mutate_calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn push_query(&self, result: Result<Vec<TestRecord>, StoreError>) {
        self.queries
            .lock()
            .expect("queries lock")
            .push_back(QueryStep { gate: None, result });
    }

    pub fn push_gated_query(&self, gate: Arc<Notify>, result: Result<Vec<TestRecord>, StoreError>) {
        self.queries.lock().expect("queries lock").push_back(QueryStep {
            gate: Some(gate),
            result,
        });
    }

    pub fn set_mutate_result(&self, result: Result<(), StoreError>) {
        *self.mutate_result.lock().expect("mutate lock") = result.err();
    }

    /// Holds the next `mutate` call at `gate` until the test releases it.
    pub fn gate_next_mutate(&self, gate: Arc<Notify>) {
        *self.mutate_gate.lock().expect("mutate gate lock") = Some(gate);
    }
}

#[async_trait]
impl RecordStore<TestRecord> for ScriptedStore {
    async fn query(&self, _query: &RecordQuery) -> Result<Vec<TestRecord>, StoreError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .queries
            .lock()
            .expect("queries lock")
            .pop_front()
            .expect("unscripted query");
        if let Some(gate) = step.gate {
            gate.notified().await;
        }
        step.result
    }

    async fn count(&self, _filter: Option<&str>) -> Result<usize, StoreError> {
        Ok(self.total.load(Ordering::SeqCst))
    }

    async fn mutate(&self, _key: &str, _patch: &RecordPatch) -> Result<(), StoreError> {
        self.mutate_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.mutate_gate.lock().expect("mutate gate lock").take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.mutate_result.lock().expect("mutate lock").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub(crate) struct StaticKeys {
    key: Mutex<Option<Vec<u8>>>,
}

impl StaticKeys {
    pub fn unlocked() -> Self {
        Self {
            key: Mutex::new(Some(vec![0u8; 32])),
        }
    }

    pub fn lock(&self) {
        *self.key.lock().expect("key lock") = None;
    }
}

#[async_trait]
impl KeyProvider for StaticKeys {
    async fn current_key(&self) -> Option<Vec<u8>> {
        self.key.lock().expect("key lock").clone()
    }
}

#[derive(Default)]
pub(crate) struct MapBlobs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bytes: &[u8]) {
        self.blobs
            .lock()
            .expect("blobs lock")
            .insert(path.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl BlobRetriever for MapBlobs {
    async fn retrieve(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .expect("blobs lock")
            .get(path)
            .cloned()
            .ok_or_else(|| BlobError(format!("no blob at {path}")))
    }
}

/// A fully wired loader over scripted collaborators, starting on instance
/// `"a"` unless built with `without_instance`.
pub(crate) struct Harness {
    pub store: Arc<ScriptedStore>,
    pub keys: Arc<StaticKeys>,
    pub blobs: Arc<MapBlobs>,
    pub registry: Arc<ResourceRegistry>,
    pub instance: Arc<ActiveInstance>,
    pub loader: CollectionLoader<TestRecord>,
}

impl Harness {
    pub fn new(page_size: usize) -> Self {
        Self::build(Arc::new(ActiveInstance::with_active("a")), page_size)
    }

    pub fn without_instance(page_size: usize) -> Self {
        Self::build(Arc::new(ActiveInstance::new()), page_size)
    }

    fn build(instance: Arc<ActiveInstance>, page_size: usize) -> Self {
        let store = Arc::new(ScriptedStore::new());
        let keys = Arc::new(StaticKeys::unlocked());
        let blobs = Arc::new(MapBlobs::new());
        let registry = Arc::new(ResourceRegistry::new());
        let config = LoaderConfig {
            page_size,
            ..LoaderConfig::default()
        };
        let loader = CollectionLoader::new(
            store.clone(),
            keys.clone(),
            blobs.clone(),
            registry.clone(),
            instance.clone(),
            config,
        );
        loader.watch_instance();
        Self {
            store,
            keys,
            blobs,
            registry,
            instance,
            loader,
        }
    }
}
