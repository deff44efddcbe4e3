use crate::instance::{ActiveInstance, InstanceToken, StaleGuard};
use crate::resource::{BlobRetriever, ResourceHandle, ResourceRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A record the view controller can load, patch, and derive assets for.
///
/// Identity keys are unique within a loaded snapshot. `asset_source` names
/// the stored bytes behind the record's ephemeral asset, if it has one.
pub trait ViewRecord: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;

    fn asset_source(&self) -> Option<&str> {
        None
    }

    fn apply_patch(&mut self, patch: &RecordPatch);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "op")]
pub enum RecordPatch {
    SoftDelete,
    Restore,
    FieldEdit { field: String, value: JsonValue },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub filter: Option<String>,
    pub order_by: String,
    pub descending: bool,
    pub offset: usize,
    pub limit: usize,
}

/// Offset/limit state for incremental loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub offset: usize,
    pub page_size: usize,
    pub total_count: Option<usize>,
}

impl PageCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            offset: 0,
            page_size,
            total_count: None,
        }
    }

    pub fn has_more(&self) -> bool {
        match self.total_count {
            Some(total) => self.offset < total,
            None => true,
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.total_count = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Unavailable(String),
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(message) => write!(f, "{message}"),
            StoreError::NotFound(key) => write!(f, "record not found: {key}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistent record storage for one view. Ordering must be deterministic
/// and `mutate` atomic per record.
#[async_trait]
pub trait RecordStore<R: ViewRecord>: Send + Sync {
    async fn query(&self, query: &RecordQuery) -> Result<Vec<R>, StoreError>;
    async fn count(&self, filter: Option<&str>) -> Result<usize, StoreError>;
    async fn mutate(&self, key: &str, patch: &RecordPatch) -> Result<(), StoreError>;
}

/// Encryption key material. `None` means the store is locked, which is a
/// precondition failure rather than a retryable error.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn current_key(&self) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Locked,
    Loading,
    Loaded { has_more: bool },
    Error(String),
}

impl LoadState {
    pub fn status(&self) -> Status {
        match self {
            LoadState::Idle => Status::Idle,
            LoadState::Locked => Status::Locked,
            LoadState::Loading => Status::Loading,
            LoadState::Loaded { .. } => Status::Loaded,
            LoadState::Error(_) => Status::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Locked,
    Loading,
    Loaded,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Locked => "locked",
            Status::Loading => "loading",
            Status::Loaded => "loaded",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ViewItem<R> {
    pub record: R,
    pub asset_uri: Option<String>,
}

/// The single projection the presentation layer reads.
#[derive(Debug, Clone)]
pub struct ViewSnapshot<R> {
    pub items: Vec<ViewItem<R>>,
    pub status: Status,
    pub error: Option<String>,
    pub total_count: Option<usize>,
    pub has_more: bool,
    pub in_flight: bool,
}

impl<R> ViewSnapshot<R> {
    pub fn loaded_count(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub filter: Option<String>,
    pub order_by: String,
    pub descending: bool,
    pub page_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            filter: None,
            order_by: "modified".to_string(),
            descending: true,
            page_size: 50,
        }
    }
}

impl LoaderConfig {
    fn query_at(&self, offset: usize) -> RecordQuery {
        RecordQuery {
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
            descending: self.descending,
            offset,
            limit: self.page_size,
        }
    }
}

struct LoadedEntry<R> {
    record: R,
    asset: Option<ResourceHandle>,
}

struct LoaderInner<R> {
    state: LoadState,
    entries: Vec<LoadedEntry<R>>,
    cursor: PageCursor,
    error: Option<String>,
    fetch_seq: u64,
    last_commit_seq: u64,
    inflight_seq: Option<u64>,
}

/// Owns the fetch/refresh/paginate lifecycle for one view's collection.
///
/// Every asynchronous attempt captures an instance token and a fetch
/// sequence number; a result is committed only when the token is still
/// fresh and no fresher attempt has committed, so late arrivals from a
/// previous instance (or an older attempt) are discarded silently and
/// their materialized assets released. There is no true cancellation of
/// in-flight collaborator calls, and no timeout: a hung collaborator
/// leaves the loader `Loading` until the instance changes.
pub struct CollectionLoader<R: ViewRecord> {
    store: Arc<dyn RecordStore<R>>,
    keys: Arc<dyn KeyProvider>,
    blobs: Arc<dyn BlobRetriever>,
    registry: Arc<ResourceRegistry>,
    instance: Arc<ActiveInstance>,
    guard: StaleGuard,
    config: LoaderConfig,
    inner: Arc<Mutex<LoaderInner<R>>>,
}

impl<R: ViewRecord> Clone for CollectionLoader<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
            blobs: self.blobs.clone(),
            registry: self.registry.clone(),
            instance: self.instance.clone(),
            guard: self.guard.clone(),
            config: self.config.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<R: ViewRecord> CollectionLoader<R> {
    pub fn new(
        store: Arc<dyn RecordStore<R>>,
        keys: Arc<dyn KeyProvider>,
        blobs: Arc<dyn BlobRetriever>,
        registry: Arc<ResourceRegistry>,
        instance: Arc<ActiveInstance>,
        config: LoaderConfig,
    ) -> Self {
        let guard = StaleGuard::new(instance.clone());
        let cursor = PageCursor::new(config.page_size);
        Self {
            store,
            keys,
            blobs,
            registry,
            instance,
            guard,
            config,
            inner: Arc::new(Mutex::new(LoaderInner {
                state: LoadState::Idle,
                entries: Vec::new(),
                cursor,
                error: None,
                fetch_seq: 0,
                last_commit_seq: 0,
                inflight_seq: None,
            })),
        }
    }

    /// Resets to `Idle` whenever the active instance switches. The reset
    /// runs inside the switch notification, before any fetch for the new
    /// instance can start.
    pub fn watch_instance(&self) {
        let inner = Arc::clone(&self.inner);
        let registry = Arc::clone(&self.registry);
        self.instance.subscribe(move |_| {
            Self::reset_in(&inner, &registry);
        });
    }

    /// Drops all cached items, releases their assets, and returns to `Idle`.
    pub fn reset(&self) {
        Self::reset_in(&self.inner, &self.registry);
    }

    fn reset_in(inner: &Mutex<LoaderInner<R>>, registry: &ResourceRegistry) {
        let evicted = {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.state = LoadState::Idle;
            inner.error = None;
            inner.cursor.reset();
            inner.inflight_seq = None;
            std::mem::take(&mut inner.entries)
        };
        release_entries(registry, evicted);
    }

    /// Fetches the first page and the total count, replacing the cached
    /// collection. An initial load (no items yet) shows `Loading`; a
    /// refresh over an existing `Loaded` collection keeps the previous
    /// items visible until the new first page commits.
    pub async fn refresh(&self) {
        // Let a just-issued instance switch settle before capturing the token.
        tokio::task::yield_now().await;

        if self.instance.current().is_none() {
            let mut inner = self.lock_inner();
            inner.state = LoadState::Locked;
            return;
        }

        let token = self.guard.begin();
        let seq = {
            let mut inner = self.lock_inner();
            inner.fetch_seq += 1;
            inner.inflight_seq = Some(inner.fetch_seq);
            if !matches!(inner.state, LoadState::Loaded { .. }) {
                inner.state = LoadState::Loading;
            }
            inner.fetch_seq
        };

        if self.keys.current_key().await.is_none() {
            self.commit_locked(&token, seq);
            return;
        }

        let total = match self.store.count(self.config.filter.as_deref()).await {
            Ok(total) => total,
            Err(err) => {
                self.commit_error(&token, seq, err.to_string());
                return;
            }
        };

        let page = match self.store.query(&self.config.query_at(0)).await {
            Ok(page) => page,
            Err(err) => {
                self.commit_error(&token, seq, err.to_string());
                return;
            }
        };

        let entries = self.materialize_entries(page).await;
        self.commit_refresh(&token, seq, entries, total);
    }

    /// Fetches the next page and appends it. Valid only from
    /// `Loaded { has_more: true }` with no fetch in flight; anything else
    /// is a no-op with no store call.
    pub async fn paginate(&self) {
        let Some((token, seq, offset)) = ({
            let mut inner = self.lock_inner();
            let ready = matches!(inner.state, LoadState::Loaded { has_more: true })
                && inner.inflight_seq.is_none();
            if ready {
                inner.fetch_seq += 1;
                inner.inflight_seq = Some(inner.fetch_seq);
                Some((self.guard.begin(), inner.fetch_seq, inner.cursor.offset))
            } else {
                None
            }
        }) else {
            return;
        };

        let page = match self.store.query(&self.config.query_at(offset)).await {
            Ok(page) => page,
            Err(err) => {
                self.commit_error(&token, seq, err.to_string());
                return;
            }
        };

        let fetched = page.len();
        let entries = self.materialize_entries(page).await;
        self.commit_append(&token, seq, entries, fetched);
    }

    pub fn snapshot(&self) -> ViewSnapshot<R> {
        let inner = self.lock_inner();
        ViewSnapshot {
            items: inner
                .entries
                .iter()
                .map(|entry| ViewItem {
                    record: entry.record.clone(),
                    asset_uri: entry.asset.as_ref().map(|handle| handle.uri().to_string()),
                })
                .collect(),
            status: inner.state.status(),
            error: inner.error.clone(),
            total_count: inner.cursor.total_count,
            has_more: matches!(inner.state, LoadState::Loaded { has_more: true }),
            in_flight: inner.inflight_seq.is_some(),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn RecordStore<R>> {
        &self.store
    }

    /// Patches the cached record for `key` in place. Returns false when the
    /// key is no longer loaded (e.g. the instance changed mid-mutation).
    pub(crate) fn patch_entry(&self, key: &str, patch: &RecordPatch) -> bool {
        let mut inner = self.lock_inner();
        match inner
            .entries
            .iter_mut()
            .find(|entry| entry.record.key() == key)
        {
            Some(entry) => {
                entry.record.apply_patch(patch);
                true
            }
            None => false,
        }
    }

    /// Surfaces a message on the shared error channel without touching the
    /// load state or the cached items.
    pub(crate) fn push_error(&self, message: String) {
        self.lock_inner().error = Some(message);
    }

    async fn materialize_entries(&self, records: Vec<R>) -> Vec<LoadedEntry<R>> {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let asset = match record.asset_source() {
                Some(source) => self.registry.materialize(self.blobs.as_ref(), source).await,
                None => None,
            };
            entries.push(LoadedEntry { record, asset });
        }
        entries
    }

    fn commit_refresh(
        &self,
        token: &InstanceToken,
        seq: u64,
        new_entries: Vec<LoadedEntry<R>>,
        total: usize,
    ) {
        let evicted = {
            let mut inner = self.lock_inner();
            Self::finish_attempt(&mut inner, seq);
            if self.should_discard(&inner, token, seq) {
                new_entries
            } else {
                let (accepted, mut duplicates) = dedup_by_key(new_entries);
                let fetched = accepted.len() + duplicates.len();
                let old = std::mem::replace(&mut inner.entries, accepted);
                inner.cursor.offset = fetched;
                inner.cursor.total_count = Some(total);
                inner.state = LoadState::Loaded {
                    has_more: fetched == inner.cursor.page_size && inner.cursor.has_more(),
                };
                inner.error = None;
                inner.last_commit_seq = seq;
                duplicates.extend(old);
                duplicates
            }
        };
        release_entries(&self.registry, evicted);
    }

    fn commit_append(
        &self,
        token: &InstanceToken,
        seq: u64,
        new_entries: Vec<LoadedEntry<R>>,
        fetched: usize,
    ) {
        let evicted = {
            let mut inner = self.lock_inner();
            Self::finish_attempt(&mut inner, seq);
            if self.should_discard(&inner, token, seq) {
                new_entries
            } else {
                let mut known: HashSet<String> = inner
                    .entries
                    .iter()
                    .map(|entry| entry.record.key().to_string())
                    .collect();
                let mut duplicates = Vec::new();
                for entry in new_entries {
                    if known.insert(entry.record.key().to_string()) {
                        inner.entries.push(entry);
                    } else {
                        duplicates.push(entry);
                    }
                }
                inner.cursor.offset += fetched;
                inner.state = LoadState::Loaded {
                    has_more: fetched == inner.cursor.page_size && inner.cursor.has_more(),
                };
                inner.last_commit_seq = seq;
                duplicates
            }
        };
        release_entries(&self.registry, evicted);
    }

    fn commit_error(&self, token: &InstanceToken, seq: u64, message: String) {
        let mut inner = self.lock_inner();
        Self::finish_attempt(&mut inner, seq);
        if self.should_discard(&inner, token, seq) {
            return;
        }
        tracing::warn!(seq, %message, "collection fetch failed");
        inner.error = Some(message.clone());
        inner.state = LoadState::Error(message);
    }

    fn commit_locked(&self, token: &InstanceToken, seq: u64) {
        let mut inner = self.lock_inner();
        Self::finish_attempt(&mut inner, seq);
        if self.should_discard(&inner, token, seq) {
            return;
        }
        inner.state = LoadState::Locked;
    }

    fn should_discard(&self, inner: &LoaderInner<R>, token: &InstanceToken, seq: u64) -> bool {
        if self.guard.is_stale(token) {
            tracing::debug!(seq, "discarding result from a stale instance");
            return true;
        }
        if seq <= inner.last_commit_seq {
            tracing::debug!(seq, "discarding result superseded by a fresher commit");
            return true;
        }
        false
    }

    fn finish_attempt(inner: &mut LoaderInner<R>, seq: u64) {
        if inner.inflight_seq == Some(seq) {
            inner.inflight_seq = None;
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, LoaderInner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn dedup_by_key<R: ViewRecord>(entries: Vec<LoadedEntry<R>>) -> (Vec<LoadedEntry<R>>, Vec<LoadedEntry<R>>) {
    let mut known = HashSet::new();
    let mut accepted = Vec::with_capacity(entries.len());
    let mut duplicates = Vec::new();
    for entry in entries {
        if known.insert(entry.record.key().to_string()) {
            accepted.push(entry);
        } else {
            duplicates.push(entry);
        }
    }
    (accepted, duplicates)
}

fn release_entries<R>(registry: &ResourceRegistry, entries: Vec<LoadedEntry<R>>) {
    for entry in entries {
        if let Some(handle) = entry.asset {
            registry.release(handle);
        }
    }
}
