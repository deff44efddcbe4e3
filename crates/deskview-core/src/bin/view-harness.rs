//! Drives a `CollectionLoader` projection from the terminal: an in-memory
//! store stands in for the persistence layer and the visible range is
//! advanced as if a virtualized list were being scrolled. Demonstrates that
//! the `{items, status, error}` projection needs nothing from a GUI.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deskview_core::{
    ActiveInstance, BlobError, BlobRetriever, CollectionLoader, KeyProvider, LoaderConfig,
    MutationCoordinator, RecordPatch, RecordQuery, RecordStore, ResourceRegistry, StoreError,
    ViewRecord, ViewportWindow,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
struct HarnessArgs {
    rows: usize,
    page_size: usize,
    label: String,
}

fn parse_args(args: &[String]) -> Result<HarnessArgs, String> {
    let mut rows: usize = 120;
    let mut page_size: usize = 25;
    let mut label = "file".to_string();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rows" => {
                let value = iter.next().ok_or_else(|| "Missing --rows value".to_string())?;
                rows = value.parse().map_err(|err| format!("Invalid --rows: {err}"))?;
            }
            "--page-size" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "Missing --page-size value".to_string())?;
                page_size = value
                    .parse()
                    .map_err(|err| format!("Invalid --page-size: {err}"))?;
                if page_size == 0 {
                    return Err("--page-size must be at least 1".to_string());
                }
            }
            "--label" => {
                let value = iter.next().ok_or_else(|| "Missing --label value".to_string())?;
                label = value.to_string();
            }
            "--help" | "-h" => {
                return Err(String::new());
            }
            _ => return Err(format!("Unknown argument: {arg}")),
        }
    }

    Ok(HarnessArgs {
        rows,
        page_size,
        label,
    })
}

#[derive(Debug, Clone)]
struct DemoRecord {
    id: String,
    name: String,
    size: u64,
    modified: DateTime<Utc>,
    thumb: Option<String>,
    deleted: bool,
}

impl ViewRecord for DemoRecord {
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

/// Keyspace-per-instance store; the query path reads whichever keyspace is
/// active at call time, like the real per-instance database would.
struct MemoryStore {
    instance: Arc<ActiveInstance>,
    keyspaces: Mutex<HashMap<String, Vec<DemoRecord>>>,
}

impl MemoryStore {
    fn new(instance: Arc<ActiveInstance>) -> Self {
        Self {
            instance,
            keyspaces: Mutex::new(HashMap::new()),
        }
    }

    fn seed(&self, instance_id: &str, rows: Vec<DemoRecord>) {
        self.lock_keyspaces().insert(instance_id.to_string(), rows);
    }

    fn active_rows(&self, filter: Option<&str>) -> Vec<DemoRecord> {
        let Some(active) = self.instance.current() else {
            return Vec::new();
        };
        let keyspaces = self.lock_keyspaces();
        let rows = keyspaces.get(&active).cloned().unwrap_or_default();
        match filter {
            Some(needle) => rows
                .into_iter()
                .filter(|row| row.name.contains(needle))
                .collect(),
            None => rows,
        }
    }

    fn lock_keyspaces(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<DemoRecord>>> {
        self.keyspaces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore<DemoRecord> for MemoryStore {
    async fn query(&self, query: &RecordQuery) -> Result<Vec<DemoRecord>, StoreError> {
        let mut rows = self.active_rows(query.filter.as_deref());
        match query.order_by.as_str() {
            "name" => rows.sort_by(|a, b| a.name.cmp(&b.name)),
            _ => rows.sort_by_key(|row| row.modified),
        }
        if query.descending {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count(&self, filter: Option<&str>) -> Result<usize, StoreError> {
        Ok(self.active_rows(filter).len())
    }

    async fn mutate(&self, key: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        let Some(active) = self.instance.current() else {
            return Err(StoreError::Unavailable("no active instance".to_string()));
        };
        let mut keyspaces = self.lock_keyspaces();
        let rows = keyspaces
            .get_mut(&active)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown keyspace {active}")))?;
        let row = rows
            .iter_mut()
            .find(|row| row.id == key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        row.apply_patch(patch);
        Ok(())
    }
}

struct UnlockedKeys;

#[async_trait]
impl KeyProvider for UnlockedKeys {
    async fn current_key(&self) -> Option<Vec<u8>> {
        Some(vec![0u8; 32])
    }
}

struct SyntheticBlobs;

#[async_trait]
impl BlobRetriever for SyntheticBlobs {
    async fn retrieve(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        Ok(path.as_bytes().to_vec())
    }
}

fn seed_rows(count: usize, prefix: &str) -> Vec<DemoRecord> {
    let base = Utc::now();
    (0..count)
        .map(|index| DemoRecord {
            id: format!("{prefix}-{index:04}"),
            name: format!("{prefix} {index:04}.md"),
            size: 512 + (index as u64) * 37,
            modified: base - Duration::minutes(index as i64),
            thumb: (index % 3 == 0).then(|| format!("thumbs/{prefix}-{index:04}.png")),
            deleted: false,
        })
        .collect()
}

fn print_table(loader: &CollectionLoader<DemoRecord>, limit: usize) {
    let snapshot = loader.snapshot();
    println!(
        "{:<14} {:<22} {:>8}  {:<20} {:<7} {}",
        "id", "name", "size", "modified", "deleted", "asset"
    );
    for item in snapshot.items.iter().take(limit) {
        println!(
            "{:<14} {:<22} {:>8}  {:<20} {:<7} {}",
            item.record.id,
            item.record.name,
            item.record.size,
            item.record.modified.format("%Y-%m-%d %H:%M:%S"),
            item.record.deleted,
            item.asset_uri.as_deref().unwrap_or("-")
        );
    }
    if snapshot.items.len() > limit {
        println!("... {} more loaded", snapshot.items.len() - limit);
    }
}

async fn run(args: HarnessArgs) {
    let instance = Arc::new(ActiveInstance::with_active("personal"));
    let store = Arc::new(MemoryStore::new(instance.clone()));
    store.seed("personal", seed_rows(args.rows, "note"));
    store.seed("work", seed_rows(3, "doc"));

    let registry = Arc::new(ResourceRegistry::new());
    let config = LoaderConfig {
        order_by: "name".to_string(),
        descending: false,
        page_size: args.page_size,
        ..LoaderConfig::default()
    };
    let loader = CollectionLoader::new(
        store.clone(),
        Arc::new(UnlockedKeys),
        Arc::new(SyntheticBlobs),
        registry.clone(),
        instance.clone(),
        config,
    );
    loader.watch_instance();

    let mut viewport = ViewportWindow::new(args.label.clone());
    loader.refresh().await;

    // Scroll to the bottom one window at a time, paginating whenever the
    // window nears the loaded boundary.
    loop {
        let snapshot = loader.snapshot();
        if snapshot.loaded_count() > 0 {
            let last = snapshot.loaded_count() - 1;
            let first = last.saturating_sub(args.page_size.saturating_sub(1));
            viewport.on_visible_range_changed(first, last);
        }
        println!(
            "[{}] {}",
            snapshot.status,
            viewport.status_text(snapshot.loaded_count(), snapshot.total_count)
        );
        if viewport.should_load_more(snapshot.loaded_count(), snapshot.has_more, snapshot.in_flight)
        {
            loader.paginate().await;
        } else {
            break;
        }
    }
    print_table(&loader, 10);
    println!("live assets: {}", registry.live_count());

    if let Some(first) = loader.snapshot().items.first().map(|item| item.record.id.clone()) {
        let coordinator = MutationCoordinator::new(loader.clone());
        match coordinator.apply(&first, RecordPatch::SoftDelete).await {
            Ok(()) => println!("soft-deleted {first} (no refetch issued)"),
            Err(err) => eprintln!("mutation failed: {err}"),
        }
    }

    println!("switching instance: personal -> work");
    instance.switch("work");
    loader.refresh().await;

    let snapshot = loader.snapshot();
    let mut viewport = ViewportWindow::new(args.label);
    if snapshot.loaded_count() > 0 {
        viewport.on_visible_range_changed(0, snapshot.loaded_count() - 1);
    }
    println!(
        "[{}] {}",
        snapshot.status,
        viewport.status_text(snapshot.loaded_count(), snapshot.total_count)
    );
    print_table(&loader, 10);
    println!("live assets: {}", registry.live_count());
}

fn main() {
    let args = std::env::args().collect::<Vec<_>>();
    let parsed = match parse_args(&args) {
        Ok(value) => value,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{message}");
            }
            eprintln!("Usage: view-harness [--rows <n>] [--page-size <n>] [--label <noun>]");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create runtime: {err}");
            std::process::exit(1);
        }
    };
    runtime.block_on(run(parsed));
}
