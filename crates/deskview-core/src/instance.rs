use std::sync::{Arc, Mutex, PoisonError};

type ChangeCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

#[derive(Default)]
struct InstanceInner {
    current: Option<String>,
    generation: u64,
}

/// The currently active logical database/keyspace, observed by the core.
///
/// Exactly one instance is active at a time. Switching bumps a monotonic
/// generation counter and invokes subscribers synchronously, before any
/// fetch for the new instance can begin. The core never mutates the active
/// instance itself; the surrounding session layer calls `switch`.
#[derive(Default)]
pub struct ActiveInstance {
    inner: Mutex<InstanceInner>,
    subscribers: Mutex<Vec<ChangeCallback>>,
}

impl ActiveInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active(id: impl Into<String>) -> Self {
        let instance = Self::new();
        instance.switch(id);
        instance
    }

    pub fn current(&self) -> Option<String> {
        self.lock_inner().current.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock_inner().generation
    }

    /// Makes `id` the active instance. Subscribers run before `switch`
    /// returns, so in-flight work scoped to the previous instance is
    /// invalidated before any caller can start a fetch against the new one.
    pub fn switch(&self, id: impl Into<String>) {
        let current = {
            let mut inner = self.lock_inner();
            inner.generation += 1;
            inner.current = Some(id.into());
            inner.current.clone()
        };
        tracing::debug!(instance = current.as_deref(), "instance switched");

        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber(current.as_deref());
        }
    }

    pub fn subscribe(&self, callback: impl Fn(Option<&str>) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, InstanceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Generation captured at the start of an asynchronous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceToken {
    generation: u64,
}

/// Detects whether the active instance changed between the start and a
/// commit point of an asynchronous operation.
///
/// Aborting the underlying calls is not enough here: a fetch chains several
/// independent awaits (count, query, key check, per-record blob retrieval),
/// so the guard is re-checked at every commit point rather than once.
#[derive(Clone)]
pub struct StaleGuard {
    instance: Arc<ActiveInstance>,
}

impl StaleGuard {
    pub fn new(instance: Arc<ActiveInstance>) -> Self {
        Self { instance }
    }

    pub fn begin(&self) -> InstanceToken {
        InstanceToken {
            generation: self.instance.generation(),
        }
    }

    pub fn is_stale(&self, token: &InstanceToken) -> bool {
        token.generation != self.instance.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn switch_updates_current_and_generation() {
        let instance = ActiveInstance::new();
        assert_eq!(instance.current(), None);
        assert_eq!(instance.generation(), 0);

        instance.switch("personal");
        assert_eq!(instance.current().as_deref(), Some("personal"));
        assert_eq!(instance.generation(), 1);

        instance.switch("work");
        assert_eq!(instance.current().as_deref(), Some("work"));
        assert_eq!(instance.generation(), 2);
    }

    #[test]
    fn token_goes_stale_after_a_switch() {
        let instance = Arc::new(ActiveInstance::with_active("personal"));
        let guard = StaleGuard::new(instance.clone());

        let token = guard.begin();
        assert!(!guard.is_stale(&token));

        instance.switch("work");
        assert!(guard.is_stale(&token));

        let fresh = guard.begin();
        assert!(!guard.is_stale(&fresh));
    }

    #[test]
    fn switching_back_to_the_same_id_still_invalidates() {
        let instance = Arc::new(ActiveInstance::with_active("personal"));
        let guard = StaleGuard::new(instance.clone());

        let token = guard.begin();
        instance.switch("personal");
        assert!(guard.is_stale(&token));
    }

    #[test]
    fn subscribers_run_synchronously_on_switch() {
        let instance = ActiveInstance::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let calls_sub = calls.clone();
        let seen_sub = seen.clone();
        instance.subscribe(move |id| {
            calls_sub.fetch_add(1, Ordering::SeqCst);
            seen_sub
                .lock()
                .expect("seen lock")
                .push(id.map(str::to_string));
        });

        instance.switch("personal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            seen.lock().expect("seen lock").as_slice(),
            &[Some("personal".to_string())]
        );
    }
}
