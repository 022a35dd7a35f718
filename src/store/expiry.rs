//! Expired-data sweeper.
//!
//! Periodically polls registered stores and deletes entries whose expiry
//! tag (a Unix timestamp) has passed. Stores register with an optional
//! handler that is told which keys are about to be removed, so dependent
//! state can be cleaned up first.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::{Operation, Store, StoreError};

const TASK_NAME: &str = "data-expiry";

/// Schedules recurring background tasks.
pub trait TaskManager {
    fn register_task(&self, name: &str, interval: Duration, task: Arc<dyn Fn() + Send + Sync>);
}

/// Task manager that runs each task on a tokio interval.
#[derive(Default)]
pub struct TokioTaskManager;

impl TaskManager for TokioTaskManager {
    fn register_task(&self, name: &str, interval: Duration, task: Arc<dyn Fn() + Send + Sync>) {
        let name = name.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so tasks run after
            // one full interval like any other round.
            ticker.tick().await;

            info!(task = %name, interval_ms = %interval.as_millis(), "scheduled task");

            loop {
                ticker.tick().await;
                task();
            }
        });
    }
}

/// Told which keys are about to be deleted.
pub trait ExpiryHandler: Send + Sync {
    fn handle_expired_keys(&self, keys: &[String]) -> Result<(), StoreError>;
}

struct NoopExpiryHandler;

impl ExpiryHandler for NoopExpiryHandler {
    fn handle_expired_keys(&self, _keys: &[String]) -> Result<(), StoreError> {
        Ok(())
    }
}

struct RegisteredStore {
    store: Arc<dyn Store>,
    name: String,
    expiry_tag: String,
    handler: Arc<dyn ExpiryHandler>,
}

/// Periodically removes expired data from registered stores.
pub struct Service {
    stores: Arc<RwLock<Vec<RegisteredStore>>>,
}

impl Service {
    /// Create the service and schedule its sweep with the task manager.
    pub fn new(scheduler: &dyn TaskManager, interval: Duration) -> Self {
        let stores: Arc<RwLock<Vec<RegisteredStore>>> = Arc::new(RwLock::new(Vec::new()));

        let sweep_stores = Arc::clone(&stores);
        scheduler.register_task(
            TASK_NAME,
            interval,
            Arc::new(move || sweep(&sweep_stores)),
        );

        Self { stores }
    }

    /// Register a store for expiry sweeps.
    ///
    /// `expiry_tag` is the tag holding the entry's expiry time as a Unix
    /// timestamp; `name` identifies the store in logs.
    pub fn register(&self, store: Arc<dyn Store>, expiry_tag: &str, name: &str) {
        self.register_with_handler(store, expiry_tag, name, Arc::new(NoopExpiryHandler));
    }

    /// Register a store with a handler invoked before deletion.
    pub fn register_with_handler(
        &self,
        store: Arc<dyn Store>,
        expiry_tag: &str,
        name: &str,
        handler: Arc<dyn ExpiryHandler>,
    ) {
        let mut stores = self.stores.write().expect("stores lock");

        stores.push(RegisteredStore {
            store,
            name: name.to_string(),
            expiry_tag: expiry_tag.to_string(),
            handler,
        });

        debug!(store = %name, tag = %expiry_tag, "registered store for expiry sweeps");
    }

    /// Run one sweep immediately.
    pub fn sweep_now(&self) {
        sweep(&self.stores);
    }
}

fn sweep(stores: &Arc<RwLock<Vec<RegisteredStore>>>) {
    let stores = stores.read().expect("stores lock");

    for registered in stores.iter() {
        if let Err(e) = registered.delete_expired_data() {
            warn!(store = %registered.name, error = %e, "error deleting expired data");
        }
    }
}

impl RegisteredStore {
    fn delete_expired_data(&self) -> Result<(), StoreError> {
        debug!(store = %self.name, "checking for expired data");

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let iterator = self.store.query(&format!("{}<={}", self.expiry_tag, now))?;

        let keys: Vec<String> = iterator.collect::<Result<_, _>>()?;

        debug!(store = %self.name, total = keys.len(), "found expired data to delete");

        // The handler observes every sweep, even when nothing expired.
        self.handler.handle_expired_keys(&keys)?;

        if !keys.is_empty() {
            let operations: Vec<Operation> = keys
                .into_iter()
                .map(|key| Operation { key })
                .collect();

            self.store.batch(&operations)?;

            debug!(store = %self.name, total = operations.len(), "deleted expired data");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::super::MemStore;
    use super::*;

    /// Task manager that only records registrations; tests drive sweeps
    /// directly.
    #[derive(Default)]
    struct ManualTaskManager {
        registered: AtomicUsize,
    }

    impl TaskManager for ManualTaskManager {
        fn register_task(
            &self,
            _name: &str,
            _interval: Duration,
            _task: Arc<dyn Fn() + Send + Sync>,
        ) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn sweep_deletes_only_expired_entries() {
        let scheduler = ManualTaskManager::default();
        let service = Service::new(&scheduler, Duration::from_secs(60));
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 1);

        let store = Arc::new(MemStore::new());
        store.put("expired", &[("expires", unix_now() - 10)]);
        store.put("live", &[("expires", unix_now() + 3600)]);
        store.put("untagged", &[("other", 1)]);

        service.register(Arc::clone(&store) as Arc<dyn Store>, "expires", "test-store");

        service.sweep_now();

        assert!(!store.contains("expired"));
        assert!(store.contains("live"));
        assert!(store.contains("untagged"));
    }

    #[test]
    fn handler_sees_keys_before_deletion() {
        struct RecordingHandler {
            keys: Mutex<Vec<String>>,
        }

        impl ExpiryHandler for RecordingHandler {
            fn handle_expired_keys(&self, keys: &[String]) -> Result<(), StoreError> {
                self.keys.lock().unwrap().extend_from_slice(keys);
                Ok(())
            }
        }

        let scheduler = ManualTaskManager::default();
        let service = Service::new(&scheduler, Duration::from_secs(60));

        let store = Arc::new(MemStore::new());
        store.put("expired", &[("expires", unix_now() - 10)]);

        let handler = Arc::new(RecordingHandler {
            keys: Mutex::new(Vec::new()),
        });

        service.register_with_handler(
            Arc::clone(&store) as Arc<dyn Store>,
            "expires",
            "test-store",
            Arc::clone(&handler) as Arc<dyn ExpiryHandler>,
        );

        service.sweep_now();

        assert_eq!(*handler.keys.lock().unwrap(), vec!["expired".to_string()]);
        assert!(!store.contains("expired"));
    }

    #[test]
    fn handler_runs_on_empty_sweep() {
        struct CountingHandler {
            calls: AtomicUsize,
        }

        impl ExpiryHandler for CountingHandler {
            fn handle_expired_keys(&self, keys: &[String]) -> Result<(), StoreError> {
                assert!(keys.is_empty());
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let scheduler = ManualTaskManager::default();
        let service = Service::new(&scheduler, Duration::from_secs(60));

        let store = Arc::new(MemStore::new());
        store.put("live", &[("expires", unix_now() + 3600)]);

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });

        service.register_with_handler(
            Arc::clone(&store) as Arc<dyn Store>,
            "expires",
            "test-store",
            Arc::clone(&handler) as Arc<dyn ExpiryHandler>,
        );

        service.sweep_now();
        service.sweep_now();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(store.contains("live"));
    }

    #[test]
    fn handler_error_keeps_data() {
        struct FailingHandler;

        impl ExpiryHandler for FailingHandler {
            fn handle_expired_keys(&self, _keys: &[String]) -> Result<(), StoreError> {
                Err(StoreError::Store("injected handler error".to_string()))
            }
        }

        let scheduler = ManualTaskManager::default();
        let service = Service::new(&scheduler, Duration::from_secs(60));

        let store = Arc::new(MemStore::new());
        store.put("expired", &[("expires", unix_now() - 10)]);

        service.register_with_handler(
            Arc::clone(&store) as Arc<dyn Store>,
            "expires",
            "test-store",
            Arc::new(FailingHandler),
        );

        // The sweep logs the failure and leaves the entry for next round.
        service.sweep_now();

        assert!(store.contains("expired"));
    }

    #[test]
    fn sweep_continues_past_failing_store() {
        struct BrokenStore;

        impl Store for BrokenStore {
            fn query(&self, _expression: &str) -> Result<super::super::KeyIterator, StoreError> {
                Err(StoreError::Store("injected query error".to_string()))
            }

            fn batch(&self, _operations: &[Operation]) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let scheduler = ManualTaskManager::default();
        let service = Service::new(&scheduler, Duration::from_secs(60));

        let healthy = Arc::new(MemStore::new());
        healthy.put("expired", &[("expires", unix_now() - 10)]);

        service.register(Arc::new(BrokenStore), "expires", "broken-store");
        service.register(Arc::clone(&healthy) as Arc<dyn Store>, "expires", "healthy-store");

        service.sweep_now();

        assert!(!healthy.contains("expired"));
    }
}
