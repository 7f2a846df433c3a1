//! Batch lifecycle observers.

use super::types::{BatchGroup, BatchResult};
use crate::Error;
use std::sync::{Arc, PoisonError, RwLock};

/// Notified by the scheduler as batches move through a cycle.
///
/// Called synchronously on the scheduler task, one event at a time, never
/// while the store is being mutated. Keep implementations fast.
pub trait BatchObserver: Send + Sync {
    fn on_batch_ready(&self, _group: &BatchGroup) {}
    fn on_batch_complete(&self, _result: &BatchResult) {}
    fn on_batch_failed(&self, _group: &BatchGroup, _error: &Error) {}
}

struct Registration {
    name: String,
    observer: Arc<dyn BatchObserver>,
}

#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Registration>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, observer: Arc<dyn BatchObserver>) {
        let name = name.into();
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|r| r.name != name);
        observers.push(Registration { name, observer });
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let len = observers.len();
        observers.retain(|r| r.name != name);
        observers.len() < len
    }

    pub fn count(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // Snapshot so observers can (un)register from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn BatchObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| Arc::clone(&r.observer))
            .collect()
    }

    pub fn batch_ready(&self, group: &BatchGroup) {
        for o in self.snapshot() {
            o.on_batch_ready(group);
        }
    }

    pub fn batch_complete(&self, result: &BatchResult) {
        for o in self.snapshot() {
            o.on_batch_complete(result);
        }
    }

    pub fn batch_failed(&self, group: &BatchGroup, error: &Error) {
        for o in self.snapshot() {
            o.on_batch_failed(group, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::aggregator;
    use crate::batch::types::PendingRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        ready: AtomicUsize,
        complete: AtomicUsize,
        failed: AtomicUsize,
    }

    impl BatchObserver for Counter {
        fn on_batch_ready(&self, _: &BatchGroup) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
        fn on_batch_complete(&self, _: &BatchResult) {
            self.complete.fetch_add(1, Ordering::SeqCst);
        }
        fn on_batch_failed(&self, _: &BatchGroup, _: &Error) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_notify_unregister() {
        let registry = ObserverRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.register("counter", counter.clone());
        registry.register("counter", counter.clone());
        assert_eq!(registry.count(), 1);

        let group = aggregator::group(vec![PendingRequest::new("p")], 5, 0.6).remove(0);
        registry.batch_ready(&group);
        registry.batch_complete(&BatchResult::new(group.id.clone()));
        registry.batch_failed(&group, &Error::execution("boom"));
        assert_eq!(counter.ready.load(Ordering::SeqCst), 1);
        assert_eq!(counter.complete.load(Ordering::SeqCst), 1);
        assert_eq!(counter.failed.load(Ordering::SeqCst), 1);

        assert!(registry.unregister("counter"));
        assert!(!registry.unregister("counter"));
        registry.batch_ready(&group);
        assert_eq!(counter.ready.load(Ordering::SeqCst), 1);
    }
}
