use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::category::{StateCategory, UpdateSource};

/// Callback invoked with `(value, source, category)` for every accepted update
pub type StateListener = Arc<dyn Fn(&serde_json::Value, UpdateSource, StateCategory) + Send + Sync>;

type ListenerMap = DashMap<u64, (StateCategory, StateListener)>;

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Arc<ListenerMap>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, category: StateCategory, listener: StateListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, (category, listener));
        ListenerHandle {
            id,
            category,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn count(&self, category: StateCategory) -> usize {
        self.listeners
            .iter()
            .filter(|e| e.value().0 == category)
            .count()
    }

    /// Call every listener of `category`. Callbacks run without any map
    /// guard held, so they may add or remove listeners.
    pub fn notify(&self, category: StateCategory, value: &serde_json::Value, source: UpdateSource) {
        let targets: Vec<StateListener> = self
            .listeners
            .iter()
            .filter(|e| e.value().0 == category)
            .map(|e| e.value().1.clone())
            .collect();

        for listener in targets {
            listener(value, source, category);
        }
    }
}

/// Returned by `add_state_listener`; call [`ListenerHandle::remove`] to unsubscribe
pub struct ListenerHandle {
    id: u64,
    category: StateCategory,
    listeners: std::sync::Weak<ListenerMap>,
}

impl ListenerHandle {
    pub fn category(&self) -> StateCategory {
        self.category
    }

    pub fn remove(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_notify_only_matching_category_and_remove() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = registry.add(
            StateCategory::Balance,
            Arc::new(move |v, source, _| {
                sink.lock().unwrap().push((v.clone(), source));
            }),
        );
        registry.add(StateCategory::Alerts, Arc::new(|_, _, _| panic!("wrong category")));

        registry.notify(StateCategory::Balance, &serde_json::json!(1), UpdateSource::LocalUpdate);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(registry.count(StateCategory::Balance), 1);

        handle.remove();
        registry.notify(StateCategory::Balance, &serde_json::json!(2), UpdateSource::LocalUpdate);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(registry.count(StateCategory::Balance), 0);
    }
}
