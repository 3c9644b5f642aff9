// Change notification for league membership and the active league.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::error;

use crate::model::LeagueId;

/// Structured change event delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// The active league switched (either side may be "no league").
    ActiveLeagueChanged {
        new_league_id: Option<LeagueId>,
        previous_league_id: Option<LeagueId>,
    },
    /// Leagues were loaded, added or removed.
    LeagueListChanged {
        league_count: usize,
        active_league_id: Option<LeagueId>,
    },
}

type Listener = Arc<dyn Fn(&ContextEvent) + Send + Sync>;

/// Registered listeners, invoked synchronously in subscription order.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ListenerRegistry::default())
    }

    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&ContextEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(self),
            attached: true,
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener. A panicking listener is logged and
    /// skipped; the rest still run. Returns how many listeners completed.
    pub fn emit(&self, event: &ContextEvent) -> usize {
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let snapshot: Vec<(u64, Listener)> = self.listeners().clone();
        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(listener_id = id, ?event, "league change listener panicked"),
            }
        }
        delivered
    }

    pub fn emit_all(&self, events: &[ContextEvent]) {
        for event in events {
            self.emit(event);
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes the listener.
#[must_use = "dropping a Subscription immediately unsubscribes its listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
    attached: bool,
}

impl Subscription {
    /// Remove the listener now. Returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.detach_from_registry()
    }

    /// Keep the listener registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.attached = false;
    }

    fn detach_from_registry(&mut self) -> bool {
        if !self.attached {
            return false;
        }
        self.attached = false;
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_from_registry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn list_changed(count: usize) -> ContextEvent {
        ContextEvent::LeagueListChanged {
            league_count: count,
            active_league_id: None,
        }
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = registry.subscribe(|_| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        let _good = registry.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.emit(&list_changed(1)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_and_drop_remove_listener() {
        let registry = ListenerRegistry::new();
        let a = registry.subscribe(|_| {});
        let b = registry.subscribe(|_| {});
        assert_eq!(registry.len(), 2);

        assert!(a.unsubscribe());
        assert_eq!(registry.len(), 1);

        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn detached_listener_stays_registered() {
        let registry = ListenerRegistry::new();
        registry.subscribe(|_| {}).detach();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.emit(&list_changed(0)), 1);
    }
}
