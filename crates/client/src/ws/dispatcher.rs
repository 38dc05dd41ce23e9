//! Typed publish/subscribe registry.
//!
//! A [`Dispatcher`] is pure fan-out: it keeps handlers in registration order,
//! filters them by event kind, and invokes every match. A panicking handler is
//! logged and skipped; the remaining handlers still see the event.
//!
//! Handlers run outside the registry lock, so a handler may subscribe or
//! unsubscribe (itself included) while being dispatched. The set of handlers
//! for one `emit` is fixed when the emit starts.

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tableside_shared::{EventKind, SessionEvent};

/// Something a [`Dispatcher`] can route by kind.
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

impl Event for SessionEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        SessionEvent::kind(self)
    }
}

/// Ids grow with registration order, so comparing two ids tells which
/// subscription came first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E: Event> {
    id: SubscriptionId,
    /// `None` matches every kind.
    kind: Option<E::Kind>,
    handler: Handler<E>,
}

struct Registry<E: Event> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

pub struct Dispatcher<E: Event> {
    registry: Mutex<Registry<E>>,
}

impl<E: Event> Dispatcher<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for events of `kind`.
    pub fn on(
        self: &Arc<Self>,
        kind: E::Kind,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event regardless of kind.
    pub fn on_any(self: &Arc<Self>, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        self.insert(None, Arc::new(handler))
    }

    fn insert(self: &Arc<Self>, kind: Option<E::Kind>, handler: Handler<E>) -> Subscription {
        let id = {
            let mut registry = self.lock();
            let id = SubscriptionId(registry.next_id);
            registry.next_id += 1;
            registry.entries.push(Entry { id, kind, handler });
            id
        };
        let weak = Arc::downgrade(self);
        let owner: Weak<dyn Detach> = weak;
        Subscription {
            id,
            owner: Some(owner),
        }
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        registry.entries.len() != before
    }

    /// Deliver `event` to every matching handler in registration order.
    /// Returns the number of handlers invoked.
    pub fn emit(&self, event: &E) -> usize {
        self.dispatch(event).0
    }

    /// Like [`emit`](Self::emit), but returns the first id that did not see
    /// the event: every subscription below it was registered in time.
    pub fn emit_marked(&self, event: &E) -> SubscriptionId {
        self.dispatch(event).1
    }

    fn dispatch(&self, event: &E) -> (usize, SubscriptionId) {
        let kind = event.kind();
        let (handlers, mark) = {
            let registry = self.lock();
            let handlers: Vec<Handler<E>> = registry
                .entries
                .iter()
                .filter(|entry| entry.kind.map_or(true, |k| k == kind))
                .map(|entry| entry.handler.clone())
                .collect();
            (handlers, SubscriptionId(registry.next_id))
        };

        for handler in &handlers {
            invoke(handler, event);
        }
        (handlers.len(), mark)
    }

    /// Deliver `event` to one subscription only, if it is still registered
    /// and its kind matches.
    pub fn emit_to(&self, id: SubscriptionId, event: &E) -> bool {
        let kind = event.kind();
        let handler = self
            .lock()
            .entries
            .iter()
            .find(|entry| entry.id == id && entry.kind.map_or(true, |k| k == kind))
            .map(|entry| entry.handler.clone());
        match handler {
            Some(handler) => {
                invoke(&handler, event);
                true
            }
            None => false,
        }
    }

    /// Detach every handler.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn invoke<E: Event>(handler: &Handler<E>, event: &E) {
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        crate::log_error!(
            "handler for {:?} panicked; continuing with the rest",
            event.kind()
        );
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: SubscriptionId) -> bool;
}

impl<E: Event> Detach for Dispatcher<E> {
    fn detach(&self, id: SubscriptionId) -> bool {
        self.off(id)
    }
}

/// Scoped registration returned by [`Dispatcher::on`].
///
/// Dropping it detaches the handler. Detaching is idempotent and a no-op once
/// the dispatcher itself is gone.
#[must_use = "dropping a Subscription detaches its handler immediately"]
pub struct Subscription {
    id: SubscriptionId,
    owner: Option<Weak<dyn Detach>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Detach now. Returns `true` if the handler was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.detach()
    }

    /// Leave the handler registered for as long as the dispatcher lives.
    pub fn keep(mut self) {
        self.owner = None;
    }

    fn detach(&mut self) -> bool {
        self.owner
            .take()
            .and_then(|owner| owner.upgrade())
            .is_some_and(|owner| owner.detach(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.owner.is_some())
            .finish()
    }
}
