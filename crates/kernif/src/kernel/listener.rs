//! Listener registry and event delivery.
//!
//! Listeners are invoked synchronously on the fan-out task, in registration
//! order, and must return quickly. Once [`ListenerRegistry::unregister`]
//! returns, the listener never sees another event; if a delivery to it is
//! in progress on another thread, unregistering waits for it to finish.
//! A listener may unregister itself from inside one of its callbacks.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::error;

use super::events::{
    AcquireEvent, AddressEvent, ExpireEvent, InterfaceEvent, KernelEvent, MappingEvent,
    MigrateEvent,
};

/// Consumer of kernel events. Every callback defaults to a no-op.
pub trait KernelListener: Send + Sync {
    /// An SA expired.
    fn expire(&self, _event: &ExpireEvent) {}

    /// An SA is needed for a policy with a reqid.
    fn acquire(&self, _event: &AcquireEvent) {}

    /// An SA is needed for a policy without a reqid.
    fn policy_acquire(&self, _event: &AcquireEvent) {}

    /// An interface came up.
    fn interface_up(&self, _event: &InterfaceEvent) {}

    /// An interface went down or disappeared.
    fn interface_down(&self, _event: &InterfaceEvent) {}

    /// An address was added.
    fn address_added(&self, _event: &AddressEvent) {}

    /// An address was removed.
    fn address_removed(&self, _event: &AddressEvent) {}

    /// SAs should move to new endpoints.
    fn migrate(&self, _event: &MigrateEvent) {}

    /// A NAT mapping changed.
    fn mapping(&self, _event: &MappingEvent) {}
}

fn invoke(listener: &dyn KernelListener, event: &KernelEvent) {
    match event {
        KernelEvent::SaExpired(e) => listener.expire(e),
        KernelEvent::SaAcquire(e) => listener.acquire(e),
        KernelEvent::PolicyAcquire(e) => listener.policy_acquire(e),
        KernelEvent::InterfaceUp(e) => listener.interface_up(e),
        KernelEvent::InterfaceDown(e) => listener.interface_down(e),
        KernelEvent::AddressAdded(e) => listener.address_added(e),
        KernelEvent::AddressRemoved(e) => listener.address_removed(e),
        KernelEvent::RouteMigrate(e) => listener.migrate(e),
        KernelEvent::Mapping(e) => listener.mapping(e),
    }
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

struct Slot {
    id: ListenerId,
    listener: Arc<dyn KernelListener>,
    active: AtomicBool,
    // held for the duration of one delivery
    delivery: Mutex<()>,
}

thread_local! {
    static DELIVERING: Cell<Option<ListenerId>> = const { Cell::new(None) };
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

/// Thread-safe set of listeners.
pub struct ListenerRegistry {
    slots: RwLock<Arc<Vec<Arc<Slot>>>>,
    next_id: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a listener. It receives every event dispatched from now on.
    pub fn register(&self, listener: Arc<dyn KernelListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot {
            id,
            listener,
            active: AtomicBool::new(true),
            delivery: Mutex::new(()),
        });

        let mut guard = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(slot);
        *guard = Arc::new(next);
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let slot = {
            let mut guard = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let Some(pos) = guard.iter().position(|s| s.id == id) else {
                return false;
            };
            let mut next: Vec<_> = guard.iter().cloned().collect();
            let slot = next.remove(pos);
            *guard = Arc::new(next);
            slot
        };

        slot.active.store(false, Ordering::Release);

        // From inside our own callback the delivery lock is held by this
        // very thread; the inactive flag already stops later deliveries.
        if DELIVERING.with(|d| d.get()) != Some(id) {
            drop(slot.delivery.lock().unwrap_or_else(PoisonError::into_inner));
        }
        true
    }

    /// Remove every listener.
    pub fn clear(&self) {
        let ids: Vec<ListenerId> = self.snapshot().iter().map(|s| s.id).collect();
        for id in ids {
            self.unregister(id);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener in registration order.
    pub fn deliver(&self, event: &KernelEvent) {
        for slot in self.snapshot().iter() {
            let _guard = slot.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }

            let previous = DELIVERING.with(|d| d.replace(Some(slot.id)));
            let result = catch_unwind(AssertUnwindSafe(|| invoke(&*slot.listener, event)));
            DELIVERING.with(|d| d.set(previous));

            if let Err(payload) = result {
                error!(
                    listener = %slot.id,
                    "listener panicked handling {}: {}",
                    event.name(),
                    panic_message(&*payload)
                );
            }
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Slot>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
