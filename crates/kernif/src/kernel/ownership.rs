//! Ledger of state installed through this dispatcher.
//!
//! Entries are tracked by value. Only what this instance created is
//! recorded; pre-existing system state is never removed at shutdown.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use super::types::{AddressEntry, PolicyKey, RouteEntry};

#[derive(Default)]
struct Owned {
    routes: HashSet<RouteEntry>,
    addresses: HashSet<AddressEntry>,
    policies: HashSet<PolicyKey>,
}

/// Everything drained from the ledger at shutdown.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub routes: Vec<RouteEntry>,
    pub addresses: Vec<AddressEntry>,
    pub policies: Vec<PolicyKey>,
}

#[derive(Default)]
pub(crate) struct OwnedResources {
    inner: Mutex<Owned>,
}

impl OwnedResources {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Owned) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn record_route(&self, route: RouteEntry) {
        self.with(|o| o.routes.insert(route));
    }

    pub fn forget_route(&self, route: &RouteEntry) -> bool {
        self.with(|o| o.routes.remove(route))
    }

    pub fn owns_route(&self, route: &RouteEntry) -> bool {
        self.with(|o| o.routes.contains(route))
    }

    pub fn record_address(&self, address: AddressEntry) {
        self.with(|o| o.addresses.insert(address));
    }

    pub fn forget_address(&self, address: &AddressEntry) -> bool {
        self.with(|o| o.addresses.remove(address))
    }

    pub fn record_policy(&self, key: PolicyKey) {
        self.with(|o| o.policies.insert(key));
    }

    pub fn forget_policy(&self, key: &PolicyKey) -> bool {
        self.with(|o| o.policies.remove(key))
    }

    pub fn forget_all_policies(&self) {
        self.with(|o| o.policies.clear());
    }

    pub fn drain(&self) -> Drained {
        self.with(|o| Drained {
            routes: o.routes.drain().collect(),
            addresses: o.addresses.drain().collect(),
            policies: o.policies.drain().collect(),
        })
    }

    #[cfg(test)]
    pub fn counts(&self) -> (usize, usize, usize) {
        self.with(|o| (o.routes.len(), o.addresses.len(), o.policies.len()))
    }
}
