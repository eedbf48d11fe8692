//! Priority-ordered backend sets.
//!
//! Each set is a read-mostly snapshot: writers clone the vector, modify it
//! and swap it in under a short write lock; dispatch clones the `Arc` and
//! releases the lock before any backend call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::backend::{BackendId, BackendInfo, BackendKind};
use super::capability::{Capabilities, Features, Operation};

/// One registration record.
pub(crate) struct Registered<B: ?Sized> {
    pub id: BackendId,
    pub name: String,
    pub priority: i32,
    seq: u64,
    pub capabilities: Capabilities,
    pub features: Features,
    healthy: AtomicBool,
    pub backend: Arc<B>,
}

impl<B: ?Sized> Registered<B> {
    pub fn new(
        id: BackendId,
        name: impl Into<String>,
        priority: i32,
        capabilities: Capabilities,
        features: Features,
        backend: Arc<B>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            priority,
            // ids are handed out in registration order
            seq: id.0,
            capabilities,
            features,
            healthy: AtomicBool::new(true),
            backend,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn serves(&self, op: Operation) -> bool {
        self.capabilities.contains(op.required())
    }

    pub fn info(&self, kind: BackendKind) -> BackendInfo {
        BackendInfo {
            id: self.id,
            kind,
            name: self.name.clone(),
            priority: self.priority,
            capabilities: self.capabilities,
            features: self.features,
            healthy: self.is_healthy(),
        }
    }
}

type Snapshot<B> = Arc<Vec<Arc<Registered<B>>>>;

/// Backends of one contract kind, sorted by descending priority.
pub(crate) struct BackendSet<B: ?Sized> {
    entries: RwLock<Snapshot<B>>,
}

impl<B: ?Sized> BackendSet<B> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Current snapshot. Cheap; never blocks writers for long.
    pub fn snapshot(&self) -> Snapshot<B> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn insert(&self, record: Registered<B>) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(Arc::new(record));
        // stable: equal priorities keep registration order
        next.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        *guard = Arc::new(next);
    }

    pub fn remove(&self, id: BackendId) -> Option<Arc<Registered<B>>> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let pos = guard.iter().position(|r| r.id == id)?;
        let mut next: Vec<_> = guard.iter().cloned().collect();
        let removed = next.remove(pos);
        *guard = Arc::new(next);
        Some(removed)
    }

    pub fn drain(&self) -> Vec<Arc<Registered<B>>> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *guard, Arc::new(Vec::new()));
        old.iter().cloned().collect()
    }

    /// Healthy backends able to serve `op`, best first.
    pub fn candidates(&self, op: Operation) -> Vec<Arc<Registered<B>>> {
        self.snapshot()
            .iter()
            .filter(|r| r.serves(op) && r.is_healthy())
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
