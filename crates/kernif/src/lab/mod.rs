//! In-memory kernel.
//!
//! [`LabIpsecBackend`] and [`LabNetworkBackend`] implement the two backend
//! contracts on plain data structures, with hooks to inject failures, fake
//! traffic and raise kernel notifications. They behave like a real kernel
//! where it matters to the dispatcher: duplicates fail with `EEXIST`,
//! missing entries with `ESRCH`/`ENOENT`, and a disabled backend reports
//! itself unusable.
//!
//! # Example
//!
//! ```ignore
//! use kernif::lab::LabKernel;
//! use kernif::{KernelConfig, KernelInterface};
//!
//! let kernel = KernelInterface::new(KernelConfig::default())?;
//! let lab = LabKernel::new();
//! lab.register(&kernel, 0).await?;
//!
//! lab.network.add_interface("eth0", true);
//! lab.ipsec.fail_next(kernif::Error::unusable("lab", "simulated socket loss"));
//! ```

mod ipsec;
mod network;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use ipsec::LabIpsecBackend;
pub use network::LabNetworkBackend;

use crate::kernel::{Backend, BackendId, EventSink, KernelInterface, Notification, Result};
use crate::Error;

/// Failure injection and call accounting shared by both lab backends.
#[derive(Default)]
struct Faults {
    queued: Mutex<VecDeque<Error>>,
    unusable: AtomicBool,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl Faults {
    fn fail_next(&self, error: Error) {
        lock(&self.queued).push_back(error);
    }

    fn set_unusable(&self, unusable: bool) {
        self.unusable.store(unusable, Ordering::SeqCst);
    }

    fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::SeqCst)
    }

    /// Count the call and return the failure it should produce, if any.
    fn check(&self, backend: &str, op: &'static str) -> Result<()> {
        *lock(&self.calls).entry(op).or_default() += 1;
        if self.is_unusable() {
            return Err(Error::unusable(backend, "lab backend disabled"));
        }
        match lock(&self.queued).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn calls(&self, op: &str) -> usize {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }
}

/// Where a lab backend sends its notifications once registered.
#[derive(Default)]
struct Outlet {
    sink: Mutex<Option<EventSink>>,
}

impl Outlet {
    fn attach(&self, sink: EventSink) {
        *lock(&self.sink) = Some(sink);
    }

    fn emit(&self, notification: Notification) -> bool {
        match lock(&self.sink).as_ref() {
            Some(sink) => sink.try_send(notification),
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A matching pair of lab backends.
pub struct LabKernel {
    /// The IPsec half.
    pub ipsec: Arc<LabIpsecBackend>,
    /// The network half.
    pub network: Arc<LabNetworkBackend>,
}

impl Default for LabKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl LabKernel {
    /// Create both backends with full capabilities.
    pub fn new() -> Self {
        Self {
            ipsec: Arc::new(LabIpsecBackend::new("lab-ipsec")),
            network: Arc::new(LabNetworkBackend::new("lab-net")),
        }
    }

    /// Register both backends with `kernel` at `priority`.
    pub async fn register(
        &self,
        kernel: &KernelInterface,
        priority: i32,
    ) -> Result<(BackendId, BackendId)> {
        let ipsec = kernel
            .register_backend(Backend::Ipsec(self.ipsec.clone()), priority)
            .await?;
        let network = kernel
            .register_backend(Backend::Network(self.network.clone()), priority)
            .await?;
        Ok((ipsec, network))
    }
}
