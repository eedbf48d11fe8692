//! The kernel interface facade.
//!
//! Every operation picks the best healthy backend that declares the
//! required capability. A backend failing with
//! [`ErrorKind::BackendUnusable`](super::ErrorKind::BackendUnusable) is
//! marked unhealthy and, with fail-over enabled, the next candidate is
//! tried for the same call. Other failures are returned unchanged.
//!
//! Notifications from all backends flow through one bounded channel into a
//! single fan-out task, which classifies them, delivers them to listeners
//! in registration order and republishes them to [`EventStream`]s.

use std::future::Future;
use std::net::IpAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{Backend, BackendId, BackendInfo, BackendKind, IpsecBackend, NetworkBackend};
use super::capability::{Features, Operation};
use super::config::KernelConfig;
use super::error::{Error, Result};
use super::events::{Classifier, EventSink, EventStream, KernelEvent, Notification};
use super::listener::{KernelListener, ListenerId, ListenerRegistry};
use super::ownership::OwnedResources;
use super::registry::{BackendSet, Registered};
use super::reqid::{ReqidAllocator, ReqidKey};
use super::spi::{SpiAllocator, SpiRange};
use super::types::{
    AddressEntry, AddressFilter, AddressInfo, InterfaceInfo, InterfaceState, IpsecProtocol,
    Policy, PolicyDirection, PolicyInfo, PolicyKey, Removal, RouteEntry, SaDescriptor, SaId,
    SaInfo, SaUpdate, TrafficSelector,
};

/// Admission control for operations, so shutdown can drain them.
struct Gate {
    closing: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct Pass<'a>(&'a Gate);

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Gate {
    fn new() -> Self {
        Self {
            closing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn enter(&self) -> Result<Pass<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let pass = Pass(self);
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(pass)
    }

    async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn removal(result: Result<()>) -> Result<Removal> {
    match result {
        Ok(()) => Ok(Removal::Removed),
        Err(e) if e.is_not_found() => Ok(Removal::NotFound),
        Err(e) => Err(e),
    }
}

/// Kernel interface dispatcher.
///
/// Construct one per process with [`KernelInterface::new`] and share the
/// returned `Arc`.
pub struct KernelInterface {
    config: KernelConfig,
    spi_range: SpiRange,
    ipsec: BackendSet<dyn IpsecBackend>,
    network: BackendSet<dyn NetworkBackend>,
    listeners: Arc<ListenerRegistry>,
    spi: Arc<SpiAllocator>,
    reqids: ReqidAllocator,
    owned: OwnedResources,
    next_backend: AtomicU64,
    notifications: mpsc::Sender<Notification>,
    events: broadcast::Sender<KernelEvent>,
    gate: Gate,
    stop: Arc<Notify>,
    fan_out: Mutex<Option<JoinHandle<()>>>,
}

impl KernelInterface {
    /// Create a dispatcher and start its event fan-out task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: KernelConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InvalidConfig(format!("no tokio runtime: {}", e)))?;

        let spi_range = config.spi()?;
        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        let (events, _) = broadcast::channel(config.event_stream_capacity);
        let listeners = Arc::new(ListenerRegistry::new());
        let spi = Arc::new(SpiAllocator::new(
            config.spi_reservation_timeout,
            config.spi_alloc_attempts,
        ));
        let stop = Arc::new(Notify::new());

        let task = runtime.spawn(fan_out(
            rx,
            Classifier::new(config.clone()),
            listeners.clone(),
            events.clone(),
            spi.clone(),
            stop.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            spi_range,
            ipsec: BackendSet::new(),
            network: BackendSet::new(),
            listeners,
            spi,
            reqids: ReqidAllocator::new(),
            owned: OwnedResources::new(),
            next_backend: AtomicU64::new(1),
            notifications: tx,
            events,
            gate: Gate::new(),
            stop,
            fan_out: Mutex::new(Some(task)),
        }))
    }

    /// The active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.gate.closing.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Backend registry
    // ------------------------------------------------------------------

    /// Register a backend.
    ///
    /// The backend's self check must pass. Higher priority wins; equal
    /// priorities are tried in registration order.
    pub async fn register_backend(&self, backend: Backend, priority: i32) -> Result<BackendId> {
        let _pass = self.gate.enter()?;

        if let Err(e) = backend.self_check().await {
            warn!(backend = backend.name(), error = %e, "backend self check failed");
            return Err(e);
        }

        let id = BackendId(self.next_backend.fetch_add(1, Ordering::Relaxed));
        let name = backend.name().to_string();
        let capabilities = backend.capabilities();
        let features = backend.features();
        backend.attach(EventSink::new(self.notifications.clone(), name.clone()));

        match &backend {
            Backend::Ipsec(b) => self.ipsec.insert(Registered::new(
                id,
                name.clone(),
                priority,
                capabilities,
                features,
                b.clone(),
            )),
            Backend::Network(b) => self.network.insert(Registered::new(
                id,
                name.clone(),
                priority,
                capabilities,
                features,
                b.clone(),
            )),
        }

        info!(
            backend = %name,
            %id,
            kind = %backend.kind(),
            priority,
            capabilities = ?capabilities,
            "registered backend"
        );
        Ok(id)
    }

    /// Unregister a backend. Returns `false` if it was not registered.
    pub fn unregister_backend(&self, id: BackendId) -> bool {
        let name = if let Some(r) = self.ipsec.remove(id) {
            r.name.clone()
        } else if let Some(r) = self.network.remove(id) {
            r.name.clone()
        } else {
            return false;
        };
        info!(backend = %name, %id, "unregistered backend");
        true
    }

    /// All registered backends, best first per kind.
    pub fn backends(&self) -> Vec<BackendInfo> {
        let ipsec = self.ipsec.snapshot();
        let network = self.network.snapshot();
        ipsec
            .iter()
            .map(|r| r.info(BackendKind::Ipsec))
            .chain(network.iter().map(|r| r.info(BackendKind::Network)))
            .collect()
    }

    /// Re-run the self check of every unhealthy backend and restore those
    /// that pass. Returns how many were restored.
    pub async fn probe_backends(&self) -> Result<usize> {
        let _pass = self.gate.enter()?;
        let mut restored = 0;

        for record in self.ipsec.snapshot().iter().filter(|r| !r.is_healthy()) {
            if record.backend.self_check().await.is_ok() {
                record.set_healthy(true);
                info!(backend = %record.name, "backend healthy again");
                restored += 1;
            }
        }
        for record in self.network.snapshot().iter().filter(|r| !r.is_healthy()) {
            if record.backend.self_check().await.is_ok() {
                record.set_healthy(true);
                info!(backend = %record.name, "backend healthy again");
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Kernel features of the healthy IPsec backends.
    pub fn features(&self) -> Features {
        self.ipsec
            .snapshot()
            .iter()
            .filter(|r| r.is_healthy())
            .fold(Features::empty(), |acc, r| acc | r.features)
    }

    async fn dispatch<B, T, F, Fut>(&self, set: &BackendSet<B>, op: Operation, mut call: F) -> Result<T>
    where
        B: ?Sized + Send + Sync,
        F: FnMut(Arc<B>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for record in set.candidates(op) {
            // may have been marked by a concurrent call since the snapshot
            if !record.is_healthy() {
                continue;
            }
            debug!(backend = %record.name, "dispatching {}", op);

            match call(record.backend.clone()).await {
                Err(e) if e.is_backend_unusable() => {
                    if record.set_healthy(false) {
                        warn!(backend = %record.name, error = %e, "backend unusable, marked unhealthy");
                    }
                    if !self.config.failover {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
        Err(Error::NoBackend { operation: op })
    }

    // ------------------------------------------------------------------
    // SAs
    // ------------------------------------------------------------------

    async fn alloc_spi(&self, src: IpAddr, dst: IpAddr, protocol: IpsecProtocol) -> Result<u32> {
        let range = match protocol {
            IpsecProtocol::Comp => SpiRange::CPI,
            _ => self.spi_range,
        };
        let spi = self
            .spi
            .allocate(dst, protocol, range, || {
                self.dispatch(&self.ipsec, Operation::AllocSpi, move |b| async move {
                    b.alloc_spi(src, dst, protocol, range).await
                })
            })
            .await?;
        debug!("allocated SPI 0x{:08x} for {} {}", spi, protocol, dst);
        Ok(spi)
    }

    /// Allocate an SPI for an SA from `src` to `dst`.
    ///
    /// The SPI stays reserved until the SA is installed, deleted or
    /// hard-expired, or the reservation times out.
    pub async fn get_spi(&self, src: IpAddr, dst: IpAddr, protocol: IpsecProtocol) -> Result<u32> {
        let _pass = self.gate.enter()?;
        self.alloc_spi(src, dst, protocol).await
    }

    /// Allocate an IPComp CPI.
    pub async fn get_cpi(&self, src: IpAddr, dst: IpAddr) -> Result<u16> {
        let _pass = self.gate.enter()?;
        let cpi = self.alloc_spi(src, dst, IpsecProtocol::Comp).await?;
        u16::try_from(cpi).map_err(|_| {
            Error::rejected(Operation::AllocSpi.name(), format!("CPI 0x{:x} too large", cpi))
        })
    }

    /// Install an SA, allocating an SPI first if none is set.
    pub async fn install_sa(&self, mut sa: SaDescriptor) -> Result<SaId> {
        let _pass = self.gate.enter()?;
        sa.validate()?;

        let id = match sa.id() {
            Some(id) => id,
            None => {
                let spi = self.alloc_spi(sa.src, sa.dst, sa.protocol).await?;
                sa.spi = Some(spi);
                SaId::new(sa.dst, sa.protocol, spi)
            }
        };

        let sa = &sa;
        self.dispatch(&self.ipsec, Operation::InstallSa, |b| async move {
            b.install_sa(sa).await
        })
        .await
        .map_err(|e| e.with_context(format!("installing SA {}", id)))?;

        self.spi.release(&id);
        debug!("installed SA {}", id);
        Ok(id)
    }

    /// Update addresses, encapsulation or lifetime of an SA.
    ///
    /// Returns the SA identity after the update (the destination may change).
    pub async fn update_sa(&self, id: &SaId, update: SaUpdate) -> Result<SaId> {
        let _pass = self.gate.enter()?;
        update.validate(id)?;

        let update = &update;
        self.dispatch(&self.ipsec, Operation::UpdateSa, |b| async move {
            b.update_sa(id, update).await
        })
        .await
        .map_err(|e| e.with_context(format!("updating SA {}", id)))?;

        let new_id = update.updated_id(id);
        debug!("updated SA {} -> {}", id, new_id);
        Ok(new_id)
    }

    /// Read usage counters of an SA.
    pub async fn query_sa(&self, id: &SaId) -> Result<SaInfo> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.ipsec, Operation::QuerySa, |b| async move { b.query_sa(id).await })
            .await
            .map_err(|e| e.with_context(format!("querying SA {}", id)))
    }

    /// Delete an SA. Deleting an absent SA is not an error.
    pub async fn delete_sa(&self, id: &SaId) -> Result<Removal> {
        let _pass = self.gate.enter()?;
        let result = self
            .dispatch(&self.ipsec, Operation::DeleteSa, |b| async move { b.delete_sa(id).await })
            .await;
        self.spi.release(id);

        let outcome = removal(result).map_err(|e| e.with_context(format!("deleting SA {}", id)))?;
        debug!("deleting SA {}: {:?}", id, outcome);
        Ok(outcome)
    }

    /// Delete every SA.
    pub async fn flush_sas(&self) -> Result<()> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.ipsec, Operation::FlushSas, |b| async move { b.flush_sas().await })
            .await
    }

    /// Enable or disable usage-based lifetime notifications.
    pub async fn set_lifetime_events(&self, enabled: bool) -> Result<()> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.ipsec, Operation::LifetimeEvents, |b| async move {
            b.set_lifetime_events(enabled).await
        })
        .await
    }

    // ------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------

    /// Install a policy.
    pub async fn install_policy(&self, policy: Policy) -> Result<()> {
        let _pass = self.gate.enter()?;
        policy.validate()?;

        let key = policy.key();
        let policy = &policy;
        self.dispatch(&self.ipsec, Operation::InstallPolicy, |b| async move {
            b.install_policy(policy).await
        })
        .await
        .map_err(|e| e.with_context(format!("installing policy {}", key)))?;

        self.owned.record_policy(key);
        debug!("installed policy {}", key);
        Ok(())
    }

    /// Read usage information of a policy.
    pub async fn query_policy(
        &self,
        selector: &TrafficSelector,
        direction: PolicyDirection,
    ) -> Result<PolicyInfo> {
        let _pass = self.gate.enter()?;
        let key = PolicyKey {
            selector: *selector,
            direction,
        };
        let key = &key;
        self.dispatch(&self.ipsec, Operation::QueryPolicy, |b| async move {
            b.query_policy(key).await
        })
        .await
        .map_err(|e| e.with_context(format!("querying policy {}", key)))
    }

    /// Delete a policy. Deleting an absent policy is not an error.
    pub async fn delete_policy(
        &self,
        selector: &TrafficSelector,
        direction: PolicyDirection,
    ) -> Result<Removal> {
        let _pass = self.gate.enter()?;
        let key = PolicyKey {
            selector: *selector,
            direction,
        };
        self.remove_policy(&key).await
    }

    async fn remove_policy(&self, key: &PolicyKey) -> Result<Removal> {
        let result = self
            .dispatch(&self.ipsec, Operation::DeletePolicy, |b| async move {
                b.delete_policy(key).await
            })
            .await;
        let outcome =
            removal(result).map_err(|e| e.with_context(format!("deleting policy {}", key)))?;
        self.owned.forget_policy(key);
        debug!("deleting policy {}: {:?}", key, outcome);
        Ok(outcome)
    }

    /// Delete every policy.
    pub async fn flush_policies(&self) -> Result<()> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.ipsec, Operation::FlushPolicies, |b| async move {
            b.flush_policies().await
        })
        .await?;
        self.owned.forget_all_policies();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reqids
    // ------------------------------------------------------------------

    /// Get the reqid for `key`, sharing it with identical keys.
    pub fn alloc_reqid(&self, key: ReqidKey) -> Result<u32> {
        let _pass = self.gate.enter()?;
        self.reqids.alloc(key)
    }

    /// Release one reference to `reqid`.
    pub fn release_reqid(&self, reqid: u32) -> Result<()> {
        let _pass = self.gate.enter()?;
        self.reqids.release(reqid)
    }

    // ------------------------------------------------------------------
    // Routes, addresses, interfaces
    // ------------------------------------------------------------------

    /// Install a route. A route that already exists is left alone and not
    /// recorded as owned.
    pub async fn add_route(&self, route: RouteEntry) -> Result<()> {
        let _pass = self.gate.enter()?;
        let entry = &route;
        let result = self
            .dispatch(&self.network, Operation::AddRoute, |b| async move {
                b.add_route(entry).await
            })
            .await;

        match result {
            Ok(()) => {
                debug!("installed route {}", route);
                self.owned.record_route(route);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("route {} already exists", route);
                Ok(())
            }
            Err(e) => Err(e.with_context(format!("installing route {}", route))),
        }
    }

    /// Remove a route by value.
    pub async fn delete_route(&self, route: &RouteEntry) -> Result<Removal> {
        let _pass = self.gate.enter()?;
        let result = self
            .dispatch(&self.network, Operation::DeleteRoute, |b| async move {
                b.del_route(route).await
            })
            .await;
        let outcome =
            removal(result).map_err(|e| e.with_context(format!("deleting route {}", route)))?;
        self.owned.forget_route(route);
        debug!("deleting route {}: {:?}", route, outcome);
        Ok(outcome)
    }

    /// Returns `true` if `route` was installed through this instance.
    pub fn owns_route(&self, route: &RouteEntry) -> bool {
        self.owned.owns_route(route)
    }

    /// Install a virtual IP.
    pub async fn add_address(&self, entry: AddressEntry) -> Result<()> {
        let _pass = self.gate.enter()?;
        let addr = &entry;
        let result = self
            .dispatch(&self.network, Operation::AddAddress, |b| async move {
                b.add_address(addr).await
            })
            .await;

        match result {
            Ok(()) => {
                debug!("installed address {}", entry);
                self.owned.record_address(entry);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("address {} already exists", entry);
                Ok(())
            }
            Err(e) => Err(e.with_context(format!("installing address {}", entry))),
        }
    }

    /// Remove a virtual IP by value.
    pub async fn delete_address(&self, entry: &AddressEntry) -> Result<Removal> {
        let _pass = self.gate.enter()?;
        let result = self
            .dispatch(&self.network, Operation::DeleteAddress, |b| async move {
                b.del_address(entry).await
            })
            .await;
        let outcome =
            removal(result).map_err(|e| e.with_context(format!("deleting address {}", entry)))?;
        self.owned.forget_address(entry);
        debug!("deleting address {}: {:?}", entry, outcome);
        Ok(outcome)
    }

    /// All interfaces known to the best network backend.
    pub async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let _pass = self.gate.enter()?;
        self.list_interfaces().await
    }

    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        self.dispatch(&self.network, Operation::Interfaces, |b| async move {
            b.interfaces().await
        })
        .await
    }

    /// Up/down state and MTU of one interface.
    pub async fn interface_state(&self, name: &str) -> Result<InterfaceState> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.network, Operation::Interfaces, |b| async move {
            b.interface_state(name).await
        })
        .await
    }

    /// Addresses matching `filter`, honoring configured interface usability.
    pub async fn enumerate_addresses(&self, filter: &AddressFilter) -> Result<Vec<AddressInfo>> {
        let _pass = self.gate.enter()?;
        let interfaces = self.list_interfaces().await?;

        let mut out = Vec::new();
        for iface in &interfaces {
            let usable = self.config.is_interface_usable(&iface.name);
            if !filter.accepts_interface(iface, usable) {
                continue;
            }
            out.extend(
                iface
                    .addresses
                    .iter()
                    .filter(|a| filter.accepts_address(a))
                    .map(|a| AddressInfo {
                        address: a.address,
                        prefix_len: a.prefix_len,
                        interface: iface.name.clone(),
                        virtual_ip: a.virtual_ip,
                    }),
            );
        }
        Ok(out)
    }

    /// Name of the usable interface `addr` is assigned to.
    pub async fn interface_for(&self, addr: IpAddr) -> Result<Option<String>> {
        let _pass = self.gate.enter()?;
        let interfaces = self.list_interfaces().await?;
        Ok(interfaces
            .into_iter()
            .find(|iface| iface.has_address(addr) && self.config.is_interface_usable(&iface.name))
            .map(|iface| iface.name))
    }

    /// Source address the kernel would use towards `dst`.
    pub async fn source_address(&self, dst: IpAddr, hint: Option<IpAddr>) -> Result<IpAddr> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.network, Operation::RouteLookup, |b| async move {
            b.source_address(dst, hint).await
        })
        .await
    }

    /// Next hop towards `dst`; `None` if directly reachable.
    pub async fn next_hop(&self, dst: IpAddr, src: Option<IpAddr>) -> Result<Option<IpAddr>> {
        let _pass = self.gate.enter()?;
        self.dispatch(&self.network, Operation::RouteLookup, |b| async move {
            b.next_hop(dst, src).await
        })
        .await
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a listener for kernel events.
    pub fn register_listener(&self, listener: Arc<dyn KernelListener>) -> ListenerId {
        let id = self.listeners.register(listener);
        debug!(listener = %id, "registered listener");
        id
    }

    /// Unregister a listener.
    ///
    /// When this returns, the listener receives no further events. Blocks
    /// while an event is being delivered to it, unless called from inside
    /// its own callback.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let removed = self.listeners.unregister(id);
        if removed {
            debug!(listener = %id, "unregistered listener");
        }
        removed
    }

    /// Subscribe to classified events as a stream.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting operations, wait for in-flight ones, remove owned
    /// policies, routes and addresses, and stop event delivery.
    ///
    /// Cleanup is best-effort: failures are logged and not retried.
    pub async fn shutdown(&self) {
        if self.gate.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down kernel interface");
        self.gate.wait_idle().await;

        let owned = self.owned.drain();
        for key in &owned.policies {
            if let Err(e) = self.remove_policy(key).await {
                warn!(error = %e, "failed to remove policy {}", key);
            }
        }
        for route in &owned.routes {
            let result = self
                .dispatch(&self.network, Operation::DeleteRoute, |b| async move {
                    b.del_route(route).await
                })
                .await;
            if let Err(e) = removal(result) {
                warn!(error = %e, "failed to remove route {}", route);
            }
        }
        for entry in &owned.addresses {
            let result = self
                .dispatch(&self.network, Operation::DeleteAddress, |b| async move {
                    b.del_address(entry).await
                })
                .await;
            if let Err(e) = removal(result) {
                warn!(error = %e, "failed to remove address {}", entry);
            }
        }

        let ipsec = self.ipsec.drain().len();
        let network = self.network.drain().len();
        debug!("dropped {} IPsec and {} network backends", ipsec, network);

        // listeners still receive what was queued before this point
        self.stop.notify_one();
        let task = self
            .fan_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "event fan-out task failed");
        }
        self.listeners.clear();
        info!("kernel interface stopped");
    }
}

impl Drop for KernelInterface {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

async fn fan_out(
    mut rx: mpsc::Receiver<Notification>,
    mut classifier: Classifier,
    listeners: Arc<ListenerRegistry>,
    events: broadcast::Sender<KernelEvent>,
    spi: Arc<SpiAllocator>,
    stop: Arc<Notify>,
) {
    let mut publish = |notification: Notification| {
        let Some(event) = classifier.classify(notification) else {
            return;
        };
        if let KernelEvent::SaExpired(expire) = &event
            && expire.hard
        {
            spi.release(&expire.id);
        }

        debug!("delivering {}", event.name());
        listeners.deliver(&event);
        // no subscribers is fine
        let _ = events.send(event);
    };

    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => break,
            received = rx.recv() => match received {
                Some(n) => publish(n),
                None => break,
            },
        }
    }

    rx.close();
    let mut drained = 0;
    while let Ok(n) = rx.try_recv() {
        publish(n);
        drained += 1;
    }
    debug!("event fan-out stopped, {} queued notifications delivered", drained);
}
