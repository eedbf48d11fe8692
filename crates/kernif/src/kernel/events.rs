//! Kernel-origin events.
//!
//! Backends push raw [`Notification`]s into the [`EventSink`] they receive
//! at registration. The dispatcher's fan-out task classifies them into
//! [`KernelEvent`]s, delivers them to listeners, and republishes them on an
//! [`EventStream`].
//!
//! # Example
//!
//! ```ignore
//! use kernif::kernel::KernelEvent;
//! use tokio_stream::StreamExt;
//!
//! let mut events = kernel.events();
//! while let Some(event) = events.next().await {
//!     if let KernelEvent::SaExpired(expire) = event {
//!         println!("{} expired (hard: {})", expire.id, expire.hard);
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use super::config::KernelConfig;
use super::error::{Error, Result};
use super::types::{PolicyDirection, SaId, TrafficSelector};

/// An SA reached a soft or hard lifetime limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireEvent {
    /// The expired SA.
    pub id: SaId,
    /// Its reqid.
    pub reqid: u32,
    /// Hard expiry (the SA is gone) versus soft (rekey now).
    pub hard: bool,
}

/// Traffic matched a policy without an SA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireEvent {
    /// Reqid from the policy template, 0 if none.
    pub reqid: u32,
    /// Selector of the triggering packet or policy.
    pub selector: Option<TrafficSelector>,
    /// Source of the triggering packet.
    pub src: Option<IpAddr>,
    /// Destination of the triggering packet.
    pub dst: Option<IpAddr>,
}

/// An interface changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEvent {
    /// Interface name.
    pub name: String,
    /// Interface index.
    pub index: u32,
}

/// An address appeared or disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    /// The address.
    pub address: IpAddr,
    /// Prefix length.
    pub prefix_len: u8,
    /// Interface name.
    pub interface: String,
    /// Installed as a virtual IP.
    pub virtual_ip: bool,
}

/// The kernel asks to move the SAs of a policy to new endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateEvent {
    /// Reqid of the affected SAs.
    pub reqid: u32,
    /// Policy selector.
    pub selector: TrafficSelector,
    /// Policy direction.
    pub direction: PolicyDirection,
    /// New local endpoint.
    pub local: IpAddr,
    /// New remote endpoint.
    pub remote: IpAddr,
}

/// The NAT mapping of a UDP-encapsulated SA changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEvent {
    /// The affected SA.
    pub id: SaId,
    /// New remote address.
    pub remote: IpAddr,
    /// New remote port.
    pub port: u16,
}

/// A classified kernel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// Soft or hard SA expiry.
    SaExpired(ExpireEvent),
    /// Acquire for a policy whose template names a reqid.
    SaAcquire(AcquireEvent),
    /// Acquire for a policy without a reqid.
    PolicyAcquire(AcquireEvent),
    /// Interface went up.
    InterfaceUp(InterfaceEvent),
    /// Interface went down or was removed.
    InterfaceDown(InterfaceEvent),
    /// Address added.
    AddressAdded(AddressEvent),
    /// Address removed.
    AddressRemoved(AddressEvent),
    /// Migrate request.
    RouteMigrate(MigrateEvent),
    /// NAT mapping change.
    Mapping(MappingEvent),
}

impl KernelEvent {
    /// Event kind name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SaExpired(e) if e.hard => "sa_expired_hard",
            Self::SaExpired(_) => "sa_expired_soft",
            Self::SaAcquire(_) => "sa_acquire",
            Self::PolicyAcquire(_) => "policy_acquire",
            Self::InterfaceUp(_) => "interface_up",
            Self::InterfaceDown(_) => "interface_down",
            Self::AddressAdded(_) => "address_added",
            Self::AddressRemoved(_) => "address_removed",
            Self::RouteMigrate(_) => "route_migrate",
            Self::Mapping(_) => "mapping",
        }
    }

    /// The expire payload, if this is an expire event.
    pub fn as_expire(&self) -> Option<&ExpireEvent> {
        match self {
            Self::SaExpired(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` for a hard expire.
    pub fn is_hard_expire(&self) -> bool {
        self.as_expire().is_some_and(|e| e.hard)
    }
}

/// A raw notification pushed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// SA lifetime expired.
    Expire {
        /// The SA.
        id: SaId,
        /// Its reqid.
        reqid: u32,
        /// Hard expiry.
        hard: bool,
    },
    /// Acquire request.
    Acquire(AcquireEvent),
    /// Link state snapshot.
    Link {
        /// Interface name.
        name: String,
        /// Interface index.
        index: u32,
        /// Current state.
        up: bool,
        /// The link was removed.
        deleted: bool,
    },
    /// Address change.
    Address {
        /// The address data.
        address: AddressEvent,
        /// The address was removed.
        deleted: bool,
    },
    /// Migrate request.
    Migrate(MigrateEvent),
    /// NAT mapping change.
    Mapping(MappingEvent),
}

/// Handle a backend uses to push notifications to the dispatcher.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Notification>,
    backend: String,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<Notification>, backend: impl Into<String>) -> Self {
        Self {
            tx,
            backend: backend.into(),
        }
    }

    /// Push a notification, waiting for queue space.
    pub async fn send(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Push a notification without waiting. Drops it if the queue is full.
    ///
    /// Returns `true` if the notification was queued.
    pub fn try_send(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(backend = %self.backend, "event queue full, dropping {:?}", n);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Returns `true` once the dispatcher stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Turns raw notifications into events.
pub(crate) struct Classifier {
    config: KernelConfig,
    links: HashMap<u32, bool>,
}

impl Classifier {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            links: HashMap::new(),
        }
    }

    pub fn classify(&mut self, notification: Notification) -> Option<KernelEvent> {
        match notification {
            Notification::Expire { id, reqid, hard } => {
                Some(KernelEvent::SaExpired(ExpireEvent { id, reqid, hard }))
            }
            Notification::Acquire(acquire) if acquire.reqid != 0 => {
                Some(KernelEvent::SaAcquire(acquire))
            }
            Notification::Acquire(acquire) => Some(KernelEvent::PolicyAcquire(acquire)),
            Notification::Link {
                name,
                index,
                up,
                deleted,
            } => self.link(name, index, up, deleted),
            Notification::Address { address, deleted } => {
                if !self.config.is_interface_usable(&address.interface) {
                    debug!("ignoring address event on {}", address.interface);
                    return None;
                }
                if deleted {
                    Some(KernelEvent::AddressRemoved(address))
                } else {
                    Some(KernelEvent::AddressAdded(address))
                }
            }
            Notification::Migrate(migrate) => Some(KernelEvent::RouteMigrate(migrate)),
            Notification::Mapping(mapping) => Some(KernelEvent::Mapping(mapping)),
        }
    }

    // Only transitions produce events; repeated snapshots are absorbed.
    fn link(&mut self, name: String, index: u32, up: bool, deleted: bool) -> Option<KernelEvent> {
        let was_up = if deleted {
            self.links.remove(&index)
        } else {
            self.links.insert(index, up)
        }
        .unwrap_or(false);
        let is_up = up && !deleted;

        if was_up == is_up || !self.config.is_interface_usable(&name) {
            return None;
        }

        let event = InterfaceEvent { name, index };
        if is_up {
            Some(KernelEvent::InterfaceUp(event))
        } else {
            Some(KernelEvent::InterfaceDown(event))
        }
    }
}

/// Stream of classified events.
///
/// A subscriber that falls behind by more than the stream capacity skips
/// the oldest events; a warning is logged.
pub struct EventStream {
    inner: BroadcastStream<KernelEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<KernelEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
        }
    }
}

impl Stream for EventStream {
    type Item = KernelEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!("event stream lagged, {} events skipped", skipped);
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
