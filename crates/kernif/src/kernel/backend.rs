//! Backend contracts.
//!
//! A backend wraps one OS kernel API. IPsec backends manage SAs and
//! policies ([`IpsecBackend`]); network backends manage routes, addresses
//! and interfaces ([`NetworkBackend`]). Both are registered as trait objects
//! and only receive calls for operations their [`Capabilities`] declare.
//!
//! Failures are plain [`Error`]s. The dispatcher classifies them with
//! [`Error::kind`], so a backend only needs to pick the right variant (or
//! errno) for "my control channel is gone" versus "the kernel refused".

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::capability::{Capabilities, Features, Operation};
use super::error::{Error, Result};
use super::events::EventSink;
use super::spi::SpiRange;
use super::types::{
    AddressEntry, InterfaceInfo, InterfaceState, IpsecProtocol, Policy, PolicyInfo, PolicyKey,
    RouteEntry, SaDescriptor, SaId, SaInfo, SaUpdate,
};

fn unsupported(backend: &str, op: Operation) -> Error {
    Error::rejected(op.name(), format!("not supported by {}", backend))
}

/// IPsec backend contract (SA and policy management).
#[async_trait]
pub trait IpsecBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Operations this backend serves.
    fn capabilities(&self) -> Capabilities;

    /// Optional kernel behaviors.
    fn features(&self) -> Features {
        Features::empty()
    }

    /// Verify that the backend is usable. Run at registration and when
    /// probing unhealthy backends.
    async fn self_check(&self) -> Result<()> {
        Ok(())
    }

    /// Receive the sink kernel notifications are pushed into.
    fn attach(&self, _sink: EventSink) {}

    /// Propose an unused SPI (or CPI) within `range`.
    async fn alloc_spi(
        &self,
        src: IpAddr,
        dst: IpAddr,
        protocol: IpsecProtocol,
        range: SpiRange,
    ) -> Result<u32>;

    /// Install an SA. The SPI is always set.
    async fn install_sa(&self, sa: &SaDescriptor) -> Result<()>;

    /// Change addresses, encapsulation or lifetime of an SA.
    async fn update_sa(&self, id: &SaId, update: &SaUpdate) -> Result<()>;

    /// Read usage counters.
    async fn query_sa(&self, id: &SaId) -> Result<SaInfo>;

    /// Delete an SA.
    async fn delete_sa(&self, id: &SaId) -> Result<()>;

    /// Delete every SA.
    async fn flush_sas(&self) -> Result<()> {
        Err(unsupported(self.name(), Operation::FlushSas))
    }

    /// Install a policy.
    async fn install_policy(&self, policy: &Policy) -> Result<()>;

    /// Read policy usage.
    async fn query_policy(&self, key: &PolicyKey) -> Result<PolicyInfo> {
        let _ = key;
        Err(unsupported(self.name(), Operation::QueryPolicy))
    }

    /// Delete a policy.
    async fn delete_policy(&self, key: &PolicyKey) -> Result<()>;

    /// Delete every policy.
    async fn flush_policies(&self) -> Result<()> {
        Err(unsupported(self.name(), Operation::FlushPolicies))
    }

    /// Enable or disable usage-based lifetime notifications.
    async fn set_lifetime_events(&self, enabled: bool) -> Result<()> {
        let _ = enabled;
        Err(unsupported(self.name(), Operation::LifetimeEvents))
    }
}

/// Network backend contract (routes, addresses, interfaces).
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Operations this backend serves.
    fn capabilities(&self) -> Capabilities;

    /// Verify that the backend is usable.
    async fn self_check(&self) -> Result<()> {
        Ok(())
    }

    /// Receive the sink kernel notifications are pushed into.
    fn attach(&self, _sink: EventSink) {}

    /// All interfaces with their addresses.
    async fn interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    /// State of one interface.
    async fn interface_state(&self, name: &str) -> Result<InterfaceState> {
        self.interfaces()
            .await?
            .into_iter()
            .find(|iface| iface.name == name)
            .map(|iface| InterfaceState {
                up: iface.up,
                mtu: iface.mtu,
            })
            .ok_or_else(|| Error::NotFound(format!("interface {}", name)))
    }

    /// Add an address to an interface.
    async fn add_address(&self, entry: &AddressEntry) -> Result<()>;

    /// Remove an address from an interface.
    async fn del_address(&self, entry: &AddressEntry) -> Result<()>;

    /// Install a route.
    async fn add_route(&self, route: &RouteEntry) -> Result<()>;

    /// Remove a route.
    async fn del_route(&self, route: &RouteEntry) -> Result<()>;

    /// Source address the kernel would use to reach `dst`.
    async fn source_address(&self, dst: IpAddr, hint: Option<IpAddr>) -> Result<IpAddr> {
        let _ = (dst, hint);
        Err(unsupported(self.name(), Operation::RouteLookup))
    }

    /// Next hop towards `dst`; `None` if `dst` is directly reachable.
    async fn next_hop(&self, dst: IpAddr, src: Option<IpAddr>) -> Result<Option<IpAddr>> {
        let _ = (dst, src);
        Err(unsupported(self.name(), Operation::RouteLookup))
    }
}

/// Which contract a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// SA and policy management.
    Ipsec,
    /// Routes, addresses and interfaces.
    Network,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipsec => f.write_str("ipsec"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// A backend to register.
#[derive(Clone)]
pub enum Backend {
    /// An IPsec backend.
    Ipsec(Arc<dyn IpsecBackend>),
    /// A network backend.
    Network(Arc<dyn NetworkBackend>),
}

impl Backend {
    /// The contract this backend implements.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Ipsec(_) => BackendKind::Ipsec,
            Self::Network(_) => BackendKind::Network,
        }
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        match self {
            Self::Ipsec(b) => b.name(),
            Self::Network(b) => b.name(),
        }
    }

    /// Declared capabilities.
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Ipsec(b) => b.capabilities(),
            Self::Network(b) => b.capabilities(),
        }
    }

    /// Declared features (always empty for network backends).
    pub fn features(&self) -> Features {
        match self {
            Self::Ipsec(b) => b.features(),
            Self::Network(_) => Features::empty(),
        }
    }

    /// Run the backend's self check.
    pub async fn self_check(&self) -> Result<()> {
        match self {
            Self::Ipsec(b) => b.self_check().await,
            Self::Network(b) => b.self_check().await,
        }
    }

    /// Hand the event sink to the backend.
    pub fn attach(&self, sink: EventSink) {
        match self {
            Self::Ipsec(b) => b.attach(sink),
            Self::Network(b) => b.attach(sink),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Handle identifying a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub(crate) u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend#{}", self.0)
    }
}

/// Snapshot of one registration record, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    /// Registration handle.
    pub id: BackendId,
    /// Contract kind.
    pub kind: BackendKind,
    /// Backend name.
    pub name: String,
    /// Priority (higher wins).
    pub priority: i32,
    /// Declared capabilities.
    pub capabilities: Capabilities,
    /// Declared features.
    pub features: Features,
    /// Current health.
    pub healthy: bool,
}
