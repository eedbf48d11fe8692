//! Value types passed between callers, the dispatcher and backends.

pub mod net;
pub mod policy;
pub mod sa;

pub use net::{
    AddressEntry, AddressFilter, AddressInfo, DEFAULT_ROUTING_TABLE, InterfaceAddress,
    InterfaceInfo, InterfaceState, IpPrefix, RouteEntry,
};
pub use policy::{
    Policy, PolicyAction, PolicyDirection, PolicyInfo, PolicyKey, PortRange, SaTemplate,
    TrafficSelector,
};
pub use sa::{
    Algorithm, IpsecMode, IpsecProtocol, KeyMaterial, LIFETIME_INFINITE, Lifetime, Mark,
    SaDescriptor, SaId, SaInfo, SaUpdate, UdpEncap,
};

/// Outcome of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Removal {
    /// The entry existed and was removed.
    Removed,
    /// The entry did not exist.
    NotFound,
}

impl Removal {
    /// Returns `true` if something was removed.
    pub fn removed(&self) -> bool {
        matches!(self, Self::Removed)
    }
}
