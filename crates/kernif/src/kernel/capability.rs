//! Backend capability masks and kernel feature flags.
//!
//! A backend declares, at registration time, which operations it can serve
//! ([`Capabilities`]) and which optional kernel behaviors it exhibits
//! ([`Features`]). The dispatcher maps every [`Operation`] to the single
//! capability bit it requires.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Capability bits (`CAP_*`).
pub mod cap_bits {
    pub const ALLOC_SPI: u32 = 1 << 0;
    pub const INSTALL_SA: u32 = 1 << 1;
    pub const UPDATE_SA: u32 = 1 << 2;
    pub const QUERY_SA: u32 = 1 << 3;
    pub const DELETE_SA: u32 = 1 << 4;
    pub const FLUSH_SA: u32 = 1 << 5;
    pub const INSTALL_POLICY: u32 = 1 << 6;
    pub const QUERY_POLICY: u32 = 1 << 7;
    pub const DELETE_POLICY: u32 = 1 << 8;
    pub const FLUSH_POLICY: u32 = 1 << 9;
    pub const LIFETIME_EVENTS: u32 = 1 << 10;
    pub const ROUTE: u32 = 1 << 16;
    pub const ADDRESS: u32 = 1 << 17;
    pub const INTERFACES: u32 = 1 << 18;
    pub const ROUTE_LOOKUP: u32 = 1 << 19;
}

/// Set of operations a backend can serve.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities(u32);

impl Capabilities {
    /// SPI and CPI allocation.
    pub const ALLOC_SPI: Self = Self(cap_bits::ALLOC_SPI);
    /// SA installation.
    pub const INSTALL_SA: Self = Self(cap_bits::INSTALL_SA);
    /// SA update (addresses, encapsulation, lifetime).
    pub const UPDATE_SA: Self = Self(cap_bits::UPDATE_SA);
    /// SA usage query.
    pub const QUERY_SA: Self = Self(cap_bits::QUERY_SA);
    /// SA deletion.
    pub const DELETE_SA: Self = Self(cap_bits::DELETE_SA);
    /// Flush all SAs.
    pub const FLUSH_SA: Self = Self(cap_bits::FLUSH_SA);
    /// Policy installation.
    pub const INSTALL_POLICY: Self = Self(cap_bits::INSTALL_POLICY);
    /// Policy usage query.
    pub const QUERY_POLICY: Self = Self(cap_bits::QUERY_POLICY);
    /// Policy deletion.
    pub const DELETE_POLICY: Self = Self(cap_bits::DELETE_POLICY);
    /// Flush all policies.
    pub const FLUSH_POLICY: Self = Self(cap_bits::FLUSH_POLICY);
    /// Usage-based lifetime enforcement notifications.
    pub const LIFETIME_EVENTS: Self = Self(cap_bits::LIFETIME_EVENTS);
    /// Route installation and removal.
    pub const ROUTE: Self = Self(cap_bits::ROUTE);
    /// Virtual IP installation and removal.
    pub const ADDRESS: Self = Self(cap_bits::ADDRESS);
    /// Interface and address enumeration.
    pub const INTERFACES: Self = Self(cap_bits::INTERFACES);
    /// Source address and next hop lookups.
    pub const ROUTE_LOOKUP: Self = Self(cap_bits::ROUTE_LOOKUP);

    /// Everything the IPsec contract can offer.
    pub const ALL_IPSEC: Self = Self(0xffff);
    /// Everything the network contract can offer.
    pub const ALL_NETWORK: Self = Self(0xffff_0000);

    /// No capabilities.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no bit is set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Union of two sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Capabilities {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(u32, &str)] = &[
            (cap_bits::ALLOC_SPI, "ALLOC_SPI"),
            (cap_bits::INSTALL_SA, "INSTALL_SA"),
            (cap_bits::UPDATE_SA, "UPDATE_SA"),
            (cap_bits::QUERY_SA, "QUERY_SA"),
            (cap_bits::DELETE_SA, "DELETE_SA"),
            (cap_bits::FLUSH_SA, "FLUSH_SA"),
            (cap_bits::INSTALL_POLICY, "INSTALL_POLICY"),
            (cap_bits::QUERY_POLICY, "QUERY_POLICY"),
            (cap_bits::DELETE_POLICY, "DELETE_POLICY"),
            (cap_bits::FLUSH_POLICY, "FLUSH_POLICY"),
            (cap_bits::LIFETIME_EVENTS, "LIFETIME_EVENTS"),
            (cap_bits::ROUTE, "ROUTE"),
            (cap_bits::ADDRESS, "ADDRESS"),
            (cap_bits::INTERFACES, "INTERFACES"),
            (cap_bits::ROUTE_LOOKUP, "ROUTE_LOOKUP"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Capabilities({})", names.join(" | "))
    }
}

/// Optional kernel behaviors an IPsec backend may exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Features(u32);

impl Features {
    /// ESPv3 TFC padding is supported.
    pub const ESP_V3_TFC: Self = Self(1 << 0);
    /// Networking requires an exclude route for the IKE peer.
    pub const REQUIRE_EXCLUDE_ROUTE: Self = Self(1 << 1);
    /// UDP encapsulation must be enabled explicitly on sockets.
    pub const REQUIRE_UDP_ENCAPSULATION: Self = Self(1 << 2);
    /// Policies cannot be updated in place.
    pub const NO_POLICY_UPDATES: Self = Self(1 << 3);
    /// SA query reports the time of last use.
    pub const SA_USE_TIME: Self = Self(1 << 4);
    /// Policies may carry an SPI.
    pub const POLICY_SPI: Self = Self(1 << 5);

    /// No features.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Operations the dispatcher can route to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AllocSpi,
    InstallSa,
    UpdateSa,
    QuerySa,
    DeleteSa,
    FlushSas,
    InstallPolicy,
    QueryPolicy,
    DeletePolicy,
    FlushPolicies,
    LifetimeEvents,
    AddRoute,
    DeleteRoute,
    AddAddress,
    DeleteAddress,
    Interfaces,
    RouteLookup,
}

impl Operation {
    /// The capability a backend must declare to serve this operation.
    pub const fn required(&self) -> Capabilities {
        match self {
            Self::AllocSpi => Capabilities::ALLOC_SPI,
            Self::InstallSa => Capabilities::INSTALL_SA,
            Self::UpdateSa => Capabilities::UPDATE_SA,
            Self::QuerySa => Capabilities::QUERY_SA,
            Self::DeleteSa => Capabilities::DELETE_SA,
            Self::FlushSas => Capabilities::FLUSH_SA,
            Self::InstallPolicy => Capabilities::INSTALL_POLICY,
            Self::QueryPolicy => Capabilities::QUERY_POLICY,
            Self::DeletePolicy => Capabilities::DELETE_POLICY,
            Self::FlushPolicies => Capabilities::FLUSH_POLICY,
            Self::LifetimeEvents => Capabilities::LIFETIME_EVENTS,
            Self::AddRoute | Self::DeleteRoute => Capabilities::ROUTE,
            Self::AddAddress | Self::DeleteAddress => Capabilities::ADDRESS,
            Self::Interfaces => Capabilities::INTERFACES,
            Self::RouteLookup => Capabilities::ROUTE_LOOKUP,
        }
    }

    /// Operation name for logs and errors.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AllocSpi => "alloc_spi",
            Self::InstallSa => "install_sa",
            Self::UpdateSa => "update_sa",
            Self::QuerySa => "query_sa",
            Self::DeleteSa => "delete_sa",
            Self::FlushSas => "flush_sas",
            Self::InstallPolicy => "install_policy",
            Self::QueryPolicy => "query_policy",
            Self::DeletePolicy => "delete_policy",
            Self::FlushPolicies => "flush_policies",
            Self::LifetimeEvents => "lifetime_events",
            Self::AddRoute => "add_route",
            Self::DeleteRoute => "delete_route",
            Self::AddAddress => "add_address",
            Self::DeleteAddress => "delete_address",
            Self::Interfaces => "interfaces",
            Self::RouteLookup => "route_lookup",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
