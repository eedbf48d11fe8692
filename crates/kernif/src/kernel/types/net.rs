//! Routes, addresses and interfaces.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::kernel::error::{Error, Result};
use crate::util::addr::{self, in_prefix, max_prefix_len, network_of};

/// Routing table IKE daemons conventionally install their routes into.
pub const DEFAULT_ROUTING_TABLE: u32 = 220;

/// An address prefix in CIDR form.
///
/// The stored address is normalized to its network address, so
/// `10.0.0.7/24` and `10.0.0.0/24` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    /// Create a prefix, rejecting lengths beyond the address family.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        if len > max_prefix_len(&addr) {
            return Err(Error::InvalidArgument(format!(
                "prefix length {} too long for {}",
                len, addr
            )));
        }
        Ok(Self {
            addr: network_of(addr, len),
            len,
        })
    }

    /// Single-host prefix (`/32` or `/128`).
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            len: max_prefix_len(&addr),
        }
    }

    /// The whole address space of the family of `addr`.
    pub fn any_of(addr: &IpAddr) -> Self {
        Self {
            addr: network_of(*addr, 0),
            len: 0,
        }
    }

    /// Network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn len(&self) -> u8 {
        self.len
    }

    /// Returns `true` for `0.0.0.0/0` and `::/0`.
    pub fn is_default(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` for a host prefix.
    pub fn is_host(&self) -> bool {
        self.len == max_prefix_len(&self.addr)
    }

    /// Returns `true` for an IPv4 prefix.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Check whether an address falls into this prefix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        in_prefix(addr, self.addr, self.len)
    }

    /// Check whether `other` lies entirely within this prefix.
    pub fn contains_prefix(&self, other: &IpPrefix) -> bool {
        other.len >= self.len && self.contains(other.addr)
    }

    /// Check whether the two prefixes share at least one address.
    pub fn overlaps(&self, other: &IpPrefix) -> bool {
        self.contains_prefix(other) || other.contains_prefix(self)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) =
            addr::parse_prefix(s).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        Self::new(addr, len)
    }
}

/// A route entry.
///
/// Routes are owned by value: equal entries are the same route, so a
/// restarted process can remove what an earlier instance installed.
///
/// # Example
///
/// ```ignore
/// use kernif::kernel::types::RouteEntry;
///
/// let route = RouteEntry::new("10.0.0.2/32".parse()?)
///     .src("192.168.1.10".parse()?)
///     .dev("eth0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    /// Destination prefix.
    pub dst: IpPrefix,
    /// Next hop.
    pub gateway: Option<IpAddr>,
    /// Preferred source address.
    pub src: Option<IpAddr>,
    /// Output interface.
    pub interface: Option<String>,
    /// Routing table.
    pub table: u32,
    /// Route metric.
    pub metric: u32,
}

impl RouteEntry {
    /// Create a route in the default IPsec routing table.
    pub fn new(dst: IpPrefix) -> Self {
        Self {
            dst,
            gateway: None,
            src: None,
            interface: None,
            table: DEFAULT_ROUTING_TABLE,
            metric: 0,
        }
    }

    /// Set the gateway.
    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the preferred source address.
    pub fn src(mut self, src: IpAddr) -> Self {
        self.src = Some(src);
        self
    }

    /// Set the output interface.
    pub fn dev(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Set the routing table.
    pub fn table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    /// Set the metric.
    pub fn metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(src) = self.src {
            write!(f, " src {}", src)?;
        }
        if let Some(dev) = &self.interface {
            write!(f, " dev {}", dev)?;
        }
        write!(f, " table {}", self.table)
    }
}

/// An address to install on an interface (virtual IP).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressEntry {
    /// The address.
    pub address: IpAddr,
    /// Prefix length.
    pub prefix_len: u8,
    /// Interface name.
    pub interface: String,
}

impl AddressEntry {
    /// Create a host address entry.
    pub fn new(interface: impl Into<String>, address: IpAddr) -> Self {
        Self {
            address,
            prefix_len: max_prefix_len(&address),
            interface: interface.into(),
        }
    }

    /// Set the prefix length.
    pub fn prefix_len(mut self, len: u8) -> Self {
        self.prefix_len = len;
        self
    }
}

impl fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} dev {}", self.address, self.prefix_len, self.interface)
    }
}

/// An address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// The address.
    pub address: IpAddr,
    /// Prefix length.
    pub prefix_len: u8,
    /// Installed as a virtual IP.
    pub virtual_ip: bool,
}

/// A network interface as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface name.
    pub name: String,
    /// Interface index.
    pub index: u32,
    /// Administrative and operational state is up.
    pub up: bool,
    /// Loopback interface.
    pub loopback: bool,
    /// MTU.
    pub mtu: u32,
    /// Assigned addresses.
    pub addresses: Vec<InterfaceAddress>,
}

impl InterfaceInfo {
    /// Create an interface without addresses.
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            up: true,
            loopback: false,
            mtu: 1500,
            addresses: Vec::new(),
        }
    }

    /// Returns `true` if `addr` is assigned to this interface.
    pub fn has_address(&self, addr: IpAddr) -> bool {
        self.addresses.iter().any(|a| a.address == addr)
    }
}

/// Up/down state and MTU of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceState {
    /// Interface is up.
    pub up: bool,
    /// MTU.
    pub mtu: u32,
}

/// One address returned by address enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// The address.
    pub address: IpAddr,
    /// Prefix length.
    pub prefix_len: u8,
    /// Interface the address is on.
    pub interface: String,
    /// Installed as a virtual IP.
    pub virtual_ip: bool,
}

/// Which addresses `enumerate_addresses` returns.
///
/// By default only regular addresses on usable interfaces that are up and
/// not loopback are returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressFilter {
    /// Include addresses on interfaces that are down.
    pub include_down: bool,
    /// Include loopback interfaces.
    pub include_loopback: bool,
    /// Include virtual IPs.
    pub include_virtual: bool,
    /// Exclude regular (non-virtual) addresses.
    pub exclude_regular: bool,
    /// Include interfaces excluded by configuration.
    pub include_ignored: bool,
    /// Restrict to one interface.
    pub interface: Option<String>,
}

impl AddressFilter {
    /// Default filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only virtual IPs.
    pub fn virtual_only() -> Self {
        Self {
            include_virtual: true,
            exclude_regular: true,
            ..Self::default()
        }
    }

    /// Every address the backend knows about.
    pub fn all() -> Self {
        Self {
            include_down: true,
            include_loopback: true,
            include_virtual: true,
            exclude_regular: false,
            include_ignored: true,
            interface: None,
        }
    }

    /// Include interfaces that are down.
    pub fn down(mut self, include: bool) -> Self {
        self.include_down = include;
        self
    }

    /// Include loopback interfaces.
    pub fn loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    /// Include virtual IPs.
    pub fn virtual_ips(mut self, include: bool) -> Self {
        self.include_virtual = include;
        self
    }

    /// Include ignored interfaces.
    pub fn ignored(mut self, include: bool) -> Self {
        self.include_ignored = include;
        self
    }

    /// Restrict to one interface.
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interface = Some(name.into());
        self
    }

    /// Apply the interface-level part of the filter.
    ///
    /// `usable` is the configured usability of the interface.
    pub fn accepts_interface(&self, iface: &InterfaceInfo, usable: bool) -> bool {
        if let Some(name) = &self.interface
            && name != &iface.name
        {
            return false;
        }
        (self.include_down || iface.up)
            && (self.include_loopback || !iface.loopback)
            && (self.include_ignored || usable)
    }

    /// Apply the address-level part of the filter.
    pub fn accepts_address(&self, addr: &InterfaceAddress) -> bool {
        if addr.virtual_ip {
            self.include_virtual
        } else {
            !self.exclude_regular
        }
    }
}
