//! Security policies and traffic selectors.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use super::net::IpPrefix;
use super::sa::{IpsecMode, IpsecProtocol, Mark};
use crate::kernel::error::{Error, Result};

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// All ports.
    pub const ANY: Self = Self {
        start: 0,
        end: u16::MAX,
    };

    /// A range of ports.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// A single port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Returns `true` if this range covers every port.
    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Check whether `port` is in range.
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    /// Check whether two ranges share a port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::ANY
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Which traffic a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrafficSelector {
    /// Source prefix.
    pub src: IpPrefix,
    /// Destination prefix.
    pub dst: IpPrefix,
    /// IP protocol number; `None` for any.
    pub protocol: Option<u8>,
    /// Source ports.
    pub src_ports: PortRange,
    /// Destination ports.
    pub dst_ports: PortRange,
}

impl TrafficSelector {
    /// Select all traffic between two prefixes.
    pub fn new(src: IpPrefix, dst: IpPrefix) -> Self {
        Self {
            src,
            dst,
            protocol: None,
            src_ports: PortRange::ANY,
            dst_ports: PortRange::ANY,
        }
    }

    /// Select all traffic between two hosts.
    pub fn host_to_host(src: IpAddr, dst: IpAddr) -> Self {
        Self::new(IpPrefix::host(src), IpPrefix::host(dst))
    }

    /// Restrict to one IP protocol.
    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Restrict source ports.
    pub fn src_ports(mut self, ports: PortRange) -> Self {
        self.src_ports = ports;
        self
    }

    /// Restrict destination ports.
    pub fn dst_ports(mut self, ports: PortRange) -> Self {
        self.dst_ports = ports;
        self
    }

    /// Check whether some packet could match both selectors.
    pub fn overlaps(&self, other: &TrafficSelector) -> bool {
        let protocols = match (self.protocol, other.protocol) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        protocols
            && self.src.overlaps(&other.src)
            && self.dst.overlaps(&other.dst)
            && self.src_ports.overlaps(&other.src_ports)
            && self.dst_ports.overlaps(&other.dst_ports)
    }

    /// Check whether a packet between `src` and `dst` matches, ignoring ports.
    pub fn matches(&self, src: IpAddr, dst: IpAddr) -> bool {
        self.src.contains(src) && self.dst.contains(dst)
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} === {}", self.src, self.dst)?;
        if let Some(proto) = self.protocol {
            write!(f, " proto {}", proto)?;
        }
        if !self.src_ports.is_any() {
            write!(f, " sport {}", self.src_ports)?;
        }
        if !self.dst_ports.is_any() {
            write!(f, " dport {}", self.dst_ports)?;
        }
        Ok(())
    }
}

/// Policy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyDirection {
    /// Inbound.
    In,
    /// Outbound.
    Out,
    /// Forwarded.
    Forward,
}

impl PolicyDirection {
    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Forward => "fwd",
        }
    }
}

impl fmt::Display for PolicyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SA attributes a protecting policy requires. Never a concrete SPI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SaTemplate {
    /// Tunnel source (ignored in transport mode).
    pub src: IpAddr,
    /// Tunnel destination (ignored in transport mode).
    pub dst: IpAddr,
    /// IPsec protocol.
    pub protocol: IpsecProtocol,
    /// Mode.
    pub mode: IpsecMode,
    /// Request ID of the SA to use.
    pub reqid: u32,
}

impl SaTemplate {
    /// Create a tunnel-mode ESP template.
    pub fn new(src: IpAddr, dst: IpAddr, reqid: u32) -> Self {
        Self {
            src,
            dst,
            protocol: IpsecProtocol::Esp,
            mode: IpsecMode::Tunnel,
            reqid,
        }
    }

    /// Set the protocol.
    pub fn protocol(mut self, protocol: IpsecProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: IpsecMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What to do with matching traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyAction {
    /// Pass in clear.
    Bypass,
    /// Drop.
    Discard,
    /// Apply the listed SAs, outermost last.
    Protect(Vec<SaTemplate>),
}

/// A security policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Traffic selector.
    pub selector: TrafficSelector,
    /// Direction.
    pub direction: PolicyDirection,
    /// Action.
    pub action: PolicyAction,
    /// Priority (lower value is preferred by the kernel).
    pub priority: u32,
    /// Packet mark.
    pub mark: Option<Mark>,
    /// XFRM interface ID.
    pub if_id: Option<u32>,
}

impl Policy {
    /// Create a policy with priority 0.
    pub fn new(selector: TrafficSelector, direction: PolicyDirection, action: PolicyAction) -> Self {
        Self {
            selector,
            direction,
            action,
            priority: 0,
            mark: None,
            if_id: None,
        }
    }

    /// Shorthand for a protecting policy.
    pub fn protect(
        selector: TrafficSelector,
        direction: PolicyDirection,
        templates: Vec<SaTemplate>,
    ) -> Self {
        Self::new(selector, direction, PolicyAction::Protect(templates))
    }

    /// Set the priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the packet mark.
    pub fn mark(mut self, mark: Mark) -> Self {
        self.mark = Some(mark);
        self
    }

    /// Set the XFRM interface ID.
    pub fn if_id(mut self, if_id: u32) -> Self {
        self.if_id = Some(if_id);
        self
    }

    /// The policy identity.
    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            selector: self.selector,
            direction: self.direction,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.selector.src.is_ipv4() != self.selector.dst.is_ipv4() {
            return Err(Error::InvalidArgument(format!(
                "selector {} mixes address families",
                self.selector
            )));
        }
        if let PolicyAction::Protect(templates) = &self.action {
            if templates.is_empty() {
                return Err(Error::InvalidArgument(
                    "protecting policy needs at least one SA template".into(),
                ));
            }
            if templates.iter().any(|t| t.src.is_ipv4() != t.dst.is_ipv4()) {
                return Err(Error::InvalidArgument(
                    "SA template mixes address families".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Identity of a policy: selector plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    /// Traffic selector.
    pub selector: TrafficSelector,
    /// Direction.
    pub direction: PolicyDirection,
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.selector, self.direction)
    }
}

/// Usage information for an installed policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInfo {
    /// The policy identity.
    pub key: PolicyKey,
    /// Time since the policy last matched traffic.
    pub idle: Option<Duration>,
}
