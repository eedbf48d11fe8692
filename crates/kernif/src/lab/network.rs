//! In-memory interfaces, addresses and routes.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Faults, Outlet, lock};
use crate::Error;
use crate::kernel::events::AddressEvent;
use crate::kernel::types::{AddressEntry, InterfaceAddress, InterfaceInfo, RouteEntry};
use crate::kernel::{Capabilities, EventSink, NetworkBackend, Notification, Result};
use crate::util::addr::in_prefix;

struct State {
    interfaces: Vec<InterfaceInfo>,
    routes: HashSet<RouteEntry>,
    next_index: u32,
}

/// In-memory network backend.
///
/// Starts with a loopback interface `lo` (index 1).
pub struct LabNetworkBackend {
    name: String,
    capabilities: Capabilities,
    faults: Faults,
    outlet: Outlet,
    state: Mutex<State>,
}

impl LabNetworkBackend {
    /// Create a backend with every network capability.
    pub fn new(name: impl Into<String>) -> Self {
        let mut lo = InterfaceInfo::new("lo", 1);
        lo.loopback = true;
        lo.mtu = 65536;
        lo.addresses = vec![
            InterfaceAddress {
                address: IpAddr::from(Ipv4Addr::LOCALHOST),
                prefix_len: 8,
                virtual_ip: false,
            },
            InterfaceAddress {
                address: IpAddr::from(Ipv6Addr::LOCALHOST),
                prefix_len: 128,
                virtual_ip: false,
            },
        ];

        Self {
            name: name.into(),
            capabilities: Capabilities::ALL_NETWORK,
            faults: Faults::default(),
            outlet: Outlet::default(),
            state: Mutex::new(State {
                interfaces: vec![lo],
                routes: HashSet::new(),
                next_index: 2,
            }),
        }
    }

    /// Declare a different capability set.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: Error) {
        self.faults.fail_next(error);
    }

    /// Make every call (and the self check) fail as unusable.
    pub fn set_unusable(&self, unusable: bool) {
        self.faults.set_unusable(unusable);
    }

    /// Number of calls made for an operation (by contract method name).
    pub fn calls(&self, op: &str) -> usize {
        self.faults.calls(op)
    }

    /// Create an interface and announce it. Returns its index.
    pub fn add_interface(&self, name: &str, up: bool) -> u32 {
        let index = {
            let mut state = lock(&self.state);
            let index = state.next_index;
            state.next_index += 1;
            let mut iface = InterfaceInfo::new(name, index);
            iface.up = up;
            state.interfaces.push(iface);
            index
        };
        self.outlet.emit(Notification::Link {
            name: name.to_string(),
            index,
            up,
            deleted: false,
        });
        index
    }

    /// Change the state of an interface and announce it.
    pub fn set_link(&self, name: &str, up: bool) -> bool {
        let index = {
            let mut state = lock(&self.state);
            let Some(iface) = state.interfaces.iter_mut().find(|i| i.name == name) else {
                return false;
            };
            iface.up = up;
            iface.index
        };
        self.outlet.emit(Notification::Link {
            name: name.to_string(),
            index,
            up,
            deleted: false,
        })
    }

    /// Remove an interface and announce it.
    pub fn remove_interface(&self, name: &str) -> bool {
        let removed = {
            let mut state = lock(&self.state);
            let Some(pos) = state.interfaces.iter().position(|i| i.name == name) else {
                return false;
            };
            state.interfaces.remove(pos)
        };
        self.outlet.emit(Notification::Link {
            name: removed.name,
            index: removed.index,
            up: false,
            deleted: true,
        })
    }

    /// Assign a regular (non-virtual) address, as the system would.
    pub fn add_system_address(&self, interface: &str, address: IpAddr, prefix_len: u8) -> bool {
        {
            let mut state = lock(&self.state);
            let Some(iface) = state.interfaces.iter_mut().find(|i| i.name == interface) else {
                return false;
            };
            iface.addresses.push(InterfaceAddress {
                address,
                prefix_len,
                virtual_ip: false,
            });
        }
        self.outlet.emit(Notification::Address {
            address: AddressEvent {
                address,
                prefix_len,
                interface: interface.to_string(),
                virtual_ip: false,
            },
            deleted: false,
        })
    }

    /// Install a route the dispatcher did not create.
    pub fn add_system_route(&self, route: RouteEntry) {
        lock(&self.state).routes.insert(route);
    }

    /// Returns `true` if the route is installed.
    pub fn has_route(&self, route: &RouteEntry) -> bool {
        lock(&self.state).routes.contains(route)
    }

    /// All installed routes.
    pub fn routes(&self) -> Vec<RouteEntry> {
        lock(&self.state).routes.iter().cloned().collect()
    }

    /// Returns `true` if `address` is assigned to any interface.
    pub fn has_address(&self, address: IpAddr) -> bool {
        lock(&self.state)
            .interfaces
            .iter()
            .any(|i| i.has_address(address))
    }

    fn check(&self, op: &'static str) -> Result<()> {
        self.faults.check(&self.name, op)
    }

    fn best_route(state: &State, dst: IpAddr) -> Option<&RouteEntry> {
        state
            .routes
            .iter()
            .filter(|r| r.dst.contains(dst))
            .max_by_key(|r| (r.dst.len(), std::cmp::Reverse(r.metric)))
    }

    fn on_link(state: &State, dst: IpAddr) -> Option<(&InterfaceInfo, &InterfaceAddress)> {
        state.interfaces.iter().filter(|i| i.up).find_map(|i| {
            i.addresses
                .iter()
                .find(|a| !a.virtual_ip && in_prefix(dst, a.address, a.prefix_len))
                .map(|a| (i, a))
        })
    }
}

fn unreachable(dst: IpAddr) -> Error {
    Error::from_errno(-libc::ENETUNREACH).with_context(format!("route lookup for {}", dst))
}

#[async_trait]
impl NetworkBackend for LabNetworkBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn self_check(&self) -> Result<()> {
        if self.faults.is_unusable() {
            return Err(Error::unusable(&self.name, "lab backend disabled"));
        }
        Ok(())
    }

    fn attach(&self, sink: EventSink) {
        self.outlet.attach(sink);
    }

    async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        self.check("interfaces")?;
        Ok(lock(&self.state).interfaces.clone())
    }

    async fn add_address(&self, entry: &AddressEntry) -> Result<()> {
        self.check("add_address")?;
        {
            let mut state = lock(&self.state);
            let iface = state
                .interfaces
                .iter_mut()
                .find(|i| i.name == entry.interface)
                .ok_or_else(|| Error::from_errno(-libc::ENODEV))?;
            if iface.has_address(entry.address) {
                return Err(Error::from_errno(-libc::EEXIST));
            }
            iface.addresses.push(InterfaceAddress {
                address: entry.address,
                prefix_len: entry.prefix_len,
                virtual_ip: true,
            });
        }
        self.outlet.emit(Notification::Address {
            address: AddressEvent {
                address: entry.address,
                prefix_len: entry.prefix_len,
                interface: entry.interface.clone(),
                virtual_ip: true,
            },
            deleted: false,
        });
        Ok(())
    }

    async fn del_address(&self, entry: &AddressEntry) -> Result<()> {
        self.check("del_address")?;
        let removed = {
            let mut state = lock(&self.state);
            let iface = state
                .interfaces
                .iter_mut()
                .find(|i| i.name == entry.interface)
                .ok_or_else(|| Error::from_errno(-libc::ENODEV))?;
            let pos = iface
                .addresses
                .iter()
                .position(|a| a.address == entry.address && a.prefix_len == entry.prefix_len)
                .ok_or_else(|| Error::from_errno(-libc::EADDRNOTAVAIL))?;
            iface.addresses.remove(pos)
        };
        self.outlet.emit(Notification::Address {
            address: AddressEvent {
                address: removed.address,
                prefix_len: removed.prefix_len,
                interface: entry.interface.clone(),
                virtual_ip: removed.virtual_ip,
            },
            deleted: true,
        });
        Ok(())
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<()> {
        self.check("add_route")?;
        let mut state = lock(&self.state);
        if let Some(dev) = &route.interface
            && !state.interfaces.iter().any(|i| &i.name == dev)
        {
            return Err(Error::from_errno(-libc::ENODEV));
        }
        if !state.routes.insert(route.clone()) {
            return Err(Error::from_errno(-libc::EEXIST));
        }
        Ok(())
    }

    async fn del_route(&self, route: &RouteEntry) -> Result<()> {
        self.check("del_route")?;
        if lock(&self.state).routes.remove(route) {
            Ok(())
        } else {
            Err(Error::from_errno(-libc::ESRCH))
        }
    }

    async fn source_address(&self, dst: IpAddr, hint: Option<IpAddr>) -> Result<IpAddr> {
        self.check("source_address")?;
        let state = lock(&self.state);

        if let Some(hint) = hint
            && state.interfaces.iter().any(|i| i.up && i.has_address(hint))
        {
            return Ok(hint);
        }
        if let Some(src) = Self::best_route(&state, dst).and_then(|r| r.src) {
            return Ok(src);
        }
        if let Some((_, addr)) = Self::on_link(&state, dst) {
            return Ok(addr.address);
        }
        state
            .interfaces
            .iter()
            .filter(|i| i.up && !i.loopback)
            .flat_map(|i| i.addresses.iter())
            .find(|a| !a.virtual_ip && a.address.is_ipv4() == dst.is_ipv4())
            .map(|a| a.address)
            .ok_or_else(|| unreachable(dst))
    }

    async fn next_hop(&self, dst: IpAddr, _src: Option<IpAddr>) -> Result<Option<IpAddr>> {
        self.check("next_hop")?;
        let state = lock(&self.state);

        if let Some(route) = Self::best_route(&state, dst) {
            return Ok(route.gateway);
        }
        if Self::on_link(&state, dst).is_some() {
            return Ok(None);
        }
        Err(unreachable(dst))
    }
}
