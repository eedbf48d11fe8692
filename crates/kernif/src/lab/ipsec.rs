//! In-memory SA and policy database.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use super::{Faults, Outlet, lock};
use crate::Error;
use crate::kernel::events::{AcquireEvent, MappingEvent};
use crate::kernel::types::{
    IpsecProtocol, Policy, PolicyAction, PolicyInfo, PolicyKey, SaDescriptor, SaId, SaInfo,
    SaUpdate, TrafficSelector,
};
use crate::kernel::{
    Capabilities, EventSink, Features, IpsecBackend, Notification, Result, SpiRange,
};

struct LabSa {
    sa: SaDescriptor,
    bytes: u64,
    packets: u64,
    last_used: Option<Instant>,
    soft_expired: bool,
}

struct LabPolicy {
    policy: Policy,
    last_used: Option<Instant>,
}

struct State {
    sas: HashMap<SaId, LabSa>,
    policies: HashMap<PolicyKey, LabPolicy>,
    next_spi: Option<u32>,
    scripted: VecDeque<u32>,
    lifetime_events: bool,
}

/// In-memory IPsec backend.
pub struct LabIpsecBackend {
    name: String,
    capabilities: Capabilities,
    features: Features,
    faults: Faults,
    outlet: Outlet,
    state: Mutex<State>,
}

impl LabIpsecBackend {
    /// Create a backend with every IPsec capability.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::ALL_IPSEC,
            features: Features::SA_USE_TIME,
            faults: Faults::default(),
            outlet: Outlet::default(),
            state: Mutex::new(State {
                sas: HashMap::new(),
                policies: HashMap::new(),
                next_spi: None,
                scripted: VecDeque::new(),
                lifetime_events: true,
            }),
        }
    }

    /// Declare a different capability set.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declare a different feature set.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// Make the next call fail with `error`. Queued failures are consumed
    /// in order.
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

    /// Propose these SPIs, in order, before falling back to sequential ones.
    pub fn script_spis(&self, spis: impl IntoIterator<Item = u32>) {
        lock(&self.state).scripted.extend(spis);
    }

    /// Number of installed SAs.
    pub fn sa_count(&self) -> usize {
        lock(&self.state).sas.len()
    }

    /// Returns `true` if the SA is installed.
    pub fn has_sa(&self, id: &SaId) -> bool {
        lock(&self.state).sas.contains_key(id)
    }

    /// Copy of an installed SA.
    pub fn sa(&self, id: &SaId) -> Option<SaDescriptor> {
        lock(&self.state).sas.get(id).map(|s| s.sa.clone())
    }

    /// Number of installed policies.
    pub fn policy_count(&self) -> usize {
        lock(&self.state).policies.len()
    }

    /// Returns `true` if a policy with this identity is installed.
    pub fn has_policy(&self, key: &PolicyKey) -> bool {
        lock(&self.state).policies.contains_key(key)
    }

    /// Whether lifetime notifications are enabled.
    pub fn lifetime_events(&self) -> bool {
        lock(&self.state).lifetime_events
    }

    /// Account traffic on an SA, raising expire notifications when limits
    /// are crossed. A hard expiry removes the SA.
    ///
    /// Returns `false` if the SA does not exist.
    pub fn record_traffic(&self, id: &SaId, bytes: u64, packets: u64) -> bool {
        let mut notifications = Vec::new();
        {
            let mut state = lock(&self.state);
            let events = state.lifetime_events;
            let Some(entry) = state.sas.get_mut(id) else {
                return false;
            };

            entry.bytes = entry.bytes.saturating_add(bytes);
            entry.packets = entry.packets.saturating_add(packets);
            let now = Instant::now();
            entry.last_used = Some(now);

            let lifetime = entry.sa.lifetime;
            let reqid = entry.sa.reqid;
            let hard = entry.bytes >= lifetime.hard_bytes || entry.packets >= lifetime.hard_packets;
            let soft = entry.bytes >= lifetime.soft_bytes || entry.packets >= lifetime.soft_packets;

            if hard {
                state.sas.remove(id);
                if events {
                    notifications.push(Notification::Expire {
                        id: *id,
                        reqid,
                        hard: true,
                    });
                }
            } else if soft && !entry.soft_expired {
                entry.soft_expired = true;
                if events {
                    notifications.push(Notification::Expire {
                        id: *id,
                        reqid,
                        hard: false,
                    });
                }
            }

            for p in state.policies.values_mut() {
                if let PolicyAction::Protect(templates) = &p.policy.action
                    && templates.iter().any(|t| t.reqid == reqid)
                {
                    p.last_used = Some(now);
                }
            }
        }

        for n in notifications {
            self.outlet.emit(n);
        }
        true
    }

    /// Raise an expire notification. A hard expiry removes the SA.
    pub fn expire(&self, id: &SaId, hard: bool) -> bool {
        let reqid = {
            let mut state = lock(&self.state);
            let reqid = state.sas.get(id).map(|s| s.sa.reqid).unwrap_or(0);
            if hard {
                state.sas.remove(id);
            }
            reqid
        };
        self.outlet.emit(Notification::Expire {
            id: *id,
            reqid,
            hard,
        })
    }

    /// Raise an acquire notification.
    pub fn acquire(
        &self,
        reqid: u32,
        selector: Option<TrafficSelector>,
        src: Option<IpAddr>,
        dst: Option<IpAddr>,
    ) -> bool {
        self.outlet.emit(Notification::Acquire(AcquireEvent {
            reqid,
            selector,
            src,
            dst,
        }))
    }

    /// Raise a NAT mapping notification.
    pub fn mapping(&self, id: &SaId, remote: IpAddr, port: u16) -> bool {
        self.outlet.emit(Notification::Mapping(MappingEvent {
            id: *id,
            remote,
            port,
        }))
    }

    /// Raise an arbitrary notification.
    pub fn emit(&self, notification: Notification) -> bool {
        self.outlet.emit(notification)
    }

    fn check(&self, op: &'static str) -> Result<()> {
        self.faults.check(&self.name, op)
    }

    fn next_candidate(state: &mut State, protocol: IpsecProtocol, dst: IpAddr, range: SpiRange) -> u32 {
        if let Some(spi) = state.scripted.pop_front() {
            return spi;
        }
        let span = u64::from(range.max - range.min) + 1;
        let mut candidate = state.next_spi.filter(|s| range.contains(*s)).unwrap_or(range.min);
        for _ in 0..span.min(65536) {
            if !state.sas.contains_key(&SaId::new(dst, protocol, candidate)) {
                break;
            }
            candidate = if candidate >= range.max {
                range.min
            } else {
                candidate + 1
            };
        }
        state.next_spi = Some(if candidate >= range.max {
            range.min
        } else {
            candidate + 1
        });
        candidate
    }
}

fn exists() -> Error {
    Error::from_errno(-libc::EEXIST)
}

#[async_trait]
impl IpsecBackend for LabIpsecBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn features(&self) -> Features {
        self.features
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

    async fn alloc_spi(
        &self,
        _src: IpAddr,
        dst: IpAddr,
        protocol: IpsecProtocol,
        range: SpiRange,
    ) -> Result<u32> {
        self.check("alloc_spi")?;
        let mut state = lock(&self.state);
        Ok(Self::next_candidate(&mut state, protocol, dst, range))
    }

    async fn install_sa(&self, sa: &SaDescriptor) -> Result<()> {
        self.check("install_sa")?;
        let Some(id) = sa.id() else {
            return Err(Error::from_errno_with_context(-libc::EINVAL, "SA without SPI"));
        };
        let mut state = lock(&self.state);
        if state.sas.contains_key(&id) {
            return Err(exists());
        }
        state.sas.insert(
            id,
            LabSa {
                sa: sa.clone(),
                bytes: 0,
                packets: 0,
                last_used: None,
                soft_expired: false,
            },
        );
        Ok(())
    }

    async fn update_sa(&self, id: &SaId, update: &SaUpdate) -> Result<()> {
        self.check("update_sa")?;
        let mut state = lock(&self.state);
        let new_id = update.updated_id(id);
        if new_id != *id && state.sas.contains_key(&new_id) {
            return Err(exists());
        }
        let mut entry = state
            .sas
            .remove(id)
            .ok_or_else(|| Error::from_errno(-libc::ESRCH))?;

        if let Some(src) = update.src {
            entry.sa.src = src;
        }
        if let Some(dst) = update.dst {
            entry.sa.dst = dst;
        }
        if let Some(encap) = update.encap {
            entry.sa.encap = encap;
        }
        if let Some(lifetime) = update.lifetime {
            entry.sa.lifetime = lifetime;
        }
        state.sas.insert(new_id, entry);
        Ok(())
    }

    async fn query_sa(&self, id: &SaId) -> Result<SaInfo> {
        self.check("query_sa")?;
        let state = lock(&self.state);
        let entry = state
            .sas
            .get(id)
            .ok_or_else(|| Error::from_errno(-libc::ESRCH))?;
        Ok(SaInfo {
            id: *id,
            src: entry.sa.src,
            mode: entry.sa.mode,
            reqid: entry.sa.reqid,
            bytes: entry.bytes,
            packets: entry.packets,
            idle: entry.last_used.map(|t| t.elapsed()),
        })
    }

    async fn delete_sa(&self, id: &SaId) -> Result<()> {
        self.check("delete_sa")?;
        lock(&self.state)
            .sas
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::from_errno(-libc::ESRCH))
    }

    async fn flush_sas(&self) -> Result<()> {
        self.check("flush_sas")?;
        lock(&self.state).sas.clear();
        Ok(())
    }

    async fn install_policy(&self, policy: &Policy) -> Result<()> {
        self.check("install_policy")?;
        let key = policy.key();
        let mut state = lock(&self.state);
        if state.policies.contains_key(&key) {
            return Err(exists());
        }

        let ambiguous = state.policies.values().any(|p| {
            p.policy.direction == policy.direction
                && p.policy.priority == policy.priority
                && p.policy.mark == policy.mark
                && p.policy.selector.overlaps(&policy.selector)
        });
        if ambiguous {
            return Err(Error::rejected(
                "install_policy",
                format!("{} overlaps a policy of equal priority", key),
            ));
        }

        state.policies.insert(
            key,
            LabPolicy {
                policy: policy.clone(),
                last_used: None,
            },
        );
        Ok(())
    }

    async fn query_policy(&self, key: &PolicyKey) -> Result<PolicyInfo> {
        self.check("query_policy")?;
        let state = lock(&self.state);
        let entry = state
            .policies
            .get(key)
            .ok_or_else(|| Error::from_errno(-libc::ENOENT))?;
        Ok(PolicyInfo {
            key: *key,
            idle: entry.last_used.map(|t| t.elapsed()),
        })
    }

    async fn delete_policy(&self, key: &PolicyKey) -> Result<()> {
        self.check("delete_policy")?;
        lock(&self.state)
            .policies
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::from_errno(-libc::ENOENT))
    }

    async fn flush_policies(&self) -> Result<()> {
        self.check("flush_policies")?;
        lock(&self.state).policies.clear();
        Ok(())
    }

    async fn set_lifetime_events(&self, enabled: bool) -> Result<()> {
        self.check("set_lifetime_events")?;
        lock(&self.state).lifetime_events = enabled;
        Ok(())
    }
}
