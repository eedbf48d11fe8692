//! Security Association descriptors.
//!
//! An SA is identified by `(destination, protocol, SPI)` ([`SaId`]). The
//! descriptor is an owned value handed to the backend by reference; the
//! dispatcher keeps no copy of it.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::policy::TrafficSelector;
use crate::kernel::error::{Error, Result};

// IPsec protocols
const IPPROTO_ESP: u8 = 50;
const IPPROTO_AH: u8 = 51;
const IPPROTO_COMP: u8 = 108;

/// SPIs below this value are reserved by IANA.
pub const SPI_RESERVED_MAX: u32 = 255;

/// Unlimited byte/packet lifetime value.
pub const LIFETIME_INFINITE: u64 = u64::MAX;

/// IPsec protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpsecProtocol {
    /// Encapsulating Security Payload.
    Esp,
    /// Authentication Header.
    Ah,
    /// IP Compression.
    Comp,
}

impl IpsecProtocol {
    /// Create from an IP protocol number.
    pub fn from_number(val: u8) -> Option<Self> {
        match val {
            IPPROTO_ESP => Some(Self::Esp),
            IPPROTO_AH => Some(Self::Ah),
            IPPROTO_COMP => Some(Self::Comp),
            _ => None,
        }
    }

    /// Get the protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Esp => IPPROTO_ESP,
            Self::Ah => IPPROTO_AH,
            Self::Comp => IPPROTO_COMP,
        }
    }

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Esp => "esp",
            Self::Ah => "ah",
            Self::Comp => "comp",
        }
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encapsulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpsecMode {
    /// Transport mode.
    Transport,
    /// Tunnel mode.
    #[default]
    Tunnel,
    /// BEET mode.
    Beet,
}

/// Identity of an installed SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaId {
    /// Destination address.
    pub dst: IpAddr,
    /// IPsec protocol.
    pub protocol: IpsecProtocol,
    /// Security Parameter Index (CPI for IPComp).
    pub spi: u32,
}

impl SaId {
    /// Create a new SA identity.
    pub fn new(dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> Self {
        Self { dst, protocol, spi }
    }
}

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} spi 0x{:08x}", self.protocol, self.dst, self.spi)
    }
}

/// Secret key bytes.
///
/// `Debug` never prints the bytes, and the buffer is zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Wrap key bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key bytes, for backends only.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for an empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key length in bits.
    pub fn bits(&self) -> u32 {
        (self.0.len() * 8) as u32
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(<{} bytes redacted>)", self.0.len())
    }
}

/// A transform algorithm with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Algorithm {
    /// Kernel algorithm name (e.g. "rfc4106(gcm(aes))").
    pub name: String,
    /// Key material.
    pub key: KeyMaterial,
    /// ICV length (AEAD) or truncation length (integrity) in bits.
    pub icv_bits: Option<u32>,
}

impl Algorithm {
    /// Create an algorithm with key material.
    pub fn new(name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            key: KeyMaterial::new(key),
            icv_bits: None,
        }
    }

    /// Set the ICV or truncation length in bits.
    pub fn icv_bits(mut self, bits: u32) -> Self {
        self.icv_bits = Some(bits);
        self
    }
}

/// SA lifetime limits.
///
/// Byte and packet limits use [`LIFETIME_INFINITE`] for "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    /// Soft byte limit.
    pub soft_bytes: u64,
    /// Hard byte limit.
    pub hard_bytes: u64,
    /// Soft packet limit.
    pub soft_packets: u64,
    /// Hard packet limit.
    pub hard_packets: u64,
    /// Soft expiry after installation.
    pub soft_time: Option<Duration>,
    /// Hard expiry after installation.
    pub hard_time: Option<Duration>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Lifetime {
    /// No limits at all.
    pub const fn unlimited() -> Self {
        Self {
            soft_bytes: LIFETIME_INFINITE,
            hard_bytes: LIFETIME_INFINITE,
            soft_packets: LIFETIME_INFINITE,
            hard_packets: LIFETIME_INFINITE,
            soft_time: None,
            hard_time: None,
        }
    }

    /// Set soft and hard byte limits.
    pub fn bytes(mut self, soft: u64, hard: u64) -> Self {
        self.soft_bytes = soft;
        self.hard_bytes = hard;
        self
    }

    /// Set soft and hard packet limits.
    pub fn packets(mut self, soft: u64, hard: u64) -> Self {
        self.soft_packets = soft;
        self.hard_packets = hard;
        self
    }

    /// Set soft and hard time limits.
    pub fn time(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_time = Some(soft);
        self.hard_time = Some(hard);
        self
    }

    /// Check that every soft limit is at or below its hard limit.
    pub fn validate(&self) -> Result<()> {
        if self.soft_bytes > self.hard_bytes {
            return Err(Error::InvalidArgument(
                "soft byte limit exceeds hard limit".into(),
            ));
        }
        if self.soft_packets > self.hard_packets {
            return Err(Error::InvalidArgument(
                "soft packet limit exceeds hard limit".into(),
            ));
        }
        if let (Some(soft), Some(hard)) = (self.soft_time, self.hard_time)
            && soft > hard
        {
            return Err(Error::InvalidArgument(
                "soft time limit exceeds hard limit".into(),
            ));
        }
        Ok(())
    }
}

/// UDP encapsulation (NAT traversal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpEncap {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
}

impl Default for UdpEncap {
    fn default() -> Self {
        Self {
            src_port: 4500,
            dst_port: 4500,
        }
    }
}

/// Packet mark (value/mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mark {
    /// Mark value.
    pub value: u32,
    /// Mark mask.
    pub mask: u32,
}

impl Mark {
    /// Exact mark match.
    pub fn new(value: u32) -> Self {
        Self {
            value,
            mask: u32::MAX,
        }
    }
}

/// Everything needed to install one SA.
///
/// # Example
///
/// ```ignore
/// use kernif::kernel::types::{Algorithm, IpsecProtocol, SaDescriptor};
///
/// let sa = SaDescriptor::new(local, remote, IpsecProtocol::Esp)
///     .spi(0xc0001001)
///     .reqid(1)
///     .encryption(Algorithm::new("rfc4106(gcm(aes))", key).icv_bits(128));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SaDescriptor {
    /// Source address.
    pub src: IpAddr,
    /// Destination address.
    pub dst: IpAddr,
    /// IPsec protocol.
    pub protocol: IpsecProtocol,
    /// SPI; `None` asks the dispatcher to allocate one.
    pub spi: Option<u32>,
    /// Encapsulation mode.
    pub mode: IpsecMode,
    /// Request ID tying the SA to policy templates.
    pub reqid: u32,
    /// Encryption or AEAD algorithm.
    pub encryption: Option<Algorithm>,
    /// Integrity algorithm.
    pub integrity: Option<Algorithm>,
    /// Compression algorithm name (IPComp only).
    pub compression: Option<String>,
    /// Lifetime limits.
    pub lifetime: Lifetime,
    /// Replay window size in packets (0 disables replay protection).
    pub replay_window: u32,
    /// Extended sequence numbers.
    pub esn: bool,
    /// UDP encapsulation.
    pub encap: Option<UdpEncap>,
    /// Packet mark.
    pub mark: Option<Mark>,
    /// XFRM interface ID.
    pub if_id: Option<u32>,
    /// Traffic selector bound to the SA.
    pub selector: Option<TrafficSelector>,
    /// Inbound (decrypting) SA.
    pub inbound: bool,
}

impl SaDescriptor {
    /// Create a tunnel-mode descriptor without keys.
    pub fn new(src: IpAddr, dst: IpAddr, protocol: IpsecProtocol) -> Self {
        Self {
            src,
            dst,
            protocol,
            spi: None,
            mode: IpsecMode::default(),
            reqid: 0,
            encryption: None,
            integrity: None,
            compression: None,
            lifetime: Lifetime::default(),
            replay_window: 32,
            esn: false,
            encap: None,
            mark: None,
            if_id: None,
            selector: None,
            inbound: false,
        }
    }

    /// Set the SPI.
    pub fn spi(mut self, spi: u32) -> Self {
        self.spi = Some(spi);
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: IpsecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the reqid.
    pub fn reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    /// Set the encryption (or AEAD) algorithm.
    pub fn encryption(mut self, alg: Algorithm) -> Self {
        self.encryption = Some(alg);
        self
    }

    /// Set the integrity algorithm.
    pub fn integrity(mut self, alg: Algorithm) -> Self {
        self.integrity = Some(alg);
        self
    }

    /// Set the compression algorithm.
    pub fn compression(mut self, name: impl Into<String>) -> Self {
        self.compression = Some(name.into());
        self
    }

    /// Set lifetime limits.
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the replay window.
    pub fn replay_window(mut self, window: u32) -> Self {
        self.replay_window = window;
        self
    }

    /// Enable extended sequence numbers.
    pub fn esn(mut self, enabled: bool) -> Self {
        self.esn = enabled;
        self
    }

    /// Enable UDP encapsulation.
    pub fn encap(mut self, encap: UdpEncap) -> Self {
        self.encap = Some(encap);
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

    /// Bind a traffic selector.
    pub fn selector(mut self, selector: TrafficSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Mark as inbound.
    pub fn inbound(mut self, inbound: bool) -> Self {
        self.inbound = inbound;
        self
    }

    /// The identity, once an SPI is set.
    pub fn id(&self) -> Option<SaId> {
        self.spi.map(|spi| SaId::new(self.dst, self.protocol, spi))
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.src.is_ipv4() != self.dst.is_ipv4() {
            return Err(Error::InvalidArgument(format!(
                "SA endpoints {} and {} differ in address family",
                self.src, self.dst
            )));
        }

        if let Some(spi) = self.spi {
            if spi <= SPI_RESERVED_MAX {
                return Err(Error::InvalidArgument(format!(
                    "SPI 0x{:08x} is in the reserved range",
                    spi
                )));
            }
            if self.protocol == IpsecProtocol::Comp && spi > u16::MAX as u32 {
                return Err(Error::InvalidArgument(format!(
                    "CPI 0x{:x} does not fit 16 bits",
                    spi
                )));
            }
        }

        match self.protocol {
            IpsecProtocol::Esp => {
                if self.encryption.is_none() && self.integrity.is_none() {
                    return Err(Error::InvalidArgument(
                        "ESP SA needs an encryption or integrity algorithm".into(),
                    ));
                }
            }
            IpsecProtocol::Ah => {
                if self.integrity.is_none() || self.encryption.is_some() {
                    return Err(Error::InvalidArgument(
                        "AH SA needs exactly an integrity algorithm".into(),
                    ));
                }
            }
            IpsecProtocol::Comp => {
                if self.compression.is_none() {
                    return Err(Error::InvalidArgument(
                        "IPComp SA needs a compression algorithm".into(),
                    ));
                }
            }
        }

        if self.encap.is_some() && self.protocol != IpsecProtocol::Esp {
            return Err(Error::InvalidArgument(
                "UDP encapsulation is only defined for ESP".into(),
            ));
        }

        self.lifetime.validate()
    }
}

/// Changes applied by `update_sa`.
///
/// Used when an IKE SA moves (MOBIKE) or its NAT mapping changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaUpdate {
    /// New source address.
    pub src: Option<IpAddr>,
    /// New destination address (changes the SA identity).
    pub dst: Option<IpAddr>,
    /// New encapsulation; `Some(None)` disables encapsulation.
    pub encap: Option<Option<UdpEncap>>,
    /// New lifetime limits.
    pub lifetime: Option<Lifetime>,
}

impl SaUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the SA to new endpoints.
    pub fn addresses(mut self, src: IpAddr, dst: IpAddr) -> Self {
        self.src = Some(src);
        self.dst = Some(dst);
        self
    }

    /// Change the encapsulation.
    pub fn encap(mut self, encap: Option<UdpEncap>) -> Self {
        self.encap = Some(encap);
        self
    }

    /// Change lifetime limits.
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Returns `true` if nothing would change.
    pub fn is_empty(&self) -> bool {
        self.src.is_none() && self.dst.is_none() && self.encap.is_none() && self.lifetime.is_none()
    }

    /// Check the update against the SA it applies to.
    ///
    /// Both endpoints must end up in one address family, and only ESP SAs
    /// can be encapsulated.
    pub fn validate(&self, id: &SaId) -> Result<()> {
        let family = |a: IpAddr| if a.is_ipv4() { "IPv4" } else { "IPv6" };
        let src = self.src.unwrap_or(id.dst);
        let dst = self.dst.unwrap_or(id.dst);
        // the current source shares the family of the current destination
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(Error::InvalidArgument(format!(
                "updated endpoints of SA {} mix {} and {}",
                id,
                family(src),
                family(dst)
            )));
        }

        if let Some(Some(_)) = self.encap
            && id.protocol != IpsecProtocol::Esp
        {
            return Err(Error::InvalidArgument(
                "UDP encapsulation is only defined for ESP".into(),
            ));
        }

        match &self.lifetime {
            Some(lifetime) => lifetime.validate(),
            None => Ok(()),
        }
    }

    /// The identity of the SA after this update is applied to `id`.
    pub fn updated_id(&self, id: &SaId) -> SaId {
        SaId {
            dst: self.dst.unwrap_or(id.dst),
            ..*id
        }
    }
}

/// Usage information for an installed SA.
#[derive(Debug, Clone, PartialEq)]
pub struct SaInfo {
    /// The SA identity.
    pub id: SaId,
    /// Source address.
    pub src: IpAddr,
    /// Mode.
    pub mode: IpsecMode,
    /// Request ID.
    pub reqid: u32,
    /// Bytes processed.
    pub bytes: u64,
    /// Packets processed.
    pub packets: u64,
    /// Time since the SA was last used, if it was ever used.
    pub idle: Option<Duration>,
}
