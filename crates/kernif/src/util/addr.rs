//! Address parsing and prefix arithmetic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Error type for address parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// Parse `addr` or `addr/len`. A bare address is a host prefix.
pub fn parse_prefix(s: &str) -> Result<(IpAddr, u8)> {
    let (addr_part, len_part) = match s.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (s, None),
    };
    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| AddrError::InvalidAddress(addr_part.to_string()))?;
    let max = max_prefix_len(&addr);

    let Some(len_part) = len_part else {
        return Ok((addr, max));
    };
    match len_part.parse::<u8>() {
        Ok(len) if len <= max => Ok((addr, len)),
        Ok(len) => Err(AddrError::InvalidPrefix(format!(
            "/{} is longer than /{} for {}",
            len, max, addr
        ))),
        Err(_) => Err(AddrError::InvalidPrefix(len_part.to_string())),
    }
}

/// Host prefix length for the address family (32 or 128).
pub fn max_prefix_len(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

/// Zero the host bits of `addr` beyond `prefix_len`.
pub fn network_of(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let len = prefix_len.min(32);
            let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let len = prefix_len.min(128);
            let mask = u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// Check if `addr` is in `prefix_addr/prefix_len`. Mixed families and
/// overlong prefixes never match.
pub fn in_prefix(addr: IpAddr, prefix_addr: IpAddr, prefix_len: u8) -> bool {
    addr.is_ipv4() == prefix_addr.is_ipv4()
        && prefix_len <= max_prefix_len(&addr)
        && network_of(addr, prefix_len) == network_of(prefix_addr, prefix_len)
}
