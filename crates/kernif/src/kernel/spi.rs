//! SPI and CPI allocation.
//!
//! The backend proposes candidates; the allocator serializes allocation per
//! `(destination, protocol)` and rejects candidates already handed out to a
//! caller that has not installed its SA yet. Such reservations end when
//! the SA is installed, deleted or hard-expired, or when they time out.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::error::{Error, Result};
use super::types::{IpsecProtocol, SaId};

/// Kernel timeout for larval (acquire) SAs.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(165);

/// Inclusive range SPIs are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpiRange {
    /// Lowest value.
    pub min: u32,
    /// Highest value.
    pub max: u32,
}

impl SpiRange {
    /// Default SPI range.
    pub const DEFAULT: Self = Self {
        min: 0xc000_0000,
        max: 0xcfff_ffff,
    };

    /// IPComp CPI range (values above 0xefff are reserved or private).
    pub const CPI: Self = Self {
        min: 0x100,
        max: 0xefff,
    };

    /// Create a range. Values at or below 255 are reserved and rejected.
    pub fn new(min: u32, max: u32) -> Result<Self> {
        if min <= super::types::sa::SPI_RESERVED_MAX {
            return Err(Error::InvalidConfig(format!(
                "SPI range may not start in the reserved range (0x{:x})",
                min
            )));
        }
        if min > max {
            return Err(Error::InvalidConfig(format!(
                "empty SPI range 0x{:x}-0x{:x}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Check whether `spi` lies in the range.
    pub fn contains(&self, spi: u32) -> bool {
        self.min <= spi && spi <= self.max
    }
}

impl Default for SpiRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Tracks SPIs handed out but not yet installed.
pub(crate) struct SpiAllocator {
    locks: Mutex<HashMap<(IpAddr, IpsecProtocol), KeyLock>>,
    reserved: Mutex<HashMap<SaId, Instant>>,
    timeout: Duration,
    attempts: u32,
}

impl SpiAllocator {
    pub fn new(timeout: Duration, attempts: u32) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashMap::new()),
            timeout,
            attempts,
        }
    }

    /// Allocate an SPI for `(dst, protocol)` from candidates produced by
    /// `propose`. Propose errors are returned as-is.
    pub async fn allocate<F, Fut>(
        &self,
        dst: IpAddr,
        protocol: IpsecProtocol,
        range: SpiRange,
        mut propose: F,
    ) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u32>>,
    {
        let key = (dst, protocol);
        let lock = self.key_lock(key);

        let result = {
            let _guard = lock.lock().await;
            self.reserve_from(dst, protocol, range, &mut propose).await
        };

        self.release_key_lock(key, &lock);
        result
    }

    async fn reserve_from<F, Fut>(
        &self,
        dst: IpAddr,
        protocol: IpsecProtocol,
        range: SpiRange,
        propose: &mut F,
    ) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u32>>,
    {
        for attempt in 1..=self.attempts {
            let candidate = propose().await?;
            if !range.contains(candidate) {
                debug!(
                    "discarding SPI 0x{:08x} outside 0x{:08x}-0x{:08x}",
                    candidate, range.min, range.max
                );
                continue;
            }
            if self.try_reserve(SaId::new(dst, protocol, candidate)) {
                return Ok(candidate);
            }
            debug!(
                "SPI 0x{:08x} for {} {} already reserved (attempt {})",
                candidate, protocol, dst, attempt
            );
        }
        Err(Error::SpiExhausted {
            dst,
            protocol: protocol.name(),
            attempts: self.attempts,
        })
    }

    /// Drop the reservation for `id`. Returns `true` if it existed.
    pub fn release(&self, id: &SaId) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    #[cfg(test)]
    pub fn is_reserved(&self, id: &SaId) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        purge(&mut reserved, self.timeout);
        reserved.contains_key(id)
    }

    #[cfg(test)]
    pub fn reserved_count(&self) -> usize {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        purge(&mut reserved, self.timeout);
        reserved.len()
    }

    fn try_reserve(&self, id: SaId) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        purge(&mut reserved, self.timeout);
        if reserved.contains_key(&id) {
            return false;
        }
        reserved.insert(id, Instant::now());
        true
    }

    fn key_lock(&self, key: (IpAddr, IpsecProtocol)) -> KeyLock {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    fn release_key_lock(&self, key: (IpAddr, IpsecProtocol), lock: &KeyLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // map + caller: nobody else is waiting on this key
        if Arc::strong_count(lock) == 2 {
            locks.remove(&key);
        }
    }
}

fn purge(reserved: &mut HashMap<SaId, Instant>, timeout: Duration) {
    let now = Instant::now();
    reserved.retain(|_, since| now.duration_since(*since) < timeout);
}
