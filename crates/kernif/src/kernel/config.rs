//! Dispatcher configuration.

use std::time::Duration;

use super::error::{Error, Result};
use super::spi::{DEFAULT_RESERVATION_TIMEOUT, SpiRange};

/// Configuration for a [`KernelInterface`](super::KernelInterface).
///
/// # Example
///
/// ```ignore
/// use kernif::KernelConfig;
///
/// let config = KernelConfig::new()
///     .failover(false)
///     .interfaces_ignore(["docker0", "virbr0"]);
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KernelConfig {
    /// Retry on the next capable backend when one becomes unusable.
    pub failover: bool,
    /// Capacity of the backend notification channel.
    pub event_queue_capacity: usize,
    /// Capacity of the broadcast channel behind [`events()`](super::KernelInterface::events).
    pub event_stream_capacity: usize,
    /// Lowest SPI handed out.
    pub spi_min: u32,
    /// Highest SPI handed out.
    pub spi_max: u32,
    /// Candidates requested from the backend before giving up.
    pub spi_alloc_attempts: u32,
    /// How long an allocated but uninstalled SPI stays reserved.
    pub spi_reservation_timeout: Duration,
    /// If non-empty, only these interfaces are used.
    pub interfaces_use: Vec<String>,
    /// Interfaces never used.
    pub interfaces_ignore: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            failover: true,
            event_queue_capacity: 256,
            event_stream_capacity: 256,
            spi_min: SpiRange::DEFAULT.min,
            spi_max: SpiRange::DEFAULT.max,
            spi_alloc_attempts: 32,
            spi_reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
            interfaces_use: Vec::new(),
            interfaces_ignore: Vec::new(),
        }
    }
}

impl KernelConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable fail-over.
    pub fn failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    /// Set the notification channel capacity.
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the event stream capacity.
    pub fn event_stream_capacity(mut self, capacity: usize) -> Self {
        self.event_stream_capacity = capacity;
        self
    }

    /// Set the SPI range.
    pub fn spi_range(mut self, min: u32, max: u32) -> Self {
        self.spi_min = min;
        self.spi_max = max;
        self
    }

    /// Set the number of allocation attempts.
    pub fn spi_alloc_attempts(mut self, attempts: u32) -> Self {
        self.spi_alloc_attempts = attempts;
        self
    }

    /// Set the reservation timeout.
    pub fn spi_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.spi_reservation_timeout = timeout;
        self
    }

    /// Restrict to the listed interfaces.
    pub fn interfaces_use<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces_use = names.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude the listed interfaces.
    pub fn interfaces_ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces_ignore = names.into_iter().map(Into::into).collect();
        self
    }

    /// The configured SPI range.
    pub fn spi(&self) -> Result<SpiRange> {
        SpiRange::new(self.spi_min, self.spi_max)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.event_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.event_stream_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_stream_capacity must be greater than zero".into(),
            ));
        }
        if self.spi_alloc_attempts == 0 {
            return Err(Error::InvalidConfig(
                "spi_alloc_attempts must be greater than zero".into(),
            ));
        }
        if self.spi_reservation_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "spi_reservation_timeout must be greater than zero".into(),
            ));
        }
        if !self.interfaces_use.is_empty() && !self.interfaces_ignore.is_empty() {
            return Err(Error::InvalidConfig(
                "interfaces_use and interfaces_ignore are mutually exclusive".into(),
            ));
        }
        self.spi().map(|_| ())
    }

    /// Whether the named interface may be used.
    pub fn is_interface_usable(&self, name: &str) -> bool {
        if !self.interfaces_use.is_empty() {
            return self.interfaces_use.iter().any(|n| n == name);
        }
        !self.interfaces_ignore.iter().any(|n| n == name)
    }
}
