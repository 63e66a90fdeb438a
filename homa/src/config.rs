//! Configuration for the Homa transport.

use crate::error::{Error, Result};

/// Transport configuration.
///
/// The three protocol timeouts are all derived from a single base unit so
/// they keep their relative ordering when tuned: a message fails after
/// 40 base units without peer activity, quiet outbound messages are pinged
/// every 3 base units, and gaps in inbound messages are re-requested after
/// 1 base unit.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Basic timeout unit in microseconds.
    /// Default: 2000
    pub base_timeout_us: u64,
    /// Maximum number of packets pulled from the driver per poll pass.
    /// Default: 32
    pub max_burst: usize,
    /// Bytes a sender may transmit before the first grant arrives.
    /// Default: 10240
    pub unscheduled_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_timeout_us: 2000,
            max_burst: 32,
            unscheduled_limit: 10 * 1024,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the basic timeout unit.
    pub fn with_base_timeout_us(mut self, base_timeout_us: u64) -> Self {
        self.base_timeout_us = base_timeout_us;
        self
    }

    /// Set the per-poll packet burst limit.
    pub fn with_max_burst(mut self, max_burst: usize) -> Self {
        self.max_burst = max_burst;
        self
    }

    /// Set the unscheduled byte limit.
    pub fn with_unscheduled_limit(mut self, unscheduled_limit: usize) -> Self {
        self.unscheduled_limit = unscheduled_limit;
        self
    }

    /// Microseconds without peer activity before a message fails.
    #[inline]
    pub fn message_timeout_us(&self) -> u64 {
        40 * self.base_timeout_us
    }

    /// Microseconds between liveness pings on quiet outbound messages.
    #[inline]
    pub fn ping_interval_us(&self) -> u64 {
        3 * self.base_timeout_us
    }

    /// Microseconds before re-requesting missing inbound bytes.
    #[inline]
    pub fn resend_interval_us(&self) -> u64 {
        self.base_timeout_us
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.base_timeout_us == 0 {
            return Err(Error::InvalidConfig("base_timeout_us must be non-zero".into()));
        }
        if self.max_burst == 0 {
            return Err(Error::InvalidConfig("max_burst must be non-zero".into()));
        }
        if self.unscheduled_limit == 0 {
            return Err(Error::InvalidConfig(
                "unscheduled_limit must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let config = TransportConfig::default()
            .with_base_timeout_us(1000)
            .with_max_burst(16)
            .with_unscheduled_limit(4096);

        assert_eq!(config.base_timeout_us, 1000);
        assert_eq!(config.max_burst, 16);
        assert_eq!(config.unscheduled_limit, 4096);
    }

    #[test]
    fn timeout_ratios() {
        let config = TransportConfig::default();
        assert_eq!(config.message_timeout_us(), 40 * config.base_timeout_us);
        assert_eq!(config.ping_interval_us(), 3 * config.base_timeout_us);
        assert_eq!(config.resend_interval_us(), config.base_timeout_us);
    }

    #[test]
    fn validation() {
        assert!(TransportConfig::default().validate().is_ok());
        assert!(TransportConfig::default()
            .with_max_burst(0)
            .validate()
            .is_err());
        assert!(TransportConfig::default()
            .with_base_timeout_us(0)
            .validate()
            .is_err());
    }
}
