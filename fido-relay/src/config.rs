//! Configuration types for the virtual CTAPHID gateway
//!
//! This module provides the timing and identity knobs of a [`HidGateway`],
//! following the builder style used across the crate.
//!
//! [`HidGateway`]: crate::gateway::HidGateway

use fido_relay_transport::ctaphid::capability;

use std::time::Duration;

/// Gateway configuration
///
/// # Example
///
/// ```
/// use fido_relay::GatewayConfig;
/// use std::time::Duration;
///
/// let config = GatewayConfig::builder()
///     .request_timeout(Duration::from_secs(10))
///     .poll_delay(Duration::from_millis(50))
///     .device_version([2, 1, 0])
///     .build();
/// assert_eq!(config.capabilities, 0x0C);
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Overall budget for one CBOR dispatch, device polling included
    pub request_timeout: Duration,

    /// Pause between device list polls and between retries
    pub poll_delay: Duration,

    /// Interval between KEEPALIVE(PROCESSING) frames while a dispatch is in flight
    pub keepalive_interval: Duration,

    /// Maximum gap between packets of one multi-packet request
    pub continuation_timeout: Duration,

    /// Device version triple reported in INIT responses
    pub device_version: [u8; 3],

    /// Capability flags reported in INIT responses
    pub capabilities: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            poll_delay: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
            continuation_timeout: Duration::from_millis(500),
            device_version: [1, 0, 0],
            capabilities: capability::CBOR | capability::NMSG,
        }
    }
}

impl GatewayConfig {
    /// Create a new builder for constructing configuration
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }
}

/// Builder for constructing gateway configuration
#[derive(Debug)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    /// Set the CBOR dispatch budget (default: 30 s)
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the device poll delay (default: 100 ms)
    pub fn poll_delay(mut self, delay: Duration) -> Self {
        self.config.poll_delay = delay;
        self
    }

    /// Set the keepalive interval (default: 100 ms)
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the continuation packet timeout (default: 500 ms)
    pub fn continuation_timeout(mut self, timeout: Duration) -> Self {
        self.config.continuation_timeout = timeout;
        self
    }

    /// Set the device version triple
    pub fn device_version(mut self, version: [u8; 3]) -> Self {
        self.config.device_version = version;
        self
    }

    /// Set the capability flags
    ///
    /// # Arguments
    /// * `capabilities` - Bitwise OR of [`capability`] flags
    pub fn capabilities(mut self, capabilities: u8) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_delay, Duration::from_millis(100));
        assert_eq!(config.continuation_timeout, Duration::from_millis(500));
        assert_eq!(config.device_version, [1, 0, 0]);
        assert_eq!(config.capabilities, 0x0C);
    }

    #[test]
    fn test_builder_overrides() {
        let config = GatewayConfig::builder()
            .keepalive_interval(Duration::from_millis(250))
            .capabilities(capability::CBOR)
            .build();
        assert_eq!(config.keepalive_interval, Duration::from_millis(250));
        assert_eq!(config.capabilities, 0x04);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
