//! Configuration for a grapevine node

use grapevine_core::{Peer, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Construction-time configuration.
///
/// The defaults match the protocol's reference timings; tests typically
/// shrink the intervals and bind port 0 for an ephemeral listen address.
#[derive(Clone, Debug)]
pub struct Config {
    /// Stable identity. `None` generates a fresh one; hosts that want a node
    /// to survive restarts under the same identity supply it here.
    pub id: Option<PeerId>,
    /// Listen address. Port 0 binds an ephemeral port.
    pub addr: SocketAddr,
    /// Default failure-detection window for peers that do not advertise one.
    pub timeout: Duration,
    /// Period of the local lifetime bump.
    pub heartbeat_interval: Duration,
    /// Period of full peer-table gossip.
    pub list_interval: Duration,
    /// Period of data gossip.
    pub hash_interval: Duration,
    /// Initial peer map, merged before the first exchange.
    pub peers: HashMap<PeerId, Peer>,
    /// Event stream buffer; lagging subscribers lose the oldest events.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            addr: "127.0.0.1:8992".parse().expect("valid default address"),
            timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(100),
            list_interval: Duration::from_millis(300),
            hash_interval: Duration::from_millis(300),
            peers: HashMap::new(),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::EngineError> {
        if self.heartbeat_interval.is_zero()
            || self.list_interval.is_zero()
            || self.hash_interval.is_zero()
        {
            return Err(crate::EngineError::InvalidConfig(
                "periodic intervals must be non-zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(crate::EngineError::InvalidConfig(
                "failure-detection timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.addr.port(), 8992);
        assert_eq!(config.timeout, Duration::from_millis(10_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.list_interval, Duration::from_millis(300));
        assert_eq!(config.hash_interval, Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config {
            hash_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
