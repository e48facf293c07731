use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceDiscoError};

/// Default capacity of the broadcast channels events are published on.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Largest accepted broadcast channel capacity. Channels allocate their
/// whole buffer up front.
pub const MAX_EVENT_CAPACITY: usize = 1 << 16;

/// Configuration for service discovery and the mDNS adapter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service types to browse for, e.g. `"_rimres._tcp"`.
    pub service_types: Vec<String>,

    /// Domains to browse in. Usually just `"local"`.
    pub domains: Vec<String>,

    /// How long an mDNS browse worker waits for an event before checking
    /// whether it was asked to stop, in milliseconds.
    pub poll_interval_ms: u64,

    /// How long to wait for the mDNS daemon to confirm shutdown or unregister,
    /// in seconds.
    pub shutdown_timeout_secs: u64,

    /// Buffer size of the event broadcast channels.
    pub event_channel_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            service_types: Vec::new(),
            domains: vec!["local".to_string()],
            poll_interval_ms: 200,
            shutdown_timeout_secs: 5,
            event_channel_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl DiscoveryConfig {
    /// Parses and validates a JSON configuration document. Missing fields
    /// take their default values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DiscoveryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for service_type in &self.service_types {
            validate_service_type(service_type)?;
        }
        if self.domains.iter().any(|d| d.trim_matches('.').is_empty()) {
            return Err(ServiceDiscoError::ConfigError(
                "Domain cannot be empty".into(),
            ));
        }
        validate_event_capacity(self.event_channel_capacity)?;
        if self.poll_interval_ms == 0 {
            return Err(ServiceDiscoError::ConfigError(
                "Poll interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_event_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 || capacity > MAX_EVENT_CAPACITY {
        return Err(ServiceDiscoError::ConfigError(format!(
            "Event channel capacity {} out of range 1..={}",
            capacity, MAX_EVENT_CAPACITY
        )));
    }
    Ok(())
}

/// Service types look like `_name._tcp` or `_name._udp`.
pub(crate) fn validate_service_type(service_type: &str) -> Result<()> {
    if !service_type.starts_with('_') || service_type.len() < 2 {
        return Err(ServiceDiscoError::ConfigError(format!(
            "Invalid service type '{}': expected a form like '_name._tcp'",
            service_type
        )));
    }
    Ok(())
}
