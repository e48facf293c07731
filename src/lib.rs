//! Multicast DNS service discovery with deduplicated service events and
//! composable service patterns.
//!
//! A [`ServiceBrowser`] turns the raw notifications of a transport adapter
//! into `Added` / `Updated` / `Removed` [`ServiceEvent`]s over a live set of
//! services; a [`ServiceDiscovery`] merges several browsers and answers
//! [`ServicePattern`] queries over all of them.
pub mod adapter;
pub mod browser;
pub mod config;
pub mod configuration;
pub mod discovery;
pub mod error;
pub mod event;
mod handlers;
pub mod mdns;
pub mod memory;
pub mod pattern;
pub mod publish;
pub mod txt;

pub use adapter::{
    AdapterCallback, AdapterSignal, DiscoveryAdapter, DiscoveryGuard, DiscoveryLock,
    PublishRecord, RawEvent, RawEventKind, Subscription,
};
pub use browser::{BrowserStatus, ServiceBrowser};
pub use config::DiscoveryConfig;
pub use configuration::{Flags, Position, Protocol, ServiceConfiguration, ServiceKey};
pub use discovery::ServiceDiscovery;
pub use error::{Result, ServiceDiscoError};
pub use event::{ServiceEvent, ServiceEventKind};
pub use handlers::EventHandler;
pub use mdns::MdnsAdapter;
pub use memory::MemoryAdapter;
pub use pattern::{FlagPattern, MultiPattern, PositionPattern, PropertyPattern, ServicePattern};
pub use publish::LocalService;

use std::sync::Arc;

/// Specifies the transport a discovery adapter is built on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdapterImplementation {
    /// mDNS/DNS-SD through the `mdns-sd` daemon.
    Mdns,
    /// In-process queue, no network access.
    Memory,
}

/// Creates a transport adapter.
///
/// # Arguments
/// * `implementation` - Specifies which transport to use.
/// * `config` - Timing parameters used by the mDNS adapter.
///
/// # Returns
/// A `Result` containing an `Arc` to a component that implements the
/// `DiscoveryAdapter` trait, or a `ServiceDiscoError` if it fails to start.
pub fn create_adapter(
    implementation: AdapterImplementation,
    config: &DiscoveryConfig,
) -> Result<Arc<dyn DiscoveryAdapter>> {
    config.validate()?;
    match implementation {
        AdapterImplementation::Mdns => {
            let adapter = MdnsAdapter::with_config(config)?;
            Ok(Arc::new(adapter))
        }
        AdapterImplementation::Memory => Ok(Arc::new(MemoryAdapter::new())),
    }
}
