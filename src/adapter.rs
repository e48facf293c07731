//! The seam between the discovery core and a concrete transport.
//!
//! An adapter delivers [`AdapterSignal`]s for one (type, domain) subscription
//! from its own delivery context, always while holding its
//! [`DiscoveryLock`], and never concurrently for subscriptions on the same
//! adapter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::configuration::{Protocol, ServiceKey};
use crate::error::Result;

/// What a raw notification from the transport reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawEventKind {
    /// A service instance was announced and resolved.
    Resolved,
    /// A service instance went away.
    Removed,
}

/// One notification from the transport, before deduplication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub interface: i32,
    pub protocol: Protocol,
    pub name: String,
    pub service_type: String,
    pub domain: String,
    /// Port and TXT blob, present once the instance was resolved.
    pub port: Option<u16>,
    pub txt: Option<Vec<u8>>,
}

impl RawEvent {
    pub fn resolved(key: ServiceKey, port: u16, txt: Vec<u8>) -> Self {
        Self::from_key(RawEventKind::Resolved, key, Some(port), Some(txt))
    }

    pub fn removed(key: ServiceKey) -> Self {
        Self::from_key(RawEventKind::Removed, key, None, None)
    }

    fn from_key(
        kind: RawEventKind,
        key: ServiceKey,
        port: Option<u16>,
        txt: Option<Vec<u8>>,
    ) -> Self {
        RawEvent {
            kind,
            interface: key.interface,
            protocol: key.protocol,
            name: key.name,
            service_type: key.service_type,
            domain: key.domain,
            port,
            txt,
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            domain: self.domain.clone(),
            interface: self.interface,
            protocol: self.protocol,
        }
    }
}

/// What an adapter hands to a subscription callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterSignal {
    Event(RawEvent),
    /// The transport stopped delivering for this subscription.
    Stalled(String),
}

/// Callback invoked by an adapter's delivery context.
pub type AdapterCallback = Arc<dyn Fn(AdapterSignal) + Send + Sync>;

/// Handle to an active subscription, returned to the adapter to cancel it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: u64,
    pub service_type: String,
    pub domain: String,
}

/// A local service as handed to an adapter for publishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishRecord {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub interface: i32,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: u16,
    pub properties: Vec<String>,
}

/// The single mutual-exclusion boundary between an adapter's event delivery
/// and callers mutating published data.
#[derive(Clone, Default, Debug)]
pub struct DiscoveryLock {
    inner: Arc<Mutex<()>>,
}

/// Guard returned by [`DiscoveryLock::lock`]; the lock is released on drop.
pub type DiscoveryGuard<'a> = MutexGuard<'a, ()>;

impl DiscoveryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is held. Not reentrant.
    pub fn lock(&self) -> DiscoveryGuard<'_> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A multicast DNS transport the discovery core can browse and publish through.
pub trait DiscoveryAdapter: Send + Sync {
    /// Starts delivering signals for `service_type` in `domain` to `callback`.
    ///
    /// # Errors
    /// Returns `ServiceDiscoError::BrowseFailed` (or an adapter specific
    /// error) if the transport is unavailable or rejects the subscription.
    fn subscribe(
        &self,
        service_type: &str,
        domain: &str,
        callback: AdapterCallback,
    ) -> Result<Subscription>;

    /// Cancels a subscription. Returns once no further callback for it can run.
    /// Must not be called while holding the adapter's discovery lock.
    fn unsubscribe(&self, subscription: Subscription) -> Result<()>;

    /// Announces (or re-announces) a local service.
    fn publish(&self, record: &PublishRecord) -> Result<()>;

    /// Withdraws a previously published local service.
    fn unpublish(&self, record: &PublishRecord) -> Result<()>;

    /// The lock held around every callback invocation.
    fn lock(&self) -> &DiscoveryLock;
}
