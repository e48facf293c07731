use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::adapter::{AdapterSignal, DiscoveryAdapter, RawEvent, RawEventKind, Subscription};
use crate::config::{DEFAULT_EVENT_CAPACITY, validate_event_capacity, validate_service_type};
use crate::configuration::{ServiceConfiguration, ServiceKey};
use crate::error::{Result, ServiceDiscoError};
use crate::event::{ServiceEvent, ServiceEventKind};
use crate::handlers::{EventHandler, HandlerList};
use crate::pattern::ServicePattern;
use crate::txt;

/// Lifecycle of a [`ServiceBrowser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserStatus {
    /// Not subscribed to the adapter.
    Stopped,
    /// Subscribed and receiving events.
    Running,
    /// Subscribed, but the adapter reported it will deliver nothing more.
    /// The live set is kept as last known.
    Stalled,
}

/// Currently known services, in the order they were first seen.
#[derive(Default)]
struct LiveSet {
    next_seq: u64,
    index: HashMap<ServiceKey, u64>,
    entries: BTreeMap<u64, ServiceConfiguration>,
}

impl LiveSet {
    /// Inserts or replaces `configuration`, returning the event to emit, if any.
    fn upsert(&mut self, configuration: ServiceConfiguration) -> Option<ServiceEvent> {
        let key = configuration.key();
        if let Some(seq) = self.index.get(&key) {
            let current = self.entries.get_mut(seq)?;
            if *current == configuration {
                return None;
            }
            *current = configuration.clone();
            return Some(ServiceEvent::new(ServiceEventKind::Updated, configuration));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key, seq);
        self.entries.insert(seq, configuration.clone());
        Some(ServiceEvent::new(ServiceEventKind::Added, configuration))
    }

    fn remove(&mut self, key: &ServiceKey) -> Option<ServiceConfiguration> {
        let seq = self.index.remove(key)?;
        self.entries.remove(&seq)
    }

    fn drain(&mut self) -> Vec<ServiceConfiguration> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn snapshot(&self) -> Vec<ServiceConfiguration> {
        self.entries.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct BrowserState {
    status: BrowserStatus,
    subscription: Option<Subscription>,
    live: LiveSet,
}

struct BrowserInner {
    adapter: Arc<dyn DiscoveryAdapter>,
    service_type: String,
    domain: String,
    state: Mutex<BrowserState>,
    handlers: HandlerList,
    sender: broadcast::Sender<ServiceEvent>,
}

/// Tracks the live set of services of one type in one domain.
///
/// Clones are handles to the same browser.
#[derive(Clone)]
pub struct ServiceBrowser {
    inner: Arc<BrowserInner>,
}

impl ServiceBrowser {
    /// Creates a stopped browser for `service_type` (e.g. `"_rimres._tcp"`)
    /// in `domain` (e.g. `"local"`).
    ///
    /// # Errors
    /// Returns `ServiceDiscoError::ConfigError` for a malformed service type
    /// or an empty domain.
    pub fn new(
        adapter: Arc<dyn DiscoveryAdapter>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self> {
        Self::with_capacity(adapter, service_type, domain, DEFAULT_EVENT_CAPACITY)
    }

    /// Like [`ServiceBrowser::new`], with an explicit broadcast channel size.
    ///
    /// # Errors
    /// Returns `ServiceDiscoError::ConfigError` if `capacity` is zero or above
    /// [`MAX_EVENT_CAPACITY`](crate::config::MAX_EVENT_CAPACITY).
    pub fn with_capacity(
        adapter: Arc<dyn DiscoveryAdapter>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
        capacity: usize,
    ) -> Result<Self> {
        let service_type = service_type.into();
        let domain = domain.into();
        validate_service_type(&service_type)?;
        if domain.trim_matches('.').is_empty() {
            return Err(ServiceDiscoError::ConfigError(
                "Domain cannot be empty".into(),
            ));
        }
        validate_event_capacity(capacity)?;

        let (sender, _) = broadcast::channel(capacity);
        Ok(ServiceBrowser {
            inner: Arc::new(BrowserInner {
                adapter,
                service_type,
                domain,
                state: Mutex::new(BrowserState {
                    status: BrowserStatus::Stopped,
                    subscription: None,
                    live: LiveSet::default(),
                }),
                handlers: HandlerList::default(),
                sender,
            }),
        })
    }

    pub fn service_type(&self) -> &str {
        &self.inner.service_type
    }

    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    pub fn status(&self) -> BrowserStatus {
        self.inner.state().status
    }

    /// Subscribes to the adapter. Calling it on a started browser is a no-op.
    ///
    /// # Errors
    /// Whatever the adapter reports when it cannot subscribe, typically
    /// `ServiceDiscoError::BrowseFailed`.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state();
        if state.status != BrowserStatus::Stopped {
            debug!(
                "Browser for {}.{} already started",
                self.inner.service_type, self.inner.domain
            );
            return Ok(());
        }

        info!(
            "Starting service browser for {}.{}",
            self.inner.service_type, self.inner.domain
        );

        let weak: Weak<BrowserInner> = Arc::downgrade(&self.inner);
        let subscription = self
            .inner
            .adapter
            .subscribe(
                &self.inner.service_type,
                &self.inner.domain,
                Arc::new(move |signal: AdapterSignal| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_signal(signal);
                    }
                }),
            )
            .map_err(|e| {
                error!(
                    "Failed to start browser for {}.{}: {}",
                    self.inner.service_type, self.inner.domain, e
                );
                e
            })?;

        state.subscription = Some(subscription);
        state.status = BrowserStatus::Running;
        Ok(())
    }

    /// Unsubscribes and empties the live set, emitting one `Removed` event per
    /// entry in insertion order. A no-op on a stopped browser.
    ///
    /// Must not be called from an event handler: it waits for the adapter's
    /// delivery context and takes the discovery lock.
    pub fn stop(&self) -> Result<()> {
        let subscription = {
            let mut state = self.inner.state();
            if state.status == BrowserStatus::Stopped {
                return Ok(());
            }
            state.status = BrowserStatus::Stopped;
            state.subscription.take()
        };

        info!(
            "Stopping service browser for {}.{}",
            self.inner.service_type, self.inner.domain
        );

        let unsubscribed = match subscription {
            Some(subscription) => self.inner.adapter.unsubscribe(subscription),
            None => Ok(()),
        };
        if let Err(e) = &unsubscribed {
            warn!(
                "Adapter failed to release {}.{}: {}",
                self.inner.service_type, self.inner.domain, e
            );
        }

        let _guard = self.inner.adapter.lock().lock();
        let removed = self.inner.state().live.drain();
        for configuration in removed {
            self.inner
                .emit(ServiceEvent::new(ServiceEventKind::Removed, configuration));
        }

        unsubscribed
    }

    /// Applies one raw transport event to the live set.
    ///
    /// Adapters call this with the discovery lock held.
    pub fn on_raw_event(&self, event: RawEvent) {
        self.inner.on_raw_event(event);
    }

    /// Snapshot of the live set in insertion order.
    pub fn get_services(&self) -> Vec<ServiceConfiguration> {
        self.inner.state().live.snapshot()
    }

    /// Lazily filters a snapshot of the live set taken now.
    pub fn find_services<'p, P>(
        &self,
        pattern: &'p P,
    ) -> impl Iterator<Item = ServiceConfiguration> + use<'p, P>
    where
        P: ServicePattern + ?Sized,
    {
        self.get_services()
            .into_iter()
            .filter(move |service| pattern.match_description(service))
    }

    pub fn len(&self) -> usize {
        self.inner.state().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a handler called with every event, after earlier handlers.
    pub fn connect<F>(&self, handler: F)
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.connect_handler(Arc::new(handler));
    }

    pub fn connect_handler(&self, handler: EventHandler) {
        self.inner.handlers.connect(handler);
    }

    /// Subscribes to the browser's events through a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.sender.subscribe()
    }
}

impl BrowserInner {
    fn state(&self) -> MutexGuard<'_, BrowserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_signal(&self, signal: AdapterSignal) {
        match signal {
            AdapterSignal::Event(event) => self.on_raw_event(event),
            AdapterSignal::Stalled(reason) => {
                let error = ServiceDiscoError::Transient(reason);
                let mut state = self.state();
                if state.status == BrowserStatus::Running {
                    warn!(
                        "Browser for {}.{} stalled, keeping {} known services: {}",
                        self.service_type,
                        self.domain,
                        state.live.len(),
                        error
                    );
                    state.status = BrowserStatus::Stalled;
                }
            }
        }
    }

    fn on_raw_event(&self, event: RawEvent) {
        if event.service_type != self.service_type || event.domain != self.domain {
            debug!(
                "Ignoring event for {}.{} (browsing {}.{})",
                event.service_type, event.domain, self.service_type, self.domain
            );
            return;
        }

        let emitted = {
            let mut state = self.state();
            if state.status == BrowserStatus::Stopped {
                debug!("Browser stopped, dropping event for '{}'", event.name);
                return;
            }

            match event.kind {
                RawEventKind::Resolved => {
                    let properties = event.txt.as_deref().map(txt::decode).unwrap_or_default();
                    let mut configuration =
                        ServiceConfiguration::new(event.name, event.service_type, event.domain)
                            .with_interface(event.interface, event.protocol)
                            .with_properties(properties);
                    if let Some(port) = event.port {
                        configuration = configuration.with_port(port);
                    }

                    let emitted = state.live.upsert(configuration);
                    if emitted.is_none() {
                        debug!("Duplicate announcement suppressed");
                    }
                    emitted
                }
                RawEventKind::Removed => {
                    let key = event.key();
                    match state.live.remove(&key) {
                        Some(configuration) => {
                            Some(ServiceEvent::new(ServiceEventKind::Removed, configuration))
                        }
                        None => {
                            debug!("Dropping removal of unknown service {}", key);
                            None
                        }
                    }
                }
            }
        };

        if let Some(event) = emitted {
            self.emit(event);
        }
    }

    fn emit(&self, event: ServiceEvent) {
        debug!(
            "Service {:?}: {} ({})",
            event.kind(),
            event.name(),
            event.configuration().service_type()
        );
        self.handlers.dispatch(&event);

        if self.sender.receiver_count() > 0 {
            if let Err(e) = self.sender.send(event) {
                warn!("Failed to send service event: {}", e);
            }
        }
    }
}

impl Drop for BrowserInner {
    fn drop(&mut self) {
        let subscription = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .subscription
            .take();
        if let Some(subscription) = subscription {
            debug!(
                "Releasing subscription for {}.{} on drop",
                self.service_type, self.domain
            );
            if let Err(e) = self.adapter.unsubscribe(subscription) {
                error!("Error releasing browser subscription in drop: {}", e);
            }
        }
    }
}
