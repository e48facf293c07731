use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::adapter::DiscoveryAdapter;
use crate::browser::ServiceBrowser;
use crate::config::{DEFAULT_EVENT_CAPACITY, DiscoveryConfig, validate_service_type};
use crate::configuration::ServiceConfiguration;
use crate::error::{Result, ServiceDiscoError};
use crate::event::{ServiceEvent, ServiceEventKind};
use crate::handlers::HandlerList;
use crate::pattern::ServicePattern;

/// Subscription points of the aggregator, shared with every owned browser.
struct Surfaces {
    added: HandlerList,
    removed: HandlerList,
    updated: HandlerList,
    sender: broadcast::Sender<ServiceEvent>,
}

impl Surfaces {
    fn forward(&self, event: &ServiceEvent) {
        let handlers = match event.kind() {
            ServiceEventKind::Added => &self.added,
            ServiceEventKind::Removed => &self.removed,
            ServiceEventKind::Updated => {
                if self.updated.is_empty() {
                    return;
                }
                &self.updated
            }
        };
        handlers.dispatch(event);

        if self.sender.receiver_count() > 0 {
            if let Err(e) = self.sender.send(event.clone()) {
                warn!("Failed to send merged service event: {}", e);
            }
        }
    }
}

struct DiscoveryState {
    service_types: Vec<String>,
    domains: Vec<String>,
    browsers: Vec<ServiceBrowser>,
    stopped: bool,
}

/// Owns one [`ServiceBrowser`] per (service type, domain) and merges them.
pub struct ServiceDiscovery {
    adapter: Arc<dyn DiscoveryAdapter>,
    state: Mutex<DiscoveryState>,
    surfaces: Arc<Surfaces>,
    capacity: usize,
}

impl ServiceDiscovery {
    pub fn new(adapter: Arc<dyn DiscoveryAdapter>) -> Self {
        Self::with_capacity(adapter, DEFAULT_EVENT_CAPACITY)
    }

    fn with_capacity(adapter: Arc<dyn DiscoveryAdapter>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        ServiceDiscovery {
            adapter,
            state: Mutex::new(DiscoveryState {
                service_types: Vec::new(),
                domains: Vec::new(),
                browsers: Vec::new(),
                stopped: false,
            }),
            surfaces: Arc::new(Surfaces {
                added: HandlerList::default(),
                removed: HandlerList::default(),
                updated: HandlerList::default(),
                sender,
            }),
            capacity,
        }
    }

    /// Registers the configured service types and listens on the configured domains.
    ///
    /// Handlers connected afterwards miss the events of services already
    /// resolved by then; use [`ServiceDiscovery::get_services`] to catch up.
    pub fn from_config(adapter: Arc<dyn DiscoveryAdapter>, config: &DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let discovery = Self::with_capacity(adapter, config.event_channel_capacity);
        for service_type in &config.service_types {
            discovery.add_service_type(service_type.as_str())?;
        }
        discovery.listen_on(config.domains.iter().cloned())?;
        Ok(discovery)
    }

    fn state(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a service type. When already listening, a browser for it is
    /// started in every current domain. Registering a known type again
    /// retries the browsers that failed to start.
    pub fn add_service_type(&self, service_type: impl Into<String>) -> Result<()> {
        let service_type = service_type.into();
        validate_service_type(&service_type)?;

        let mut state = self.state();
        Self::ensure_usable(&state)?;
        if state.service_types.contains(&service_type) {
            // Still started below: an earlier registration may have failed
            // to start some of its browsers.
            debug!("Service type {} already registered", service_type);
        } else {
            state.service_types.push(service_type.clone());
        }

        let domains = state.domains.clone();
        for domain in domains {
            self.ensure_browser(&mut state, &service_type, &domain)?;
        }
        Ok(())
    }

    /// Makes sure a started browser exists for every registered type in each
    /// of `domains`. Stops at the first browser that fails to start; browsers
    /// started before it are kept.
    pub fn listen_on<I>(&self, domains: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut state = self.state();
        Self::ensure_usable(&state)?;

        for domain in domains {
            let domain: String = domain.into();
            let domain = domain.trim_matches('.').to_string();
            if domain.is_empty() {
                return Err(ServiceDiscoError::ConfigError(
                    "Domain cannot be empty".into(),
                ));
            }
            if !state.domains.contains(&domain) {
                info!("Listening on domain: {}", domain);
                state.domains.push(domain.clone());
            }

            let service_types = state.service_types.clone();
            for service_type in service_types {
                self.ensure_browser(&mut state, &service_type, &domain)?;
            }
        }
        Ok(())
    }

    fn ensure_usable(state: &DiscoveryState) -> Result<()> {
        if state.stopped {
            return Err(ServiceDiscoError::StateError(
                "Service discovery has been stopped".into(),
            ));
        }
        Ok(())
    }

    fn ensure_browser(
        &self,
        state: &mut DiscoveryState,
        service_type: &str,
        domain: &str,
    ) -> Result<()> {
        if let Some(browser) = state
            .browsers
            .iter()
            .find(|b| b.service_type() == service_type && b.domain() == domain)
        {
            return browser.start();
        }

        let browser = ServiceBrowser::with_capacity(
            Arc::clone(&self.adapter),
            service_type,
            domain,
            self.capacity,
        )?;
        let surfaces = Arc::clone(&self.surfaces);
        browser.connect(move |event| surfaces.forward(event));
        browser.start()?;
        state.browsers.push(browser);
        Ok(())
    }

    pub fn added_component_connect<F>(&self, handler: F)
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.surfaces.added.connect(Arc::new(handler));
    }

    pub fn removed_component_connect<F>(&self, handler: F)
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.surfaces.removed.connect(Arc::new(handler));
    }

    /// Opts in to `Updated` events, which are otherwise not re-exposed here.
    pub fn updated_component_connect<F>(&self, handler: F)
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.surfaces.updated.connect(Arc::new(handler));
    }

    /// Merged event stream, carrying the same events as the handler surfaces.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.surfaces.sender.subscribe()
    }

    fn browser_handles(&self) -> Vec<ServiceBrowser> {
        self.state().browsers.clone()
    }

    /// The (service type, domain) pairs currently browsed, in creation order.
    pub fn browsers(&self) -> Vec<(String, String)> {
        self.browser_handles()
            .iter()
            .map(|b| (b.service_type().to_string(), b.domain().to_string()))
            .collect()
    }

    /// Snapshot of every owned browser's live set, browser by browser.
    pub fn get_services(&self) -> Vec<ServiceConfiguration> {
        self.browser_handles()
            .iter()
            .flat_map(|b| b.get_services())
            .collect()
    }

    /// Lazily filters the merged snapshot, in browser creation order and then
    /// in each browser's insertion order.
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

    /// Stops every browser in creation order, delivering a `Removed` event for
    /// each known service. The aggregator cannot be reused afterwards.
    pub fn stop(&self) -> Result<()> {
        let browsers = {
            let mut state = self.state();
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            std::mem::take(&mut state.browsers)
        };

        info!("Stopping service discovery ({} browsers)", browsers.len());
        let mut first_error = None;
        for browser in browsers {
            if let Err(e) = browser.stop() {
                error!(
                    "Failed to stop browser for {}.{}: {}",
                    browser.service_type(),
                    browser.domain(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error during automatic stop in drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RawEvent;
    use crate::configuration::{Protocol, ServiceKey};
    use crate::memory::MemoryAdapter;
    use crate::pattern::PropertyPattern;
    use crate::txt;

    fn resolved(name: &str, service_type: &str, domain: &str, properties: &[&str]) -> RawEvent {
        RawEvent::resolved(
            ServiceKey {
                name: name.to_string(),
                service_type: service_type.to_string(),
                domain: domain.to_string(),
                interface: 1,
                protocol: Protocol::IPv4,
            },
            4000,
            txt::encode(properties),
        )
    }

    fn names(services: impl Iterator<Item = ServiceConfiguration>) -> Vec<String> {
        services.map(|s| s.name().to_string()).collect()
    }

    #[test]
    fn test_registering_type_while_listening_starts_browsers() {
        let adapter = Arc::new(MemoryAdapter::new());
        let discovery = ServiceDiscovery::new(adapter.clone());
        discovery.add_service_type("_a._tcp").unwrap();
        discovery.listen_on(["local", "lab"]).unwrap();
        assert_eq!(adapter.subscriber_count(), 2);

        discovery.add_service_type("_b._tcp").unwrap();
        assert_eq!(
            discovery.browsers(),
            vec![
                ("_a._tcp".to_string(), "local".to_string()),
                ("_a._tcp".to_string(), "lab".to_string()),
                ("_b._tcp".to_string(), "local".to_string()),
                ("_b._tcp".to_string(), "lab".to_string()),
            ]
        );

        // Listening again on a known domain creates nothing new.
        discovery.listen_on(["local"]).unwrap();
        assert_eq!(adapter.subscriber_count(), 4);
    }

    #[test]
    fn test_updated_not_reexposed_without_opt_in() {
        let adapter = Arc::new(MemoryAdapter::new());
        let discovery = ServiceDiscovery::new(adapter.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let added = seen.clone();
        discovery.added_component_connect(move |e| added.lock().unwrap().push(("added", e.kind())));
        let removed = seen.clone();
        discovery
            .removed_component_connect(move |e| removed.lock().unwrap().push(("removed", e.kind())));
        discovery.add_service_type("_a._tcp").unwrap();
        discovery.listen_on(["local"]).unwrap();

        adapter.push(resolved("x", "_a._tcp", "local", &["v=1"]));
        adapter.push(resolved("x", "_a._tcp", "local", &["v=2"]));
        adapter.run_pending();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("added", ServiceEventKind::Added)]
        );

        let updates = Arc::new(Mutex::new(0));
        let counter = updates.clone();
        discovery.updated_component_connect(move |_| *counter.lock().unwrap() += 1);
        adapter.emit(resolved("x", "_a._tcp", "local", &["v=3"]));
        assert_eq!(*updates.lock().unwrap(), 1);
    }

    #[test]
    fn test_find_services_merges_browsers_in_order() {
        let adapter = Arc::new(MemoryAdapter::new());
        let discovery = ServiceDiscovery::new(adapter.clone());
        discovery.add_service_type("_a._tcp").unwrap();
        discovery.add_service_type("_b._tcp").unwrap();
        discovery.listen_on(["local"]).unwrap();

        adapter.push(resolved("b1", "_b._tcp", "local", &[]));
        adapter.push(resolved("a1", "_a._tcp", "local", &[]));
        adapter.push(resolved("a2", "_a._tcp", "local", &[]));
        adapter.push(resolved("b2", "_b._tcp", "local", &[]));
        adapter.run_pending();

        let all = PropertyPattern::default();
        assert_eq!(
            names(discovery.find_services(&all)),
            vec!["a1", "a2", "b1", "b2"]
        );

        let only_b = PropertyPattern::new("type", "^_b").unwrap();
        assert_eq!(names(discovery.find_services(&only_b)), vec!["b1", "b2"]);
    }

    #[test]
    fn test_stop_cascades_removed_and_disables() {
        let adapter = Arc::new(MemoryAdapter::new());
        let discovery = ServiceDiscovery::new(adapter.clone());
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        discovery.removed_component_connect(move |e| sink.lock().unwrap().push(e.name().to_string()));
        discovery.add_service_type("_a._tcp").unwrap();
        discovery.add_service_type("_b._tcp").unwrap();
        discovery.listen_on(["local"]).unwrap();
        adapter.push(resolved("a1", "_a._tcp", "local", &[]));
        adapter.push(resolved("b1", "_b._tcp", "local", &[]));
        adapter.run_pending();

        discovery.stop().unwrap();
        assert_eq!(*removed.lock().unwrap(), vec!["a1", "b1"]);
        assert!(discovery.is_stopped());
        assert!(discovery.get_services().is_empty());
        assert!(matches!(
            discovery.listen_on(["local"]),
            Err(ServiceDiscoError::StateError(_))
        ));
        assert_eq!(adapter.subscriber_count(), 0);
    }

    #[test]
    fn test_failed_type_registration_can_be_retried() {
        let adapter = Arc::new(MemoryAdapter::new());
        let discovery = ServiceDiscovery::new(adapter.clone());
        discovery.listen_on(["local"]).unwrap();

        adapter.refuse_subscriptions(true);
        assert!(matches!(
            discovery.add_service_type("_a._tcp"),
            Err(ServiceDiscoError::BrowseFailed(_))
        ));
        assert!(discovery.browsers().is_empty());

        adapter.refuse_subscriptions(false);
        discovery.add_service_type("_a._tcp").unwrap();
        assert_eq!(
            discovery.browsers(),
            vec![("_a._tcp".to_string(), "local".to_string())]
        );
        assert_eq!(adapter.subscriber_count(), 1);

        // A healthy type registered twice stays a single browser.
        discovery.add_service_type("_a._tcp").unwrap();
        assert_eq!(adapter.subscriber_count(), 1);
    }

    #[test]
    fn test_duplicate_domains_in_one_call() {
        let adapter = Arc::new(MemoryAdapter::new());
        let discovery = ServiceDiscovery::new(adapter.clone());
        discovery.add_service_type("_a._tcp").unwrap();
        discovery.listen_on(["local", "local.", "local"]).unwrap();
        assert_eq!(
            discovery.browsers(),
            vec![("_a._tcp".to_string(), "local".to_string())]
        );
        assert_eq!(adapter.subscriber_count(), 1);
    }

    #[test]
    fn test_from_config_rejects_oversized_capacity() {
        let adapter = Arc::new(MemoryAdapter::new());
        let config = DiscoveryConfig {
            event_channel_capacity: usize::MAX,
            ..DiscoveryConfig::default()
        };
        assert!(matches!(
            ServiceDiscovery::from_config(adapter, &config),
            Err(ServiceDiscoError::ConfigError(_))
        ));
    }

    #[test]
    fn test_listen_on_surfaces_refusal() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.refuse_subscriptions(true);
        let discovery = ServiceDiscovery::new(adapter.clone());
        discovery.add_service_type("_a._tcp").unwrap();
        assert!(matches!(
            discovery.listen_on(["local"]),
            Err(ServiceDiscoError::BrowseFailed(_))
        ));
        assert!(discovery.browsers().is_empty());
    }
}
