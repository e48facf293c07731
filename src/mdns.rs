use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo, TxtProperty};

use crate::adapter::{
    AdapterCallback, AdapterSignal, DiscoveryAdapter, DiscoveryLock, PublishRecord, RawEvent,
    RawEventKind, Subscription,
};
use crate::config::DiscoveryConfig;
use crate::configuration::{INTERFACE_UNSPECIFIED, Protocol, split_property};
use crate::error::{Result, ServiceDiscoError};
use crate::txt;

/// Host name announced when a published record does not name one.
const DEFAULT_HOST: &str = "localhost.local.";

/// One browse worker thread and the means to stop it.
struct Worker {
    browse_name: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// A [`DiscoveryAdapter`] backed by an `mdns-sd` daemon.
///
/// Each subscription gets its own worker thread draining the daemon's browse
/// channel; every callback runs with the adapter's discovery lock held.
pub struct MdnsAdapter {
    mdns: ServiceDaemon,
    lock: DiscoveryLock,
    workers: Mutex<HashMap<u64, Worker>>,
    next_id: AtomicU64,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    shut_down: AtomicBool,
}

/// Composes the name the daemon browses for, e.g. `_foo._tcp.local.`.
pub fn browse_name(service_type: &str, domain: &str) -> String {
    format!(
        "{}.{}.",
        service_type.trim_end_matches('.'),
        domain.trim_matches('.')
    )
}

/// Strips the `.<type>.<domain>.` suffix off a full instance name.
fn instance_name(fullname: &str, type_domain: &str) -> String {
    fullname
        .strip_suffix(type_domain)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MdnsAdapter {
    /// Creates an adapter with default timings.
    ///
    /// # Errors
    /// Returns `ServiceDiscoError::MdnsError` if the mDNS daemon fails to initialize.
    pub fn new() -> Result<Self> {
        Self::with_config(&DiscoveryConfig::default())
    }

    /// Creates an adapter using the timing fields of `config`.
    pub fn with_config(config: &DiscoveryConfig) -> Result<Self> {
        let mdns = ServiceDaemon::new().map_err(|e| {
            error!("Failed to create mDNS service daemon: {}", e);
            ServiceDiscoError::MdnsError(e)
        })?;

        Ok(MdnsAdapter {
            mdns,
            lock: DiscoveryLock::new(),
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Converts a daemon event into a raw event for the subscribed (type, domain).
    fn raw_event(event: ServiceEvent, service_type: &str, domain: &str) -> Option<RawEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let properties: Vec<String> = info
                    .get_properties()
                    .iter()
                    .map(|prop| match prop.val() {
                        Some(_) => format!("{}={}", prop.key(), prop.val_str()),
                        None => prop.key().to_string(),
                    })
                    .collect();

                Some(RawEvent {
                    kind: RawEventKind::Resolved,
                    interface: INTERFACE_UNSPECIFIED,
                    protocol: Protocol::Unspecified,
                    name: instance_name(info.get_fullname(), info.get_type()),
                    service_type: service_type.to_string(),
                    domain: domain.to_string(),
                    port: Some(info.get_port()),
                    txt: Some(txt::encode(&properties)),
                })
            }
            ServiceEvent::ServiceRemoved(type_domain, fullname) => Some(RawEvent {
                kind: RawEventKind::Removed,
                interface: INTERFACE_UNSPECIFIED,
                protocol: Protocol::Unspecified,
                name: instance_name(&fullname, &type_domain),
                service_type: service_type.to_string(),
                domain: domain.to_string(),
                port: None,
                txt: None,
            }),
            other => {
                debug!("Ignoring mDNS event: {:?}", other);
                None
            }
        }
    }

    /// Worker loop: drain the browse channel until stopped or disconnected.
    fn run_worker(
        receiver: Receiver<ServiceEvent>,
        stop: Arc<AtomicBool>,
        lock: DiscoveryLock,
        callback: AdapterCallback,
        service_type: String,
        domain: String,
        poll_interval: Duration,
    ) {
        debug!("mDNS browse worker started for {}.{}", service_type, domain);

        while !stop.load(Ordering::Acquire) {
            match receiver.recv_timeout(poll_interval) {
                Ok(event) => {
                    if let Some(raw) = Self::raw_event(event, &service_type, &domain) {
                        let _guard = lock.lock();
                        callback(AdapterSignal::Event(raw));
                    }
                }
                Err(_) if receiver.is_disconnected() => {
                    if !stop.load(Ordering::Acquire) {
                        let reason = format!(
                            "mDNS browse channel for {}.{} closed unexpectedly",
                            service_type, domain
                        );
                        warn!("{}", reason);
                        let _guard = lock.lock();
                        callback(AdapterSignal::Stalled(reason));
                    }
                    break;
                }
                Err(_) => {}
            }
        }

        debug!("mDNS browse worker finished for {}.{}", service_type, domain);
    }

    fn stop_worker(&self, id: u64, worker: Worker) -> Result<()> {
        worker.stop.store(true, Ordering::Release);

        let stopped = self.mdns.stop_browse(&worker.browse_name).map_err(|e| {
            error!(
                "Failed to stop mDNS browser for '{}': {}",
                worker.browse_name, e
            );
            ServiceDiscoError::MdnsError(e)
        });

        if worker.handle.thread().id() == thread::current().id() {
            debug!("Worker #{} released from its own thread, not joining", id);
        } else if worker.handle.join().is_err() {
            error!("mDNS browse worker #{} panicked", id);
        }

        stopped
    }

    /// Stops every worker and shuts the daemon down. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down mDNS adapter");

        let workers: Vec<(u64, Worker)> = guard(&self.workers).drain().collect();
        for (id, worker) in workers {
            if let Err(e) = self.stop_worker(id, worker) {
                warn!("Error stopping browse worker during shutdown: {}", e);
            }
        }

        let status_receiver = self.mdns.shutdown().map_err(|e| {
            error!("Failed to initiate mDNS daemon shutdown: {}", e);
            ServiceDiscoError::ShutdownError(format!(
                "Failed to initiate mDNS daemon shutdown: {}",
                e
            ))
        })?;

        match status_receiver.recv_timeout(self.shutdown_timeout) {
            Ok(_) => {
                info!("mDNS daemon shut down successfully.");
                Ok(())
            }
            Err(e) => {
                let error_msg = format!("Waiting for mDNS daemon shutdown failed: {}", e);
                error!("{}", error_msg);
                Err(ServiceDiscoError::ShutdownError(error_msg))
            }
        }
    }

    fn service_info(record: &PublishRecord) -> Result<ServiceInfo> {
        let properties: Vec<TxtProperty> = record
            .properties
            .iter()
            .map(|entry| split_property(entry).into())
            .collect();
        let host = record.host.as_deref().unwrap_or(DEFAULT_HOST);

        let info = ServiceInfo::new(
            &browse_name(&record.service_type, &record.domain),
            &record.name,
            host,
            (),
            record.port,
            properties,
        )
        .map_err(|e| {
            error!("Failed to create service info for '{}': {}", record.name, e);
            ServiceDiscoError::MdnsError(e)
        })?;

        Ok(info.enable_addr_auto())
    }
}

impl DiscoveryAdapter for MdnsAdapter {
    fn subscribe(
        &self,
        service_type: &str,
        domain: &str,
        callback: AdapterCallback,
    ) -> Result<Subscription> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ServiceDiscoError::StateError(
                "mDNS adapter has been shut down".into(),
            ));
        }

        let name = browse_name(service_type, domain);
        info!("Starting mDNS browse for: {}", name);

        let receiver = self.mdns.browse(&name).map_err(|e| {
            error!("Failed to create mDNS browser: {}", e);
            ServiceDiscoError::BrowseFailed(format!("Failed to browse '{}': {}", name, e))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let spawned = {
            let stop = Arc::clone(&stop);
            let lock = self.lock.clone();
            let service_type = service_type.to_string();
            let domain = domain.to_string();
            let poll_interval = self.poll_interval;
            thread::Builder::new()
                .name(format!("mdns-browse-{}", id))
                .spawn(move || {
                    Self::run_worker(
                        receiver,
                        stop,
                        lock,
                        callback,
                        service_type,
                        domain,
                        poll_interval,
                    )
                })
        };

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn browse worker for '{}': {}", name, e);
                if let Err(e) = self.mdns.stop_browse(&name) {
                    warn!("Failed to roll back mDNS browse for '{}': {}", name, e);
                }
                return Err(ServiceDiscoError::IoError(e));
            }
        };

        guard(&self.workers).insert(
            id,
            Worker {
                browse_name: name,
                stop,
                handle,
            },
        );

        Ok(Subscription {
            id,
            service_type: service_type.to_string(),
            domain: domain.to_string(),
        })
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let worker = guard(&self.workers).remove(&subscription.id);
        match worker {
            Some(worker) => {
                info!("Stopping mDNS browse for: {}", worker.browse_name);
                self.stop_worker(subscription.id, worker)
            }
            None => {
                debug!("Subscription #{} already released", subscription.id);
                Ok(())
            }
        }
    }

    fn publish(&self, record: &PublishRecord) -> Result<()> {
        info!(
            "Registering service: instance='{}', type='{}'",
            record.name, record.service_type
        );
        let info = Self::service_info(record)?;
        self.mdns.register(info).map_err(|e| {
            error!("Failed to register mDNS service: {}", e);
            ServiceDiscoError::PublishFailed(format!(
                "Failed to register '{}': {}",
                record.name, e
            ))
        })
    }

    fn unpublish(&self, record: &PublishRecord) -> Result<()> {
        let fullname = format!(
            "{}.{}",
            record.name,
            browse_name(&record.service_type, &record.domain)
        );
        info!("Unregistering service: {}", fullname);

        let status = self.mdns.unregister(&fullname).map_err(|e| {
            error!("Failed to unregister mDNS service: {}", e);
            ServiceDiscoError::PublishFailed(format!("Failed to unregister '{}': {}", fullname, e))
        })?;

        match status.recv_timeout(self.shutdown_timeout) {
            Ok(status) => {
                debug!("Unregister status for {}: {:?}", fullname, status);
                Ok(())
            }
            Err(e) => {
                warn!("No unregister confirmation for {}: {}", fullname, e);
                Ok(())
            }
        }
    }

    fn lock(&self) -> &DiscoveryLock {
        &self.lock
    }
}

impl Drop for MdnsAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Error during automatic shutdown in drop: {}", e);
        }
    }
}
