//! In-process transport adapter.
//!
//! Nothing touches the network: raw events are queued with
//! [`MemoryAdapter::push`] (or produced by publishing) and handed to
//! subscribers when the owner calls [`MemoryAdapter::run_pending`]. The
//! calling thread is the delivery context.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use log::debug;

use crate::adapter::{
    AdapterCallback, AdapterSignal, DiscoveryAdapter, DiscoveryLock, PublishRecord, RawEvent,
    Subscription,
};
use crate::configuration::ServiceKey;
use crate::error::{Result, ServiceDiscoError};
use crate::txt;

struct Pending {
    service_type: String,
    domain: String,
    signal: AdapterSignal,
}

struct Subscriber {
    id: u64,
    service_type: String,
    domain: String,
    callback: AdapterCallback,
}

/// A queue-driven [`DiscoveryAdapter`] for tests and embedding.
#[derive(Default)]
pub struct MemoryAdapter {
    lock: DiscoveryLock,
    next_id: AtomicU64,
    refuse: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    queue: Mutex<VecDeque<Pending>>,
    published: Mutex<HashMap<(String, String, String), PublishRecord>>,
    delivering: Mutex<Option<ThreadId>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `subscribe` fail, as an unreachable daemon would.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Queues a raw event for delivery.
    pub fn push(&self, event: RawEvent) {
        let pending = Pending {
            service_type: event.service_type.clone(),
            domain: event.domain.clone(),
            signal: AdapterSignal::Event(event),
        };
        guard(&self.queue).push_back(pending);
    }

    /// Queues a transport failure for every subscription on (type, domain).
    pub fn fail(&self, service_type: &str, domain: &str, reason: impl Into<String>) {
        guard(&self.queue).push_back(Pending {
            service_type: service_type.to_string(),
            domain: domain.to_string(),
            signal: AdapterSignal::Stalled(reason.into()),
        });
    }

    /// Queues `event` and delivers everything pending.
    pub fn emit(&self, event: RawEvent) -> usize {
        self.push(event);
        self.run_pending()
    }

    /// Delivers queued signals in FIFO order, each under the discovery lock.
    ///
    /// Returns the number of signals taken off the queue. Must not be called
    /// while holding the discovery lock or from inside a callback.
    pub fn run_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let _guard = self.lock.lock();
            let Some(pending) = guard(&self.queue).pop_front() else {
                break;
            };
            delivered += 1;
            *guard(&self.delivering) = Some(thread::current().id());

            let callbacks: Vec<AdapterCallback> = guard(&self.subscribers)
                .iter()
                .filter(|s| s.service_type == pending.service_type && s.domain == pending.domain)
                .map(|s| s.callback.clone())
                .collect();
            if callbacks.is_empty() {
                debug!(
                    "No subscriber for {}.{}, dropping signal",
                    pending.service_type, pending.domain
                );
            }
            for callback in callbacks {
                callback(pending.signal.clone());
            }
            *guard(&self.delivering) = None;
        }
        delivered
    }

    /// Number of signals waiting for [`MemoryAdapter::run_pending`].
    pub fn pending(&self) -> usize {
        guard(&self.queue).len()
    }

    pub fn subscriber_count(&self) -> usize {
        guard(&self.subscribers).len()
    }

    /// Snapshot of the currently published records.
    pub fn published(&self) -> Vec<PublishRecord> {
        guard(&self.published).values().cloned().collect()
    }

    fn record_key(record: &PublishRecord) -> ServiceKey {
        ServiceKey {
            name: record.name.clone(),
            service_type: record.service_type.clone(),
            domain: record.domain.clone(),
            interface: record.interface,
            protocol: record.protocol,
        }
    }
}

impl DiscoveryAdapter for MemoryAdapter {
    fn subscribe(
        &self,
        service_type: &str,
        domain: &str,
        callback: AdapterCallback,
    ) -> Result<Subscription> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ServiceDiscoError::BrowseFailed(format!(
                "Adapter refused subscription for {}.{}",
                service_type, domain
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        guard(&self.subscribers).push(Subscriber {
            id,
            service_type: service_type.to_string(),
            domain: domain.to_string(),
            callback,
        });
        debug!("Subscribed #{} to {}.{}", id, service_type, domain);

        Ok(Subscription {
            id,
            service_type: service_type.to_string(),
            domain: domain.to_string(),
        })
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        guard(&self.subscribers).retain(|s| s.id != subscription.id);
        // Wait out a delivery that already picked up the callback, unless
        // this is that delivery releasing its last browser handle.
        if *guard(&self.delivering) != Some(thread::current().id()) {
            drop(self.lock.lock());
        }
        debug!("Unsubscribed #{}", subscription.id);
        Ok(())
    }

    fn publish(&self, record: &PublishRecord) -> Result<()> {
        let id = (
            record.name.clone(),
            record.service_type.clone(),
            record.domain.clone(),
        );
        guard(&self.published).insert(id, record.clone());
        self.push(RawEvent::resolved(
            Self::record_key(record),
            record.port,
            txt::encode(&record.properties),
        ));
        Ok(())
    }

    fn unpublish(&self, record: &PublishRecord) -> Result<()> {
        let id = (
            record.name.clone(),
            record.service_type.clone(),
            record.domain.clone(),
        );
        if guard(&self.published).remove(&id).is_none() {
            return Err(ServiceDiscoError::PublishFailed(format!(
                "Service '{}' is not published",
                record.name
            )));
        }
        self.push(RawEvent::removed(Self::record_key(record)));
        Ok(())
    }

    fn lock(&self) -> &DiscoveryLock {
        &self.lock
    }
}
