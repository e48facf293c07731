use std::sync::Arc;

use log::{error, info, warn};

use crate::adapter::{DiscoveryAdapter, PublishRecord};
use crate::config::validate_service_type;
use crate::configuration::{INTERFACE_UNSPECIFIED, Protocol};
use crate::error::{Result, ServiceDiscoError};

/// A service announced by this process.
///
/// The service is withdrawn when the value is dropped.
pub struct LocalService {
    adapter: Arc<dyn DiscoveryAdapter>,
    record: PublishRecord,
    published: bool,
}

impl LocalService {
    /// Describes a service in the `local` domain on all interfaces. Nothing
    /// is announced until [`LocalService::publish`].
    ///
    /// # Errors
    /// Returns `ServiceDiscoError::ConfigError` for an empty name or a
    /// malformed service type.
    pub fn new<I, S>(
        adapter: Arc<dyn DiscoveryAdapter>,
        name: impl Into<String>,
        service_type: impl Into<String>,
        port: u16,
        properties: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let service_type = service_type.into();
        if name.is_empty() {
            return Err(ServiceDiscoError::ConfigError(
                "Instance name cannot be empty".into(),
            ));
        }
        validate_service_type(&service_type)?;

        Ok(LocalService {
            adapter,
            record: PublishRecord {
                name,
                service_type,
                domain: "local".to_string(),
                interface: INTERFACE_UNSPECIFIED,
                protocol: Protocol::Unspecified,
                host: None,
                port,
                properties: properties.into_iter().map(Into::into).collect(),
            },
            published: false,
        })
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.record.domain = domain.into();
        self
    }

    pub fn with_interface(mut self, interface: i32, protocol: Protocol) -> Self {
        self.record.interface = interface;
        self.record.protocol = protocol;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.record.host = Some(host.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn properties(&self) -> &[String] {
        &self.record.properties
    }

    pub fn record(&self) -> &PublishRecord {
        &self.record
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Announces the service.
    ///
    /// # Errors
    /// `ServiceDiscoError::StateError` if it is already published, or the
    /// adapter's error if it refuses the registration.
    pub fn publish(&mut self) -> Result<()> {
        if self.published {
            return Err(ServiceDiscoError::StateError(format!(
                "Service '{}' is already published",
                self.record.name
            )));
        }
        self.adapter.publish(&self.record)?;
        self.published = true;
        info!("Service published: {}", self.record.name);
        Ok(())
    }

    /// Withdraws the service. A no-op if it is not published.
    ///
    /// The service stays published if the adapter fails to withdraw it.
    pub fn unpublish(&mut self) -> Result<()> {
        if !self.published {
            return Ok(());
        }
        self.adapter.unpublish(&self.record)?;
        self.published = false;
        info!("Service unpublished: {}", self.record.name);
        Ok(())
    }

    /// Replaces the property list and re-announces the service if published.
    ///
    /// Runs under the adapter's discovery lock, so it must not be called from
    /// an event handler.
    pub fn update_properties<I, S>(&mut self, properties: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = self.adapter.lock().lock();
        self.record.properties = properties.into_iter().map(Into::into).collect();
        if !self.published {
            return Ok(());
        }

        info!("Updating properties of service: {}", self.record.name);
        self.adapter.publish(&self.record).map_err(|e| {
            warn!(
                "Failed to re-publish '{}' after property update: {}",
                self.record.name, e
            );
            e
        })
    }
}

impl Drop for LocalService {
    fn drop(&mut self) {
        if let Err(e) = self.unpublish() {
            error!("Error unpublishing '{}' in drop: {}", self.record.name, e);
        }
    }
}
