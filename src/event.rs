use serde::Serialize;

use crate::configuration::ServiceConfiguration;

/// The transition a [`ServiceEvent`] reports.
#[derive(Clone, Copy, Debug, Serialize, Hash, PartialEq, Eq)]
pub enum ServiceEventKind {
    /// A service instance was seen for the first time.
    Added,
    /// A known service instance went away, or its browser was stopped.
    Removed,
    /// A known service instance re-announced itself with different properties.
    Updated,
}

/// One transition of the live service set.
///
/// Only browsers and the aggregator create these.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ServiceEvent {
    kind: ServiceEventKind,
    configuration: ServiceConfiguration,
}

impl ServiceEvent {
    pub(crate) fn new(kind: ServiceEventKind, configuration: ServiceConfiguration) -> Self {
        ServiceEvent {
            kind,
            configuration,
        }
    }

    pub fn kind(&self) -> ServiceEventKind {
        self.kind
    }

    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    /// Shorthand for the configuration's instance name.
    pub fn name(&self) -> &str {
        self.configuration.name()
    }
}
