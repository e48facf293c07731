use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use log::error;

use crate::event::ServiceEvent;

/// Callback invoked with every delivered [`ServiceEvent`].
pub type EventHandler = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

/// Ordered list of event handlers. A panicking handler is logged and skipped.
#[derive(Default)]
pub(crate) struct HandlerList {
    handlers: RwLock<Vec<EventHandler>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl HandlerList {
    pub(crate) fn connect(&self, handler: EventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Calls every handler in registration order.
    pub(crate) fn dispatch(&self, event: &ServiceEvent) {
        // Snapshot so a handler may connect further handlers.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                error!(
                    "Event handler #{} failed on {:?} of '{}': {}",
                    index,
                    event.kind(),
                    event.name(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}
