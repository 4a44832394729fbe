//! Registries holding the coordinator's shared state.
//!
//! Locks inside the registries are never held across a relay call. Each
//! operation reads what it needs, releases the lock, calls the relay, and
//! re-validates before committing.

pub mod capabilities;
pub mod endpoints;
pub mod transports;

pub use capabilities::CapabilityRegistry;
pub use endpoints::{ConsumerDescriptor, MediaEndpointRegistry, ProducerSnapshot};
pub use transports::TransportRegistry;

use crate::bus::NotificationBus;
use crate::config::Config;
use crate::errors::CoordinatorError;
use crate::relay::{RelayError, WebRtcTransportOptions};
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by the registries.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub transport_options: WebRtcTransportOptions,
    /// Per-transport incoming bitrate cap, applied best-effort.
    pub max_incoming_bitrate: Option<u32>,
    /// Bound on every relay call.
    pub relay_call_timeout: Duration,
}

impl RegistrySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            transport_options: config.transport_options(),
            max_incoming_bitrate: config.max_incoming_bitrate,
            relay_call_timeout: config.relay_call_timeout,
        }
    }
}

/// The registry set one coordinator works against.
#[derive(Clone)]
pub struct Registries {
    pub capabilities: Arc<CapabilityRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub endpoints: Arc<MediaEndpointRegistry>,
    pub bus: Arc<NotificationBus>,
}

impl Registries {
    #[must_use]
    pub fn new(settings: RegistrySettings) -> Self {
        let settings = Arc::new(settings);
        let capabilities = Arc::new(CapabilityRegistry::new());
        let bus = Arc::new(NotificationBus::new());
        let transports = Arc::new(TransportRegistry::new(
            Arc::clone(&capabilities),
            Arc::clone(&settings),
        ));
        let endpoints = Arc::new(MediaEndpointRegistry::new(
            Arc::clone(&capabilities),
            Arc::clone(&transports),
            Arc::clone(&bus),
            settings,
        ));

        Self {
            capabilities,
            transports,
            endpoints,
            bus,
        }
    }
}

/// Map a failed relay call to the client-facing error, logging the cause.
pub(crate) fn relay_unavailable(operation: &'static str, err: RelayError) -> CoordinatorError {
    tracing::warn!(
        target: "rc.relay",
        operation = operation,
        error = %err,
        "Relay call failed"
    );
    CoordinatorError::RelayUnavailable(err.to_string())
}
