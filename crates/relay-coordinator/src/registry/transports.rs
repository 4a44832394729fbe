//! Per-session WebRTC transports.
//!
//! At most one transport per `(session, direction)`. Creating a second one
//! replaces and closes the first.

use super::{relay_unavailable, CapabilityRegistry, RegistrySettings};
use crate::errors::CoordinatorError;
use crate::relay::{with_timeout, DtlsParameters, RelayError, RelayRouter, TransportParams};
use crate::types::{Direction, SessionId, TransportId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct TransportEntry {
    id: TransportId,
    connected: bool,
}

/// Tracks the producing and consuming transport of every session.
pub struct TransportRegistry {
    capabilities: Arc<CapabilityRegistry>,
    settings: Arc<RegistrySettings>,
    transports: RwLock<HashMap<(SessionId, Direction), TransportEntry>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new(capabilities: Arc<CapabilityRegistry>, settings: Arc<RegistrySettings>) -> Self {
        Self {
            capabilities,
            settings,
            transports: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a transport at the relay and store it for the session.
    ///
    /// # Errors
    ///
    /// `NotReady` without a router, `RelayUnavailable` if allocation fails or
    /// times out. A failed bitrate cap is logged, not returned.
    pub async fn create_transport(
        &self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<TransportParams, CoordinatorError> {
        let router = self.capabilities.router()?;
        let limit = self.settings.relay_call_timeout;

        let params = with_timeout(
            "create_webrtc_transport",
            limit,
            router.create_webrtc_transport(&self.settings.transport_options),
        )
        .await
        .map_err(|e| relay_unavailable("create_webrtc_transport", e))?;

        if let Some(bitrate) = self.settings.max_incoming_bitrate {
            if let Err(e) = with_timeout(
                "set_max_incoming_bitrate",
                limit,
                router.set_max_incoming_bitrate(&params.id, bitrate),
            )
            .await
            {
                warn!(
                    target: "rc.registry.transport",
                    session_id = %session_id,
                    transport_id = %params.id,
                    bitrate = bitrate,
                    error = %e,
                    "Failed to apply max incoming bitrate"
                );
            }
        }

        let previous = self.transports.write().await.insert(
            (session_id, direction),
            TransportEntry {
                id: params.id.clone(),
                connected: false,
            },
        );

        info!(
            target: "rc.registry.transport",
            session_id = %session_id,
            direction = direction.as_str(),
            transport_id = %params.id,
            replaced = previous.is_some(),
            "Transport created"
        );

        if let Some(previous) = previous {
            self.close_at_relay(&router, &previous.id).await;
        }

        Ok(params)
    }

    /// Forward the client's DTLS parameters to the session's transport.
    ///
    /// # Errors
    ///
    /// `UnknownTransport` if the session has no transport of this direction,
    /// `TransportAlreadyConnected` on a second connect, `RelayUnavailable` if
    /// the relay call fails.
    pub async fn connect_transport(
        &self,
        session_id: SessionId,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), CoordinatorError> {
        let entry = self
            .transports
            .read()
            .await
            .get(&(session_id, direction))
            .cloned()
            .ok_or(CoordinatorError::UnknownTransport(direction))?;
        if entry.connected {
            return Err(CoordinatorError::TransportAlreadyConnected(direction));
        }

        let router = self.capabilities.router()?;
        with_timeout(
            "connect_transport",
            self.settings.relay_call_timeout,
            router.connect_transport(&entry.id, dtls_parameters),
        )
        .await
        .map_err(|e| match e {
            RelayError::InvalidState(_) => CoordinatorError::TransportAlreadyConnected(direction),
            other => relay_unavailable("connect_transport", other),
        })?;

        let mut transports = self.transports.write().await;
        match transports.get_mut(&(session_id, direction)) {
            Some(current) if current.id == entry.id => current.connected = true,
            // Replaced or released while the call was outstanding
            _ => return Err(CoordinatorError::UnknownTransport(direction)),
        }
        drop(transports);

        debug!(
            target: "rc.registry.transport",
            session_id = %session_id,
            direction = direction.as_str(),
            transport_id = %entry.id,
            "Transport connected"
        );
        Ok(())
    }

    /// The id of the session's transport, if it exists and is connected.
    ///
    /// # Errors
    ///
    /// `TransportNotReady` otherwise.
    pub async fn connected_transport(
        &self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<TransportId, CoordinatorError> {
        match self.transports.read().await.get(&(session_id, direction)) {
            Some(entry) if entry.connected => Ok(entry.id.clone()),
            _ => Err(CoordinatorError::TransportNotReady(direction)),
        }
    }

    /// Remove and close every transport the session owns.
    pub async fn release_session(&self, session_id: SessionId) -> Vec<TransportId> {
        let released: Vec<TransportId> = {
            let mut transports = self.transports.write().await;
            [Direction::Producing, Direction::Consuming]
                .into_iter()
                .filter_map(|direction| transports.remove(&(session_id, direction)))
                .map(|entry| entry.id)
                .collect()
        };

        if let Ok(router) = self.capabilities.router() {
            for id in &released {
                self.close_at_relay(&router, id).await;
            }
        }

        if !released.is_empty() {
            debug!(
                target: "rc.registry.transport",
                session_id = %session_id,
                count = released.len(),
                "Session transports released"
            );
        }
        released
    }

    pub async fn transport_count(&self) -> usize {
        self.transports.read().await.len()
    }

    async fn close_at_relay(&self, router: &Arc<dyn RelayRouter>, id: &TransportId) {
        if let Err(e) = with_timeout(
            "close_transport",
            self.settings.relay_call_timeout,
            router.close_transport(id),
        )
        .await
        {
            warn!(
                target: "rc.registry.transport",
                transport_id = %id,
                error = %e,
                "Failed to close transport at relay"
            );
        }
    }
}
