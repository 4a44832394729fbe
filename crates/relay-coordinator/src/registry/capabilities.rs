//! Router slot and its RTP capabilities.

use crate::errors::CoordinatorError;
use crate::relay::{RelayRouter, RtpCapabilities};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Holds the relay router once startup has created it.
///
/// Written once, read by every registry afterwards.
pub struct CapabilityRegistry {
    router: watch::Sender<Option<Arc<dyn RelayRouter>>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (router, _) = watch::channel(None);
        Self { router }
    }

    /// Install the router. Returns `false` if one was already installed; the
    /// first router stays in place.
    pub fn install(&self, router: Arc<dyn RelayRouter>) -> bool {
        let installed = self.router.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(router);
            true
        });

        if installed {
            info!(target: "rc.registry.capabilities", "Relay router installed");
        } else {
            warn!(
                target: "rc.registry.capabilities",
                "Relay router already installed, ignoring"
            );
        }
        installed
    }

    /// Router RTP capabilities.
    ///
    /// # Errors
    ///
    /// `NotReady` before [`CapabilityRegistry::install`].
    pub fn capabilities(&self) -> Result<RtpCapabilities, CoordinatorError> {
        self.router().map(|router| router.rtp_capabilities())
    }

    /// The installed router.
    ///
    /// # Errors
    ///
    /// `NotReady` before [`CapabilityRegistry::install`].
    pub fn router(&self) -> Result<Arc<dyn RelayRouter>, CoordinatorError> {
        self.router
            .borrow()
            .as_ref()
            .map(Arc::clone)
            .ok_or(CoordinatorError::NotReady)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.router.borrow().is_some()
    }

    /// Resolve once a router is installed.
    pub async fn wait_ready(&self) -> Arc<dyn RelayRouter> {
        let mut rx = self.router.subscribe();
        loop {
            if let Some(router) = rx.borrow_and_update().as_ref() {
                return Arc::clone(router);
            }
            // The sender lives in `self`, so `changed` cannot fail while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
