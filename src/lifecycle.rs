//! Process-wide lifecycle shell: initialize, register, start/stop, terminate.

use std::sync::Arc;

use axum::Router;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::info;

use crate::{config::MetricsConfig, errors::VitalsError, interceptor::MetricsLayer, registry::Registry};

static REGISTRY: Lazy<RwLock<Option<Arc<Registry>>>> = Lazy::new(|| RwLock::new(None));

/// Fetch the process-wide registry.
///
/// # Errors
///
/// Returns [`VitalsError::NotInitialized`] before [`MetricsConfig::initialize`]
/// or after [`VitalsHandle::terminate`].
pub fn registry() -> Result<Arc<Registry>, VitalsError> {
    REGISTRY.read().clone().ok_or(VitalsError::NotInitialized)
}

/// Handle returned by [`MetricsConfig::initialize`], owning the process-wide
/// registry for the lifetime of the metrics subsystem.
#[non_exhaustive]
pub struct VitalsHandle {
    registry: Arc<Registry>,
    enabled: bool,
}

impl MetricsConfig {
    /// Create the registry, publish it through the module-level accessor, and
    /// start periodic collection.
    ///
    /// # Errors
    ///
    /// Returns [`VitalsError::AlreadyInitialized`] if a registry is already
    /// published.
    pub fn initialize(self) -> Result<VitalsHandle, VitalsError> {
        let mut slot = REGISTRY.write();
        if slot.is_some() {
            return Err(VitalsError::AlreadyInitialized);
        }
        let enabled = self.enabled;
        let registry = Registry::new(self);
        *slot = Some(Arc::clone(&registry));
        drop(slot);

        if enabled {
            registry.start_collection();
        }
        info!(enabled, "metrics subsystem initialized");
        Ok(VitalsHandle { registry, enabled })
    }
}

impl VitalsHandle {
    /// The registry owned by this handle.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Install the request interceptor and mount the exposition routes onto
    /// `router`. A no-op that returns `router` unchanged when the subsystem
    /// is disabled.
    #[must_use]
    pub fn register(&self, router: Router) -> Router {
        if !self.enabled {
            return router;
        }
        router
            .merge(crate::endpoints::router())
            .layer(MetricsLayer::new(Arc::clone(&self.registry)))
    }

    /// Start the periodic collection loop, idempotently.
    pub fn on_server_start(&self) {
        if self.enabled {
            self.registry.start_collection();
        }
    }

    /// Stop periodic collection, run the reporter one final time if
    /// configured, and emit a closing status line.
    pub fn on_server_stop(&self) {
        self.registry.stop_collection();
        let snapshot = self.registry.snapshot();
        if let Some(reporter) = self.registry.config().reporter.clone() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| reporter(&snapshot))).is_err() {
                tracing::error!("metrics reporter callback panicked during shutdown");
            }
        }
        info!(
            total_requests = snapshot.http.total_requests,
            "metrics subsystem stopped"
        );
    }

    /// Stop collection and clear the module-level accessor. Subsequent
    /// [`registry`] calls fail with [`VitalsError::NotInitialized`].
    pub fn terminate(self) {
        self.registry.stop_collection();
        *REGISTRY.write() = None;
        info!("metrics subsystem terminated");
    }
}
