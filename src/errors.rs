//! Crate-wide error type and response mapping.

use axum::{http::StatusCode, response::IntoResponse, response::Response};
use thiserror::Error;

/// Tag URI used for [`problemdetails`] bodies produced by this crate.
pub(crate) const TAG_VITALS_ERROR: &str = "tag:vitals,2026:error";
/// Tag URI for bodies returned when no registry has been initialized.
pub(crate) const TAG_VITALS_NOT_INITIALIZED: &str = "tag:vitals,2026:not-initialized";

/// Errors produced by this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VitalsError {
    /// An exposition endpoint or accessor was reached before
    /// [`crate::config::MetricsConfig::initialize`] was called, or after
    /// [`crate::lifecycle::VitalsHandle::terminate`].
    #[error("metrics registry is not initialized")]
    NotInitialized,
    /// [`crate::config::MetricsConfig::initialize`] was called while a registry already existed.
    #[error("metrics registry is already initialized")]
    AlreadyInitialized,
    /// A new metric name would exceed the configured cardinality limit and
    /// the configured policy is `error`.
    #[error("cardinality limit exceeded: {0}")]
    CardinalityExceeded(String),
    /// Rendering the Prometheus text exposition or HTML dashboard failed.
    ///
    /// Carries the operation tag (e.g. `"dashboard"`) and the underlying
    /// error's message, so the 500 response body preserves the original
    /// failure instead of a generic string.
    #[error("failed to render {operation}: {source}")]
    Render {
        /// Which exposition surface failed to render.
        operation: &'static str,
        /// The underlying error's message.
        source: String,
    },
}

impl IntoResponse for VitalsError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            Self::AlreadyInitialized => StatusCode::CONFLICT,
            Self::CardinalityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::Render { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let tag = match self {
            Self::NotInitialized => TAG_VITALS_NOT_INITIALIZED,
            _ => TAG_VITALS_ERROR,
        };
        problemdetails::new(status)
            .with_type(tag)
            .with_title(self.to_string())
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as Sc;

    #[test]
    fn not_initialized_maps_to_503() {
        let resp = VitalsError::NotInitialized.into_response();
        assert_eq!(resp.status(), Sc::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn already_initialized_maps_to_409() {
        let resp = VitalsError::AlreadyInitialized.into_response();
        assert_eq!(resp.status(), Sc::CONFLICT);
    }

    #[test]
    fn render_maps_to_500_and_preserves_original_message() {
        let err = VitalsError::Render {
            operation: "dashboard",
            source: "stray '}' in template".to_owned(),
        };
        let message = err.to_string();
        assert!(message.contains("dashboard"));
        assert!(message.contains("stray '}' in template"));
        let resp = err.into_response();
        assert_eq!(resp.status(), Sc::INTERNAL_SERVER_ERROR);
    }
}
