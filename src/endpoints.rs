//! Read-only exposition endpoints: JSON, Prometheus text, and HTML dashboard.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::{dashboard, errors::VitalsError, prometheus, registry::Registry};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const DASHBOARD_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Per-request labels merged into [`crate::config::MetricsConfig::labels`]
/// when rendering the Prometheus exposition.
///
/// spec.md §4.8 draws the Prometheus endpoint's global labels from
/// `{service?, environment?, instance?}` in request state "when present". A
/// host that wants those labels on scraped output should insert this into
/// the request's [`http::Extensions`] (e.g. from its own auth/context
/// middleware, upstream of this crate's routes) before it reaches
/// `/metrics/prometheus`. Any field left `None` falls back to the
/// correspondingly-named static label in `MetricsConfig::labels`, if any.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct RequestLabels {
    /// Overrides the `service` label.
    pub service: Option<String>,
    /// Overrides the `environment` label.
    pub environment: Option<String>,
    /// Overrides the `instance` label.
    pub instance: Option<String>,
}

impl RequestLabels {
    fn merge_into(self, labels: &mut std::collections::HashMap<String, String>) {
        if let Some(service) = self.service {
            labels.insert("service".to_owned(), service);
        }
        if let Some(environment) = self.environment {
            labels.insert("environment".to_owned(), environment);
        }
        if let Some(instance) = self.instance {
            labels.insert("instance".to_owned(), instance);
        }
    }
}

/// Build the three exposition routes. Intended to be `.merge`d into a host
/// `Router` by [`crate::lifecycle::VitalsHandle::register`].
#[must_use]
pub(crate) fn router() -> Router {
    Router::new()
        .route("/metrics", get(json_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .route("/metrics/dashboard", get(dashboard_handler))
}

async fn json_handler(registry: Option<Extension<Arc<Registry>>>) -> Response {
    match registry {
        Some(Extension(registry)) => Json(registry.snapshot()).into_response(),
        None => VitalsError::NotInitialized.into_response(),
    }
}

async fn prometheus_handler(
    registry: Option<Extension<Arc<Registry>>>,
    request_labels: Option<Extension<RequestLabels>>,
) -> Response {
    let Some(Extension(registry)) = registry else {
        return VitalsError::NotInitialized.into_response();
    };
    let snapshot = registry.snapshot();
    let mut labels = registry.config().labels.clone();
    if let Some(Extension(request_labels)) = request_labels {
        request_labels.merge_into(&mut labels);
    }
    let body = prometheus::format(&snapshot, &labels);
    let mut response = body.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
    );
    response
}

async fn dashboard_handler(registry: Option<Extension<Arc<Registry>>>) -> Response {
    let Some(Extension(registry)) = registry else {
        return VitalsError::NotInitialized.into_response();
    };
    let snapshot = registry.snapshot();
    match dashboard::render(&snapshot) {
        Ok(html) => {
            let mut response = html.into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DASHBOARD_CONTENT_TYPE),
            );
            response
        }
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use tower::ServiceExt;

    use super::*;
    use crate::config::MetricsConfig;

    #[tokio::test]
    async fn missing_registry_returns_503() {
        let app = router();
        let req = axum::http::Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn json_endpoint_returns_snapshot_when_attached() {
        let registry = Registry::new(MetricsConfig::default());
        let app = router().layer(Extension(Arc::clone(&registry)));
        let req = axum::http::Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prometheus_endpoint_sets_content_type() {
        let registry = Registry::new(MetricsConfig::default());
        let app = router().layer(Extension(Arc::clone(&registry)));
        let req = axum::http::Request::builder()
            .uri("/metrics/prometheus")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            PROMETHEUS_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn prometheus_endpoint_merges_request_labels() {
        let registry = Registry::new(
            MetricsConfig::default().with_labels(
                [("service".to_owned(), "fallback".to_owned())]
                    .into_iter()
                    .collect(),
            ),
        );
        let app = router()
            .layer(Extension(RequestLabels {
                service: Some("checkout".to_owned()),
                environment: Some("production".to_owned()),
                instance: None,
            }))
            .layer(Extension(Arc::clone(&registry)));
        let req = axum::http::Request::builder()
            .uri("/metrics/prometheus")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("http_requests_total{environment=\"production\",service=\"checkout\"}"));
    }

    #[tokio::test]
    async fn dashboard_endpoint_sets_content_type() {
        let registry = Registry::new(MetricsConfig::default());
        let app = router().layer(Extension(Arc::clone(&registry)));
        let req = axum::http::Request::builder()
            .uri("/metrics/dashboard")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            DASHBOARD_CONTENT_TYPE
        );
    }
}
