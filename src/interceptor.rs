//! Request-lifecycle interceptor: exactly one record per request.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Instant,
};

use axum::{
    extract::{MatchedPath, Request},
    response::Response,
};
use pin_project::pin_project;
use tower::{Layer, Service};

use crate::registry::Registry;

/// Implemented by service errors that carry a meaningful HTTP status.
///
/// The default falls back to `500` for error types that don't model a
/// status of their own.
pub trait HasStatusCode {
    /// The HTTP status this error should be recorded under.
    fn status_code(&self) -> u16 {
        500
    }
}

impl HasStatusCode for std::convert::Infallible {
    fn status_code(&self) -> u16 {
        unreachable!("Infallible has no values")
    }
}

impl HasStatusCode for axum::BoxError {}

fn path_excluded(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix("/*") {
        Some(prefix) => path == prefix || path.starts_with(&format!("{prefix}/")),
        None => path == pattern,
    })
}

/// A [`tower::Layer`] recording one request per call into a [`Registry`].
#[derive(Clone)]
pub struct MetricsLayer {
    registry: Arc<Registry>,
    exclude_paths: Arc<[String]>,
}

impl MetricsLayer {
    /// Build a layer bound to `registry`, reading `exclude_paths` from its config.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        let exclude_paths: Arc<[String]> = registry.config().exclude_paths.clone().into();
        Self {
            registry,
            exclude_paths,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsMiddleware {
            inner,
            registry: Arc::clone(&self.registry),
            exclude_paths: Arc::clone(&self.exclude_paths),
        }
    }
}

/// The [`tower::Service`] produced by [`MetricsLayer`].
#[derive(Clone)]
pub struct MetricsMiddleware<S> {
    inner: S,
    registry: Arc<Registry>,
    exclude_paths: Arc<[String]>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: HasStatusCode,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let method = req.method().to_string();
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_owned())
            .unwrap_or_else(|| {
                let raw = req.uri().path();
                if raw.is_empty() { "/".to_owned() } else { raw.to_owned() }
            });

        req.extensions_mut().insert(Arc::clone(&self.registry));

        if path_excluded(&self.exclude_paths, &path) {
            return MetricsFuture::passthrough(self.inner.call(req));
        }

        self.registry.http_tracker().start_request();
        MetricsFuture::tracked(self.inner.call(req), Arc::clone(&self.registry), method, path)
    }
}

/// Response future for [`MetricsMiddleware`].
///
/// Excluded requests pass straight through; tracked requests record exactly
/// once, on completion, regardless of success or failure.
#[pin_project(project = MetricsFutureProj)]
pub enum MetricsFuture<F> {
    /// Path matched an exclusion pattern; no bookkeeping happens.
    Passthrough {
        #[pin]
        inner: F,
    },
    /// Path is tracked; records a sample when `inner` resolves.
    Tracked {
        #[pin]
        inner: F,
        registry: Arc<Registry>,
        method: String,
        path: String,
        start: Instant,
    },
}

impl<F> MetricsFuture<F> {
    fn passthrough(inner: F) -> Self {
        Self::Passthrough { inner }
    }

    fn tracked(inner: F, registry: Arc<Registry>, method: String, path: String) -> Self {
        Self::Tracked {
            inner,
            registry,
            method,
            path,
            start: Instant::now(),
        }
    }
}

impl<F, ResBody, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    E: HasStatusCode,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            MetricsFutureProj::Passthrough { inner } => inner.poll(cx),
            MetricsFutureProj::Tracked {
                inner,
                registry,
                method,
                path,
                start,
            } => {
                let result = ready!(inner.poll(cx));
                let status = match &result {
                    Ok(resp) => resp.status().as_u16(),
                    Err(err) => err.status_code(),
                };
                let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                registry
                    .http_tracker()
                    .record_request(method, path, status, duration_ms);
                Poll::Ready(result)
            }
        }
    }
}
