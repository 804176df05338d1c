#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod config;
mod dashboard;
mod endpoints;
mod errors;
mod histogram;
mod http_tracker;
mod interceptor;
mod lifecycle;
mod process;
pub mod prelude;
mod prometheus;
mod registry;
mod util;

pub use self::{
    config::{CardinalityPolicy, MetricsConfig, Reporter},
    endpoints::RequestLabels,
    errors::VitalsError,
    histogram::{Window, WindowStats},
    http_tracker::{HttpMetrics, HttpTracker, RouteAggregateView},
    interceptor::{HasStatusCode, MetricsFuture, MetricsLayer, MetricsMiddleware},
    lifecycle::{registry, VitalsHandle},
    process::{CpuUsage, MemoryUsage, ProcessSampler, ProcessSnapshot},
    registry::{CustomMetrics, Registry, Snapshot, SnapshotMeta, Timer},
};
