//! Configuration and builder for the metrics subsystem.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::registry::Snapshot;
use crate::util::default_true;

/// Policy applied when a new metric name would exceed [`MetricsConfig::max_cardinality`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CardinalityPolicy {
    /// Refuse the new name silently, except for one warning at first refusal.
    #[default]
    Drop,
    /// Refuse the new name and log a warning for every refused call.
    Warn,
    /// Refuse the new name and return [`crate::errors::VitalsError::CardinalityExceeded`].
    Error,
}

/// Callback invoked with each periodically collected snapshot.
///
/// Not (de)serializable; set via [`MetricsConfig::with_reporter`].
pub type Reporter = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Configuration and builder for the metrics subsystem.
#[derive(Clone, Deserialize, Serialize)]
#[non_exhaustive]
pub struct MetricsConfig {
    /// Master kill-switch. When `false`, [`crate::lifecycle::initialize`]
    /// still creates a registry but skips collection and interception.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Request paths skipped by the interceptor: either an exact match, or a
    /// `prefix/*` pattern matching `prefix` and anything under it.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Sample capacity `K` used for every histogram and timer window.
    #[serde(default = "MetricsConfig::default_histogram_limit")]
    pub histogram_limit: usize,
    /// Period between process-sampler ticks.
    #[serde(
        default = "MetricsConfig::default_collection_interval",
        with = "humantime_serde"
    )]
    pub collection_interval: Duration,
    /// Total distinct metric names allowed across counters, gauges,
    /// histograms, and timers combined.
    #[serde(default = "MetricsConfig::default_max_cardinality")]
    pub max_cardinality: usize,
    /// Policy applied once `max_cardinality` is reached.
    #[serde(default)]
    pub on_cardinality_limit: CardinalityPolicy,
    /// Global labels attached to every Prometheus exposition sample.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Emit a compact status line on every collection tick.
    #[serde(default)]
    pub log_to_console: bool,
    /// Optional callback invoked with each periodic snapshot. Errors inside
    /// the callback are logged and never propagate.
    #[serde(skip)]
    pub(crate) reporter: Option<Reporter>,
}

impl fmt::Debug for MetricsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsConfig")
            .field("enabled", &self.enabled)
            .field("exclude_paths", &self.exclude_paths)
            .field("histogram_limit", &self.histogram_limit)
            .field("collection_interval", &self.collection_interval)
            .field("max_cardinality", &self.max_cardinality)
            .field("on_cardinality_limit", &self.on_cardinality_limit)
            .field("labels", &self.labels)
            .field("log_to_console", &self.log_to_console)
            .field("reporter", &self.reporter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            exclude_paths: Vec::new(),
            histogram_limit: Self::default_histogram_limit(),
            collection_interval: Self::default_collection_interval(),
            max_cardinality: Self::default_max_cardinality(),
            on_cardinality_limit: CardinalityPolicy::default(),
            labels: HashMap::new(),
            log_to_console: false,
            reporter: None,
        }
    }
}

impl MetricsConfig {
    /// Default value for [`Self::histogram_limit`].
    #[must_use]
    #[inline]
    fn default_histogram_limit() -> usize {
        1000
    }

    /// Default value for [`Self::collection_interval`].
    #[must_use]
    #[inline]
    fn default_collection_interval() -> Duration {
        Duration::from_millis(60_000)
    }

    /// Default value for [`Self::max_cardinality`].
    #[must_use]
    #[inline]
    fn default_max_cardinality() -> usize {
        10_000
    }

    /// Enable or disable the subsystem.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set excluded request paths.
    #[must_use]
    pub fn with_exclude_paths(mut self, paths: impl IntoIterator<Item = impl ToString>) -> Self {
        self.exclude_paths = paths.into_iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set the sample capacity for histogram and timer windows.
    #[must_use]
    pub fn with_histogram_limit(mut self, limit: usize) -> Self {
        self.histogram_limit = limit;
        self
    }

    /// Set the process-sampler collection period.
    #[must_use]
    pub fn with_collection_interval(mut self, interval: Duration) -> Self {
        self.collection_interval = interval;
        self
    }

    /// Set the maximum number of distinct metric names.
    #[must_use]
    pub fn with_max_cardinality(mut self, max: usize) -> Self {
        self.max_cardinality = max;
        self
    }

    /// Set the policy applied once the cardinality limit is reached.
    #[must_use]
    pub fn with_on_cardinality_limit(mut self, policy: CardinalityPolicy) -> Self {
        self.on_cardinality_limit = policy;
        self
    }

    /// Set global labels attached to Prometheus output.
    #[must_use]
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Emit a compact status line on every collection tick.
    #[must_use]
    pub fn with_log_to_console(mut self, log: bool) -> Self {
        self.log_to_console = log;
        self
    }

    /// Set the periodic snapshot reporter callback.
    #[must_use]
    pub fn with_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.reporter = Some(Arc::new(reporter));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MetricsConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.histogram_limit, 1000);
        assert_eq!(cfg.collection_interval, Duration::from_millis(60_000));
        assert_eq!(cfg.max_cardinality, 10_000);
        assert_eq!(cfg.on_cardinality_limit, CardinalityPolicy::Drop);
        assert!(cfg.labels.is_empty());
    }

    #[test]
    fn builder_setters_compose() {
        let cfg = MetricsConfig::default()
            .with_enabled(true)
            .with_histogram_limit(50)
            .with_max_cardinality(5)
            .with_on_cardinality_limit(CardinalityPolicy::Error)
            .with_log_to_console(true);
        assert_eq!(cfg.histogram_limit, 50);
        assert_eq!(cfg.max_cardinality, 5);
        assert_eq!(cfg.on_cardinality_limit, CardinalityPolicy::Error);
        assert!(cfg.log_to_console);
    }
}
