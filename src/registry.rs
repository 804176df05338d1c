//! Counters, gauges, histograms, and timers behind a cardinality governor,
//! plus the periodic sampling loop and snapshot assembly.

use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{CardinalityPolicy, MetricsConfig},
    errors::VitalsError,
    histogram::{Window, WindowStats},
    http_tracker::{HttpMetrics, HttpTracker},
    process::{ProcessSampler, ProcessSnapshot},
};

/// Custom metrics captured in a [`Snapshot`], grouped by kind.
#[derive(Clone, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct CustomMetrics {
    /// Monotonically-accumulated counters.
    pub counters: HashMap<String, f64>,
    /// Last-written gauge values.
    pub gauges: HashMap<String, f64>,
    /// Histogram summary statistics, in their recorded units.
    pub histograms: HashMap<String, WindowStats>,
    /// Timer summary statistics, in milliseconds.
    pub timers: HashMap<String, WindowStats>,
}

/// Cardinality bookkeeping attached to a [`Snapshot`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct SnapshotMeta {
    /// Distinct metric names currently tracked.
    pub cardinality: usize,
    /// Configured cardinality ceiling.
    pub max_cardinality: usize,
    /// `floor(100 * cardinality / max_cardinality)`, `0` if `max_cardinality` is `0`.
    pub cardinality_usage_percent: u64,
}

/// A value-copy snapshot of everything the registry has observed.
///
/// Two snapshots taken at different times are fully independent; mutating
/// the registry afterwards never changes a previously returned snapshot.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct Snapshot {
    /// Unix epoch milliseconds at the time the snapshot was assembled.
    pub timestamp: u64,
    /// HTTP request tracker metrics.
    pub http: HttpMetrics,
    /// Process-health metrics.
    pub process: ProcessSnapshot,
    /// User-defined counters, gauges, histograms, and timers.
    pub custom: CustomMetrics,
    #[serde(rename = "_meta")]
    /// Cardinality bookkeeping.
    pub meta: SnapshotMeta,
}

/// Which of the four metric maps a name is admitted into.
///
/// A name is admitted into exactly one kind for the registry's lifetime (or
/// since the last [`Registry::reset`]); the four maps are therefore always
/// disjoint by key, so `|counters| + |gauges| + |histograms| + |timers|`
/// never double-counts a name reused across kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

impl MetricKind {
    fn label(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Timer => "timer",
        }
    }
}

/// Tracks admitted metric names, and the kind each was admitted under,
/// against the configured cardinality budget.
struct Governor {
    names: HashMap<String, MetricKind>,
    max: usize,
    policy: CardinalityPolicy,
    warned_limit: bool,
    triggered_thresholds: HashSet<u8>,
}

impl Governor {
    fn new(max: usize, policy: CardinalityPolicy) -> Self {
        Self {
            names: HashMap::new(),
            max,
            policy,
            warned_limit: false,
            triggered_thresholds: HashSet::new(),
        }
    }

    /// Decide whether `name` may be written as `kind`.
    ///
    /// `Ok(true)` — proceed; `Ok(false)` — silently skip the write (`drop`/`warn`
    /// policies past the limit, or a cross-kind name collision); `Err` —
    /// refuse under the `error` policy.
    fn admit(&mut self, name: &str, kind: MetricKind) -> Result<bool, VitalsError> {
        if let Some(existing) = self.names.get(name) {
            if *existing == kind {
                return Ok(true);
            }
            warn!(
                metric = name,
                existing_kind = existing.label(),
                requested_kind = kind.label(),
                "metric name already registered under a different kind, ignoring write"
            );
            return Ok(false);
        }
        if self.names.len() >= self.max {
            return match self.policy {
                CardinalityPolicy::Error => Err(VitalsError::CardinalityExceeded(name.to_owned())),
                CardinalityPolicy::Warn => {
                    warn!(metric = name, max = self.max, "cardinality limit reached, refusing new metric name");
                    Ok(false)
                }
                CardinalityPolicy::Drop => {
                    if !self.warned_limit {
                        self.warned_limit = true;
                        warn!(max = self.max, "cardinality limit reached, dropping new metric names");
                    }
                    Ok(false)
                }
            };
        }
        self.names.insert(name.to_owned(), kind);
        self.check_thresholds();
        Ok(true)
    }

    fn check_thresholds(&mut self) {
        if self.max == 0 {
            return;
        }
        let n = self.names.len();
        for threshold in [80u8, 90u8] {
            if !self.triggered_thresholds.contains(&threshold)
                && n * 100 >= threshold as usize * self.max
            {
                self.triggered_thresholds.insert(threshold);
                warn!(n, max = self.max, threshold, "metric cardinality threshold crossed");
            }
        }
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn reset(&mut self) {
        self.names.clear();
        self.warned_limit = false;
        self.triggered_thresholds.clear();
    }
}

struct CollectionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle returned by [`Registry::start_timer`].
///
/// Calling [`Timer::stop`] more than once is supported and records another
/// sample each time; this matches the tested behavior this crate inherits.
pub struct Timer {
    inner: Option<(Arc<Registry>, String, Instant)>,
}

impl Timer {
    fn admitted(registry: Arc<Registry>, name: String) -> Self {
        Self {
            inner: Some((registry, name, Instant::now())),
        }
    }

    fn refused() -> Self {
        Self { inner: None }
    }

    /// Record a sample of elapsed time since the timer started, in
    /// milliseconds. A no-op if admission was refused when the timer was
    /// created.
    pub fn stop(&self) {
        if let Some((registry, name, start)) = &self.inner {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            registry.push_timer_sample(name, elapsed_ms);
        }
    }
}

/// Owns every metric map, the HTTP tracker, the process sampler, and the
/// periodic collection loop. There is exactly one of these per
/// [`crate::lifecycle`] session.
pub struct Registry {
    config: MetricsConfig,
    http: HttpTracker,
    process: ProcessSampler,
    last_event_loop_lag_ms: Mutex<f64>,
    counters: Mutex<HashMap<String, f64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Window>>,
    timers: Mutex<HashMap<String, Window>>,
    governor: Mutex<Governor>,
    collecting: Mutex<Option<CollectionHandle>>,
}

impl Registry {
    /// Construct a new, empty registry from `config`.
    pub(crate) fn new(config: MetricsConfig) -> Arc<Self> {
        let governor = Governor::new(config.max_cardinality, config.on_cardinality_limit);
        let http = HttpTracker::new(config.histogram_limit);
        Arc::new(Self {
            process: ProcessSampler::new(),
            http,
            last_event_loop_lag_ms: Mutex::new(0.0),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            governor: Mutex::new(governor),
            collecting: Mutex::new(None),
            config,
        })
    }

    /// The configuration this registry was built with.
    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// The HTTP request tracker.
    #[must_use]
    pub fn http_tracker(&self) -> &HttpTracker {
        &self.http
    }

    /// Increment a counter by `value`, admitting the name if new.
    pub fn increment(&self, name: &str, value: f64) -> Result<(), VitalsError> {
        if !self.admit(name, MetricKind::Counter)? {
            return Ok(());
        }
        *self.counters.lock().entry(name.to_owned()).or_insert(0.0) += value;
        Ok(())
    }

    /// Set a gauge to `value`, admitting the name if new.
    pub fn gauge(&self, name: &str, value: f64) -> Result<(), VitalsError> {
        if !self.admit(name, MetricKind::Gauge)? {
            return Ok(());
        }
        self.gauges.lock().insert(name.to_owned(), value);
        Ok(())
    }

    /// Push a sample into a histogram, admitting and lazily allocating the
    /// window if new.
    pub fn histogram(&self, name: &str, value: f64) -> Result<(), VitalsError> {
        if !self.admit(name, MetricKind::Histogram)? {
            return Ok(());
        }
        self.histograms
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| Window::new(self.config.histogram_limit))
            .push(value);
        Ok(())
    }

    /// Start a timer. Admission is checked here, not on [`Timer::stop`] —
    /// under the `error` policy this is where [`VitalsError::CardinalityExceeded`]
    /// surfaces.
    pub fn start_timer(self: &Arc<Self>, name: &str) -> Result<Timer, VitalsError> {
        if !self.admit(name, MetricKind::Timer)? {
            return Ok(Timer::refused());
        }
        Ok(Timer::admitted(Arc::clone(self), name.to_owned()))
    }

    fn push_timer_sample(&self, name: &str, elapsed_ms: f64) {
        self.timers
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| Window::new(self.config.histogram_limit))
            .push(elapsed_ms);
    }

    /// A name is admitted into exactly one [`MetricKind`] for the registry's
    /// lifetime: reusing it under a different kind is refused rather than
    /// admitted, so the four metric maps stay disjoint by key and
    /// `meta.cardinality` (see [`Self::snapshot`]) never double-counts.
    fn admit(&self, name: &str, kind: MetricKind) -> Result<bool, VitalsError> {
        self.governor.lock().admit(name, kind)
    }

    /// Assemble a value-copy snapshot of the current registry state.
    ///
    /// Locks are taken in a fixed order (counters, gauges, histograms,
    /// timers, http, process) for determinism; no section blocks another.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let counters = self.counters.lock().clone();
        let gauges = self.gauges.lock().clone();
        let histograms = self
            .histograms
            .lock()
            .iter()
            .map(|(k, w)| (k.clone(), w.stats()))
            .collect();
        let timers = self
            .timers
            .lock()
            .iter()
            .map(|(k, w)| (k.clone(), w.stats()))
            .collect();
        let http = self.http.metrics();
        let mut process = self.process.collect();
        process.event_loop_lag = *self.last_event_loop_lag_ms.lock();

        let (cardinality, max_cardinality) = {
            let governor = self.governor.lock();
            (governor.len(), governor.max)
        };
        let cardinality_usage_percent = if max_cardinality == 0 {
            0
        } else {
            (100 * cardinality / max_cardinality) as u64
        };

        Snapshot {
            timestamp: unix_millis_now(),
            http,
            process,
            custom: CustomMetrics {
                counters,
                gauges,
                histograms,
                timers,
            },
            meta: SnapshotMeta {
                cardinality,
                max_cardinality,
                cardinality_usage_percent,
            },
        }
    }

    /// Start the periodic sampling loop if it isn't already running.
    ///
    /// The spawned task is cancelled (not merely dropped) by
    /// [`Self::stop_collection`], so it never outlives the registry's
    /// intended lifetime, but it also never pins the Tokio runtime open by
    /// itself — the equivalent of an "unref'd" timer.
    pub fn start_collection(self: &Arc<Self>) {
        let mut collecting = self.collecting.lock();
        if collecting.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.collection_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => registry.collection_tick().await,
                }
            }
        });
        *collecting = Some(CollectionHandle { cancel, task });
    }

    async fn collection_tick(&self) {
        let lag = self.process.event_loop_lag().await;
        *self.last_event_loop_lag_ms.lock() = lag.as_secs_f64() * 1000.0;

        let snapshot = self.snapshot();
        if let Some(reporter) = self.config.reporter.clone() {
            let snap = snapshot.clone();
            if catch_unwind(AssertUnwindSafe(|| reporter(&snap))).is_err() {
                error!("metrics reporter callback panicked");
            }
        }
        if self.config.log_to_console {
            info!(
                total_requests = snapshot.http.total_requests,
                cardinality = snapshot.meta.cardinality,
                event_loop_lag_ms = snapshot.process.event_loop_lag,
                "metrics collection tick"
            );
        }
    }

    /// Cancel the periodic sampling loop. Safe to call when not running.
    pub fn stop_collection(&self) {
        if let Some(handle) = self.collecting.lock().take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }

    /// Whether the periodic sampling loop is currently running.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting.lock().is_some()
    }

    /// Clear all custom metrics and cardinality-warning state, and reset the
    /// HTTP tracker and CPU baseline. Does not stop collection.
    pub fn reset(&self) {
        self.counters.lock().clear();
        self.gauges.lock().clear();
        self.histograms.lock().clear();
        self.timers.lock().clear();
        self.governor.lock().reset();
        self.http.reset();
        self.process.reset_cpu_baseline();
        *self.last_event_loop_lag_ms.lock() = 0.0;
    }
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(max: usize, policy: CardinalityPolicy) -> MetricsConfig {
        MetricsConfig::default()
            .with_max_cardinality(max)
            .with_on_cardinality_limit(policy)
    }

    #[test]
    fn cardinality_governor_drop_policy_keeps_existing_names_updatable() {
        let registry = Registry::new(config_with(3, CardinalityPolicy::Drop));
        registry.increment("a", 1.0).unwrap();
        registry.increment("b", 1.0).unwrap();
        registry.increment("c", 1.0).unwrap();
        registry.increment("d", 5.0).unwrap();
        registry.increment("a", 10.0).unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap.custom.counters.get("a"), Some(&11.0));
        assert_eq!(snap.custom.counters.get("b"), Some(&1.0));
        assert_eq!(snap.custom.counters.get("c"), Some(&1.0));
        assert!(!snap.custom.counters.contains_key("d"));
        assert_eq!(snap.meta.cardinality, 3);
    }

    #[test]
    fn cardinality_governor_error_policy_propagates() {
        let registry = Registry::new(config_with(1, CardinalityPolicy::Error));
        registry.increment("a", 1.0).unwrap();
        let err = registry.increment("b", 1.0).unwrap_err();
        assert!(matches!(err, VitalsError::CardinalityExceeded(_)));
    }

    #[test]
    fn cross_kind_reuse_of_a_name_is_refused_and_cardinality_stays_exact() {
        let registry = Registry::new(MetricsConfig::default());
        registry.increment("x", 1.0).unwrap();
        registry.histogram("x", 2.0).unwrap();
        registry.gauge("x", 3.0).unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap.custom.counters.get("x"), Some(&1.0));
        assert!(!snap.custom.histograms.contains_key("x"));
        assert!(!snap.custom.gauges.contains_key("x"));
        assert_eq!(snap.meta.cardinality, 1);
        assert_eq!(
            snap.meta.cardinality,
            snap.custom.counters.len()
                + snap.custom.gauges.len()
                + snap.custom.histograms.len()
                + snap.custom.timers.len()
        );
    }

    #[test]
    fn error_policy_raises_on_start_timer_call_not_on_stop() {
        let registry = Registry::new(config_with(0, CardinalityPolicy::Error));
        let err = registry.start_timer("slow").unwrap_err();
        assert!(matches!(err, VitalsError::CardinalityExceeded(_)));
    }

    #[test]
    fn refused_timer_stop_is_a_silent_noop() {
        let registry = Registry::new(config_with(0, CardinalityPolicy::Drop));
        let timer = registry.start_timer("slow").unwrap();
        timer.stop();
        assert!(registry.snapshot().custom.timers.is_empty());
    }

    #[test]
    fn timer_stop_is_idempotently_repeatable() {
        let registry = Registry::new(MetricsConfig::default());
        let timer = registry.start_timer("op").unwrap();
        timer.stop();
        timer.stop();
        timer.stop();
        let snap = registry.snapshot();
        assert_eq!(snap.custom.timers.get("op").unwrap().count, 3);
    }

    #[test]
    fn reset_clears_everything_but_not_collection_state() {
        let registry = Registry::new(MetricsConfig::default());
        registry.increment("a", 1.0).unwrap();
        registry.histogram("h", 5.0).unwrap();
        registry.reset();
        let snap = registry.snapshot();
        assert_eq!(snap.meta.cardinality, 0);
        assert!(snap.custom.counters.is_empty());
        assert!(snap.custom.histograms.is_empty());
        assert_eq!(snap.http.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_collection_is_idempotent_and_stoppable() {
        let registry = Registry::new(MetricsConfig::default());
        registry.start_collection();
        assert!(registry.is_collecting());
        registry.start_collection();
        assert!(registry.is_collecting());
        registry.stop_collection();
        assert!(!registry.is_collecting());
        registry.stop_collection();
        assert!(!registry.is_collecting());
    }
}
