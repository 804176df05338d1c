//! Per-method, per-route, per-status HTTP request bookkeeping.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::histogram::{Window, WindowStats};

/// Aggregate counters for a single method or route.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct RouteAggregate {
    /// Number of requests seen for this key.
    pub count: u64,
    /// Total accumulated duration, in milliseconds.
    pub total_duration: f64,
}

impl RouteAggregate {
    fn record(&mut self, duration_ms: f64) {
        self.count += 1;
        self.total_duration += duration_ms;
    }

    /// Average latency in milliseconds.
    #[must_use]
    pub fn avg_latency(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_duration / self.count as f64
        }
    }
}

/// Point-in-time snapshot of everything the [`HttpTracker`] has observed.
#[derive(Clone, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct HttpMetrics {
    /// Total requests recorded since the tracker was created or last reset.
    pub total_requests: u64,
    /// Requests currently in flight.
    pub active_requests: u64,
    /// `total_requests / seconds since tracker start` (0 if no time has elapsed).
    pub requests_per_second: f64,
    /// Count of requests per HTTP status code, keyed by its string form.
    pub status_codes: HashMap<String, u64>,
    /// Latency distribution, in milliseconds.
    pub latency: WindowStats,
    /// Aggregate counters keyed by HTTP method.
    pub by_method: HashMap<String, RouteAggregateView>,
    /// Aggregate counters keyed by route path.
    pub by_route: HashMap<String, RouteAggregateView>,
}

/// Serializable view of a [`RouteAggregate`] including its derived average.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct RouteAggregateView {
    /// Number of requests.
    pub count: u64,
    /// Average latency in milliseconds.
    pub avg_latency: f64,
}

impl From<RouteAggregate> for RouteAggregateView {
    fn from(agg: RouteAggregate) -> Self {
        Self {
            count: agg.count,
            avg_latency: agg.avg_latency(),
        }
    }
}

struct TrackerState {
    total_requests: u64,
    active_requests: u64,
    status_codes: HashMap<String, u64>,
    latency: Window,
    by_method: HashMap<String, RouteAggregate>,
    by_route: HashMap<String, RouteAggregate>,
    start: Instant,
}

impl TrackerState {
    fn new(histogram_limit: usize) -> Self {
        Self {
            total_requests: 0,
            active_requests: 0,
            status_codes: HashMap::new(),
            latency: Window::new(histogram_limit),
            by_method: HashMap::new(),
            by_route: HashMap::new(),
            start: Instant::now(),
        }
    }
}

/// Tracks in-flight and completed HTTP requests.
///
/// All mutation goes through a single [`parking_lot::Mutex`], matching the
/// "one fast mutex per hot map" discipline used elsewhere in the registry.
pub struct HttpTracker {
    histogram_limit: usize,
    state: Mutex<TrackerState>,
}

impl HttpTracker {
    /// Create a new tracker whose latency window holds up to `histogram_limit`
    /// samples.
    #[must_use]
    pub fn new(histogram_limit: usize) -> Self {
        Self {
            histogram_limit,
            state: Mutex::new(TrackerState::new(histogram_limit)),
        }
    }

    /// Mark the start of a request. Always increments `active_requests`;
    /// pairing with [`Self::record_request`] is best-effort on the caller's
    /// part.
    pub fn start_request(&self) {
        self.state.lock().active_requests += 1;
    }

    /// Record a completed request. Never underflows `active_requests`, and
    /// records the sample even if [`Self::start_request`] was never called
    /// for it.
    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        let mut state = self.state.lock();
        if state.active_requests > 0 {
            state.active_requests -= 1;
        }
        state.total_requests += 1;
        *state.status_codes.entry(status.to_string()).or_insert(0) += 1;
        state.latency.push(duration_ms);
        state
            .by_method
            .entry(method.to_string())
            .or_default()
            .record(duration_ms);
        state
            .by_route
            .entry(path.to_string())
            .or_default()
            .record(duration_ms);
    }

    /// Materialize a value snapshot of the tracker's current state.
    #[must_use]
    pub fn metrics(&self) -> HttpMetrics {
        let state = self.state.lock();
        let elapsed = state.start.elapsed().as_secs_f64().max(f64::EPSILON);
        let requests_per_second = if state.start.elapsed() == Duration::ZERO {
            0.0
        } else {
            state.total_requests as f64 / elapsed
        };
        HttpMetrics {
            total_requests: state.total_requests,
            active_requests: state.active_requests,
            requests_per_second,
            status_codes: state.status_codes.clone(),
            latency: state.latency.stats(),
            by_method: state
                .by_method
                .iter()
                .map(|(k, v)| (k.clone(), (*v).into()))
                .collect(),
            by_route: state
                .by_route
                .iter()
                .map(|(k, v)| (k.clone(), (*v).into()))
                .collect(),
        }
    }

    /// Zero every field and restart the `requests_per_second` clock.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = TrackerState::new(self.histogram_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_scenario() {
        let tracker = HttpTracker::new(1000);
        tracker.record_request("GET", "/a", 200, 50.0);
        tracker.record_request("POST", "/b", 201, 120.0);
        tracker.record_request("GET", "/a", 404, 30.0);

        let metrics = tracker.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.status_codes.get("200"), Some(&1));
        assert_eq!(metrics.status_codes.get("201"), Some(&1));
        assert_eq!(metrics.status_codes.get("404"), Some(&1));
        assert_eq!(metrics.by_method.get("GET").unwrap().count, 2);
        assert!((metrics.by_method.get("GET").unwrap().avg_latency - 40.0).abs() < 1e-9);
        assert!((metrics.by_route.get("/a").unwrap().avg_latency - 40.0).abs() < 1e-9);
        assert_eq!(metrics.latency.min, 30.0);
        assert_eq!(metrics.latency.max, 120.0);
    }

    #[test]
    fn active_requests_never_underflows() {
        let tracker = HttpTracker::new(10);
        tracker.record_request("GET", "/x", 200, 1.0);
        assert_eq!(tracker.metrics().active_requests, 0);
    }

    #[test]
    fn pairing_is_best_effort_but_bounded() {
        let tracker = HttpTracker::new(10);
        tracker.start_request();
        tracker.start_request();
        tracker.record_request("GET", "/x", 200, 1.0);
        tracker.record_request("GET", "/x", 200, 1.0);
        tracker.record_request("GET", "/x", 200, 1.0);
        assert_eq!(tracker.metrics().active_requests, 0);
        assert_eq!(tracker.metrics().total_requests, 3);
    }

    #[test]
    fn reset_zeros_everything() {
        let tracker = HttpTracker::new(10);
        tracker.record_request("GET", "/x", 200, 5.0);
        tracker.reset();
        let metrics = tracker.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert!(metrics.status_codes.is_empty());
        assert!(metrics.by_method.is_empty());
    }

    #[test]
    fn unusual_status_codes_accepted_verbatim() {
        let tracker = HttpTracker::new(10);
        tracker.record_request("", "", 418, 1.0);
        tracker.record_request("GET", "/x", 599, 1.0);
        let metrics = tracker.metrics();
        assert_eq!(metrics.status_codes.get("418"), Some(&1));
        assert_eq!(metrics.status_codes.get("599"), Some(&1));
    }
}
