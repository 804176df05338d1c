//! Prometheus text-exposition formatter (format version `0.0.4`).

use std::collections::{BTreeMap, HashMap};

use crate::{histogram::WindowStats, http_tracker::RouteAggregateView, registry::Snapshot};

const STANDARD_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Render a [`Snapshot`] as Prometheus text exposition, merging `global_labels`
/// into every sample line.
///
/// The output is `\n`-joined and terminated with a trailing `\n`.
#[must_use]
pub(crate) fn format(snapshot: &Snapshot, global_labels: &HashMap<String, String>) -> String {
    let mut out = Vec::new();

    emit_counter(
        &mut out,
        "http_requests_total",
        "Total number of HTTP requests processed",
        snapshot.http.total_requests as f64,
        &[],
        global_labels,
    );
    emit_gauge(
        &mut out,
        "http_requests_active",
        "Number of HTTP requests currently in flight",
        snapshot.http.active_requests as f64,
        &[],
        global_labels,
    );
    emit_gauge_fixed(
        &mut out,
        "http_requests_per_second",
        "Observed HTTP request rate",
        snapshot.http.requests_per_second,
        3,
        &[],
        global_labels,
    );

    emit_counter_family(
        &mut out,
        "http_requests_by_status_total",
        "Total number of HTTP requests by status code",
        "status",
        &snapshot.http.status_codes,
        global_labels,
    );

    emit_duration_histogram(
        &mut out,
        "http_request_duration_seconds",
        "HTTP request duration",
        &snapshot.http.latency,
        STANDARD_LATENCY_BUCKETS,
        &[],
        global_labels,
    );

    emit_counter_family_agg(
        &mut out,
        "http_requests_by_method_total",
        "Total number of HTTP requests by method",
        "method",
        &snapshot.http.by_method,
        global_labels,
    );
    emit_counter_family_agg(
        &mut out,
        "http_requests_by_route_total",
        "Total number of HTTP requests by route",
        "route",
        &snapshot.http.by_route,
        global_labels,
    );

    let mem = &snapshot.process.memory_usage;
    emit_gauge(
        &mut out,
        "process_memory_heap_used_bytes",
        "Process heap memory in use",
        mem.heap_used as f64,
        &[],
        global_labels,
    );
    emit_gauge(
        &mut out,
        "process_memory_heap_total_bytes",
        "Process heap memory reserved",
        mem.heap_total as f64,
        &[],
        global_labels,
    );
    emit_gauge(
        &mut out,
        "process_memory_external_bytes",
        "Process memory outside the main heap",
        mem.external as f64,
        &[],
        global_labels,
    );
    emit_gauge(
        &mut out,
        "process_memory_rss_bytes",
        "Process resident set size",
        mem.rss as f64,
        &[],
        global_labels,
    );
    emit_counter_fixed(
        &mut out,
        "process_cpu_user_seconds_total",
        "Cumulative process CPU time in user mode",
        snapshot.process.cpu_usage.user as f64 / 1_000_000.0,
        6,
        &[],
        global_labels,
    );
    emit_counter_fixed(
        &mut out,
        "process_cpu_system_seconds_total",
        "Cumulative process CPU time in kernel mode",
        snapshot.process.cpu_usage.system as f64 / 1_000_000.0,
        6,
        &[],
        global_labels,
    );
    emit_gauge_fixed(
        &mut out,
        "process_uptime_seconds",
        "Process uptime",
        snapshot.process.uptime,
        3,
        &[],
        global_labels,
    );
    emit_gauge_fixed(
        &mut out,
        "process_event_loop_lag_seconds",
        "Measured scheduler lag",
        snapshot.process.event_loop_lag / 1000.0,
        6,
        &[],
        global_labels,
    );

    for (name, value) in sorted(&snapshot.custom.counters) {
        emit_counter(
            &mut out,
            &sanitize_metric_name(name),
            &format!("{name} counter metric"),
            *value,
            &[],
            global_labels,
        );
    }
    for (name, value) in sorted(&snapshot.custom.gauges) {
        emit_gauge(
            &mut out,
            &sanitize_metric_name(name),
            &format!("{name} gauge metric"),
            *value,
            &[],
            global_labels,
        );
    }
    for (name, stats) in sorted(&snapshot.custom.histograms) {
        emit_custom_histogram(
            &mut out,
            &sanitize_metric_name(name),
            &format!("{name} histogram metric"),
            stats,
            1.0,
            global_labels,
        );
    }
    for (name, stats) in sorted(&snapshot.custom.timers) {
        emit_custom_histogram(
            &mut out,
            &format!("{}_seconds", sanitize_metric_name(name)),
            &format!("{name} timer metric"),
            stats,
            1000.0,
            global_labels,
        );
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Iterate a map in a deterministic (key-sorted) order.
fn sorted<V>(map: &HashMap<String, V>) -> Vec<(&String, &V)> {
    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
}

fn emit_counter(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    value: f64,
    extra: &[(&str, &str)],
    global: &HashMap<String, String>,
) {
    emit_metric(out, name, help, "counter", &[(extra, fmt_default(value))], global);
}

fn emit_counter_fixed(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    value: f64,
    decimals: usize,
    extra: &[(&str, &str)],
    global: &HashMap<String, String>,
) {
    emit_metric(out, name, help, "counter", &[(extra, fmt_fixed(value, decimals))], global);
}

fn emit_gauge(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    value: f64,
    extra: &[(&str, &str)],
    global: &HashMap<String, String>,
) {
    emit_metric(out, name, help, "gauge", &[(extra, fmt_default(value))], global);
}

/// Emit a single `counter` metric family with one sample line per entry of
/// `map`, labeled `{label_key="<map key>"}` — one `# HELP`/`# TYPE` pair for
/// the whole family, not one per entry.
fn emit_counter_family(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    label_key: &str,
    map: &HashMap<String, u64>,
    global: &HashMap<String, String>,
) {
    if map.is_empty() {
        return;
    }
    let entries = sorted(map);
    let label_sets: Vec<[(&str, &str); 1]> = entries
        .iter()
        .map(|(key, _)| [(label_key, key.as_str())])
        .collect();
    let samples: Vec<(&[(&str, &str)], String)> = entries
        .iter()
        .zip(label_sets.iter())
        .map(|((_, value), labels)| (labels.as_slice(), fmt_default(**value as f64)))
        .collect();
    emit_metric(out, name, help, "counter", &samples, global);
}

/// Like [`emit_counter_family`], but sources each sample's value from a
/// [`RouteAggregateView`]'s `count` field.
fn emit_counter_family_agg(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    label_key: &str,
    map: &HashMap<String, RouteAggregateView>,
    global: &HashMap<String, String>,
) {
    if map.is_empty() {
        return;
    }
    let entries = sorted(map);
    let label_sets: Vec<[(&str, &str); 1]> = entries
        .iter()
        .map(|(key, _)| [(label_key, key.as_str())])
        .collect();
    let samples: Vec<(&[(&str, &str)], String)> = entries
        .iter()
        .zip(label_sets.iter())
        .map(|((_, agg), labels)| (labels.as_slice(), fmt_default(agg.count as f64)))
        .collect();
    emit_metric(out, name, help, "counter", &samples, global);
}

fn emit_gauge_fixed(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    value: f64,
    decimals: usize,
    extra: &[(&str, &str)],
    global: &HashMap<String, String>,
) {
    emit_metric(out, name, help, "gauge", &[(extra, fmt_fixed(value, decimals))], global);
}

/// Emit `# HELP`/`# TYPE`, each `(labels, value)` sample line, then a blank separator.
fn emit_metric(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    kind: &str,
    samples: &[(&[(&str, &str)], String)],
    global: &HashMap<String, String>,
) {
    out.push(format!("# HELP {name} {help}"));
    out.push(format!("# TYPE {name} {kind}"));
    for (extra, value) in samples {
        out.push(format!("{name}{} {value}", format_labels(global, extra)));
    }
    out.push(String::new());
}

/// Emit an HTTP/timer duration histogram, converting millisecond `stats` to
/// seconds before applying `buckets`.
fn emit_duration_histogram(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    stats: &WindowStats,
    buckets: &[f64],
    extra: &[(&str, &str)],
    global: &HashMap<String, String>,
) {
    let max_seconds = stats.max / 1000.0;
    let sum_seconds = stats.sum / 1000.0;
    emit_histogram_lines(
        out, name, help, stats.count, sum_seconds, max_seconds, buckets, extra, global, Some(6),
    );
}

/// Emit a custom (non-fixed-contract) histogram or timer, selecting bucket
/// geometry from the (possibly unit-converted) maximum.
///
/// `divisor` converts recorded units into the emitted units (`1.0` for
/// histograms recorded directly in their native unit, `1000.0` for timers
/// recorded in milliseconds and emitted in seconds).
fn emit_custom_histogram(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    stats: &WindowStats,
    divisor: f64,
    global: &HashMap<String, String>,
) {
    let max = stats.max / divisor;
    let sum = stats.sum / divisor;
    let buckets = custom_buckets(max);
    let sum_decimals = if divisor == 1.0 { None } else { Some(6) };
    emit_histogram_lines(out, name, help, stats.count, sum, max, &buckets, &[], global, sum_decimals);
}

/// `sum_decimals = None` formats the `_sum` line with [`fmt_default`] instead
/// of a fixed precision.
fn emit_histogram_lines(
    out: &mut Vec<String>,
    name: &str,
    help: &str,
    count: usize,
    sum: f64,
    max: f64,
    buckets: &[f64],
    extra: &[(&str, &str)],
    global: &HashMap<String, String>,
    sum_decimals: Option<usize>,
) {
    out.push(format!("# HELP {name} {help}"));
    out.push(format!("# TYPE {name} histogram"));
    for &b in buckets {
        let mut labels = extra.to_vec();
        let le = fmt_default(b);
        labels.push(("le", le.as_str()));
        out.push(format!(
            "{name}_bucket{} {}",
            format_labels(global, &labels),
            bucket_count(max, count, b)
        ));
    }
    let mut inf_labels = extra.to_vec();
    inf_labels.push(("le", "+Inf"));
    out.push(format!(
        "{name}_bucket{} {count}",
        format_labels(global, &inf_labels)
    ));
    let sum_str = match sum_decimals {
        Some(d) => fmt_fixed(sum, d),
        None => fmt_default(sum),
    };
    out.push(format!("{name}_sum{} {sum_str}", format_labels(global, extra)));
    out.push(format!("{name}_count{} {count}", format_labels(global, extra)));
    out.push(String::new());
}

/// Estimated cumulative sample count for bucket boundary `b`.
fn bucket_count(max: f64, count: usize, b: f64) -> u64 {
    if count == 0 {
        return 0;
    }
    if max <= b {
        count as u64
    } else {
        ((b / max) * count as f64).floor() as u64
    }
}

/// Bucket boundaries for a custom (non-time-contract) histogram.
fn custom_buckets(max: f64) -> Vec<f64> {
    if max <= 0.0 {
        return vec![0.0, 1.0, 10.0, 100.0];
    }
    let magnitude = 10f64.powf(max.log10().floor());
    let limit = max * 1.2;
    let mut buckets = Vec::new();
    let mut factor = 0.1_f64;
    loop {
        let b = magnitude * factor;
        if b > limit {
            break;
        }
        buckets.push(b);
        factor *= 2.5;
    }
    buckets
}

fn format_labels(global: &HashMap<String, String>, extra: &[(&str, &str)]) -> String {
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    for (k, v) in global {
        merged.insert(k.as_str(), v.as_str());
    }
    for (k, v) in extra {
        merged.insert(k, v);
    }
    if merged.is_empty() {
        return String::new();
    }
    let body = merged
        .into_iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Sanitize a user-supplied metric name per the Prometheus naming contract.
fn sanitize_metric_name(name: &str) -> String {
    if name.is_empty() {
        return "_".to_owned();
    }
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn fmt_default(v: f64) -> String {
    format!("{v}")
}

fn fmt_fixed(v: f64, decimals: usize) -> String {
    format!("{v:.decimals$}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        histogram::WindowStats,
        http_tracker::HttpMetrics,
        process::{CpuUsage, MemoryUsage, ProcessSnapshot},
        registry::{CustomMetrics, Snapshot, SnapshotMeta},
    };

    fn sample_snapshot() -> Snapshot {
        let mut status_codes = HashMap::new();
        status_codes.insert("200".to_owned(), 1000u64);
        Snapshot {
            timestamp: 0,
            http: HttpMetrics {
                total_requests: 1000,
                active_requests: 0,
                requests_per_second: 12.5,
                status_codes,
                latency: WindowStats {
                    count: 1000,
                    sum: 50_000.0,
                    min: 10.0,
                    max: 500.0,
                    mean: 50.0,
                    p50: 45.0,
                    p95: 200.0,
                    p99: 480.0,
                },
                by_method: HashMap::new(),
                by_route: HashMap::new(),
            },
            process: ProcessSnapshot {
                memory_usage: MemoryUsage::default(),
                cpu_usage: CpuUsage::default(),
                uptime: 10.0,
                event_loop_lag: 0.0,
            },
            custom: CustomMetrics::default(),
            meta: SnapshotMeta::default(),
        }
    }

    #[test]
    fn worked_example_matches_contract() {
        let snapshot = sample_snapshot();
        let mut labels = HashMap::new();
        labels.insert("service".to_owned(), "api".to_owned());
        let text = format(&snapshot, &labels);

        assert!(text.contains("http_requests_total{service=\"api\"} 1000"));
        assert!(text.contains("http_request_duration_seconds_sum{service=\"api\"} 50.000000"));
        assert!(text.contains("http_request_duration_seconds_count{service=\"api\"} 1000"));
        assert!(text.contains("http_request_duration_seconds_bucket{service=\"api\",le=\"+Inf\"} 1000"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn status_code_family_emits_single_help_type_pair() {
        let mut snapshot = sample_snapshot();
        snapshot.http.status_codes.insert("404".to_owned(), 3);
        snapshot.http.status_codes.insert("500".to_owned(), 2);
        let text = format(&snapshot, &HashMap::new());

        assert_eq!(
            text.matches("# HELP http_requests_by_status_total").count(),
            1
        );
        assert_eq!(
            text.matches("# TYPE http_requests_by_status_total").count(),
            1
        );
        assert!(text.contains("http_requests_by_status_total{status=\"200\"} 1000"));
        assert!(text.contains("http_requests_by_status_total{status=\"404\"} 3"));
        assert!(text.contains("http_requests_by_status_total{status=\"500\"} 2"));
    }

    #[test]
    fn method_and_route_families_emit_single_help_type_pair() {
        let mut snapshot = sample_snapshot();
        snapshot
            .http
            .by_method
            .insert("GET".to_owned(), RouteAggregateView { count: 10, avg_latency: 1.0 });
        snapshot
            .http
            .by_method
            .insert("POST".to_owned(), RouteAggregateView { count: 4, avg_latency: 2.0 });
        snapshot
            .http
            .by_route
            .insert("/a".to_owned(), RouteAggregateView { count: 6, avg_latency: 1.0 });
        snapshot
            .http
            .by_route
            .insert("/b".to_owned(), RouteAggregateView { count: 8, avg_latency: 2.0 });
        let text = format(&snapshot, &HashMap::new());

        assert_eq!(
            text.matches("# HELP http_requests_by_method_total").count(),
            1
        );
        assert!(text.contains("http_requests_by_method_total{method=\"GET\"} 10"));
        assert!(text.contains("http_requests_by_method_total{method=\"POST\"} 4"));
        assert_eq!(
            text.matches("# HELP http_requests_by_route_total").count(),
            1
        );
        assert!(text.contains("http_requests_by_route_total{route=\"/a\"} 6"));
        assert!(text.contains("http_requests_by_route_total{route=\"/b\"} 8"));
    }

    #[test]
    fn metric_name_sanitization() {
        assert_eq!(sanitize_metric_name(""), "_");
        assert_eq!(sanitize_metric_name("9lives"), "_9lives");
        assert_eq!(sanitize_metric_name("a.b-c"), "a_b_c");
        assert_eq!(sanitize_metric_name("valid_name:1"), "valid_name:1");
    }

    #[test]
    fn label_value_escaping() {
        assert_eq!(escape_label_value("a\\b\"c\nd"), "a\\\\b\\\"c\\nd");
    }

    #[test]
    fn custom_bucket_geometry_default_when_max_zero() {
        assert_eq!(custom_buckets(0.0), vec![0.0, 1.0, 10.0, 100.0]);
    }

    #[test]
    fn custom_bucket_geometry_scales_by_magnitude() {
        let buckets = custom_buckets(50.0);
        assert_eq!(buckets.first(), Some(&1.0));
        assert!(buckets.last().unwrap() <= &60.0);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn bucket_count_estimate() {
        assert_eq!(bucket_count(500.0, 1000, 500.0), 1000);
        assert_eq!(bucket_count(500.0, 1000, 250.0), 500);
        assert_eq!(bucket_count(0.0, 0, 1.0), 0);
    }
}
