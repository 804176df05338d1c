//! Self-contained HTML dashboard renderer.

use askama::Template;

use crate::{errors::VitalsError, registry::Snapshot};

/// Template backing the rendered dashboard. Askama's `ext = "html"` auto-escape
/// covers every interpolated value below, satisfying the "no raw
/// user-controlled substring" requirement for free.
#[derive(Template)]
#[template(path = "dashboard.html.j2", ext = "html")]
struct DashboardTemplate {
    generated_at: u64,
    total_requests: u64,
    active_requests: u64,
    avg_latency_ms: String,
    uptime: String,
    heap_used: String,
    event_loop_lag_ms: String,
    rps: String,
    p50: String,
    p95: String,
    p99: String,
    routes: Vec<RouteRow>,
    status_badges: Vec<StatusBadge>,
    heap_total: String,
    rss: String,
    cpu_user_seconds: String,
    cpu_system_seconds: String,
    cardinality: Option<CardinalityView>,
    counters: Vec<(String, String)>,
    gauges: Vec<(String, String)>,
    histograms: Vec<HistogramRow>,
    timers: Vec<HistogramRow>,
}

impl DashboardTemplate {
    fn has_custom_metrics(&self) -> bool {
        !self.counters.is_empty()
            || !self.gauges.is_empty()
            || !self.histograms.is_empty()
            || !self.timers.is_empty()
    }
}

struct RouteRow {
    route: String,
    count: u64,
    avg_latency_ms: String,
}

struct StatusBadge {
    code: String,
    count: u64,
    class: &'static str,
}

struct HistogramRow {
    name: String,
    count: usize,
    mean: String,
    p95: String,
}

struct CardinalityView {
    value: usize,
    max: usize,
    percent: u64,
    color: &'static str,
}

/// Render `snapshot` as a self-contained HTML5 document.
pub(crate) fn render(snapshot: &Snapshot) -> Result<String, VitalsError> {
    build_template(snapshot).render().map_err(|err| VitalsError::Render {
        operation: "dashboard",
        source: err.to_string(),
    })
}

fn build_template(snapshot: &Snapshot) -> DashboardTemplate {
    let http = &snapshot.http;
    let process = &snapshot.process;

    let mut routes: Vec<RouteRow> = http
        .by_route
        .iter()
        .map(|(route, agg)| RouteRow {
            route: route.clone(),
            count: agg.count,
            avg_latency_ms: format!("{:.1}", agg.avg_latency),
        })
        .collect();
    routes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.route.cmp(&b.route)));
    routes.truncate(10);

    let mut status_badges: Vec<StatusBadge> = http
        .status_codes
        .iter()
        .map(|(code, count)| StatusBadge {
            code: code.clone(),
            count: *count,
            class: status_badge_class(code),
        })
        .collect();
    status_badges.sort_by(|a, b| a.code.cmp(&b.code));

    let cardinality = if snapshot.meta.max_cardinality > 0 {
        let percent = snapshot.meta.cardinality_usage_percent;
        Some(CardinalityView {
            value: snapshot.meta.cardinality,
            max: snapshot.meta.max_cardinality,
            percent,
            color: if percent >= 90 {
                "red"
            } else if percent >= 80 {
                "yellow"
            } else {
                "green"
            },
        })
    } else {
        None
    };

    let counters = snapshot
        .custom
        .counters
        .iter()
        .map(|(name, value)| (name.clone(), format!("{value}")))
        .collect::<Vec<_>>();
    let mut counters = counters;
    counters.sort_by(|a, b| a.0.cmp(&b.0));

    let mut gauges = snapshot
        .custom
        .gauges
        .iter()
        .map(|(name, value)| (name.clone(), format!("{value}")))
        .collect::<Vec<_>>();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));

    let mut histograms = snapshot
        .custom
        .histograms
        .iter()
        .map(|(name, stats)| HistogramRow {
            name: name.clone(),
            count: stats.count,
            mean: format!("{:.2}", stats.mean),
            p95: format!("{:.2}", stats.p95),
        })
        .collect::<Vec<_>>();
    histograms.sort_by(|a, b| a.name.cmp(&b.name));

    let mut timers = snapshot
        .custom
        .timers
        .iter()
        .map(|(name, stats)| HistogramRow {
            name: name.clone(),
            count: stats.count,
            mean: format!("{:.2}", stats.mean),
            p95: format!("{:.2}", stats.p95),
        })
        .collect::<Vec<_>>();
    timers.sort_by(|a, b| a.name.cmp(&b.name));

    DashboardTemplate {
        generated_at: snapshot.timestamp,
        total_requests: http.total_requests,
        active_requests: http.active_requests,
        avg_latency_ms: format!("{:.2}", http.latency.mean),
        uptime: format_uptime(process.uptime),
        heap_used: format_bytes(process.memory_usage.heap_used),
        event_loop_lag_ms: format!("{:.2}", process.event_loop_lag),
        rps: format!("{:.3}", http.requests_per_second),
        p50: format!("{:.2}", http.latency.p50),
        p95: format!("{:.2}", http.latency.p95),
        p99: format!("{:.2}", http.latency.p99),
        routes,
        status_badges,
        heap_total: format_bytes(process.memory_usage.heap_total),
        rss: format_bytes(process.memory_usage.rss),
        cpu_user_seconds: format!("{:.3}", process.cpu_usage.user as f64 / 1_000_000.0),
        cpu_system_seconds: format!("{:.3}", process.cpu_usage.system as f64 / 1_000_000.0),
        cardinality,
        counters,
        gauges,
        histograms,
        timers,
    }
}

fn status_badge_class(code: &str) -> &'static str {
    match code.parse::<u16>() {
        Ok(c) if (200..300).contains(&c) => "success",
        Ok(c) if (400..500).contains(&c) => "warning",
        Ok(c) if c >= 500 => "error",
        _ => "info",
    }
}

fn format_uptime(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
