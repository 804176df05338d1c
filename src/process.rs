//! Process-health sampling: memory, CPU delta percentage, and scheduler lag.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

/// Memory usage, in bytes.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct MemoryUsage {
    /// Heap bytes currently in use.
    ///
    /// Rust has no distinct heap/RSS split the way a managed runtime does;
    /// this and `heap_total` both report resident set size so the field
    /// names stay stable for consumers of the wire format.
    pub heap_used: u64,
    /// Heap bytes reserved.
    pub heap_total: u64,
    /// Memory outside the main heap (reported as virtual memory size).
    pub external: u64,
    /// Resident set size.
    pub rss: u64,
}

/// Cumulative process CPU time, in microseconds, since the sampler was
/// constructed.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct CpuUsage {
    /// Time spent in user mode.
    ///
    /// `sysinfo` does not expose a user/system split portably, so all
    /// measured CPU time is attributed here and `system` stays `0`.
    pub user: u64,
    /// Time spent in kernel mode.
    pub system: u64,
}

/// Point-in-time snapshot of process health.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct ProcessSnapshot {
    /// Memory usage.
    pub memory_usage: MemoryUsage,
    /// Cumulative CPU usage.
    pub cpu_usage: CpuUsage,
    /// Seconds since the sampler was created (tracker-relative, not OS
    /// process-relative).
    pub uptime: f64,
    /// Scheduler lag, in milliseconds. Always `0.0` from [`ProcessSampler::collect`];
    /// the registry fills in the last measured value.
    pub event_loop_lag: f64,
}

/// Shared monotonic CPU-time accumulator.
///
/// `sysinfo` only exposes instantaneous CPU usage as a percentage over its
/// own refresh interval, not a cumulative counter, so one is synthesized here
/// by integrating that percentage over wall-clock time on every sample.
struct CpuAccumulator {
    micros: u64,
    last_sample: Instant,
}

/// Baseline used by [`ProcessSampler::cpu_percentage`] to compute a delta.
#[derive(Clone, Copy)]
struct CpuBaseline {
    micros: u64,
    wall_clock: Instant,
}

/// Samples OS-level process health data.
pub struct ProcessSampler {
    start: Instant,
    system: Mutex<System>,
    pid: Pid,
    accumulator: Mutex<CpuAccumulator>,
    baseline: Mutex<Option<CpuBaseline>>,
}

impl ProcessSampler {
    /// Create a new sampler, establishing the tracker-relative uptime origin.
    #[must_use]
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let refresh = RefreshKind::nothing().with_processes(ProcessRefreshKind::everything());
        let system = System::new_with_specifics(refresh);
        let now = Instant::now();
        Self {
            start: now,
            system: Mutex::new(system),
            pid,
            accumulator: Mutex::new(CpuAccumulator {
                micros: 0,
                last_sample: now,
            }),
            baseline: Mutex::new(None),
        }
    }

    fn refresh(&self) {
        self.system.lock().refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        );
    }

    /// Advance the cumulative CPU-time accumulator using the latest
    /// instantaneous CPU percentage, and return its new value in
    /// microseconds.
    fn advance_cpu_accumulator(&self) -> u64 {
        let percent = {
            let system = self.system.lock();
            system.process(self.pid).map_or(0.0, |p| p.cpu_usage() as f64)
        };
        let now = Instant::now();
        let mut acc = self.accumulator.lock();
        let wall_delta_micros = now.duration_since(acc.last_sample).as_micros() as f64;
        acc.micros += ((percent / 100.0) * wall_delta_micros).max(0.0) as u64;
        acc.last_sample = now;
        acc.micros
    }

    /// Collect a process snapshot. `event_loop_lag` is always `0.0`; callers
    /// (the registry) fill it in from their own periodic measurement.
    #[must_use]
    pub fn collect(&self) -> ProcessSnapshot {
        self.refresh();
        let (rss, virt) = {
            let system = self.system.lock();
            match system.process(self.pid) {
                Some(proc) => (proc.memory(), proc.virtual_memory()),
                None => (0, 0),
            }
        };
        let cpu_micros = self.advance_cpu_accumulator();

        ProcessSnapshot {
            memory_usage: MemoryUsage {
                heap_used: rss,
                heap_total: rss,
                external: virt.saturating_sub(rss),
                rss,
            },
            cpu_usage: CpuUsage {
                user: cpu_micros,
                system: 0,
            },
            uptime: self.start.elapsed().as_secs_f64(),
            event_loop_lag: 0.0,
        }
    }

    /// Compute CPU usage percentage since the last call to this method (or
    /// since construction / the last [`Self::reset_cpu_baseline`] call).
    ///
    /// The first call always returns `0.0` and only establishes the
    /// baseline. Returns `0.0` if no wall-clock time has elapsed.
    pub fn cpu_percentage(&self) -> f64 {
        self.refresh();
        let now_micros = self.advance_cpu_accumulator();
        let now_wall = Instant::now();

        let mut baseline = self.baseline.lock();
        let pct = match *baseline {
            None => 0.0,
            Some(prev) => {
                let wall_delta = now_wall.duration_since(prev.wall_clock).as_micros() as f64;
                if wall_delta <= 0.0 {
                    0.0
                } else {
                    let cpu_delta = now_micros.saturating_sub(prev.micros) as f64;
                    (100.0 * cpu_delta / wall_delta).max(0.0)
                }
            }
        };
        *baseline = Some(CpuBaseline {
            micros: now_micros,
            wall_clock: now_wall,
        });
        pct
    }

    /// Re-seed the CPU usage baseline to now, discarding history.
    pub fn reset_cpu_baseline(&self) {
        *self.baseline.lock() = None;
    }

    /// Measure scheduler lag by scheduling a near-immediate task and timing
    /// the delay until it actually runs.
    ///
    /// Non-blocking: suspends the calling task, not the runtime.
    pub async fn event_loop_lag(&self) -> Duration {
        let scheduled_at = Instant::now();
        // tokio::task::yield_now() returns control to the scheduler and
        // resumes only after pending ready tasks have had a turn, which is
        // this runtime's closest equivalent of scheduling an "immediate".
        tokio::task::yield_now().await;
        scheduled_at.elapsed()
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cpu_call_establishes_baseline() {
        let sampler = ProcessSampler::new();
        assert_eq!(sampler.cpu_percentage(), 0.0);
    }

    #[test]
    fn collect_reports_nonnegative_uptime() {
        let sampler = ProcessSampler::new();
        let snap = sampler.collect();
        assert!(snap.uptime >= 0.0);
        assert_eq!(snap.event_loop_lag, 0.0);
    }

    #[test]
    fn reset_cpu_baseline_clears_state() {
        let sampler = ProcessSampler::new();
        let _ = sampler.cpu_percentage();
        sampler.reset_cpu_baseline();
        // Next call re-establishes the baseline and returns 0.0 again.
        assert_eq!(sampler.cpu_percentage(), 0.0);
    }

    #[tokio::test]
    async fn event_loop_lag_is_non_negative() {
        let sampler = ProcessSampler::new();
        let lag = sampler.event_loop_lag().await;
        assert!(lag >= Duration::ZERO);
    }
}
