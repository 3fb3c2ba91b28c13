//! Scheduler statistics: result counts and queue/update timing histories.
//!
//! Result counters are always maintained. Timing histories are feature-gated
//! and runtime-toggled so they cost nothing when disabled.
//!
//! # Usage
//!
//! ```ignore
//! use instance_scheduler::metrics::COLLECT_METRICS;
//!
//! // Compile with --features metrics
//! // Runtime toggle:
//! COLLECT_METRICS.store(false, Ordering::Relaxed);
//!
//! let metrics = scheduler.metrics();
//! println!("avg queue time: {:.1}us", metrics.avg_queue_time_us());
//! ```

use std::collections::VecDeque;
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::context::UpdateOutcome;
use crate::types::UpdateResult;

/// Runtime toggle for timing collection.
pub static COLLECT_METRICS: AtomicBool = AtomicBool::new(true);

/// Check if timing collection is enabled (both compile-time and runtime).
#[inline]
pub fn is_enabled() -> bool {
    #[cfg(feature = "metrics")]
    {
        COLLECT_METRICS.load(Ordering::Relaxed)
    }
    #[cfg(not(feature = "metrics"))]
    {
        false
    }
}

/// Most recent durations, oldest evicted first.
#[derive(Debug, Clone)]
pub struct TimingWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl TimingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    /// Zero when empty.
    pub fn mean(&self) -> Duration {
        match self.samples.len() {
            0 => Duration::ZERO,
            n => self.samples.iter().sum::<Duration>() / n as u32,
        }
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    /// Nearest-rank percentile, `p` in `0.0..=1.0`.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        Some(sorted[rank])
    }
}

impl Default for TimingWindow {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Counters and timing histories for a scheduler.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    /// Finalized updates per result kind (index = `UpdateResult` order).
    results: [u64; 7],
    /// Time between enqueue and pipeline start.
    pub queue_timings: TimingWindow,
    /// Time spent in the pipeline.
    pub update_timings: TimingWindow,
    /// Scheduling passes run.
    pub ticks: u64,
    /// Cache sweeps run.
    pub sweeps: u64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized update.
    pub fn record_outcome(&mut self, outcome: &UpdateOutcome) {
        self.results[outcome.result.index()] += 1;
        if is_enabled() {
            self.queue_timings.record(outcome.queue_time);
            self.update_timings.record(outcome.update_time);
        }
    }

    /// Finalized updates with `result`.
    pub fn count(&self, result: UpdateResult) -> u64 {
        self.results[result.index()]
    }

    /// Finalized updates of any kind.
    pub fn total_finalized(&self) -> u64 {
        self.results.iter().sum()
    }

    pub fn avg_queue_time_us(&self) -> f64 {
        self.queue_timings.mean().as_secs_f64() * 1e6
    }

    pub fn avg_update_time_us(&self) -> f64 {
        self.update_timings.mean().as_secs_f64() * 1e6
    }

    /// Slowest 5% boundary of recent update times.
    pub fn p95_update_time(&self) -> Option<Duration> {
        self.update_timings.percentile(0.95)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstanceRecord, ObjectDesc, Registry};

    fn outcome(result: UpdateResult) -> UpdateOutcome {
        let mut registry = Registry::new();
        let object = registry.add_object(ObjectDesc {
            name: "m".into(),
            component_count: 1,
            lod_count: 1,
            source: None,
        });
        UpdateOutcome {
            instance: registry.insert(InstanceRecord::new(object)),
            result,
            queue_time: Duration::from_micros(100),
            update_time: Duration::from_micros(300),
        }
    }

    #[test]
    fn test_timing_window_evicts_oldest() {
        let mut window = TimingWindow::new(3);
        assert!(window.is_empty());
        assert_eq!(window.mean(), Duration::ZERO);
        assert!(window.percentile(0.5).is_none());

        for ms in [10, 20, 30, 40] {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean(), Duration::from_millis(30));
        assert_eq!(window.max(), Some(Duration::from_millis(40)));
        assert_eq!(window.latest(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let mut window = TimingWindow::new(100);
        for ms in (1..=100).rev() {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.percentile(0.0), Some(Duration::from_millis(1)));
        assert_eq!(window.percentile(1.0), Some(Duration::from_millis(100)));
        assert_eq!(window.percentile(0.95), Some(Duration::from_millis(95)));
    }

    #[test]
    fn test_result_counters() {
        let mut metrics = SchedulerMetrics::new();
        metrics.record_outcome(&outcome(UpdateResult::Success));
        metrics.record_outcome(&outcome(UpdateResult::Success));
        metrics.record_outcome(&outcome(UpdateResult::ErrorReplaced));

        assert_eq!(metrics.count(UpdateResult::Success), 2);
        assert_eq!(metrics.count(UpdateResult::ErrorReplaced), 1);
        assert_eq!(metrics.count(UpdateResult::Error), 0);
        assert_eq!(metrics.total_finalized(), 3);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_timing_recording() {
        let mut metrics = SchedulerMetrics::new();
        metrics.record_outcome(&outcome(UpdateResult::Success));

        assert_eq!(metrics.queue_timings.len(), 1);
        assert_eq!(metrics.avg_queue_time_us(), 100.0);
        assert_eq!(metrics.avg_update_time_us(), 300.0);
        assert_eq!(metrics.p95_update_time(), Some(Duration::from_micros(300)));
    }
}
