// src/pipeline/metrics.rs
//
// Counters for every subsystem, exported as JSON via the hub's /metrics
// endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct PipelineMetrics {
    pub frames_processed: AtomicU64,
    pub detections_total: AtomicU64,
    pub tracklets_submitted: AtomicU64,
    pub cluster_passes: AtomicU64,
    pub cluster_failures: AtomicU64,
    pub frames_published: AtomicU64,
    pub transient_errors: AtomicU64,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            tracklets_submitted: AtomicU64::new(0),
            cluster_passes: AtomicU64::new(0),
            cluster_failures: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Aggregate frames per second across all cameras since startup.
    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            fps: self.fps(),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            tracklets_submitted: self.tracklets_submitted.load(Ordering::Relaxed),
            cluster_passes: self.cluster_passes.load(Ordering::Relaxed),
            cluster_failures: self.cluster_failures.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_processed: u64,
    pub fps: f64,
    pub detections_total: u64,
    pub tracklets_submitted: u64,
    pub cluster_passes: u64,
    pub cluster_failures: u64,
    pub frames_published: u64,
    pub transient_errors: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_summary() {
        let metrics = PipelineMetrics::new();
        metrics.inc(&metrics.frames_processed);
        metrics.add(&metrics.detections_total, 7);
        metrics.inc(&metrics.cluster_passes);

        let summary = metrics.summary();
        assert_eq!(summary.frames_processed, 1);
        assert_eq!(summary.detections_total, 7);
        assert_eq!(summary.cluster_passes, 1);
        assert_eq!(summary.cluster_failures, 0);
    }

    #[test]
    fn summary_serializes_to_json() {
        let metrics = PipelineMetrics::new();
        metrics.add(&metrics.frames_published, 3);
        metrics.inc(&metrics.transient_errors);

        let json = serde_json::to_value(metrics.summary()).unwrap();
        assert_eq!(json["frames_published"], 3);
        assert_eq!(json["transient_errors"], 1);
        assert!(json["elapsed_secs"].is_f64());
    }
}
