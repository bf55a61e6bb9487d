// src/pipeline/metrics.rs
//
// Counters shared by the processing loop, the recognition workers and the
// HTTP layer. Exported through /api/metrics and the progress log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct MonitorMetrics {
    pub frames_read: Arc<AtomicU64>,
    pub cycles: Arc<AtomicU64>,
    pub video_loops: Arc<AtomicU64>,
    pub recognitions_dispatched: Arc<AtomicU64>,
    pub recognitions_completed: Arc<AtomicU64>,
    pub recognitions_empty: Arc<AtomicU64>,
    pub recognitions_failed: Arc<AtomicU64>,
    pub plate_events: Arc<AtomicU64>,
    pub reservations_expired: Arc<AtomicU64>,
    pub fines_scheduled: Arc<AtomicU64>,
    pub subscribers_dropped: Arc<AtomicU64>,
    pub classifier_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self {
            frames_read: Arc::new(AtomicU64::new(0)),
            cycles: Arc::new(AtomicU64::new(0)),
            video_loops: Arc::new(AtomicU64::new(0)),
            recognitions_dispatched: Arc::new(AtomicU64::new(0)),
            recognitions_completed: Arc::new(AtomicU64::new(0)),
            recognitions_empty: Arc::new(AtomicU64::new(0)),
            recognitions_failed: Arc::new(AtomicU64::new(0)),
            plate_events: Arc::new(AtomicU64::new(0)),
            reservations_expired: Arc::new(AtomicU64::new(0)),
            fines_scheduled: Arc::new(AtomicU64::new(0)),
            subscribers_dropped: Arc::new(AtomicU64::new(0)),
            classifier_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_read.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            fps: self.fps(),
            cycles: self.cycles.load(Ordering::Relaxed),
            video_loops: self.video_loops.load(Ordering::Relaxed),
            recognitions_dispatched: self.recognitions_dispatched.load(Ordering::Relaxed),
            recognitions_completed: self.recognitions_completed.load(Ordering::Relaxed),
            recognitions_empty: self.recognitions_empty.load(Ordering::Relaxed),
            recognitions_failed: self.recognitions_failed.load(Ordering::Relaxed),
            plate_events: self.plate_events.load(Ordering::Relaxed),
            reservations_expired: self.reservations_expired.load(Ordering::Relaxed),
            fines_scheduled: self.fines_scheduled.load(Ordering::Relaxed),
            subscribers_dropped: self.subscribers_dropped.load(Ordering::Relaxed),
            last_classifier_us: self.classifier_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_read: u64,
    pub fps: f64,
    pub cycles: u64,
    pub video_loops: u64,
    pub recognitions_dispatched: u64,
    pub recognitions_completed: u64,
    pub recognitions_empty: u64,
    pub recognitions_failed: u64,
    pub plate_events: u64,
    pub reservations_expired: u64,
    pub fines_scheduled: u64,
    pub subscribers_dropped: u64,
    pub last_classifier_us: u64,
    pub elapsed_secs: f64,
}
