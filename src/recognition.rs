// src/recognition.rs
//
// Out-of-band plate recognition. At most one job per spot is in flight; the
// pending set tracks which spots have one. Results come back on a channel
// that the processing loop drains between frames.

use crate::interface::Recognizer;
use crate::pipeline::MonitorMetrics;
use crate::preprocessing::SpotCrop;
use crate::types::PlateReading;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Spots with a recognition job in flight.
#[derive(Default)]
pub struct PendingSet {
    spots: Mutex<HashSet<String>>,
}

impl PendingSet {
    /// False if the spot already had a job.
    pub fn try_insert(&self, spot: &str) -> bool {
        self.spots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spot.to_string())
    }

    pub fn remove(&self, spot: &str) -> bool {
        self.spots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(spot)
    }

    #[cfg(test)]
    pub fn contains(&self, spot: &str) -> bool {
        self.spots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(spot)
    }

    pub fn len(&self) -> usize {
        self.spots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases the spot when the job ends, whichever way it ends.
struct PendingGuard<'a> {
    pending: &'a PendingSet,
    spot: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.spot);
    }
}

struct RecognitionJob {
    spot: String,
    generation: u64,
    crop: SpotCrop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    Plate(PlateReading),
    Empty,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecognitionCompletion {
    pub spot: String,
    /// Occupancy generation the crop was taken in.
    pub generation: u64,
    pub outcome: RecognitionOutcome,
    pub finished_at: DateTime<Utc>,
}

pub struct RecognitionDispatcher {
    jobs: Option<Sender<RecognitionJob>>,
    completions: Receiver<RecognitionCompletion>,
    pending: Arc<PendingSet>,
    workers: Vec<JoinHandle<()>>,
    metrics: MonitorMetrics,
}

impl RecognitionDispatcher {
    /// `queue_capacity` bounds jobs waiting for a free worker.
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        num_workers: usize,
        queue_capacity: usize,
        metrics: MonitorMetrics,
    ) -> Self {
        let (job_tx, job_rx) = bounded::<RecognitionJob>(queue_capacity.max(1));
        let (done_tx, done_rx) = unbounded::<RecognitionCompletion>();
        let pending = Arc::new(PendingSet::default());

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers.max(1) {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let recognizer = recognizer.clone();
            let pending = pending.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("recognition-{}", worker_id))
                .spawn(move || {
                    debug!("Recognition worker {} started", worker_id);
                    while let Ok(job) = job_rx.recv() {
                        let completion = run_job(recognizer.as_ref(), &pending, job);
                        if done_tx.send(completion).is_err() {
                            break;
                        }
                    }
                    debug!("Recognition worker {} shutting down", worker_id);
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("Failed to spawn recognition worker {}: {}", worker_id, e),
            }
        }

        info!("✓ Recognition dispatcher ready ({} worker(s))", workers.len());

        Self {
            jobs: Some(job_tx),
            completions: done_rx,
            pending,
            workers,
            metrics,
        }
    }

    /// Dispatcher that accepts nothing. Used when recognition is turned off.
    pub fn disabled(metrics: MonitorMetrics) -> Self {
        let (_done_tx, done_rx) = unbounded();
        Self {
            jobs: None,
            completions: done_rx,
            pending: Arc::new(PendingSet::default()),
            workers: Vec::new(),
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.jobs.is_some()
    }

    /// Fire and forget. Returns whether a job was actually queued.
    pub fn schedule(&self, spot: &str, generation: u64, crop: Option<SpotCrop>) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        let Some(crop) = crop.filter(|c| !c.is_empty()) else {
            return false;
        };
        if !self.pending.try_insert(spot) {
            debug!("Recognition already pending for {}", spot);
            return false;
        }

        let job = RecognitionJob {
            spot: spot.to_string(),
            generation,
            crop,
        };
        match jobs.try_send(job) {
            Ok(()) => {
                self.metrics.inc(&self.metrics.recognitions_dispatched);
                debug!("Recognition scheduled for {}", spot);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.pending.remove(spot);
                warn!("Recognition queue full, skipping {}", spot);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending.remove(spot);
                warn!("Recognition workers are gone, skipping {}", spot);
                false
            }
        }
    }

    /// Completions that arrived since the last call, without blocking.
    pub fn drain_completions(&self) -> Vec<RecognitionCompletion> {
        self.completions.try_iter().collect()
    }

    #[cfg(test)]
    pub fn wait_completion(&self, timeout: std::time::Duration) -> Option<RecognitionCompletion> {
        self.completions.recv_timeout(timeout).ok()
    }

    #[cfg(test)]
    pub fn is_pending(&self, spot: &str) -> bool {
        self.pending.contains(spot)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop accepting work and wait for in-flight jobs to finish.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!("Recognition worker {} panicked", worker_id);
            }
        }
    }
}

fn run_job(recognizer: &dyn Recognizer, pending: &PendingSet, job: RecognitionJob) -> RecognitionCompletion {
    let outcome = {
        let _guard = PendingGuard {
            pending,
            spot: &job.spot,
        };
        match catch_unwind(AssertUnwindSafe(|| recognizer.recognize(&job.crop))) {
            Ok(Ok(Some(reading))) if !reading.plate.trim().is_empty() => {
                RecognitionOutcome::Plate(reading)
            }
            Ok(Ok(_)) => RecognitionOutcome::Empty,
            Ok(Err(e)) => RecognitionOutcome::Failed(format!("{:#}", e)),
            Err(_) => RecognitionOutcome::Failed("recognizer panicked".to_string()),
        }
    };

    RecognitionCompletion {
        spot: job.spot,
        generation: job.generation,
        outcome,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Blocks every call until the test releases it.
    struct GatedRecognizer {
        gate: Receiver<()>,
        calls: AtomicUsize,
        mode: &'static str,
    }

    impl Recognizer for GatedRecognizer {
        fn recognize(&self, _crop: &SpotCrop) -> Result<Option<PlateReading>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            match self.mode {
                "plate" => Ok(Some(PlateReading {
                    plate: "ABC1D23".to_string(),
                    ocr_confidence: Some(0.93),
                    detection_confidence: Some(0.88),
                })),
                "empty" => Ok(None),
                "error" => Err(anyhow!("model crashed")),
                _ => panic!("recognizer exploded"),
            }
        }
    }

    fn crop() -> Option<SpotCrop> {
        Some(SpotCrop {
            data: vec![10u8; 4 * 4 * 3],
            width: 4,
            height: 4,
        })
    }

    fn dispatcher(mode: &'static str) -> (RecognitionDispatcher, Sender<()>, Arc<GatedRecognizer>) {
        let (gate_tx, gate_rx) = unbounded();
        let recognizer = Arc::new(GatedRecognizer {
            gate: gate_rx,
            calls: AtomicUsize::new(0),
            mode,
        });
        let d = RecognitionDispatcher::new(recognizer.clone(), 2, 8, MonitorMetrics::new());
        (d, gate_tx, recognizer)
    }

    #[test]
    fn test_duplicate_schedule_runs_one_job() {
        let (mut d, gate, recognizer) = dispatcher("plate");

        assert!(d.schedule("A1", 0, crop()));
        assert!(!d.schedule("A1", 0, crop()));
        assert!(d.is_pending("A1"));

        gate.send(()).unwrap();
        let done = d.wait_completion(Duration::from_secs(5)).unwrap();
        assert_eq!(done.spot, "A1");
        assert!(matches!(done.outcome, RecognitionOutcome::Plate(ref r) if r.plate == "ABC1D23"));
        assert!(!d.is_pending("A1"));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);

        // a new job is accepted once the previous one completed
        assert!(d.schedule("A1", 3, crop()));
        gate.send(()).unwrap();
        assert_eq!(d.wait_completion(Duration::from_secs(5)).unwrap().generation, 3);
        d.shutdown();
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failures_release_pending() {
        for mode in ["empty", "error", "panic"] {
            let (mut d, gate, _) = dispatcher(mode);
            assert!(d.schedule("B2", 0, crop()));
            gate.send(()).unwrap();
            let done = d.wait_completion(Duration::from_secs(5)).unwrap();
            match mode {
                "empty" => assert_eq!(done.outcome, RecognitionOutcome::Empty),
                _ => assert!(matches!(done.outcome, RecognitionOutcome::Failed(_))),
            }
            assert_eq!(d.pending_count(), 0);
            d.shutdown();
        }
    }

    #[test]
    fn test_noop_cases() {
        let d = RecognitionDispatcher::disabled(MonitorMetrics::new());
        assert!(!d.is_enabled());
        assert!(!d.schedule("A1", 0, crop()));

        let (mut d, _gate, recognizer) = dispatcher("plate");
        assert!(!d.schedule("A1", 0, None));
        assert!(!d.schedule(
            "A1",
            0,
            Some(SpotCrop {
                data: vec![],
                width: 0,
                height: 0
            })
        ));
        assert_eq!(d.pending_count(), 0);
        drop(_gate);
        d.shutdown();
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }
}
