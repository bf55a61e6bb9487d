// src/monitor.rs
//
// The processing loop: read → classify (every Nth frame) → debounce →
// reconcile with reservations → publish, with recognition results folded
// back in between frames.

use crate::batch_classifier::BatchClassifier;
use crate::geometry::SpotGeometry;
use crate::pipeline::{
    EncodedFrame, FramePublisher, MonitorMetrics, PlateEventLog, SnapshotBroadcaster,
    SpotStateStore,
};
use crate::preprocessing::SpotCrop;
use crate::recognition::{RecognitionCompletion, RecognitionDispatcher, RecognitionOutcome};
use crate::reservations::ReservationCache;
use crate::smoother::{OccupancyDebouncer, Transition};
use crate::spots::SpotLayout;
use crate::types::{
    Config, Frame, PlateEvent, PlateReading, Reservation, Snapshot, Spot, SpotRuntimeState,
};
use crate::video_processor::{FrameRead, FrameRenderer, FrameSource, SourceError, SourceKind};
use crate::violation::{authorization_for, Authorization};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything the HTTP layer reads. Cheap to clone.
#[derive(Clone)]
pub struct MonitorOutputs {
    pub store: Arc<SpotStateStore>,
    pub broadcaster: Arc<SnapshotBroadcaster>,
    pub frames: Arc<FramePublisher>,
    pub plate_events: Arc<PlateEventLog>,
    pub reservations: Arc<ReservationCache>,
    pub metrics: MonitorMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub threshold: f32,
    pub history_len: usize,
    pub process_every_n_frames: u64,
    pub progress_every: u64,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.detection.threshold,
            history_len: config.detection.history_len,
            process_every_n_frames: config.detection.process_every_n_frames.max(1),
            progress_every: config.logging.progress_every,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop flag was raised; the last cycle completed.
    Requested,
    /// A live source stopped delivering frames.
    SourceEnded,
}

#[derive(Debug, Clone)]
struct PlateMemory {
    plate: String,
    ocr_conf: Option<f32>,
    det_conf: Option<f32>,
    timestamp: DateTime<Utc>,
}

pub struct ParkingMonitor {
    spots: HashMap<String, Spot>,
    geometry: SpotGeometry,
    classifier: BatchClassifier,
    debouncer: OccupancyDebouncer,
    dispatcher: RecognitionDispatcher,
    renderer: Box<dyn FrameRenderer>,
    outputs: MonitorOutputs,
    settings: MonitorSettings,
    stop: Arc<AtomicBool>,
    /// Frame counter within the current pass over the source.
    frame_index: u64,
    frames_total: u64,
    current: Snapshot,
    plate_memory: HashMap<String, PlateMemory>,
    /// Latest crop of every occupied spot.
    latest_crops: HashMap<String, SpotCrop>,
    /// Occupancy generation of the last accepted recognition job per spot.
    dispatched: HashMap<String, u64>,
}

impl ParkingMonitor {
    pub fn new(
        layout: &SpotLayout,
        classifier: BatchClassifier,
        dispatcher: RecognitionDispatcher,
        renderer: Box<dyn FrameRenderer>,
        outputs: MonitorOutputs,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            spots: layout
                .spots
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
            geometry: SpotGeometry::new(layout),
            classifier,
            debouncer: OccupancyDebouncer::new(settings.threshold, settings.history_len),
            dispatcher,
            renderer,
            outputs,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
            frame_index: 0,
            frames_total: 0,
            current: Snapshot::new(),
            plate_memory: HashMap::new(),
            latest_crops: HashMap::new(),
            dispatched: HashMap::new(),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run until stopped or until a live source ends. Recognition workers
    /// are drained before returning.
    pub fn run(&mut self, source: &mut dyn FrameSource) -> Result<StopReason, SourceError> {
        info!(
            "🅿️  Monitoring {} spot(s) from {} (plate recognition {})",
            self.spots.len(),
            source.describe(),
            if self.dispatcher.is_enabled() { "on" } else { "off" }
        );
        let result = self.run_loop(source);
        self.dispatcher.shutdown();
        self.apply_completions();
        info!("Monitor stopped after {} frame(s)", self.frames_total);
        result
    }

    fn run_loop(&mut self, source: &mut dyn FrameSource) -> Result<StopReason, SourceError> {
        let mut frames_since_rewind: u64 = 0;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("Stop requested, leaving processing loop");
                return Ok(StopReason::Requested);
            }

            self.apply_completions();

            let read = source.next_frame();
            match (read, source.kind()) {
                (Ok(FrameRead::Frame(frame)), _) => {
                    frames_since_rewind += 1;
                    self.process_frame(&frame);
                }
                (Ok(FrameRead::EndOfStream), SourceKind::File) => {
                    if frames_since_rewind == 0 {
                        return Err(SourceError::Read(format!(
                            "{} produced no frames",
                            source.describe()
                        )));
                    }
                    info!("End of video, restarting from the beginning");
                    source.rewind()?;
                    self.frame_index = 0;
                    frames_since_rewind = 0;
                    self.outputs.metrics.inc(&self.outputs.metrics.video_loops);
                }
                (Err(e), SourceKind::File) => {
                    warn!("Read error on file source, rewinding: {}", e);
                    if frames_since_rewind == 0 {
                        return Err(e);
                    }
                    source.rewind()?;
                    self.frame_index = 0;
                    frames_since_rewind = 0;
                }
                (Ok(FrameRead::EndOfStream), SourceKind::Live) => {
                    warn!("Live source {} ended", source.describe());
                    return Ok(StopReason::SourceEnded);
                }
                (Err(e), SourceKind::Live) => {
                    warn!("Live source {} failed: {}", source.describe(), e);
                    return Err(e);
                }
            }
        }
    }

    pub fn process_frame(&mut self, frame: &Frame) {
        self.frame_index += 1;
        self.frames_total += 1;
        self.outputs.metrics.inc(&self.outputs.metrics.frames_read);

        let stride = self.settings.process_every_n_frames;
        if self.frame_index == 1 || self.frame_index % stride == 0 {
            self.run_cycle(frame);
        }

        let spots = self.geometry.resolve(frame.resolution());
        match self.renderer.render(frame, spots, &self.current) {
            Ok(jpeg) => self.outputs.frames.publish(EncodedFrame {
                jpeg: Bytes::from(jpeg),
                frame_id: self.frames_total,
                width: frame.width as u32,
                height: frame.height as u32,
            }),
            Err(e) => debug!("Annotation failed on frame {}: {:#}", self.frames_total, e),
        }

        let every = self.settings.progress_every;
        if every > 0 && self.frames_total % every == 0 {
            let occupied = self.current.values().filter(|s| s.occupied).count();
            info!(
                "Progress: frame {} | occupied {}/{} | pending recognitions {} | {} subscriber(s) | {:.1} FPS",
                self.frames_total,
                occupied,
                self.spots.len(),
                self.dispatcher.pending_count(),
                self.outputs.broadcaster.subscriber_count(),
                self.outputs.metrics.fps()
            );
        }
    }

    /// One classification cycle. Readers see either the previous snapshot or
    /// this one, never a mix.
    fn run_cycle(&mut self, frame: &Frame) {
        let now = Utc::now();
        let reservations = self.outputs.reservations.active_snapshot(now);

        let scaled = self.geometry.resolve(frame.resolution());
        let started = Instant::now();
        let readings = self.classifier.classify_frame(frame, scaled);
        self.outputs.metrics.set_timing(
            &self.outputs.metrics.classifier_time_us,
            started.elapsed().as_micros() as u64,
        );

        // Spots missing from this cycle keep their previous state.
        let mut next = self.current.clone();

        for reading in readings {
            let name = reading.name;
            let Some(spot) = self.spots.get(&name) else {
                continue;
            };
            let reserved = spot.reserved || reservations.contains_key(&name);
            let outcome = self.debouncer.update(&name, reading.occupied_prob);

            if outcome.occupied && reservations.contains_key(&name) {
                self.outputs.reservations.mark_matched(&name);
            }

            if outcome.transition == Transition::BecameOccupied && reserved {
                self.dispatch(&name, outcome.generation, reading.crop.clone());
            }

            if outcome.occupied {
                self.latest_crops.insert(name.clone(), reading.crop);
            } else {
                self.latest_crops.remove(&name);
                if self.plate_memory.remove(&name).is_some() {
                    debug!("Spot {} is free, plate memory cleared", name);
                }
            }

            let entry = next.entry(name).or_default();
            entry.occupied = outcome.occupied;
            entry.prob = reading.occupied_prob;
        }

        for (name, state) in next.iter_mut() {
            let Some(spot) = self.spots.get(name) else {
                continue;
            };
            let reservation = reservations.get(name);
            let auth = authorization_for(spot, reservation);
            reconcile(
                state,
                spot,
                &auth,
                reservation,
                self.plate_memory.get(name),
            );
        }

        self.current = next;
        self.outputs.store.replace(self.current.clone());
        self.outputs
            .broadcaster
            .publish(Arc::new(self.current.clone()));
        self.outputs.metrics.inc(&self.outputs.metrics.cycles);
    }

    fn apply_completions(&mut self) {
        for completion in self.dispatcher.drain_completions() {
            self.apply_completion(completion);
        }
    }

    fn dispatch(&mut self, name: &str, generation: u64, crop: SpotCrop) {
        if self.dispatcher.schedule(name, generation, Some(crop)) {
            self.dispatched.insert(name.to_string(), generation);
        }
    }

    fn apply_completion(&mut self, completion: RecognitionCompletion) {
        let RecognitionCompletion {
            spot,
            generation,
            outcome,
            finished_at,
        } = completion;

        let metrics = &self.outputs.metrics;
        match &outcome {
            RecognitionOutcome::Plate(_) => metrics.inc(&metrics.recognitions_completed),
            RecognitionOutcome::Empty => metrics.inc(&metrics.recognitions_empty),
            RecognitionOutcome::Failed(_) => metrics.inc(&metrics.recognitions_failed),
        }

        // The crop belongs to an earlier occupancy of this spot.
        if generation != self.debouncer.generation(&spot) || !self.debouncer.is_occupied(&spot) {
            debug!(
                "Discarding recognition for {}: spot was released since dispatch",
                spot
            );
            self.redispatch(&spot);
            return;
        }

        match outcome {
            RecognitionOutcome::Plate(reading) => self.apply_plate(&spot, reading, finished_at),
            RecognitionOutcome::Empty => debug!("No plate found on {}", spot),
            RecognitionOutcome::Failed(reason) => {
                warn!("Recognition failed on {}: {}", spot, reason)
            }
        }
    }

    /// A spot that refilled while an older job was in flight had its own
    /// dispatch rejected as a duplicate. Send its latest crop instead.
    fn redispatch(&mut self, name: &str) {
        if !self.debouncer.is_occupied(name) {
            return;
        }
        let generation = self.debouncer.generation(name);
        if self.dispatched.get(name) == Some(&generation) {
            return;
        }
        let reserved = match self.spots.get(name) {
            Some(spot) => spot.reserved || self.outputs.reservations.get(name).is_some(),
            None => false,
        };
        if !reserved {
            return;
        }
        if let Some(crop) = self.latest_crops.get(name).cloned() {
            debug!("Recognition re-dispatched for {}", name);
            self.dispatch(name, generation, crop);
        }
    }

    fn apply_plate(&mut self, name: &str, reading: PlateReading, at: DateTime<Utc>) {
        let Some(spot) = self.spots.get(name) else {
            return;
        };

        let reservation = self.outputs.reservations.get(name);
        let auth = authorization_for(spot, reservation.as_ref());
        let violation = auth.is_violation(Some(&reading.plate));

        if reservation.is_some() && auth.permits(&reading.plate) {
            self.outputs.reservations.mark_matched(name);
        }

        let memory = PlateMemory {
            plate: reading.plate.clone(),
            ocr_conf: reading.ocr_confidence,
            det_conf: reading.detection_confidence,
            timestamp: at,
        };
        self.plate_memory.insert(name.to_string(), memory.clone());

        if violation {
            warn!(
                "🚨 VIOLATION on {}: plate {} not in {:?}",
                name, reading.plate, auth.allowed
            );
        } else {
            info!("🔎 Plate {} recognized on {}", reading.plate, name);
        }

        self.outputs.plate_events.push(PlateEvent {
            spot: name.to_string(),
            plate: reading.plate,
            ocr_conf: reading.ocr_confidence,
            det_conf: reading.detection_confidence,
            timestamp: at,
            reserved: auth.reserved,
            violation,
            authorized: spot.authorized_plates.clone(),
            reservation: reservation.as_ref().map(Reservation::summary),
        });
        self.outputs
            .metrics
            .inc(&self.outputs.metrics.plate_events);

        if let Some(state) = self.current.get_mut(name) {
            reconcile(state, spot, &auth, reservation.as_ref(), Some(&memory));
        }
        let patched = self.outputs.store.patch(name, |state| {
            reconcile(state, spot, &auth, reservation.as_ref(), Some(&memory))
        });
        if let Some(snapshot) = patched {
            self.outputs.broadcaster.publish(Arc::new(snapshot));
        }
    }
}

/// Bring the reservation and plate fields of one spot in line with the
/// current reservation and plate memory.
fn reconcile(
    state: &mut SpotRuntimeState,
    spot: &Spot,
    auth: &Authorization,
    reservation: Option<&Reservation>,
    plate: Option<&PlateMemory>,
) {
    state.reserved = auth.reserved;
    state.authorized = spot.authorized_plates.clone();
    state.reservation = reservation.map(Reservation::summary);

    match plate {
        Some(memory) => {
            state.plate = Some(memory.plate.clone());
            state.plate_conf = memory.ocr_conf.or(memory.det_conf);
            state.plate_timestamp = Some(memory.timestamp);
            state.violation = auth.is_violation(Some(&memory.plate));
        }
        // No plate read yet for this occupancy: the published flag waits for one.
        None => {
            state.plate = None;
            state.plate_conf = None;
            state.plate_timestamp = None;
            state.violation = false;
        }
    }
}
