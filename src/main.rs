// src/main.rs

mod batch_classifier;
mod config;
mod geometry;
mod inference;
mod interface;
mod monitor;
mod persistence;
mod pipeline;
mod preprocessing;
mod recognition;
mod recognizer;
mod reservations;
mod server;
mod smoother;
mod spots;
mod types;
mod video_processor;
mod violation;

use anyhow::{anyhow, Context, Result};
use batch_classifier::BatchClassifier;
use inference::OnnxSpotClassifier;
use monitor::{MonitorOutputs, MonitorSettings, ParkingMonitor, StopReason};
use persistence::{InMemoryReservationStore, ReservationStore};
use pipeline::{FramePublisher, MonitorMetrics, PlateEventLog, SnapshotBroadcaster, SpotStateStore};
use recognition::RecognitionDispatcher;
use recognizer::RemoteRecognizer;
use reservations::{run_persistence_worker, ReservationCache};
use server::AppState;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Config;
use video_processor::{open_source, OpenCvRenderer};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let mut config = Config::load_or_default(&config_path)?;
    config.apply_env_overrides();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("parking_monitor=info,ort=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🅿️  Parking Monitor Starting");
    config.validate()?;
    info!("✓ Configuration loaded ({})", config_path);
    config.log_summary();

    let layout = Arc::new(spots::load_spots(Path::new(&config.spots.path))?);
    let metrics = MonitorMetrics::new();

    // Reservations
    let ledger = config.reservations.fines_ledger.as_ref().map(PathBuf::from);
    let store: Arc<dyn ReservationStore> = match &config.reservations.seed_file {
        Some(seed) => Arc::new(InMemoryReservationStore::from_seed_file(Path::new(seed), ledger)?),
        None => Arc::new(InMemoryReservationStore::new(ledger)),
    };

    let (persist_tx, persist_rx) = tokio::sync::mpsc::unbounded_channel();
    let reservations = Arc::new(
        ReservationCache::new(config.reservations.fine_amount, Some(persist_tx))
            .with_metrics(metrics.clone()),
    );
    let active = reservations.refresh(store.as_ref()).await;
    info!("✓ {} active reservation(s)", active.len());
    tokio::spawn(run_persistence_worker(
        persist_rx,
        store.clone(),
        reservations.clone(),
    ));

    let outputs = MonitorOutputs {
        store: Arc::new(SpotStateStore::new()),
        broadcaster: Arc::new(
            SnapshotBroadcaster::new(config.server.subscriber_buffer).with_metrics(metrics.clone()),
        ),
        frames: Arc::new(FramePublisher::new()),
        plate_events: Arc::new(PlateEventLog::new(config.recognition.event_buffer)),
        reservations,
        metrics: metrics.clone(),
    };

    // Models
    let classifier = OnnxSpotClassifier::new(&config.model)?;
    let classifier = BatchClassifier::new(Box::new(classifier), config.model.input_size);
    info!("✓ Spot classifier ready");

    let dispatcher = if config.recognition.enabled {
        let recognizer = RemoteRecognizer::new(
            config.recognition.server_url.clone(),
            config.recognition.timeout_secs,
            tokio::runtime::Handle::current(),
        )?;
        RecognitionDispatcher::new(
            Arc::new(recognizer),
            config.recognition.workers,
            layout.spots.len().max(1),
            metrics.clone(),
        )
    } else {
        info!("Plate recognition disabled");
        RecognitionDispatcher::disabled(metrics.clone())
    };

    let mut monitor = ParkingMonitor::new(
        &layout,
        classifier,
        dispatcher,
        Box::new(OpenCvRenderer::new(config.video.jpeg_quality)),
        outputs.clone(),
        MonitorSettings::from_config(&config),
    );
    let stop = monitor.stop_handle();

    // Processing loop on its own thread; the runtime only serves HTTP.
    let (loop_done_tx, loop_done_rx) = tokio::sync::oneshot::channel::<()>();
    let video = config.video.clone();
    let monitor_thread = std::thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || -> Result<StopReason> {
            let result = open_source(
                &video.source,
                video.open_attempts,
                Duration::from_millis(video.open_retry_delay_ms),
            )
            .map_err(anyhow::Error::from)
            .and_then(|mut source| monitor.run(&mut source).map_err(anyhow::Error::from));
            let _ = loop_done_tx.send(());
            result
        })
        .context("Failed to spawn monitor thread")?;

    let state = Arc::new(AppState {
        outputs,
        layout: layout.clone(),
        store,
        stream_interval: Duration::from_millis(config.server.stream_interval_ms.max(1)),
    });
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);

    let served = server::serve(state, &addr, async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
            _ = loop_done_rx => warn!("Processing loop exited, shutting down server"),
        }
    })
    .await;

    stop.store(true, Ordering::Relaxed);
    let joined = tokio::task::spawn_blocking(move || monitor_thread.join())
        .await
        .context("Failed to join monitor thread")?
        .map_err(|_| anyhow!("Monitor thread panicked"))?;

    let summary = metrics.summary();
    info!(
        "✓ Processed {} frame(s) in {:.1}s ({:.1} FPS), {} plate event(s), {} fine(s)",
        summary.frames_read,
        summary.elapsed_secs,
        summary.fps,
        summary.plate_events,
        summary.fines_scheduled
    );

    match joined {
        Ok(StopReason::Requested) => info!("Monitor stopped cleanly"),
        Ok(StopReason::SourceEnded) => {
            error!("Live source ended, restart required");
            served?;
            return Err(anyhow!("live video source ended"));
        }
        Err(e) => {
            error!("Monitor failed: {:#}", e);
            served?;
            return Err(e);
        }
    }

    served
}
