use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub spots: SpotsConfig,
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub reservations: ReservationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Camera index ("0"), file path or stream URL.
    pub source: String,
    pub open_attempts: u32,
    pub open_retry_delay_ms: u64,
    pub jpeg_quality: i32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: "video.mp4".to_string(),
            open_attempts: 3,
            open_retry_delay_ms: 1000,
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotsConfig {
    pub path: String,
}

impl Default for SpotsConfig {
    fn default() -> Self {
        Self {
            path: "parking_spots.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    pub input_size: usize,
    pub num_threads: usize,
    pub use_cuda: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "models/spot_classifier.onnx".to_string(),
            input_size: 64,
            num_threads: 2,
            use_cuda: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Occupied probability at or above which a single frame counts as occupied.
    pub threshold: f32,
    /// Debounce window (K).
    pub history_len: usize,
    pub process_every_n_frames: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            history_len: 5,
            process_every_n_frames: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub enabled: bool,
    pub workers: usize,
    pub event_buffer: usize,
    pub server_url: String,
    pub timeout_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 1,
            event_buffer: 40,
            server_url: "http://localhost:8081".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Optional YAML/JSON file with reservations to load at startup.
    pub seed_file: Option<String>,
    /// JSON-lines ledger that fines are appended to.
    pub fines_ledger: Option<String>,
    pub fine_amount: f64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            seed_file: None,
            fines_ledger: Some("fines.jsonl".to_string()),
            fine_amount: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub stream_interval_ms: u64,
    pub subscriber_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            stream_interval_ms: 50,
            subscriber_buffer: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub progress_every: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "parking_monitor=info,ort=warn".to_string(),
            progress_every: 300,
        }
    }
}

/// Raw RGB frame, row-major, 3 bytes per pixel.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width as u32,
            height: self.height as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Polygon vertex in authored (reference) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Polygon vertex in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spot {
    pub name: String,
    pub polygon: Vec<Point>,
    /// Permanent reservation.
    pub reserved: bool,
    pub authorized_plates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationSummary {
    pub plate: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub spot: String,
    pub plate: String,
    pub plate_norm: Option<String>,
    pub reserved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn summary(&self) -> ReservationSummary {
        ReservationSummary {
            plate: self.plate.clone(),
            expires_at: self.expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Live state of one spot as served to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpotRuntimeState {
    pub occupied: bool,
    pub prob: f32,
    pub reserved: bool,
    pub authorized: Vec<String>,
    pub plate: Option<String>,
    pub plate_conf: Option<f32>,
    pub plate_timestamp: Option<DateTime<Utc>>,
    pub violation: bool,
    pub reservation: Option<ReservationSummary>,
}

/// Full state of every spot, keyed by spot name.
pub type Snapshot = BTreeMap<String, SpotRuntimeState>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateReading {
    pub plate: String,
    pub ocr_confidence: Option<f32>,
    pub detection_confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateEvent {
    pub spot: String,
    pub plate: String,
    pub ocr_conf: Option<f32>,
    pub det_conf: Option<f32>,
    pub timestamp: DateTime<Utc>,
    pub reserved: bool,
    pub violation: bool,
    pub authorized: Vec<String>,
    pub reservation: Option<ReservationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fine {
    pub reservation_id: Uuid,
    pub spot: String,
    pub plate: String,
    pub amount: f64,
    pub issued_at: DateTime<Utc>,
}
