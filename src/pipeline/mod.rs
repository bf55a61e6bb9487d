// src/pipeline/mod.rs

pub mod broadcast;
pub mod frame_publisher;
pub mod metrics;
pub mod plate_log;
pub mod state_store;

pub use broadcast::{SnapshotBroadcaster, Subscription};
pub use frame_publisher::{EncodedFrame, FramePublisher};
pub use metrics::{MetricsSummary, MonitorMetrics};
pub use plate_log::PlateEventLog;
pub use state_store::SpotStateStore;
