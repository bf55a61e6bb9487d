// src/video_processor.rs

use crate::geometry::ScaledSpot;
use crate::types::{Frame, Snapshot, SpotRuntimeState};
use anyhow::{Context, Result};
use opencv::{
    core::{self, Mat, Vector},
    imgcodecs, imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {source_spec}: {reason}")]
    Open { source_spec: String, reason: String },
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("failed to rewind source: {0}")]
    Rewind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Loops back to the start at end of stream.
    File,
    /// Camera or network stream; end of stream is fatal.
    Live,
}

pub enum FrameRead {
    Frame(Frame),
    EndOfStream,
}

pub trait FrameSource {
    fn next_frame(&mut self) -> Result<FrameRead, SourceError>;
    fn rewind(&mut self) -> Result<(), SourceError>;
    fn kind(&self) -> SourceKind;
    fn describe(&self) -> &str;
}

pub struct OpenCvSource {
    cap: VideoCapture,
    spec: String,
    kind: SourceKind,
    frames_read: u64,
    fps: f64,
}

/// Open a camera index ("0"), a file path or a stream URL, retrying a few
/// times before giving up.
pub fn open_source(spec: &str, attempts: u32, retry_delay: Duration) -> Result<OpenCvSource, SourceError> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match OpenCvSource::open(spec) {
            Ok(source) => return Ok(source),
            Err(e) => {
                warn!("Open attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = e.to_string();
                if attempt < attempts {
                    std::thread::sleep(retry_delay);
                }
            }
        }
    }

    Err(SourceError::Open {
        source_spec: spec.to_string(),
        reason: last_error,
    })
}

impl OpenCvSource {
    fn open(spec: &str) -> Result<Self, SourceError> {
        let open_err = |reason: String| SourceError::Open {
            source_spec: spec.to_string(),
            reason,
        };

        let (cap, kind) = if let Ok(index) = spec.trim().parse::<i32>() {
            let cap = VideoCapture::new(index, videoio::CAP_ANY).map_err(|e| open_err(e.to_string()))?;
            (cap, SourceKind::Live)
        } else {
            let kind = if Path::new(spec).is_file() {
                SourceKind::File
            } else {
                SourceKind::Live
            };
            let cap =
                VideoCapture::from_file(spec, videoio::CAP_ANY).map_err(|e| open_err(e.to_string()))?;
            (cap, kind)
        };

        if !cap.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("capture did not open".to_string()));
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS).unwrap_or(0.0);
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0);
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0);

        info!(
            "Opened {:?} source {}: {}x{} @ {:.1} FPS",
            kind, spec, width as i32, height as i32, fps
        );

        Ok(Self {
            cap,
            spec: spec.to_string(),
            kind,
            frames_read: 0,
            fps,
        })
    }
}

impl FrameSource for OpenCvSource {
    fn next_frame(&mut self) -> Result<FrameRead, SourceError> {
        let mut mat = Mat::default();

        let ok = VideoCaptureTrait::read(&mut self.cap, &mut mat)
            .map_err(|e| SourceError::Read(e.to_string()))?;
        if !ok || mat.empty() {
            return Ok(FrameRead::EndOfStream);
        }

        self.frames_read += 1;
        let timestamp_ms = if self.fps > 0.0 {
            (self.frames_read as f64 / self.fps) * 1000.0
        } else {
            0.0
        };

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)
            .map_err(|e| SourceError::Read(e.to_string()))?;

        let data = rgb_mat
            .data_bytes()
            .map_err(|e| SourceError::Read(e.to_string()))?
            .to_vec();

        Ok(FrameRead::Frame(Frame {
            data,
            width: rgb_mat.cols() as usize,
            height: rgb_mat.rows() as usize,
            timestamp_ms,
        }))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        VideoCaptureTrait::set(&mut self.cap, videoio::CAP_PROP_POS_FRAMES, 0.0)
            .map_err(|e| SourceError::Rewind(e.to_string()))?;
        self.frames_read = 0;
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn describe(&self) -> &str {
        &self.spec
    }
}

// ============================================================================
// ANNOTATION
// ============================================================================

/// Draws the current spot state on a frame and returns it JPEG-encoded.
pub trait FrameRenderer: Send {
    fn render(&mut self, frame: &Frame, spots: &[ScaledSpot], state: &Snapshot) -> Result<Vec<u8>>;
}

pub struct OpenCvRenderer {
    jpeg_quality: i32,
}

impl OpenCvRenderer {
    pub fn new(jpeg_quality: i32) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

/// (fill, border) in BGR.
pub fn spot_colors(state: Option<&SpotRuntimeState>) -> ((f64, f64, f64), (f64, f64, f64)) {
    let (occupied, reserved, violation) = state
        .map(|s| (s.occupied, s.reserved, s.violation))
        .unwrap_or((false, false, false));

    if violation {
        ((0.0, 0.0, 255.0), (0.0, 0.0, 180.0))
    } else if reserved && occupied {
        ((255.0, 0.0, 0.0), (255.0, 120.0, 120.0))
    } else if reserved {
        ((200.0, 150.0, 50.0), (220.0, 180.0, 120.0))
    } else if occupied {
        ((0.0, 0.0, 180.0), (0.0, 0.0, 255.0))
    } else {
        ((0.0, 160.0, 0.0), (0.0, 255.0, 0.0))
    }
}

/// `name (prob) [R,VIOL] PLATE @(RESERVATION_PLATE)`
pub fn spot_label(name: &str, state: Option<&SpotRuntimeState>) -> String {
    let Some(s) = state else {
        return name.to_string();
    };

    let mut label = if s.prob > 0.0 {
        format!("{} ({:.2})", name, s.prob)
    } else {
        name.to_string()
    };

    let mut tags = Vec::new();
    if s.reserved {
        tags.push("R");
    }
    if s.violation {
        tags.push("VIOL");
    }
    if !tags.is_empty() {
        label.push_str(&format!(" [{}]", tags.join(",")));
    }
    if let Some(plate) = &s.plate {
        label.push_str(&format!(" {}", plate));
    }
    if let Some(reservation) = &s.reservation {
        if !reservation.plate.is_empty() {
            label.push_str(&format!(" @({})", reservation.plate));
        }
    }
    label
}

fn scalar((b, g, r): (f64, f64, f64)) -> core::Scalar {
    core::Scalar::new(b, g, r, 0.0)
}

impl FrameRenderer for OpenCvRenderer {
    fn render(&mut self, frame: &Frame, spots: &[ScaledSpot], state: &Snapshot) -> Result<Vec<u8>> {
        let mat = Mat::from_slice(frame.data.as_slice())?;
        let mat = mat.reshape(3, frame.height as i32)?;

        let mut bgr_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut bgr_mat, imgproc::COLOR_RGB2BGR, 0)?;
        let mut overlay = bgr_mat.try_clone()?;

        for spot in spots {
            let info = state.get(&spot.name);
            let (fill, border) = spot_colors(info);

            let pts: Vector<core::Point> = spot
                .polygon
                .iter()
                .map(|p| core::Point::new(p.x, p.y))
                .collect();
            let mut polys: Vector<Vector<core::Point>> = Vector::new();
            polys.push(pts);

            imgproc::fill_poly(
                &mut overlay,
                &polys,
                scalar(fill),
                imgproc::LINE_8,
                0,
                core::Point::default(),
            )?;
            imgproc::polylines(&mut overlay, &polys, true, scalar(border), 2, imgproc::LINE_8, 0)?;

            let centroid = spot.centroid();
            imgproc::put_text(
                &mut overlay,
                &spot_label(&spot.name, info),
                core::Point::new(centroid.x - 20, centroid.y),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                core::Scalar::new(255.0, 255.0, 255.0, 0.0),
                2,
                imgproc::LINE_AA,
                false,
            )?;
        }

        let mut blended = Mat::default();
        core::add_weighted(&overlay, 0.4, &bgr_mat, 0.6, 0.0, &mut blended, -1)?;

        let mut buf: Vector<u8> = Vector::new();
        let params: Vector<i32> = Vector::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, self.jpeg_quality]);
        let encoded = imgcodecs::imencode(".jpg", &blended, &mut buf, &params)
            .context("JPEG encoding failed")?;
        if !encoded {
            anyhow::bail!("JPEG encoder rejected the frame");
        }

        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReservationSummary;
    use chrono::Utc;

    #[test]
    fn test_spot_label() {
        assert_eq!(spot_label("A1", None), "A1");

        let state = SpotRuntimeState {
            occupied: true,
            prob: 0.876,
            reserved: true,
            violation: true,
            plate: Some("XYZ9Z99".to_string()),
            reservation: Some(ReservationSummary {
                plate: "ABC1D23".to_string(),
                expires_at: Utc::now(),
            }),
            ..Default::default()
        };
        assert_eq!(
            spot_label("A1", Some(&state)),
            "A1 (0.88) [R,VIOL] XYZ9Z99 @(ABC1D23)"
        );

        let free = SpotRuntimeState {
            prob: 0.0,
            ..Default::default()
        };
        assert_eq!(spot_label("B2", Some(&free)), "B2");
    }

    #[test]
    fn test_spot_colors_priority() {
        let mut s = SpotRuntimeState {
            occupied: true,
            reserved: true,
            violation: true,
            ..Default::default()
        };
        assert_eq!(spot_colors(Some(&s)).0, (0.0, 0.0, 255.0));
        s.violation = false;
        assert_eq!(spot_colors(Some(&s)).0, (255.0, 0.0, 0.0));
        s.occupied = false;
        assert_eq!(spot_colors(Some(&s)).0, (200.0, 150.0, 50.0));
        s.reserved = false;
        assert_eq!(spot_colors(Some(&s)).0, (0.0, 160.0, 0.0));
        assert_eq!(spot_colors(None).0, (0.0, 160.0, 0.0));
    }
}
