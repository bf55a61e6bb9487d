// src/recognizer.rs
//
// HTTP client for the plate recognition service. Called from the
// recognition worker threads, which drive the async client through the
// runtime handle captured at startup.

use crate::interface::Recognizer;
use crate::preprocessing::SpotCrop;
use crate::types::PlateReading;
use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct RecognitionRequest {
    request_id: String,
    width: usize,
    height: usize,
    /// Base64-encoded JPEG
    image_base64: String,
}

/// Some engines report one confidence per character.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Confidence {
    Single(f32),
    Many(Vec<Option<f32>>),
}

impl Confidence {
    fn value(&self) -> Option<f32> {
        match self {
            Confidence::Single(v) => Some(*v),
            Confidence::Many(values) => {
                let present: Vec<f32> = values.iter().flatten().copied().collect();
                if present.is_empty() {
                    None
                } else {
                    Some(present.iter().sum::<f32>() / present.len() as f32)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RecognitionResponse {
    #[serde(default)]
    plate: Option<String>,
    #[serde(default)]
    ocr_confidence: Option<Confidence>,
    #[serde(default)]
    detection_confidence: Option<Confidence>,
}

impl RecognitionResponse {
    fn into_reading(self) -> Option<PlateReading> {
        let plate = self.plate?.trim().to_string();
        if plate.is_empty() {
            return None;
        }
        Some(PlateReading {
            plate,
            ocr_confidence: self.ocr_confidence.as_ref().and_then(Confidence::value),
            detection_confidence: self
                .detection_confidence
                .as_ref()
                .and_then(Confidence::value),
        })
    }
}

pub struct RemoteRecognizer {
    http_client: reqwest::Client,
    server_url: String,
    runtime: Handle,
}

impl RemoteRecognizer {
    pub fn new(server_url: String, timeout_secs: u64, runtime: Handle) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        info!("🔎 Plate recognition service: {}", server_url);

        Ok(Self {
            http_client,
            server_url,
            runtime,
        })
    }

    async fn post(&self, request: &RecognitionRequest) -> Result<Option<PlateReading>> {
        let url = format!("{}/recognize", self.server_url.trim_end_matches('/'));

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("Recognition request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            bail!("Recognition server returned {}: {}", status, body);
        }

        let parsed: RecognitionResponse = response
            .json()
            .await
            .context("Failed to parse recognition response")?;
        Ok(parsed.into_reading())
    }
}

impl Recognizer for RemoteRecognizer {
    fn recognize(&self, crop: &SpotCrop) -> Result<Option<PlateReading>> {
        let jpeg = encode_rgb_to_jpeg(&crop.data, crop.width, crop.height, 90)
            .context("Failed to encode crop as JPEG")?;

        let request = RecognitionRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            width: crop.width,
            height: crop.height,
            image_base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
        };

        debug!(
            "Sending {}x{} crop ({} bytes) for recognition",
            crop.width,
            crop.height,
            jpeg.len()
        );

        self.runtime.block_on(self.post(&request))
    }
}

/// Encode raw RGB bytes into a JPEG. Returns None on failure.
pub fn encode_rgb_to_jpeg(rgb_data: &[u8], width: usize, height: usize, quality: u8) -> Option<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};

    let img: RgbImage = ImageBuffer::from_raw(width as u32, height as u32, rgb_data.to_vec())?;

    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder).ok()?;

    Some(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_with_list_confidences() {
        let json = r#"{"plate": " ABC1D23 ", "ocr_confidence": [0.9, 0.7, null], "detection_confidence": 0.95}"#;
        let parsed: RecognitionResponse = serde_json::from_str(json).unwrap();
        let reading = parsed.into_reading().unwrap();
        assert_eq!(reading.plate, "ABC1D23");
        assert!((reading.ocr_confidence.unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(reading.detection_confidence, Some(0.95));
    }

    #[test]
    fn test_response_without_plate() {
        let parsed: RecognitionResponse = serde_json::from_str(r#"{"plate": null}"#).unwrap();
        assert!(parsed.into_reading().is_none());

        let parsed: RecognitionResponse =
            serde_json::from_str(r#"{"plate": "  ", "ocr_confidence": []}"#).unwrap();
        assert!(parsed.into_reading().is_none());
    }

    #[test]
    fn test_encode_rgb_to_jpeg() {
        let jpeg = encode_rgb_to_jpeg(&vec![128u8; 16 * 8 * 3], 16, 8, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(encode_rgb_to_jpeg(&[0u8; 5], 16, 8, 80).is_none());
    }
}
