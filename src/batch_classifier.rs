// src/batch_classifier.rs
//
// Crops every spot of a sampled frame and classifies all of them with one
// backend call.

use crate::geometry::ScaledSpot;
use crate::interface::{Classifier, ClassifierBatch};
use crate::preprocessing::{crop_spot, crop_to_tensor, SpotCrop};
use crate::types::Frame;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SpotReading {
    pub name: String,
    pub occupied_prob: f32,
    pub crop: SpotCrop,
}

pub struct BatchClassifier {
    backend: Box<dyn Classifier>,
    input_size: usize,
}

impl BatchClassifier {
    pub fn new(backend: Box<dyn Classifier>, input_size: usize) -> Self {
        Self {
            backend,
            input_size,
        }
    }

    /// Readings for every spot with a usable crop. Degenerate crops are
    /// skipped; a failing backend yields no readings for this frame.
    pub fn classify_frame(&mut self, frame: &Frame, spots: &[ScaledSpot]) -> Vec<SpotReading> {
        let mut batch = ClassifierBatch::with_capacity(spots.len(), self.input_size);
        let mut pending: Vec<(String, SpotCrop)> = Vec::with_capacity(spots.len());

        for spot in spots {
            match crop_spot(frame, spot) {
                Some(crop) if !crop.is_empty() => {
                    batch.push(&crop_to_tensor(&crop, self.input_size));
                    pending.push((spot.name.clone(), crop));
                }
                _ => debug!("Spot {} has an empty crop, skipping", spot.name),
            }
        }

        if batch.is_empty() {
            return Vec::new();
        }

        let probs = match self.backend.classify(&batch) {
            Ok(p) => p,
            Err(e) => {
                warn!("Classifier failed on {} crop(s): {:#}", batch.count, e);
                return Vec::new();
            }
        };

        if probs.len() != pending.len() {
            warn!(
                "Classifier returned {} result(s) for {} crop(s)",
                probs.len(),
                pending.len()
            );
        }

        pending
            .into_iter()
            .zip(probs)
            .map(|((name, crop), p)| SpotReading {
                name,
                occupied_prob: p.clamp(0.0, 1.0),
                crop,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::bounding_box;
    use crate::types::PixelPoint;
    use anyhow::{anyhow, Result};
    use std::sync::{Arc, Mutex};

    struct ScriptedClassifier {
        probs: Vec<f32>,
        calls: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl Classifier for ScriptedClassifier {
        fn classify(&mut self, batch: &ClassifierBatch) -> Result<Vec<f32>> {
            self.calls.lock().unwrap().push(batch.count);
            if self.fail {
                return Err(anyhow!("backend down"));
            }
            Ok(self.probs.iter().take(batch.count).copied().collect())
        }
    }

    fn square(name: &str, x: i32, y: i32, side: i32) -> ScaledSpot {
        let polygon = vec![
            PixelPoint { x, y },
            PixelPoint { x: x + side, y },
            PixelPoint {
                x: x + side,
                y: y + side,
            },
            PixelPoint { x, y: y + side },
        ];
        ScaledSpot {
            name: name.to_string(),
            bounds: bounding_box(&polygon),
            polygon,
        }
    }

    fn frame() -> Frame {
        Frame {
            data: vec![90u8; 40 * 40 * 3],
            width: 40,
            height: 40,
            timestamp_ms: 0.0,
        }
    }

    #[test]
    fn test_single_batched_call_and_skips_degenerate() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut classifier = BatchClassifier::new(
            Box::new(ScriptedClassifier {
                probs: vec![0.9, 0.1],
                calls: calls.clone(),
                fail: false,
            }),
            8,
        );

        let spots = vec![
            square("A", 0, 0, 10),
            square("OUT", 100, 100, 10),
            square("B", 20, 20, 10),
        ];
        let readings = classifier.classify_frame(&frame(), &spots);

        assert_eq!(*calls.lock().unwrap(), vec![2]);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].name, "A");
        assert_eq!(readings[0].occupied_prob, 0.9);
        assert_eq!(readings[1].name, "B");
    }

    #[test]
    fn test_backend_failure_yields_nothing() {
        let mut classifier = BatchClassifier::new(
            Box::new(ScriptedClassifier {
                probs: vec![],
                calls: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }),
            8,
        );
        assert!(classifier
            .classify_frame(&frame(), &[square("A", 0, 0, 10)])
            .is_empty());
    }
}
