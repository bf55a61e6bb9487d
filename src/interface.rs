// src/interface.rs
//
// Seams to the two model backends. The monitor only talks to these traits,
// so tests swap in scripted fakes.

use crate::preprocessing::SpotCrop;
use crate::types::PlateReading;
use anyhow::Result;

/// Normalised crops stacked as one `[count, 3, side, side]` tensor.
#[derive(Debug, Clone)]
pub struct ClassifierBatch {
    pub data: Vec<f32>,
    pub count: usize,
    pub side: usize,
}

impl ClassifierBatch {
    pub fn with_capacity(count: usize, side: usize) -> Self {
        Self {
            data: Vec::with_capacity(count * 3 * side * side),
            count: 0,
            side,
        }
    }

    pub fn push(&mut self, tensor: &[f32]) {
        debug_assert_eq!(tensor.len(), 3 * self.side * self.side);
        self.data.extend_from_slice(tensor);
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub trait Classifier: Send {
    /// One occupied probability per batch item, in batch order.
    fn classify(&mut self, batch: &ClassifierBatch) -> Result<Vec<f32>>;
}

pub trait Recognizer: Send + Sync {
    /// `Ok(None)` when no plate was found in the crop.
    fn recognize(&self, crop: &SpotCrop) -> Result<Option<PlateReading>>;
}
