// src/inference.rs

use crate::interface::{Classifier, ClassifierBatch};
use crate::types::ModelConfig;
use anyhow::{bail, Context, Result};
use ndarray::{Array2, ArrayView2, Axis};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

/// Two-class (free / occupied) spot classifier backed by ONNX Runtime.
pub struct OnnxSpotClassifier {
    session: Session,
}

impl OnnxSpotClassifier {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        info!("Initializing spot classifier");
        info!("Model path: {}", config.path);

        let mut session_builder = Session::builder()?;

        if config.use_cuda {
            info!("Enabling CUDA execution provider");
            session_builder =
                session_builder.with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(0)
                    .build()])?;
        }

        let session = session_builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.num_threads)?
            .with_inter_threads(1)?
            .commit_from_file(&config.path)
            .context("Failed to load spot classifier model")?;

        info!("✓ Spot classifier initialized");

        Ok(Self { session })
    }
}

impl Classifier for OnnxSpotClassifier {
    fn classify(&mut self, batch: &ClassifierBatch) -> Result<Vec<f32>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let shape = [batch.count, 3, batch.side, batch.side];
        let input_value = ort::value::Value::from_array((
            shape.as_slice(),
            batch.data.clone().into_boxed_slice(),
        ))?;

        let outputs = self.session.run(ort::inputs!["input" => input_value])?;

        let (output_shape, data_slice) = outputs[0].try_extract_tensor::<f32>()?;
        debug!("Classifier output shape: {:?}", output_shape);

        let classes = data_slice.len() / batch.count.max(1);
        if classes < 2 || classes * batch.count != data_slice.len() {
            bail!(
                "Unexpected classifier output: {} values for {} crop(s)",
                data_slice.len(),
                batch.count
            );
        }

        let logits = ArrayView2::from_shape((batch.count, classes), data_slice)
            .context("Failed to view classifier output")?;
        let probs = softmax_rows(logits);

        Ok(probs.column(1).to_vec())
    }
}

/// Row-wise softmax, shifted by the row max for stability.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softmax_rows() {
        let logits = array![[0.0f32, 0.0], [0.0, 2.0], [1000.0, 0.0]];
        let probs = softmax_rows(logits.view());
        assert!((probs[[0, 1]] - 0.5).abs() < 1e-6);
        assert!((probs[[1, 1]] - 0.880_797).abs() < 1e-4);
        assert!(probs[[2, 1]] < 1e-6);
        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }
}
