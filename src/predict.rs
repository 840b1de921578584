use candle_core::Device;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::alignment;
use crate::dataset::{load_sequences, Dataset};
use crate::device::select_device;
use crate::error::{Error, Result};
use crate::model::{predict_classes, AuxMode, HybridClassifier, ModelConfig};
use crate::{HIDDEN_SIZE, NUM_CLASSES};

#[derive(Debug, Clone)]
pub struct PredictConfig {
    /// Reads per forward pass
    pub batch_size: usize,
    pub hidden_size: usize,
    pub use_lstm: bool,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            hidden_size: HIDDEN_SIZE,
            use_lstm: true,
        }
    }
}

/// Predicted class distribution of one FASTQ file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePrediction {
    pub path: PathBuf,
    pub counts: [usize; NUM_CLASSES],
}

impl FilePrediction {
    /// Tallies `classes`; values outside `0..NUM_CLASSES` are not counted.
    pub fn from_classes(path: &Path, classes: &[u32]) -> Self {
        let mut counts = [0usize; NUM_CLASSES];
        for &class in classes {
            if let Some(count) = counts.get_mut(class as usize) {
                *count += 1;
            }
        }
        Self {
            path: path.to_path_buf(),
            counts,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Share of predictions for `class`, in percent; 0 when nothing was predicted
    pub fn percentage(&self, class: usize) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.counts[class] as f64 / total as f64 * 100.0
    }
}

impl fmt::Display for FilePrediction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Predictions for {}", self.path.display())?;
        for (class, count) in self.counts.iter().enumerate() {
            writeln!(
                f,
                "Class {}: {} predictions ({:.2}%)",
                class,
                count,
                self.percentage(class)
            )?;
        }
        Ok(())
    }
}

/// Classifies every read of each file with the weights at `weights_path`.
///
/// Files whose reads match `alignment_data` use the auxiliary branch, so the
/// weights must have been trained the same way. Results are per file.
pub fn predict(
    weights_path: &Path,
    fastq_files: &[PathBuf],
    alignment_data: Option<&Path>,
    config: &PredictConfig,
) -> Result<Vec<FilePrediction>> {
    predict_on(
        weights_path,
        fastq_files,
        alignment_data,
        config,
        &select_device(),
    )
}

/// [`predict`] on an explicit device.
///
/// The classifier is built per file: with the auxiliary branch when at least one
/// of the file's reads matched the alignment data, without it otherwise.
pub fn predict_on(
    weights_path: &Path,
    fastq_files: &[PathBuf],
    alignment_data: Option<&Path>,
    config: &PredictConfig,
    device: &Device,
) -> Result<Vec<FilePrediction>> {
    if !weights_path.exists() {
        return Err(Error::MissingFile(weights_path.to_path_buf()));
    }
    let index = alignment::load_optional(alignment_data)?;

    // 每种辅助配置只加载一次权重
    let mut plain: Option<HybridClassifier> = None;
    let mut fused: Option<HybridClassifier> = None;

    let mut results = Vec::with_capacity(fastq_files.len());
    for path in fastq_files {
        let dataset = Dataset::from(load_sequences(path, index.as_ref())?);
        let aux_mode = dataset.aux_mode();
        if index.is_some() && aux_mode == AuxMode::WithoutAuxiliary {
            tracing::warn!(
                path = %path.display(),
                "No read matched the alignment data, predicting without auxiliary features"
            );
        }

        let slot = match aux_mode {
            AuxMode::WithAuxiliary(_) => &mut fused,
            AuxMode::WithoutAuxiliary => &mut plain,
        };
        let model = match slot {
            Some(model) => model,
            None => {
                let model_config = ModelConfig {
                    hidden_size: config.hidden_size,
                    use_lstm: config.use_lstm,
                    aux: aux_mode,
                    ..Default::default()
                };
                slot.insert(HybridClassifier::load(weights_path, &model_config, device)?)
            }
        };

        let classes = classify(model, &dataset, config.batch_size, device)?;
        let prediction = FilePrediction::from_classes(path, &classes);
        tracing::info!(
            path = %path.display(),
            reads = prediction.total(),
            counts = ?prediction.counts,
            "Predicted classes"
        );
        results.push(prediction);
    }
    Ok(results)
}

/// Argmax class of every read in `dataset`, in order.
pub fn classify(
    model: &HybridClassifier,
    dataset: &Dataset,
    batch_size: usize,
    device: &Device,
) -> Result<Vec<u32>> {
    let aux_mode = model.config().aux;
    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut classes = Vec::with_capacity(indices.len());
    for chunk in indices.chunks(batch_size.max(1)) {
        let batch = dataset.to_batch(chunk, aux_mode, device)?;
        let logits = model.forward(&batch.xs, batch.aux.as_ref())?;
        classes.extend(predict_classes(&logits)?);
    }
    Ok(classes)
}
