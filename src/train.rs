//! Training loop with validation monitoring and early stopping.

use candle_core::Device;
use candle_nn::{Optimizer, ParamsAdamW};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

use crate::alignment;
use crate::dataset::{load_sequences, train_test_val_split, Dataset};
use crate::device::{
    available_gpus, count_correct, select_device, DeviceStrategy, Mirrored, SingleDevice,
};
use crate::error::{Error, Result};
use crate::model::{AuxMode, HybridClassifier, ModelConfig};
use crate::HIDDEN_SIZE;

/// Rows per forward pass when evaluating
const EVAL_BATCH_SIZE: usize = 256;

/// Training configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Epochs without validation-loss improvement before stopping
    pub patience: usize,
    pub train_ratio: f64,
    pub test_ratio: f64,
    pub hidden_size: usize,
    pub use_lstm: bool,
    /// Replicate over every visible GPU
    pub multi_gpu: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-4,
            patience: 3,
            train_ratio: 0.7,
            test_ratio: 0.15,
            hidden_size: HIDDEN_SIZE,
            use_lstm: true,
            multi_gpu: false,
        }
    }
}

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// `None` when the validation split is empty
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub history: Vec<EpochMetrics>,
    pub stopped_early: bool,
    pub val_accuracy: Option<f64>,
    pub test_accuracy: Option<f64>,
    pub aux_mode: AuxMode,
    pub weights_path: PathBuf,
}

impl TrainReport {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }
}

/// Loss and accuracy of a model over a set of rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub count: usize,
}

/// Evaluates `model` on `indices` with dropout off; `None` for an empty set.
pub fn evaluate(
    model: &HybridClassifier,
    dataset: &Dataset,
    indices: &[usize],
    device: &Device,
) -> Result<Option<Evaluation>> {
    if indices.is_empty() {
        return Ok(None);
    }
    let aux_mode = model.config().aux;
    let mut loss_sum = 0.0;
    let mut correct = 0;
    for chunk in indices.chunks(EVAL_BATCH_SIZE) {
        let batch = dataset.to_batch(chunk, aux_mode, device)?;
        let logits = model.forward(&batch.xs, batch.aux.as_ref())?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
        loss_sum += f64::from(loss.to_scalar::<f32>()?) * chunk.len() as f64;
        correct += count_correct(&logits, &batch.labels)?;
    }
    let count = indices.len();
    Ok(Some(Evaluation {
        loss: loss_sum / count as f64,
        accuracy: correct as f64 / count as f64,
        count,
    }))
}

fn default_strategy(multi_gpu: bool) -> Box<dyn DeviceStrategy> {
    if multi_gpu {
        let gpus = available_gpus();
        if gpus.len() > 1 {
            tracing::info!(devices = gpus.len(), "Mirroring training across GPUs");
            return Box::new(Mirrored::new(gpus));
        }
        tracing::warn!(
            devices = gpus.len(),
            "Multi-GPU requested but fewer than two GPUs are visible, using a single device"
        );
    }
    Box::new(SingleDevice::new(select_device()))
}

/// Loads `fastq_files`, trains a classifier and saves its weights to `weights_path`.
pub fn train(
    fastq_files: &[PathBuf],
    weights_path: &Path,
    alignment_data: Option<&Path>,
    config: &TrainConfig,
) -> Result<TrainReport> {
    let strategy = default_strategy(config.multi_gpu);
    train_with_strategy(
        fastq_files,
        weights_path,
        alignment_data,
        config,
        strategy.as_ref(),
    )
}

/// [`train`] with an explicit device strategy.
pub fn train_with_strategy(
    fastq_files: &[PathBuf],
    weights_path: &Path,
    alignment_data: Option<&Path>,
    config: &TrainConfig,
    strategy: &dyn DeviceStrategy,
) -> Result<TrainReport> {
    let index = alignment::load_optional(alignment_data)?;

    let mut dataset = Dataset::default();
    for path in fastq_files {
        dataset.extend(load_sequences(path, index.as_ref())?);
    }
    if dataset.is_empty() {
        return Err(Error::EmptyDataset);
    }

    let aux_mode = dataset.aux_mode();
    if aux_mode != AuxMode::WithoutAuxiliary {
        let unmatched = dataset.unmatched_aux();
        if unmatched > 0 {
            tracing::warn!(
                unmatched,
                total = dataset.len(),
                "Reads without alignment data get zero-filled auxiliary features"
            );
        }
    }

    let split = train_test_val_split(dataset.len(), config.train_ratio, config.test_ratio);
    tracing::info!(
        train = split.train.len(),
        test = split.test.len(),
        val = split.val.len(),
        aux = ?aux_mode,
        "Split dataset"
    );

    let model_config = ModelConfig {
        hidden_size: config.hidden_size,
        use_lstm: config.use_lstm,
        aux: aux_mode,
        ..Default::default()
    };
    let replicas = strategy.build_replicas(&model_config)?;
    let primary = &replicas[0];

    let mut optimizer = candle_nn::AdamW::new(
        primary.varmap.all_vars(),
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    tracing::info!(
        lr = config.learning_rate,
        batch = config.batch_size,
        max_epochs = config.epochs,
        patience = config.patience,
        "Training"
    );

    let mut best_loss = f64::INFINITY;
    let mut stale_epochs = 0usize;
    let mut stopped_early = false;
    let mut history = Vec::new();
    let mut order = split.train.clone();

    for epoch in 0..config.epochs {
        order.shuffle(&mut rand::rng());

        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        for chunk in order.chunks(config.batch_size.max(1)) {
            let batch = dataset.to_batch(chunk, aux_mode, &Device::Cpu)?;
            let step = strategy.compute_gradients(&replicas, &batch)?;
            optimizer.step(&step.grads)?;
            strategy.synchronize(&replicas)?;

            loss_sum += step.loss * chunk.len() as f64;
            correct += step.correct;
        }
        let seen = order.len().max(1) as f64;
        let train_loss = loss_sum / seen;
        let train_accuracy = correct as f64 / seen;

        let val = evaluate(&primary.model, &dataset, &split.val, &primary.device)?;
        let metrics = EpochMetrics {
            epoch: epoch + 1,
            train_loss,
            train_accuracy,
            val_loss: val.map(|v| v.loss),
            val_accuracy: val.map(|v| v.accuracy),
        };

        // 验证集为空时退回到训练损失
        let monitored = metrics.val_loss.unwrap_or(train_loss);
        let improved = monitored < best_loss;
        if improved {
            best_loss = monitored;
            stale_epochs = 0;
        } else {
            stale_epochs += 1;
        }

        tracing::info!(
            epoch = metrics.epoch,
            train_loss,
            train_acc = train_accuracy,
            val_loss = ?metrics.val_loss,
            val_acc = ?metrics.val_accuracy,
            improved,
            "Epoch finished"
        );
        history.push(metrics);

        if stale_epochs >= config.patience {
            tracing::info!(
                epoch = epoch + 1,
                patience = config.patience,
                "Early stopping, validation loss stopped improving"
            );
            stopped_early = true;
            break;
        }
    }

    let val_accuracy = evaluate(&primary.model, &dataset, &split.val, &primary.device)?
        .map(|v| v.accuracy);
    let test_accuracy = evaluate(&primary.model, &dataset, &split.test, &primary.device)?
        .map(|v| v.accuracy);
    match val_accuracy {
        Some(acc) => tracing::info!("Final Validation Accuracy: {:.2}%", acc * 100.0),
        None => tracing::warn!("Validation split is empty, no accuracy to report"),
    }
    if let Some(acc) = test_accuracy {
        tracing::info!("Test Accuracy: {:.2}%", acc * 100.0);
    }

    save_weights(&primary.varmap, weights_path)?;
    tracing::info!(path = %weights_path.display(), "Model weights saved");

    Ok(TrainReport {
        history,
        stopped_early,
        val_accuracy,
        test_accuracy,
        aux_mode,
        weights_path: weights_path.to_path_buf(),
    })
}

fn save_weights(varmap: &candle_nn::VarMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    varmap.save(path).map_err(|source| Error::SaveWeights {
        path: path.to_path_buf(),
        source,
    })
}
