//! Hybrid CNN / BiLSTM read classifier.
//!
//! # Architecture
//!
//! ```text
//! seq [B,150] → Conv1d(32,k3) → ReLU → MaxPool(2) → Conv1d(64,k3) → ReLU → MaxPool(2)
//!             → [BiLSTM(128) →] mean over time
//!             → [concat Linear(aux → 128)] → Linear(NUM_CLASSES) logits
//! ```

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, LSTMConfig, Linear, VarBuilder, VarMap, LSTM, RNN};
use std::path::Path;

use crate::error::{Error, Result};
use crate::{AUX_INPUT_SIZE, DROPOUT_PROB, HIDDEN_SIZE, INPUT_SIZE, NUM_CLASSES};

const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 64;
const KERNEL_SIZE: usize = 3;
const POOL_SIZE: usize = 2;

/// Whether the classifier carries the auxiliary alignment branch.
///
/// Fixed when the model is built; the forward pass branches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxMode {
    WithAuxiliary(usize),
    WithoutAuxiliary,
}

impl AuxMode {
    /// Mode implied by whether alignment data is in play
    pub fn from_presence(has_aux: bool) -> Self {
        if has_aux {
            AuxMode::WithAuxiliary(AUX_INPUT_SIZE)
        } else {
            AuxMode::WithoutAuxiliary
        }
    }

    pub fn width(&self) -> Option<usize> {
        match self {
            AuxMode::WithAuxiliary(width) => Some(*width),
            AuxMode::WithoutAuxiliary => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_classes: usize,
    pub aux: AuxMode,
    pub use_lstm: bool,
}

impl ModelConfig {
    pub fn new(aux: AuxMode) -> Self {
        Self {
            aux,
            ..Default::default()
        }
    }

    /// Sequence length after both conv/pool blocks
    pub fn feature_len(&self) -> usize {
        let after_first = (self.input_size - (KERNEL_SIZE - 1)) / POOL_SIZE;
        (after_first - (KERNEL_SIZE - 1)) / POOL_SIZE
    }

    /// Width of the pooled vector fed to the head, before auxiliary fusion
    fn pooled_width(&self) -> usize {
        if self.use_lstm {
            2 * self.hidden_size
        } else {
            CONV2_CHANNELS
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: INPUT_SIZE,
            hidden_size: HIDDEN_SIZE,
            num_classes: NUM_CLASSES,
            aux: AuxMode::WithoutAuxiliary,
            use_lstm: true,
        }
    }
}

struct BiLstm {
    fw: LSTM,
    bw: LSTM,
}

impl BiLstm {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let fw = candle_nn::lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("fw"))?;
        let bw = candle_nn::lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("bw"))?;
        Ok(Self { fw, bw })
    }

    /// `[B, T, F]` → `[B, T, 2H]`, forward states first
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let fw_states = self.fw.seq(xs)?;
        let fw = self.fw.states_to_tensor(&fw_states)?;

        // the backward pass reads the sequence back to front
        let bw_states = self.bw.seq(&reverse_time(xs)?)?;
        let bw = reverse_time(&self.bw.states_to_tensor(&bw_states)?)?;

        Tensor::cat(&[&fw, &bw], D::Minus1)
    }
}

fn reverse_time(xs: &Tensor) -> candle_core::Result<Tensor> {
    let steps = xs.dim(1)?;
    let idx: Vec<u32> = (0..steps as u32).rev().collect();
    let idx = Tensor::new(idx.as_slice(), xs.device())?;
    xs.index_select(&idx, 1)
}

/// Non-overlapping max pooling along the last axis of `[B, C, L]`; a ragged tail is dropped.
fn max_pool1d(xs: &Tensor, size: usize) -> candle_core::Result<Tensor> {
    let (b, c, l) = xs.dims3()?;
    let out = l / size;
    xs.narrow(2, 0, out * size)?
        .reshape((b, c, out, size))?
        .max(D::Minus1)
}

/// Dropout on `[B, T, F]` with one mask per sequence, reused at every time step.
fn time_shared_dropout(xs: &Tensor, drop_p: f32) -> candle_core::Result<Tensor> {
    let (b, _, f) = xs.dims3()?;
    let ones = Tensor::ones((b, 1, f), xs.dtype(), xs.device())?;
    let mask = candle_nn::ops::dropout(&ones, drop_p)?;
    xs.broadcast_mul(&mask)
}

pub struct HybridClassifier {
    conv1: Conv1d,
    conv2: Conv1d,
    lstm: Option<BiLstm>,
    aux_fc: Option<Linear>,
    fc: Linear,
    config: ModelConfig,
}

impl HybridClassifier {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let conv1 = candle_nn::conv1d(
            1,
            CONV1_CHANNELS,
            KERNEL_SIZE,
            Conv1dConfig::default(),
            vb.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv1d(
            CONV1_CHANNELS,
            CONV2_CHANNELS,
            KERNEL_SIZE,
            Conv1dConfig::default(),
            vb.pp("conv2"),
        )?;

        let lstm = if config.use_lstm {
            Some(BiLstm::new(CONV2_CHANNELS, config.hidden_size, vb.pp("lstm"))?)
        } else {
            None
        };

        let (aux_fc, head_in) = match config.aux {
            AuxMode::WithAuxiliary(width) => (
                Some(candle_nn::linear(width, config.hidden_size, vb.pp("aux_fc"))?),
                config.pooled_width() + config.hidden_size,
            ),
            AuxMode::WithoutAuxiliary => (None, config.pooled_width()),
        };
        let fc = candle_nn::linear(head_in, config.num_classes, vb.pp("fc"))?;

        Ok(Self {
            conv1,
            conv2,
            lstm,
            aux_fc,
            fc,
            config: config.clone(),
        })
    }

    /// Builds a classifier and fills it with weights saved by [`VarMap::save`].
    ///
    /// Weights saved under a different configuration (e.g. with the auxiliary
    /// branch when this one has none) fail with [`Error::WeightsIncompatible`].
    pub fn load(path: &Path, config: &ModelConfig, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        varmap
            .load(path)
            .map_err(|source| Error::WeightsIncompatible {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(path = %path.display(), aux = ?config.aux, "Loaded model weights");
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Inference forward pass, dropout disabled
    pub fn forward(&self, xs: &Tensor, aux: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(xs, aux, false)
    }

    /// Maps `xs [B, input_size]` (and `aux [B, width]` for auxiliary models) to logits `[B, num_classes]`.
    ///
    /// `train` only switches the recurrent layer's input dropout.
    pub fn forward_t(&self, xs: &Tensor, aux: Option<&Tensor>, train: bool) -> Result<Tensor> {
        // [B, L] -> [B, 1, L]
        let x = xs.unsqueeze(1)?;
        let x = max_pool1d(&self.conv1.forward(&x)?.relu()?, POOL_SIZE)?;
        let x = max_pool1d(&self.conv2.forward(&x)?.relu()?, POOL_SIZE)?;
        // [B, C, T] -> [B, T, C]
        let x = x.transpose(1, 2)?.contiguous()?;

        let x = match &self.lstm {
            Some(lstm) => {
                let x = if train {
                    time_shared_dropout(&x, DROPOUT_PROB)?
                } else {
                    x
                };
                lstm.forward(&x)?
            }
            None => x,
        };
        let pooled = x.mean(1)?;

        let fused = match (&self.aux_fc, aux) {
            (Some(aux_fc), Some(aux)) => {
                let aux_out = aux_fc.forward(aux)?;
                Tensor::cat(&[&pooled, &aux_out], 1)?
            }
            (Some(_), None) => {
                return Err(Error::AuxMismatch(
                    "classifier was built with an auxiliary branch but no auxiliary input was given"
                        .to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::AuxMismatch(
                    "auxiliary input given to a classifier built without an auxiliary branch"
                        .to_string(),
                ))
            }
            (None, None) => pooled,
        };

        Ok(self.fc.forward(&fused)?)
    }
}

/// Per-row argmax over logits
pub fn predict_classes(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
}
