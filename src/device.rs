//! Device selection and data-parallel replication of the training step.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::fmt;

use crate::dataset::Batch;
use crate::error::Result;
use crate::model::{HybridClassifier, ModelConfig};

/// Upper bound on CUDA ordinals probed
const MAX_PROBED_DEVICES: usize = 16;

/// Select the best available compute device: CUDA > Metal > CPU.
pub fn select_device() -> Device {
    if let Ok(device) = Device::new_cuda(0) {
        tracing::info!("Using CUDA device 0");
        return device;
    }
    if let Ok(device) = Device::new_metal(0) {
        tracing::info!("Using Metal device 0");
        return device;
    }
    Device::Cpu
}

/// All accelerator devices that can be opened.
pub fn available_gpus() -> Vec<Device> {
    let mut devices = Vec::new();
    for ordinal in 0..MAX_PROBED_DEVICES {
        match Device::new_cuda(ordinal) {
            Ok(device) => devices.push(device),
            Err(_) => break,
        }
    }
    if devices.is_empty() {
        if let Ok(device) = Device::new_metal(0) {
            devices.push(device);
        }
    }
    devices
}

/// Read-only summary of accelerator support, for `check-gpu`.
#[derive(Debug, Clone)]
pub struct GpuReport {
    pub cuda_compiled: bool,
    pub metal_compiled: bool,
    pub devices: Vec<String>,
}

pub fn gpu_report() -> GpuReport {
    GpuReport {
        cuda_compiled: candle_core::utils::cuda_is_available(),
        metal_compiled: candle_core::utils::metal_is_available(),
        devices: available_gpus()
            .iter()
            .map(|d| format!("{:?}", d.location()))
            .collect(),
    }
}

impl fmt::Display for GpuReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Built with CUDA support: {}", self.cuda_compiled)?;
        writeln!(f, "Built with Metal support: {}", self.metal_compiled)?;
        writeln!(f, "Available GPUs: {:?}", self.devices)?;
        if self.devices.is_empty() {
            write!(f, "No GPU in use, running on CPU")
        } else {
            write!(f, "GPU acceleration is available")
        }
    }
}

/// One copy of the model and its variables on one device.
pub struct Replica {
    pub varmap: VarMap,
    pub model: HybridClassifier,
    pub device: Device,
}

impl Replica {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = HybridClassifier::new(config, vb)?;
        Ok(Self {
            varmap,
            model,
            device: device.clone(),
        })
    }
}

/// Result of one forward/backward pass over a batch.
pub struct StepOutput {
    /// Gradients keyed by the primary replica's variables
    pub grads: GradStore,
    /// Mean cross-entropy over the batch
    pub loss: f64,
    pub correct: usize,
}

/// How a training step is spread over devices.
///
/// Every implementation must produce the gradient of the full-batch mean loss
/// on the primary replica (index 0); only throughput may differ.
pub trait DeviceStrategy {
    /// One device per replica, primary first. Never empty.
    fn devices(&self) -> &[Device];

    fn compute_gradients(&self, replicas: &[Replica], batch: &Batch) -> Result<StepOutput>;

    /// Brings every replica's weights in line with the primary's.
    fn synchronize(&self, replicas: &[Replica]) -> Result<()>;

    fn primary(&self) -> &Device {
        &self.devices()[0]
    }

    fn build_replicas(&self, config: &ModelConfig) -> Result<Vec<Replica>> {
        let replicas = self
            .devices()
            .iter()
            .map(|device| Replica::new(config, device))
            .collect::<Result<Vec<_>>>()?;
        self.synchronize(&replicas)?;
        Ok(replicas)
    }
}

/// Loss and accuracy count of `replica` on `batch`, in training mode.
fn shard_loss(replica: &Replica, batch: &Batch) -> Result<(Tensor, usize)> {
    let batch = batch.to_device(&replica.device)?;
    let logits = replica
        .model
        .forward_t(&batch.xs, batch.aux.as_ref(), true)?;
    let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
    let correct = count_correct(&logits, &batch.labels)?;
    Ok((loss, correct))
}

pub fn count_correct(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let preds = logits.argmax(candle_core::D::Minus1)?;
    let hits = preds.eq(labels)?.to_dtype(DType::U32)?.sum_all()?;
    Ok(hits.to_scalar::<u32>()? as usize)
}

/// Everything on a single device.
pub struct SingleDevice {
    devices: [Device; 1],
}

impl SingleDevice {
    pub fn new(device: Device) -> Self {
        Self { devices: [device] }
    }
}

impl DeviceStrategy for SingleDevice {
    fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn compute_gradients(&self, replicas: &[Replica], batch: &Batch) -> Result<StepOutput> {
        let (loss, correct) = shard_loss(&replicas[0], batch)?;
        let grads = loss.backward()?;
        Ok(StepOutput {
            grads,
            loss: f64::from(loss.to_scalar::<f32>()?),
            correct,
        })
    }

    fn synchronize(&self, _replicas: &[Replica]) -> Result<()> {
        Ok(())
    }
}

/// Replicated data parallelism: each device holds a full model copy and
/// processes a contiguous slice of every batch.
pub struct Mirrored {
    devices: Vec<Device>,
}

impl Mirrored {
    /// Falls back to the CPU when `devices` is empty.
    pub fn new(devices: Vec<Device>) -> Self {
        let devices = if devices.is_empty() {
            vec![Device::Cpu]
        } else {
            devices
        };
        Self { devices }
    }
}

/// Splits `len` rows into at most `parts` contiguous, non-empty `(start, len)` slices.
fn shard_ranges(len: usize, parts: usize) -> Vec<(usize, usize)> {
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for p in 0..parts {
        let size = base + usize::from(p < extra);
        if size == 0 {
            break;
        }
        ranges.push((start, size));
        start += size;
    }
    ranges
}

impl DeviceStrategy for Mirrored {
    fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn compute_gradients(&self, replicas: &[Replica], batch: &Batch) -> Result<StepOutput> {
        let total = batch.len();
        let primary = &replicas[0];
        let mut merged: Option<GradStore> = None;
        let mut loss_sum = 0.0;
        let mut correct = 0;

        for (replica, (start, len)) in replicas.iter().zip(shard_ranges(total, replicas.len())) {
            let shard = batch.narrow(start, len)?;
            let (loss, shard_correct) = shard_loss(replica, &shard)?;
            // shard mean * shard share == contribution to the batch mean
            let weight = len as f64 / total as f64;
            let grads = loss.affine(weight, 0.0)?.backward()?;
            loss_sum += f64::from(loss.to_scalar::<f32>()?) * weight;
            correct += shard_correct;

            merged = Some(match merged {
                // the first shard always runs on the primary
                None => grads,
                Some(mut acc) => {
                    let primary_vars = primary.varmap.data().lock().unwrap();
                    let replica_vars = replica.varmap.data().lock().unwrap();
                    for (name, var) in replica_vars.iter() {
                        let (Some(grad), Some(target)) = (grads.get(var), primary_vars.get(name))
                        else {
                            continue;
                        };
                        let grad = grad.to_device(&primary.device)?;
                        let sum = match acc.get(target) {
                            Some(existing) => (existing + &grad)?,
                            None => grad,
                        };
                        acc.insert(target, sum);
                    }
                    acc
                }
            });
        }

        let grads = match merged {
            Some(grads) => grads,
            None => {
                // empty batch: nothing to learn from
                let zero = Tensor::zeros((), DType::F32, &primary.device)?;
                zero.backward()?
            }
        };
        Ok(StepOutput {
            grads,
            loss: loss_sum,
            correct,
        })
    }

    fn synchronize(&self, replicas: &[Replica]) -> Result<()> {
        let Some((primary, others)) = replicas.split_first() else {
            return Ok(());
        };
        let primary_vars = primary.varmap.data().lock().unwrap();
        for replica in others {
            let replica_vars = replica.varmap.data().lock().unwrap();
            for (name, var) in replica_vars.iter() {
                if let Some(source) = primary_vars.get(name) {
                    var.set(&source.as_tensor().to_device(&replica.device)?)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::model::AuxMode;
    use crate::INPUT_SIZE;

    fn toy_batch() -> Batch {
        let dataset = Dataset {
            sequences: (0..7)
                .map(|i| vec![(i % 5) as f32; INPUT_SIZE])
                .collect(),
            labels: (0..7).map(|i| (i % 2) as u32).collect(),
            aux: vec![None; 7],
        };
        let idx: Vec<usize> = (0..7).collect();
        dataset
            .to_batch(&idx, AuxMode::WithoutAuxiliary, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn shard_ranges_cover_rows() {
        assert_eq!(shard_ranges(7, 3), vec![(0, 3), (3, 2), (5, 2)]);
        assert_eq!(shard_ranges(1, 4), vec![(0, 1)]);
        assert!(shard_ranges(0, 2).is_empty());
    }

    #[test]
    fn mirrored_replicas_start_identical() {
        let config = ModelConfig {
            use_lstm: false,
            ..Default::default()
        };
        let strategy = Mirrored::new(vec![Device::Cpu, Device::Cpu]);
        let replicas = strategy.build_replicas(&config).unwrap();

        let a = replicas[0].varmap.data().lock().unwrap();
        let b = replicas[1].varmap.data().lock().unwrap();
        for (name, var) in a.iter() {
            let lhs = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let rhs = b[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(lhs, rhs, "{name}");
        }
    }

    #[test]
    fn mirrored_gradients_match_single_device() {
        // no LSTM, so no dropout noise between the two passes
        let config = ModelConfig {
            use_lstm: false,
            ..Default::default()
        };
        let mirrored = Mirrored::new(vec![Device::Cpu, Device::Cpu, Device::Cpu]);
        let replicas = mirrored.build_replicas(&config).unwrap();
        let batch = toy_batch();

        let split = mirrored.compute_gradients(&replicas, &batch).unwrap();
        let whole = SingleDevice::new(Device::Cpu)
            .compute_gradients(&replicas[..1], &batch)
            .unwrap();

        assert!((split.loss - whole.loss).abs() < 1e-4);
        assert_eq!(split.correct, whole.correct);

        let vars = replicas[0].varmap.all_vars();
        for var in &vars {
            let a = split.grads.get(var).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = whole.grads.get(var).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() < 1e-4 * (1.0 + y.abs()), "{x} vs {y}");
            }
        }
    }

    #[test]
    fn gpu_report_formats() {
        let report = GpuReport {
            cuda_compiled: false,
            metal_compiled: false,
            devices: vec![],
        };
        let text = report.to_string();
        assert!(text.contains("Built with CUDA support: false"));
        assert!(text.contains("running on CPU"));
    }
}
