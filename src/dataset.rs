//! FASTQ loading, label extraction, tensor batching and the train/test/val split.

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use std::path::Path;

use crate::alignment::{AlignmentIndex, AuxFeatures};
use crate::encode::encode_window;
use crate::error::{Error, Result};
use crate::fastq::{stream_fastq, READ_BATCH_SIZE};
use crate::model::AuxMode;
use crate::{AUX_INPUT_SIZE, INPUT_SIZE, NUM_CLASSES};

/// Extracts the class label embedded as `...__<label>.<ext1>.<ext2>`.
///
/// Exactly two extensions are stripped before searching for the last `__`.
pub fn label_from_filename(path: &Path) -> Result<u32> {
    let stem = path
        .file_stem()
        .map(Path::new)
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::InvalidLabelFilename(path.to_path_buf()))?;

    let pos = stem
        .rfind("__")
        .ok_or_else(|| Error::InvalidLabelFilename(path.to_path_buf()))?;
    let value = &stem[pos + 2..];

    let label: u64 = value.parse().map_err(|_| Error::InvalidLabel {
        path: path.to_path_buf(),
        value: value.to_string(),
    })?;
    if label >= NUM_CLASSES as u64 {
        return Err(Error::LabelOutOfRange {
            path: path.to_path_buf(),
            label,
            max: NUM_CLASSES,
        });
    }
    Ok(label as u32)
}

/// Encoded reads of a single FASTQ file; the vectors are parallel.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    pub sequences: Vec<Vec<f32>>,
    pub labels: Vec<u32>,
    pub aux: Vec<Option<AuxFeatures>>,
    /// Records read from the file
    pub total: usize,
    /// Records dropped for being shorter than the input window
    pub excluded: usize,
}

impl FileData {
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// True when at least one read matched the alignment index
    pub fn has_aux(&self) -> bool {
        self.aux.iter().any(Option::is_some)
    }
}

/// Loads and encodes every read of `path`, labelled from the file name.
pub fn load_sequences(path: &Path, alignment: Option<&AlignmentIndex>) -> Result<FileData> {
    let label = label_from_filename(path)?;
    tracing::info!(path = %path.display(), label, "Label from filename");

    let mut data = FileData::default();
    stream_fastq(path, READ_BATCH_SIZE, |batch| {
        for record in batch {
            data.total += 1;
            let Some(window) = encode_window(record.sequence.as_bytes()) else {
                data.excluded += 1;
                continue;
            };
            let aux = alignment
                .and_then(|index| index.get(record.id()))
                .map(|aln| aln.aux_features());

            data.sequences.push(window);
            data.labels.push(label);
            data.aux.push(aux);
        }
        Ok(())
    })?;

    tracing::info!(
        "Excluded {}/{} sequences for not matching input size {}",
        data.excluded,
        data.total,
        INPUT_SIZE
    );
    Ok(data)
}

/// Reads of every loaded file, concatenated in load order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub sequences: Vec<Vec<f32>>,
    pub labels: Vec<u32>,
    pub aux: Vec<Option<AuxFeatures>>,
}

impl Dataset {
    pub fn extend(&mut self, data: FileData) {
        self.sequences.extend(data.sequences);
        self.labels.extend(data.labels);
        self.aux.extend(data.aux);
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Auxiliary configuration of the whole run: on if any read carried alignment features
    pub fn aux_mode(&self) -> AuxMode {
        AuxMode::from_presence(self.aux.iter().any(Option::is_some))
    }

    /// Gathers `indices` into tensors on `device`.
    ///
    /// With [`AuxMode::WithAuxiliary`], reads lacking an alignment record get
    /// a zero-filled auxiliary vector so the batch stays rectangular.
    pub fn to_batch(&self, indices: &[usize], aux_mode: AuxMode, device: &Device) -> Result<Batch> {
        let n = indices.len();
        let mut xs = Vec::with_capacity(n * INPUT_SIZE);
        let mut labels = Vec::with_capacity(n);
        for &i in indices {
            xs.extend_from_slice(&self.sequences[i]);
            labels.push(self.labels[i]);
        }

        let aux = match aux_mode {
            AuxMode::WithAuxiliary(width) => {
                if width != AUX_INPUT_SIZE {
                    return Err(Error::AuxMismatch(format!(
                        "expected auxiliary width {AUX_INPUT_SIZE}, classifier uses {width}"
                    )));
                }
                let mut flat = Vec::with_capacity(n * width);
                for &i in indices {
                    match &self.aux[i] {
                        Some(features) => flat.extend_from_slice(features),
                        None => flat.extend(std::iter::repeat(0.0f32).take(width)),
                    }
                }
                Some(Tensor::from_vec(flat, (n, width), device)?)
            }
            AuxMode::WithoutAuxiliary => None,
        };

        Ok(Batch {
            xs: Tensor::from_vec(xs, (n, INPUT_SIZE), device)?,
            labels: Tensor::from_vec(labels, n, device)?,
            aux,
        })
    }

    /// Reads that will be zero-filled under an auxiliary run
    pub fn unmatched_aux(&self) -> usize {
        self.aux.iter().filter(|a| a.is_none()).count()
    }
}

impl From<FileData> for Dataset {
    fn from(data: FileData) -> Self {
        let mut dataset = Dataset::default();
        dataset.extend(data);
        dataset
    }
}

/// Model-ready tensors: `xs [n, INPUT_SIZE]`, `labels [n]` (u32), `aux [n, width]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub xs: Tensor,
    pub labels: Tensor,
    pub aux: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.xs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows `start..start + len`
    pub fn narrow(&self, start: usize, len: usize) -> Result<Batch> {
        Ok(Batch {
            xs: self.xs.narrow(0, start, len)?,
            labels: self.labels.narrow(0, start, len)?,
            aux: self.aux.as_ref().map(|a| a.narrow(0, start, len)).transpose()?,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            xs: self.xs.to_device(device)?,
            labels: self.labels.to_device(device)?,
            aux: self.aux.as_ref().map(|a| a.to_device(device)).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
    pub val: Vec<usize>,
}

/// Shuffles `0..len` and cuts it into train, test and validation parts.
///
/// Train takes `floor(len * train_ratio)`, test the next `floor(len * test_ratio)`,
/// validation the remainder. Not seeded: each call may give a different partition.
pub fn train_test_val_split(len: usize, train_ratio: f64, test_ratio: f64) -> SplitIndices {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut rand::rng());

    let train_end = ((len as f64 * train_ratio).floor() as usize).min(len);
    let test_end = (train_end + (len as f64 * test_ratio).floor() as usize).min(len);

    SplitIndices {
        train: indices[..train_end].to_vec(),
        test: indices[train_end..test_end].to_vec(),
        val: indices[test_end..].to_vec(),
    }
}
