use std::path::PathBuf;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The file name carries no `__<label>` suffix
    #[error("Invalid filename format for extracting label: {0}")]
    InvalidLabelFilename(PathBuf),

    #[error("Label suffix `{value}` is not an integer: {path}")]
    InvalidLabel { path: PathBuf, value: String },

    #[error("Label {label} is out of range (expected < {max}): {path}")]
    LabelOutOfRange {
        path: PathBuf,
        label: u64,
        max: usize,
    },

    #[error("Malformed alignment data in {path} at line {line}: {reason}")]
    AlignmentParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Invalid FASTQ in {path}: {reason}")]
    FastqFormat { path: PathBuf, reason: String },

    #[error("File was not found: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Saved weights do not fit the classifier they are loaded into
    #[error("Model weights in {path} are incompatible with this classifier: {source}")]
    WeightsIncompatible {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("Failed to save model weights to {path}: {source}")]
    SaveWeights {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("Auxiliary input mismatch: {0}")]
    AuxMismatch(String),

    #[error("No reads of sufficient length were loaded")]
    EmptyDataset,

    #[error("Background reader thread panicked")]
    ReaderPanic,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl Error {
    /// Wraps an I/O error with the offending path, turning `NotFound` into [`Error::MissingFile`]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::MissingFile(path)
        } else {
            Error::Io { path, source }
        }
    }
}
