// lib.rs - 库函数

//! Classifies FASTQ reads into origin categories with a hybrid CNN/BiLSTM
//! network, and trains that network from labeled FASTQ files.

pub mod alignment;
pub mod dataset;
pub mod device;
pub mod encode;
pub mod error;
pub mod fastq;
pub mod logging;
pub mod model;
pub mod predict;
pub mod train;

/// Length of the nucleotide window fed to the network
pub const INPUT_SIZE: usize = 150;

/// Number of origin classes
pub const NUM_CLASSES: usize = 5;

/// Chromosomes 1-22, X, Y and MT
pub const NUM_CHROMOSOMES: usize = 25;

/// One-hot chromosome plus raw start and end
pub const AUX_INPUT_SIZE: usize = NUM_CHROMOSOMES + 2;

/// Width of the recurrent layer and of the auxiliary projection
pub const HIDDEN_SIZE: usize = 128;

/// Dropout applied to the recurrent layer's input while training
pub const DROPOUT_PROB: f32 = 0.5;

pub use alignment::{AlignmentIndex, AlignmentRecord};
pub use dataset::{label_from_filename, load_sequences, train_test_val_split, Dataset, FileData};
pub use encode::{encode_sequence, encode_window};
pub use error::{Error, Result};
pub use model::{AuxMode, HybridClassifier, ModelConfig};
pub use predict::{predict, FilePrediction, PredictConfig};
pub use train::{train, TrainConfig, TrainReport};
