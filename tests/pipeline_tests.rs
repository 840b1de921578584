use candle_core::Device;
use candle_nn::{Optimizer, ParamsAdamW};
use read_origin_nn::dataset::Dataset;
use read_origin_nn::device::{DeviceStrategy, SingleDevice};
use read_origin_nn::model::{AuxMode, HybridClassifier, ModelConfig};
use read_origin_nn::predict::{classify, predict_on};
use read_origin_nn::{
    load_sequences, train, Error, PredictConfig, TrainConfig, AUX_INPUT_SIZE, INPUT_SIZE,
    NUM_CLASSES,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Deterministic pseudo-random read of `len` bases
fn synthetic_read(seed: u64, len: usize, alphabet: &[u8]) -> String {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            alphabet[(state >> 33) as usize % alphabet.len()] as char
        })
        .collect()
}

fn write_reads(path: &Path, prefix: &str, count: usize, alphabet: &[u8]) {
    let mut file = fs::File::create(path).unwrap();
    for i in 0..count {
        let len = INPUT_SIZE + (i % 3) * 10;
        writeln!(file, "@{prefix}{i}").unwrap();
        writeln!(file, "{}", synthetic_read(i as u64 + 1, len, alphabet)).unwrap();
        writeln!(file, "+").unwrap();
        writeln!(file, "{}", "I".repeat(len)).unwrap();
    }
}

fn quick_config() -> TrainConfig {
    TrainConfig {
        epochs: 2,
        batch_size: 4,
        ..Default::default()
    }
}

fn percentage_sum(prediction: &read_origin_nn::FilePrediction) -> f64 {
    (0..NUM_CLASSES).map(|c| prediction.percentage(c)).sum()
}

#[test]
fn test_train_then_predict_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let fastq = dir.path().join("x__1.fastq");
    write_reads(&fastq, "read", 10, b"ACGT");
    let weights = dir.path().join("models").join("x.safetensors");

    let report = train(&[fastq.clone()], &weights, None, &quick_config()).unwrap();
    assert!(weights.exists());
    assert_eq!(report.aux_mode, AuxMode::WithoutAuxiliary);
    assert!(report.epochs_run() >= 1 && report.epochs_run() <= 2);
    // 10 reads: 7 train, 1 test, 2 val
    assert!(report.val_accuracy.is_some());
    assert!(report.test_accuracy.is_some());

    let predictions = predict_on(
        &weights,
        &[fastq.clone()],
        None,
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].path, fastq);
    assert_eq!(predictions[0].total(), 10);
    assert!((percentage_sum(&predictions[0]) - 100.0).abs() < 1e-6);
}

#[test]
fn test_predict_reports_each_file_separately() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a__0.fastq");
    let b = dir.path().join("b__2.fq");
    write_reads(&a, "a", 6, b"AC");
    write_reads(&b, "b", 4, b"GT");
    let weights = dir.path().join("w.safetensors");

    train(&[a.clone(), b.clone()], &weights, None, &quick_config()).unwrap();
    let predictions =
        predict_on(&weights, &[a, b], None, &PredictConfig::default(), &Device::Cpu).unwrap();
    assert_eq!(predictions[0].total(), 6);
    assert_eq!(predictions[1].total(), 4);
}

#[test]
fn test_bad_filename_aborts_training() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good__0.fastq");
    let bad = dir.path().join("unlabelled.fastq");
    write_reads(&good, "g", 4, b"ACGT");
    write_reads(&bad, "b", 4, b"ACGT");

    let err = train(
        &[good, bad],
        &dir.path().join("w.safetensors"),
        None,
        &quick_config(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidLabelFilename(_)));
    assert!(!dir.path().join("w.safetensors").exists());
}

#[test]
fn test_auxiliary_fusion_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let fastq = dir.path().join("host__0.fastq");
    write_reads(&fastq, "r", 10, b"ACGT");

    let aln = dir.path().join("aln.csv");
    let mut lines = String::new();
    for i in 0..10 {
        lines.push_str(&format!("r{i},{},{},{}\n", i % 25, i, i + 150));
    }
    fs::write(&aln, lines).unwrap();

    let index = read_origin_nn::AlignmentIndex::from_path(&aln).unwrap();
    let data = load_sequences(&fastq, Some(&index)).unwrap();
    assert!(data.aux.iter().all(|a| a.map(|v| v.len()) == Some(AUX_INPUT_SIZE)));

    let weights = dir.path().join("aux.safetensors");
    let report = train(&[fastq.clone()], &weights, Some(&aln), &quick_config()).unwrap();
    assert_eq!(report.aux_mode, AuxMode::WithAuxiliary(AUX_INPUT_SIZE));

    let predictions = predict_on(
        &weights,
        &[fastq.clone()],
        Some(&aln),
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(predictions[0].total(), 10);

    // weights with the auxiliary branch cannot serve a plain classifier
    let err = predict_on(
        &weights,
        &[fastq],
        None,
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap_err();
    assert!(matches!(err, Error::WeightsIncompatible { .. }));
}

#[test]
fn test_unmatched_alignment_trains_without_auxiliary_branch() {
    let dir = tempfile::tempdir().unwrap();
    let fastq = dir.path().join("other__3.fastq");
    write_reads(&fastq, "r", 8, b"ACGT");
    let aln = dir.path().join("aln.csv");
    fs::write(&aln, "unrelated,1,10,160\n").unwrap();

    let weights = dir.path().join("w.safetensors");
    let report = train(&[fastq.clone()], &weights, Some(&aln), &quick_config()).unwrap();
    assert_eq!(report.aux_mode, AuxMode::WithoutAuxiliary);

    // the same alignment file at prediction time still matches nothing
    let predictions = predict_on(
        &weights,
        &[fastq.clone()],
        Some(&aln),
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(predictions[0].total(), 8);
    assert!((percentage_sum(&predictions[0]) - 100.0).abs() < 1e-6);

    let without =
        predict_on(&weights, &[fastq], None, &PredictConfig::default(), &Device::Cpu).unwrap();
    assert_eq!(without[0].total(), 8);
}

#[test]
fn test_predict_picks_auxiliary_branch_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let matched = dir.path().join("host__0.fastq");
    let unmatched = dir.path().join("other__1.fastq");
    write_reads(&matched, "m", 6, b"ACGT");
    write_reads(&unmatched, "u", 6, b"ACGT");

    let aln = dir.path().join("aln.csv");
    let lines: String = (0..6).map(|i| format!("m{i},{i},100,250\n")).collect();
    fs::write(&aln, lines).unwrap();

    let weights = dir.path().join("aux.safetensors");
    let report = train(&[matched.clone()], &weights, Some(&aln), &quick_config()).unwrap();
    assert_eq!(report.aux_mode, AuxMode::WithAuxiliary(AUX_INPUT_SIZE));

    // the unmatched file needs a plain classifier, which these weights cannot fill
    let err = predict_on(
        &weights,
        &[matched.clone(), unmatched],
        Some(&aln),
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap_err();
    assert!(matches!(err, Error::WeightsIncompatible { .. }));

    let predictions = predict_on(
        &weights,
        &[matched],
        Some(&aln),
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap();
    assert_eq!(predictions[0].total(), 6);
}

#[test]
fn test_missing_weights_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let fastq = dir.path().join("x__1.fastq");
    write_reads(&fastq, "r", 2, b"ACGT");
    let err = predict_on(
        &dir.path().join("absent.safetensors"),
        &[fastq],
        None,
        &PredictConfig::default(),
        &Device::Cpu,
    )
    .unwrap_err();
    assert!(matches!(err, Error::MissingFile(_)));
}

#[test]
fn test_trained_weights_reload_with_identical_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = vec![dir.path().join("a__0.fastq"), dir.path().join("t__1.fastq")];
    write_reads(&paths[0], "a", 12, b"AAAC");
    write_reads(&paths[1], "t", 12, b"TTTG");

    let mut dataset = Dataset::default();
    for path in &paths {
        dataset.extend(load_sequences(path, None).unwrap());
    }

    let config = ModelConfig::new(AuxMode::WithoutAuxiliary);
    let strategy = SingleDevice::new(Device::Cpu);
    let replicas = strategy.build_replicas(&config).unwrap();
    let mut optimizer = candle_nn::AdamW::new(
        replicas[0].varmap.all_vars(),
        ParamsAdamW {
            lr: 1e-2,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
    .unwrap();

    let all: Vec<usize> = (0..dataset.len()).collect();
    let batch = dataset
        .to_batch(&all, AuxMode::WithoutAuxiliary, &Device::Cpu)
        .unwrap();
    let mut last_loss = f64::INFINITY;
    for _ in 0..30 {
        let step = strategy.compute_gradients(&replicas, &batch).unwrap();
        optimizer.step(&step.grads).unwrap();
        last_loss = step.loss;
    }
    assert!(last_loss.is_finite());

    let weights = dir.path().join("toy.safetensors");
    replicas[0].varmap.save(&weights).unwrap();
    let reloaded = HybridClassifier::load(&weights, &config, &Device::Cpu).unwrap();

    let before = classify(&replicas[0].model, &dataset, 5, &Device::Cpu).unwrap();
    let after = classify(&reloaded, &dataset, 7, &Device::Cpu).unwrap();
    assert_eq!(before.len(), 24);
    assert_eq!(before, after);
}
