use crate::config::ModelParams;
use crate::core::alignment::LayerStack;
use crate::core::classifier::{validate_training_data, BinaryClassifier, Model};
use crate::core::map_cells;
use crate::core::sampling::TrainingTable;
use crate::types::{Cell, PipelineError, PipelineResult, RasterLayer};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Stratified train/test split of row indices.
///
/// Each class is shuffled with the seed and `test_fraction` of it (rounded)
/// is held out. Both index lists come back sorted.
pub fn train_test_split(labels: &[u8], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in [0u8, 1u8] {
        let mut idx: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        idx.shuffle(&mut rng);
        let n_test = (idx.len() as f64 * test_fraction).round() as usize;
        let n_test = n_test.min(idx.len().saturating_sub(1));
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Area under the ROC curve from the Mann-Whitney rank statistic (ties get
/// their average rank). `None` when only one class is present.
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> Option<f64> {
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 || labels.len() != scores.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = labels.iter().zip(&ranks).filter(|(l, _)| **l == 1).map(|(_, r)| r).sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}

/// Binary classification metrics at a 0.5 threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub roc_auc: Option<f64>,
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl Metrics {
    pub fn compute(labels: &[u8], probabilities: &[f64]) -> Self {
        let (mut tp, mut fp, mut tn, mut fneg) = (0, 0, 0, 0);
        for (&label, &p) in labels.iter().zip(probabilities) {
            match (label == 1, p >= 0.5) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (false, false) => tn += 1,
                (true, false) => fneg += 1,
            }
        }
        let ratio = |a: usize, b: usize| if b == 0 { 0.0 } else { a as f64 / b as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fneg);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            accuracy: ratio(tp + tn, labels.len()),
            precision,
            recall,
            f1,
            roc_auc: roc_auc(labels, probabilities),
            true_positives: tp,
            false_positives: fp,
            true_negatives: tn,
            false_negatives: fneg,
        }
    }
}

/// Model file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub model: Model,
    /// Stack layer order the model was trained on
    pub feature_names: Vec<String>,
    pub params: ModelParams,
    /// Held-out metrics (training metrics when nothing was held out)
    pub metrics: Metrics,
    pub n_train: usize,
    pub n_test: usize,
    pub trained_at: DateTime<Utc>,
}

impl TrainedModel {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> PipelineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        log::info!("Model saved to: {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::MissingSource(path.to_path_buf()));
        }
        let file = std::fs::File::open(path)?;
        let model: TrainedModel = serde_json::from_reader(std::io::BufReader::new(file))?;
        log::info!(
            "Loaded {:?} model with {} features (trained {})",
            model.model.kind(),
            model.feature_names.len(),
            model.trained_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(model)
    }
}

/// Fits and evaluates a classifier on a training table
pub struct Trainer {
    params: ModelParams,
}

impl Trainer {
    pub fn new(params: ModelParams) -> Self {
        Self { params }
    }

    pub fn train(&self, table: &TrainingTable) -> PipelineResult<TrainedModel> {
        let (x, y) = table.to_matrix();
        validate_training_data(&x, &y)?;

        let (train_idx, test_idx) = train_test_split(&y, self.params.test_fraction, self.params.seed);
        log::info!(
            "Training {:?}: {} train / {} test samples, {} features",
            self.params.kind,
            train_idx.len(),
            test_idx.len(),
            table.feature_names().len()
        );

        let x_train = x.select(Axis(0), &train_idx);
        let y_train: Vec<u8> = train_idx.iter().map(|&i| y[i]).collect();

        let mut model = Model::from_params(&self.params);
        model.fit(&x_train, &y_train)?;

        let (x_eval, y_eval) = if test_idx.is_empty() {
            log::warn!("No held-out samples; metrics are computed on the training data");
            (x_train, y_train)
        } else {
            let y_test: Vec<u8> = test_idx.iter().map(|&i| y[i]).collect();
            (x.select(Axis(0), &test_idx), y_test)
        };
        let metrics = Metrics::compute(&y_eval, &model.try_predict_proba(&x_eval)?);
        log::info!(
            "Evaluation: accuracy {:.3}, precision {:.3}, recall {:.3}, F1 {:.3}, AUC {}",
            metrics.accuracy,
            metrics.precision,
            metrics.recall,
            metrics.f1,
            metrics.roc_auc.map_or("n/a".to_string(), |a| format!("{:.3}", a))
        );

        Ok(TrainedModel {
            model,
            feature_names: table.feature_names().to_vec(),
            params: self.params.clone(),
            metrics,
            n_train: train_idx.len(),
            n_test: test_idx.len(),
            trained_at: Utc::now(),
        })
    }
}

/// Presence probability for every cell of the stack; nodata where any layer
/// is nodata. Stack layer names must match the model's feature names.
pub fn predict_probability_map(trained: &TrainedModel, stack: &LayerStack, nodata: Cell) -> PipelineResult<RasterLayer> {
    let names = stack.names();
    if names != trained.feature_names {
        return Err(PipelineError::Training(format!(
            "Stack layers {:?} do not match model features {:?}",
            names, trained.feature_names
        )));
    }

    log::info!(
        "Predicting probability map on {}x{} grid",
        stack.grid().width,
        stack.grid().height
    );
    let model = &trained.model;
    let data = map_cells(stack.grid().shape(), nodata, |row, col| match stack.features_at(row, col) {
        Some(features) => {
            let row = Array1::from_iter(features.iter().map(|&v| v as f64));
            model.predict_proba_row(row.view()) as Cell
        }
        None => nodata,
    });

    RasterLayer::new("probabilidad", data, stack.grid().clone(), nodata)
}
