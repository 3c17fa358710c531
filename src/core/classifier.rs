//! Binary classifiers for presence/absence modelling.
//!
//! All models take a dense feature matrix (samples x features) with 0/1
//! labels and output presence probabilities. Every source of randomness is
//! driven by an explicit seed.

use crate::config::{ModelKind, ModelParams};
use crate::types::{PipelineError, PipelineResult};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Common interface of the presence/absence classifiers
pub trait BinaryClassifier {
    /// Fit on `x` (samples x features) and 0/1 labels
    fn fit(&mut self, x: &Array2<f64>, y: &[u8]) -> PipelineResult<()>;

    /// Presence probability of one sample
    fn predict_proba_row(&self, row: ArrayView1<f64>) -> f64;

    /// Number of features seen during fitting (0 before)
    fn n_features(&self) -> usize;

    fn predict_proba(&self, x: &Array2<f64>) -> Vec<f64> {
        x.axis_iter(Axis(0)).map(|row| self.predict_proba_row(row)).collect()
    }

    fn predict(&self, x: &Array2<f64>) -> Vec<u8> {
        self.predict_proba(x).into_iter().map(|p| u8::from(p >= 0.5)).collect()
    }
}

/// Reject inputs no model can be trained on
pub fn validate_training_data(x: &Array2<f64>, y: &[u8]) -> PipelineResult<()> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(PipelineError::Training(format!(
            "Empty training data ({} samples, {} features)",
            x.nrows(),
            x.ncols()
        )));
    }
    if x.nrows() != y.len() {
        return Err(PipelineError::Training(format!(
            "{} samples but {} labels",
            x.nrows(),
            y.len()
        )));
    }
    if let Some(bad) = y.iter().find(|&&l| l > 1) {
        return Err(PipelineError::Training(format!("Label {} is not 0/1", bad)));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::Training("Feature matrix contains non-finite values".to_string()));
    }
    let positives = y.iter().filter(|&&l| l == 1).count();
    if positives == 0 || positives == y.len() {
        return Err(PipelineError::Training(
            "Training labels contain a single class".to_string(),
        ));
    }
    Ok(())
}

fn check_features(expected: usize, x: &Array2<f64>) -> PipelineResult<()> {
    if expected != 0 && x.ncols() != expected {
        return Err(PipelineError::Training(format!(
            "Model expects {} features, got {}",
            expected,
            x.ncols()
        )));
    }
    Ok(())
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

// ---------------------------------------------------------------------------
// Logistic regression
// ---------------------------------------------------------------------------

/// L2-regularised logistic regression on standardised features, fitted by
/// batch gradient descent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub learning_rate: f64,
    pub max_iter: usize,
    pub l2: f64,
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl LogisticRegression {
    pub fn new(learning_rate: f64, max_iter: usize, l2: f64) -> Self {
        Self {
            learning_rate,
            max_iter,
            l2,
            means: Vec::new(),
            scales: Vec::new(),
            weights: Vec::new(),
            bias: 0.0,
        }
    }

    /// Coefficients on the standardised scale
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl BinaryClassifier for LogisticRegression {
    fn fit(&mut self, x: &Array2<f64>, y: &[u8]) -> PipelineResult<()> {
        validate_training_data(x, y)?;
        let (n, p) = x.dim();
        log::info!("Fitting logistic regression: {} samples, {} features", n, p);

        let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
        let scales = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let xs = (x - &means) / &scales;
        let targets = Array1::from_iter(y.iter().map(|&l| l as f64));

        let mut w = Array1::<f64>::zeros(p);
        let mut b = 0.0;
        for iter in 0..self.max_iter {
            let probs = (xs.dot(&w) + b).mapv(sigmoid);
            let err = &probs - &targets;
            let grad_w = xs.t().dot(&err) / n as f64 + &w * self.l2;
            let grad_b = err.sum() / n as f64;
            w = w - grad_w * self.learning_rate;
            b -= grad_b * self.learning_rate;

            if iter % 100 == 0 {
                let loss = log_loss(&targets, &probs);
                log::debug!("  iter {}: log loss {:.5}", iter, loss);
            }
        }

        self.means = means.to_vec();
        self.scales = scales.to_vec();
        self.weights = w.to_vec();
        self.bias = b;
        Ok(())
    }

    fn predict_proba_row(&self, row: ArrayView1<f64>) -> f64 {
        let z = row
            .iter()
            .zip(&self.means)
            .zip(&self.scales)
            .zip(&self.weights)
            .map(|(((v, m), s), w)| (v - m) / s * w)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }

    fn n_features(&self) -> usize {
        self.weights.len()
    }
}

fn log_loss(targets: &Array1<f64>, probs: &Array1<f64>) -> f64 {
    let eps = 1e-12;
    let n = targets.len().max(1) as f64;
    targets
        .iter()
        .zip(probs.iter())
        .map(|(t, p)| {
            let p = p.clamp(eps, 1.0 - eps);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum::<f64>()
        / n
}

// ---------------------------------------------------------------------------
// Regression tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// CART regression tree with squared-error splits.
///
/// On 0/1 targets the variance criterion ranks splits exactly like Gini
/// impurity, so the same tree serves as a forest member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; all when `None`
    pub max_features: Option<usize>,
    nodes: Vec<Node>,
    n_features: usize,
}

struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    targets: &'a [f64],
    leaf_value: &'a dyn Fn(&[usize]) -> f64,
}

impl RegressionTree {
    pub fn new(max_depth: usize, min_samples_leaf: usize) -> Self {
        Self {
            max_depth,
            min_samples_leaf: min_samples_leaf.max(1),
            max_features: None,
            nodes: Vec::new(),
            n_features: 0,
        }
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = Some(max_features.max(1));
        self
    }

    /// Fit on continuous targets; leaves hold the target mean
    pub fn fit(&mut self, x: &Array2<f64>, targets: &[f64], seed: u64) -> PipelineResult<()> {
        if x.nrows() == 0 || x.nrows() != targets.len() {
            return Err(PipelineError::Training(format!(
                "Tree needs matching non-empty samples and targets ({} vs {})",
                x.nrows(),
                targets.len()
            )));
        }
        let indices: Vec<usize> = (0..x.nrows()).collect();
        let mean = |idx: &[usize]| idx.iter().map(|&i| targets[i]).sum::<f64>() / idx.len() as f64;
        let mut rng = StdRng::seed_from_u64(seed);
        self.fit_indices(x, targets, indices, &mean, &mut rng);
        Ok(())
    }

    /// Fit on a subset of rows with a custom leaf estimator
    fn fit_indices(
        &mut self,
        x: &Array2<f64>,
        targets: &[f64],
        mut indices: Vec<usize>,
        leaf_value: &dyn Fn(&[usize]) -> f64,
        rng: &mut StdRng,
    ) {
        self.nodes.clear();
        self.n_features = x.ncols();
        let builder = TreeBuilder { x, targets, leaf_value };
        self.grow(&builder, &mut indices, 0, rng);
    }

    fn grow(&mut self, b: &TreeBuilder, indices: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: (b.leaf_value)(&*indices),
        });

        if depth >= self.max_depth || indices.len() < 2 * self.min_samples_leaf {
            return id;
        }
        let split = match self.best_split(b, indices, rng) {
            Some(s) => s,
            None => return id,
        };

        let (feature, threshold) = split;
        let mut left: Vec<usize> = Vec::new();
        let mut right: Vec<usize> = Vec::new();
        for &i in indices.iter() {
            if b.x[[i, feature]] <= threshold {
                left.push(i);
            } else {
                right.push(i);
            }
        }

        let l = self.grow(b, &mut left, depth + 1, rng);
        let r = self.grow(b, &mut right, depth + 1, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left: l,
            right: r,
        };
        id
    }

    /// (feature, threshold) with the largest squared-error reduction
    fn best_split(&self, b: &TreeBuilder, indices: &mut [usize], rng: &mut StdRng) -> Option<(usize, f64)> {
        let p = b.x.ncols();
        let features: Vec<usize> = match self.max_features {
            Some(m) if m < p => rand::seq::index::sample(rng, p, m).into_vec(),
            _ => (0..p).collect(),
        };

        let n = indices.len();
        let total: f64 = indices.iter().map(|&i| b.targets[i]).sum();
        let total_sq: f64 = indices.iter().map(|&i| b.targets[i] * b.targets[i]).sum();
        let parent_sse = total_sq - total * total / n as f64;

        let mut best: Option<(usize, f64)> = None;
        let mut best_gain = 1e-12;

        for feature in features {
            indices.sort_by(|&a, &c| b.x[[a, feature]].total_cmp(&b.x[[c, feature]]));

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for k in 0..n - 1 {
                let t = b.targets[indices[k]];
                left_sum += t;
                left_sq += t * t;

                let n_left = k + 1;
                let n_right = n - n_left;
                if n_left < self.min_samples_leaf || n_right < self.min_samples_leaf {
                    continue;
                }
                let here = b.x[[indices[k], feature]];
                let next = b.x[[indices[k + 1], feature]];
                if here == next {
                    continue;
                }

                let right_sum = total - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / n_left as f64)
                    + (right_sq - right_sum * right_sum / n_right as f64);
                let gain = parent_sse - sse;
                if gain > best_gain {
                    best_gain = gain;
                    best = Some((feature, here + (next - here) / 2.0));
                }
            }
        }
        best
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut id = 0;
        loop {
            match self.nodes.get(id) {
                Some(Node::Leaf { value }) => return *value,
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    id = if row[*feature] <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match nodes.get(id) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

// ---------------------------------------------------------------------------
// Random forest
// ---------------------------------------------------------------------------

/// Bagged regression trees on 0/1 targets with sqrt(p) feature subsampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn new(n_trees: usize, max_depth: usize, min_samples_leaf: usize, seed: u64) -> Self {
        Self {
            n_trees,
            max_depth,
            min_samples_leaf,
            seed,
            trees: Vec::new(),
        }
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    fn fit_tree(&self, x: &Array2<f64>, targets: &[f64], tree_idx: usize) -> RegressionTree {
        let n = x.nrows();
        let mtry = ((x.ncols() as f64).sqrt().round() as usize).max(1);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(tree_idx as u64));
        let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();

        let mean = |idx: &[usize]| idx.iter().map(|&i| targets[i]).sum::<f64>() / idx.len() as f64;
        let mut tree = RegressionTree::new(self.max_depth, self.min_samples_leaf).with_max_features(mtry);
        tree.fit_indices(x, targets, bootstrap, &mean, &mut rng);
        tree
    }
}

impl BinaryClassifier for RandomForest {
    fn fit(&mut self, x: &Array2<f64>, y: &[u8]) -> PipelineResult<()> {
        validate_training_data(x, y)?;
        if self.n_trees == 0 {
            return Err(PipelineError::Training("Random forest needs at least one tree".to_string()));
        }
        log::info!(
            "Fitting random forest: {} trees, max depth {}, {} samples, {} features",
            self.n_trees,
            self.max_depth,
            x.nrows(),
            x.ncols()
        );
        let targets: Vec<f64> = y.iter().map(|&l| l as f64).collect();

        #[cfg(feature = "parallel")]
        let trees: Vec<RegressionTree> = (0..self.n_trees)
            .into_par_iter()
            .map(|t| self.fit_tree(x, &targets, t))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let trees: Vec<RegressionTree> = (0..self.n_trees).map(|t| self.fit_tree(x, &targets, t)).collect();

        self.trees = trees;
        Ok(())
    }

    fn predict_proba_row(&self, row: ArrayView1<f64>) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / self.trees.len() as f64
    }

    fn n_features(&self) -> usize {
        self.trees.first().map_or(0, |t| t.n_features)
    }
}

// ---------------------------------------------------------------------------
// Gradient boosting
// ---------------------------------------------------------------------------

/// Gradient-boosted trees with logistic loss and Newton leaf values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoosting {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub learning_rate: f64,
    /// Row fraction drawn (without replacement) for every round
    pub subsample: f64,
    pub seed: u64,
    base_score: f64,
    trees: Vec<RegressionTree>,
}

impl GradientBoosting {
    pub fn new(n_trees: usize, max_depth: usize, min_samples_leaf: usize, learning_rate: f64, seed: u64) -> Self {
        Self {
            n_trees,
            max_depth,
            min_samples_leaf,
            learning_rate,
            subsample: 0.8,
            seed,
            base_score: 0.0,
            trees: Vec::new(),
        }
    }

    fn raw_score(&self, row: ArrayView1<f64>) -> f64 {
        self.base_score + self.trees.iter().map(|t| self.learning_rate * t.predict_row(row)).sum::<f64>()
    }
}

impl BinaryClassifier for GradientBoosting {
    fn fit(&mut self, x: &Array2<f64>, y: &[u8]) -> PipelineResult<()> {
        validate_training_data(x, y)?;
        let n = x.nrows();
        log::info!(
            "Fitting gradient boosting: {} rounds, depth {}, learning rate {}",
            self.n_trees,
            self.max_depth,
            self.learning_rate
        );

        let labels: Vec<f64> = y.iter().map(|&l| l as f64).collect();
        let prior = (labels.iter().sum::<f64>() / n as f64).clamp(1e-6, 1.0 - 1e-6);
        self.base_score = (prior / (1.0 - prior)).ln();
        self.trees.clear();

        let mut scores = vec![self.base_score; n];
        let mut rng = StdRng::seed_from_u64(self.seed);
        let take = ((n as f64 * self.subsample.clamp(0.0, 1.0)).round() as usize).clamp(1, n);

        for round in 0..self.n_trees {
            let probs: Vec<f64> = scores.iter().map(|&s| sigmoid(s)).collect();
            let residuals: Vec<f64> = labels.iter().zip(&probs).map(|(t, p)| t - p).collect();
            let hessians: Vec<f64> = probs.iter().map(|p| p * (1.0 - p)).collect();

            let rows = if take < n {
                rand::seq::index::sample(&mut rng, n, take).into_vec()
            } else {
                (0..n).collect()
            };

            let newton = |idx: &[usize]| {
                let g: f64 = idx.iter().map(|&i| residuals[i]).sum();
                let h: f64 = idx.iter().map(|&i| hessians[i]).sum();
                g / h.max(1e-12)
            };
            let mut tree = RegressionTree::new(self.max_depth, self.min_samples_leaf);
            tree.fit_indices(x, &residuals, rows, &newton, &mut rng);

            for (i, row) in x.axis_iter(Axis(0)).enumerate() {
                scores[i] += self.learning_rate * tree.predict_row(row);
            }
            self.trees.push(tree);

            if round % 20 == 0 {
                let t = Array1::from(labels.clone());
                let p = Array1::from_iter(scores.iter().map(|&s| sigmoid(s)));
                log::debug!("  round {}: log loss {:.5}", round, log_loss(&t, &p));
            }
        }
        Ok(())
    }

    fn predict_proba_row(&self, row: ArrayView1<f64>) -> f64 {
        sigmoid(self.raw_score(row))
    }

    fn n_features(&self) -> usize {
        self.trees.first().map_or(0, |t| t.n_features)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Any trained classifier, serialisable with its kind tag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Model {
    LogisticRegression(LogisticRegression),
    RandomForest(RandomForest),
    GradientBoosting(GradientBoosting),
}

impl Model {
    /// Untrained model configured from parameters
    pub fn from_params(params: &ModelParams) -> Self {
        match params.kind {
            ModelKind::LogisticRegression => {
                Model::LogisticRegression(LogisticRegression::new(params.learning_rate, params.max_iter, params.l2))
            }
            ModelKind::RandomForest => Model::RandomForest(RandomForest::new(
                params.n_trees,
                params.max_depth,
                params.min_samples_leaf,
                params.seed,
            )),
            ModelKind::GradientBoosting => Model::GradientBoosting(GradientBoosting::new(
                params.n_trees,
                params.max_depth,
                params.min_samples_leaf,
                params.learning_rate,
                params.seed,
            )),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Model::LogisticRegression(_) => ModelKind::LogisticRegression,
            Model::RandomForest(_) => ModelKind::RandomForest,
            Model::GradientBoosting(_) => ModelKind::GradientBoosting,
        }
    }

    fn inner(&self) -> &dyn BinaryClassifier {
        match self {
            Model::LogisticRegression(m) => m,
            Model::RandomForest(m) => m,
            Model::GradientBoosting(m) => m,
        }
    }
}

impl BinaryClassifier for Model {
    fn fit(&mut self, x: &Array2<f64>, y: &[u8]) -> PipelineResult<()> {
        match self {
            Model::LogisticRegression(m) => m.fit(x, y),
            Model::RandomForest(m) => m.fit(x, y),
            Model::GradientBoosting(m) => m.fit(x, y),
        }
    }

    fn predict_proba_row(&self, row: ArrayView1<f64>) -> f64 {
        self.inner().predict_proba_row(row)
    }

    fn n_features(&self) -> usize {
        self.inner().n_features()
    }
}

impl Model {
    /// Probabilities with a feature-count check
    pub fn try_predict_proba(&self, x: &Array2<f64>) -> PipelineResult<Vec<f64>> {
        check_features(self.n_features(), x)?;
        Ok(self.inner().predict_proba(x))
    }
}
