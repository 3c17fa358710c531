//! Core raster processing modules

pub mod alignment;
pub mod mosaic;
pub mod terrain;
pub mod distance;
pub mod sampling;
pub mod classifier;
pub mod training;

// Re-export main types
pub use alignment::{ensure_aligned, resample_to_grid, LayerStack};
pub use mosaic::{merge_aligned, merge_into, target_grid, TileMosaicker};
pub use terrain::{DerivativeKind, TerrainAnalyzer, TerrainParams};
pub use distance::{euclidean_distance, DistanceRasterBuilder, Rasterizer};
pub use sampling::{presence_points, Sampler, TrainingTable};
pub use classifier::{BinaryClassifier, GradientBoosting, LogisticRegression, Model, RandomForest, RegressionTree};
pub use training::{predict_probability_map, roc_auc, train_test_split, Metrics, TrainedModel, Trainer};

use ndarray::{Array2, Zip};

/// Build a grid by evaluating `f(row, col)` for every cell, in parallel when
/// the `parallel` feature is enabled
pub(crate) fn map_cells<T, F>(shape: (usize, usize), fill: T, f: F) -> Array2<T>
where
    T: Copy + Send + Sync,
    F: Fn(usize, usize) -> T + Send + Sync,
{
    let mut out = Array2::from_elem(shape, fill);

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut out).par_for_each(|(row, col), v| *v = f(row, col));

    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut out).for_each(|(row, col), v| *v = f(row, col));

    out
}
