use crate::config::SamplingParams;
use crate::core::alignment::LayerStack;
use crate::types::{Coord, Label, PipelineError, PipelineResult, SampleRecord, VectorLayer};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

/// Presence locations of a site layer: points as-is, lines by their vertex
/// mean and polygons by their centroid
pub fn presence_points(layer: &VectorLayer) -> Vec<Coord> {
    let points: Vec<Coord> = layer
        .geometries
        .iter()
        .filter_map(|g| g.representative_point())
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .collect();
    log::info!("{} presence points from '{}'", points.len(), layer.name);
    points
}

/// Presence/absence training table
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTable {
    feature_names: Vec<String>,
    records: Vec<SampleRecord>,
}

impl TrainingTable {
    pub fn new(feature_names: Vec<String>, records: Vec<SampleRecord>) -> PipelineResult<Self> {
        for (i, record) in records.iter().enumerate() {
            if record.features.len() != feature_names.len() {
                return Err(PipelineError::InvalidFormat(format!(
                    "Record {} has {} features, expected {}",
                    i,
                    record.features.len(),
                    feature_names.len()
                )));
            }
        }
        Ok(Self { feature_names, records })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// (absences, presences)
    pub fn label_counts(&self) -> (usize, usize) {
        self.records.iter().fold((0, 0), |(a, p), r| match r.label {
            Label::Absence => (a + 1, p),
            Label::Presence => (a, p + 1),
        })
    }

    /// Feature matrix (records x features) and 0/1 labels
    pub fn to_matrix(&self) -> (Array2<f64>, Vec<u8>) {
        let n_features = self.feature_names.len();
        let x = Array2::from_shape_fn((self.records.len(), n_features), |(i, j)| {
            self.records[i].features[j] as f64
        });
        let y = self.records.iter().map(|r| r.label.as_u8()).collect();
        (x, y)
    }
}

/// Presence/absence sampler over an aligned layer stack
pub struct Sampler {
    params: SamplingParams,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        Self { params }
    }

    /// Draw `absence_ratio` absence points per presence point, at valid cell
    /// centres at least `min_distance_m` away from every presence point.
    pub fn absence_points(&self, stack: &LayerStack, presences: &[Coord]) -> PipelineResult<Vec<Coord>> {
        let target = (self.params.absence_ratio * presences.len() as f64).round().max(1.0) as usize;
        self.draw_absences(stack, presences, target)
    }

    /// Draw up to `target` absence points away from `exclusion`.
    ///
    /// Cells are drawn uniformly over the grid without replacement; draws on
    /// a cell where any layer is nodata are rejected. The result depends only
    /// on the seed and inputs.
    fn draw_absences(&self, stack: &LayerStack, exclusion: &[Coord], target: usize) -> PipelineResult<Vec<Coord>> {
        if exclusion.is_empty() {
            return Err(PipelineError::Processing("No presence points to sample against".to_string()));
        }

        let valid = stack.valid_count();
        if valid == 0 {
            return Err(PipelineError::Processing(
                "No valid cells in the layer stack to draw absences from".to_string(),
            ));
        }

        log::info!(
            "Sampling {} absence points from {} valid cells (seed {}, min distance {} m)",
            target,
            valid,
            self.params.seed,
            self.params.min_distance_m
        );

        let index = PointIndex::new(exclusion, self.params.min_distance_m);
        let grid = stack.grid();
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut taken: HashSet<(usize, usize)> = HashSet::new();
        let mut absences = Vec::with_capacity(target);
        let max_attempts = target.saturating_mul(self.params.max_attempts_per_point);
        let mut attempts = 0usize;

        while absences.len() < target && attempts < max_attempts && taken.len() < valid {
            attempts += 1;
            let row = rng.gen_range(0..grid.height);
            let col = rng.gen_range(0..grid.width);
            if !stack.is_valid_cell(row, col) || taken.contains(&(row, col)) {
                continue;
            }
            let centre = grid.cell_center(row, col);
            if index.any_within(&centre, self.params.min_distance_m) {
                continue;
            }
            taken.insert((row, col));
            absences.push(centre);
        }

        if absences.is_empty() {
            return Err(PipelineError::Processing(format!(
                "No absence candidates found at least {} m from presence points",
                self.params.min_distance_m
            )));
        }
        if absences.len() < target {
            log::warn!(
                "Only {} of {} absence points found after {} attempts",
                absences.len(),
                target,
                attempts
            );
        }
        Ok(absences)
    }

    /// Feature records for `points`; returns the records and the number of
    /// points dropped (outside the grid or on nodata)
    pub fn extract(&self, stack: &LayerStack, points: &[Coord], label: Label) -> (Vec<SampleRecord>, usize) {
        let mut records = Vec::with_capacity(points.len());
        let mut dropped = 0;
        for point in points {
            match stack.features_at_coord(point) {
                Some(features) => records.push(SampleRecord {
                    location: *point,
                    label,
                    features,
                }),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            log::warn!("Dropped {} {} points outside the grid or on nodata", dropped, label);
        }
        (records, dropped)
    }

    /// Presence records followed by absence records.
    ///
    /// The absence count follows the presence rows kept; every input presence
    /// still excludes absences around it.
    pub fn build_table(&self, stack: &LayerStack, presences: &[Coord]) -> PipelineResult<TrainingTable> {
        let (mut records, _) = self.extract(stack, presences, Label::Presence);
        if records.is_empty() {
            return Err(PipelineError::Processing(
                "No presence point falls on valid cells of the layer stack".to_string(),
            ));
        }

        let target = (self.params.absence_ratio * records.len() as f64).round().max(1.0) as usize;
        let absences = self.draw_absences(stack, presences, target)?;
        let (absence_records, _) = self.extract(stack, &absences, Label::Absence);
        records.extend(absence_records);

        let table = TrainingTable::new(stack.names(), records)?;
        let (n_abs, n_pres) = table.label_counts();
        log::info!("Training table: {} presences, {} absences, {} features", n_pres, n_abs, stack.len());
        Ok(table)
    }
}

/// Uniform bucket index for radius queries
struct PointIndex {
    bucket: f64,
    cells: HashMap<(i64, i64), Vec<Coord>>,
}

impl PointIndex {
    fn new(points: &[Coord], radius: f64) -> Self {
        let bucket = if radius > 0.0 { radius } else { 1.0 };
        let mut cells: HashMap<(i64, i64), Vec<Coord>> = HashMap::new();
        for p in points {
            cells.entry(Self::key(p, bucket)).or_default().push(*p);
        }
        Self { bucket, cells }
    }

    fn key(p: &Coord, bucket: f64) -> (i64, i64) {
        ((p.x / bucket).floor() as i64, (p.y / bucket).floor() as i64)
    }

    /// Whether any indexed point is strictly closer than `radius`
    fn any_within(&self, p: &Coord, radius: f64) -> bool {
        if radius <= 0.0 {
            return false;
        }
        let (kx, ky) = Self::key(p, self.bucket);
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(points) = self.cells.get(&(kx + dx, ky + dy)) {
                    if points.iter().any(|q| q.distance(p) < radius) {
                        return true;
                    }
                }
            }
        }
        false
    }
}
