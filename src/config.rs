//! Pipeline configuration and predictor raster registry.
//!
//! Adding a predictor to the whole pipeline (alignment check, sampling,
//! training, prediction) means appending one [`LayerSpec`] to the registry.

use crate::types::{PipelineError, PipelineResult, VarGroup, VarType, NODATA};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// South America Albers Equal Area Conic
pub const DEFAULT_CRS: &str = "ESRI:102033";

/// Target resolution in metres
pub const DEFAULT_PIXEL_SIZE: f64 = 30.0;

/// Metadata for a single predictor raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Column name in the training table (unique)
    pub name: String,
    /// File name inside the raster directory
    pub filename: String,
    pub var_type: VarType,
    pub group: VarGroup,
    pub label: String,
    #[serde(default)]
    pub unit: String,
    /// "v1" baseline or "v2" DEM derivatives
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

fn default_version() -> String {
    "v1".to_string()
}

impl LayerSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        filename: &str,
        var_type: VarType,
        group: VarGroup,
        label: &str,
        unit: &str,
        version: &str,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            var_type,
            group,
            label: label.to_string(),
            unit: unit.to_string(),
            version: version.to_string(),
            description: description.to_string(),
        }
    }
}

/// Vector sources burned into one distance raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceSource {
    /// Registry name of the produced layer
    pub name: String,
    /// Vector files (relative to the vector directory); their distances are
    /// combined with a cell-wise minimum
    pub inputs: Vec<PathBuf>,
    pub output: String,
}

/// Absence sampling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub seed: u64,
    /// Absence points drawn per presence point
    pub absence_ratio: f64,
    /// Minimum distance (metres) between an absence and any presence point
    pub min_distance_m: f64,
    /// Candidate draws allowed per requested absence point
    pub max_attempts_per_point: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: 42,
            absence_ratio: 1.0,
            min_distance_m: 500.0,
            max_attempts_per_point: 100,
        }
    }
}

/// Classifier family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LogisticRegression,
    RandomForest,
    GradientBoosting,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::LogisticRegression => "logistic_regression",
            ModelKind::RandomForest => "random_forest",
            ModelKind::GradientBoosting => "gradient_boosting",
        }
    }
}

/// Classifier and evaluation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub kind: ModelKind,
    pub seed: u64,
    /// Fraction of records held out for evaluation
    pub test_fraction: f64,
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub learning_rate: f64,
    /// Gradient descent iterations (logistic regression)
    pub max_iter: usize,
    /// L2 penalty (logistic regression)
    pub l2: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            kind: ModelKind::RandomForest,
            seed: 42,
            test_fraction: 0.3,
            n_trees: 100,
            max_depth: 12,
            min_samples_leaf: 2,
            learning_rate: 0.1,
            max_iter: 500,
            l2: 1e-3,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub crs: String,
    pub pixel_size: f64,
    pub nodata: f32,
    /// Raw tile archives / tiles
    pub tile_dir: PathBuf,
    /// Where archives are extracted; a temporary directory when unset
    pub extract_dir: Option<PathBuf>,
    /// Case-insensitive regex selecting elevation tiles
    pub tile_pattern: String,
    pub vector_dir: PathBuf,
    pub raster_dir: PathBuf,
    pub samples_dir: PathBuf,
    pub models_dir: PathBuf,
    /// Reference elevation raster file name inside `raster_dir`
    pub dem_filename: String,
    /// TPI neighbourhood radius in pixels
    pub tpi_radius: usize,
    pub layers: Vec<LayerSpec>,
    pub distances: Vec<DistanceSource>,
    pub sampling: SamplingParams,
    pub model: ModelParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            crs: DEFAULT_CRS.to_string(),
            pixel_size: DEFAULT_PIXEL_SIZE,
            nodata: NODATA,
            tile_dir: PathBuf::from("data/raw/dem_tiles"),
            extract_dir: None,
            tile_pattern: r"(?i)dem\.tif$".to_string(),
            vector_dir: PathBuf::from("data/raw"),
            raster_dir: PathBuf::from("data/processed/rasters"),
            samples_dir: PathBuf::from("data/processed/samples"),
            models_dir: PathBuf::from("models"),
            dem_filename: "dem.tif".to_string(),
            tpi_radius: 10,
            layers: default_registry(),
            distances: default_distance_sources(),
            sampling: SamplingParams::default(),
            model: ModelParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON configuration file; omitted fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from: {}", path.display());
        if !path.exists() {
            return Err(PipelineError::MissingSource(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> PipelineResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.crs.trim().is_empty() {
            return Err(PipelineError::Config("Project CRS is empty".to_string()));
        }
        if !(self.pixel_size > 0.0) || !self.pixel_size.is_finite() {
            return Err(PipelineError::Config(format!("Invalid pixel size: {}", self.pixel_size)));
        }
        if self.nodata.is_nan() {
            return Err(PipelineError::Config("Nodata sentinel must not be NaN".to_string()));
        }
        regex::Regex::new(&self.tile_pattern)
            .map_err(|e| PipelineError::Config(format!("Invalid tile pattern '{}': {}", self.tile_pattern, e)))?;
        if self.tpi_radius == 0 {
            return Err(PipelineError::Config("TPI radius must be at least 1 pixel".to_string()));
        }

        let mut names = HashSet::new();
        for layer in &self.layers {
            if !names.insert(layer.name.as_str()) {
                return Err(PipelineError::Config(format!("Duplicate layer name: {}", layer.name)));
            }
        }
        for source in &self.distances {
            if source.inputs.is_empty() {
                return Err(PipelineError::Config(format!(
                    "Distance source '{}' has no inputs",
                    source.name
                )));
            }
        }

        let s = &self.sampling;
        if !(s.absence_ratio > 0.0) || s.min_distance_m < 0.0 || s.max_attempts_per_point == 0 {
            return Err(PipelineError::Config(format!("Invalid sampling parameters: {:?}", s)));
        }
        let m = &self.model;
        if !(m.test_fraction >= 0.0 && m.test_fraction < 1.0) {
            return Err(PipelineError::Config(format!("Invalid test fraction: {}", m.test_fraction)));
        }
        if m.n_trees == 0 || m.max_depth == 0 || m.min_samples_leaf == 0 || m.max_iter == 0 {
            return Err(PipelineError::Config(format!("Invalid model parameters: {:?}", m)));
        }
        if !(m.learning_rate > 0.0) {
            return Err(PipelineError::Config(format!("Invalid learning rate: {}", m.learning_rate)));
        }
        Ok(())
    }

    /// Layers filtered by version, type and/or group
    pub fn layers_where(
        &self,
        version: Option<&str>,
        var_type: Option<VarType>,
        group: Option<VarGroup>,
    ) -> Vec<&LayerSpec> {
        self.layers
            .iter()
            .filter(|l| version.map_or(true, |v| l.version == v))
            .filter(|l| var_type.map_or(true, |t| l.var_type == t))
            .filter(|l| group.map_or(true, |g| l.group == g))
            .collect()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerSpec> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Ordered feature names (training table columns)
    pub fn feature_names(&self, version: Option<&str>) -> Vec<String> {
        self.layers_where(version, None, None)
            .into_iter()
            .map(|l| l.name.clone())
            .collect()
    }

    pub fn layer_path(&self, layer: &LayerSpec) -> PathBuf {
        self.raster_dir.join(&layer.filename)
    }

    pub fn dem_path(&self) -> PathBuf {
        self.raster_dir.join(&self.dem_filename)
    }
}

/// Predictor registry of the Peru model
pub fn default_registry() -> Vec<LayerSpec> {
    use VarGroup::*;
    use VarType::*;

    vec![
        // v1: terrain
        LayerSpec::new("pendiente", "pendiente.tif", Continuous, Terrain, "Slope", "deg", "v1",
            "Terrain inclination. Flat areas preferred for habitation."),
        LayerSpec::new("rugosidad", "rugosidad.tif", Continuous, Terrain, "Terrain Ruggedness (TRI)", "index", "v1",
            "Terrain irregularity. Smoother terrain facilitates construction."),
        // v1: hydrology
        LayerSpec::new("dist_rios", "distancia_rios.tif", Distance, Hydrology, "Dist. Rivers", "m", "v1",
            "Euclidean distance to watercourses."),
        LayerSpec::new("dist_lagos", "distancia_lagos.tif", Distance, Hydrology, "Dist. Lakes", "m", "v1",
            "Distance to lacustrine bodies."),
        // v1: road network
        LayerSpec::new("dist_qhapaq", "distancia_qhapaq_nan.tif", Distance, Road, "Dist. Qhapaq Nan", "m", "v1",
            "Distance to the Inca road network."),
        // v1: archaeological context
        LayerSpec::new("dist_declarados", "distancia_declarados.tif", Distance, Context, "Dist. Declared Sites", "m", "v1",
            "Proximity to registered point sites."),
        LayerSpec::new("dist_g1", "distancia_g1.tif", Distance, Context, "Dist. Monumental Nuclei (G1)", "m", "v1",
            "Proximity to major urban and ceremonial centres."),
        LayerSpec::new("dist_g2", "distancia_g2.tif", Distance, Context, "Dist. Cultural Landscapes (G2)", "m", "v1",
            "Proximity to terraces, canals and extensive modification areas."),
        LayerSpec::new("dist_g3", "distancia_g3.tif", Distance, Context, "Dist. Isolated Evidence (G3)", "m", "v1",
            "Spatial continuity of isolated findings."),
        // v2: DEM derivatives
        LayerSpec::new("altitud", "altitud.tif", Continuous, Terrain, "Elevation", "m", "v2",
            "Altitude determines ecological zones and habitability."),
        LayerSpec::new("aspecto", "aspecto.tif", Continuous, Terrain, "Slope Aspect", "deg", "v2",
            "Slope orientation."),
        LayerSpec::new("curvatura", "curvatura.tif", Continuous, Terrain, "Profile Curvature", "1/m", "v2",
            "Surface concavity/convexity."),
        LayerSpec::new("tpi", "tpi.tif", Continuous, Terrain, "Topographic Position Index", "m", "v2",
            "Relative elevation: ridges (+) vs valleys (-)."),
        LayerSpec::new("twi", "twi.tif", Continuous, Terrain, "Topographic Wetness Index", "ln(a/tan b)", "v2",
            "Soil moisture proxy."),
        LayerSpec::new("pisos_ecologicos", "pisos_ecologicos.tif", Categorical, Ecological,
            "Ecological Zones (Pulgar Vidal)", "", "v2",
            "Altitudinal classification with distinct resources per zone."),
    ]
}

fn default_distance_sources() -> Vec<DistanceSource> {
    let source = |name: &str, inputs: &[&str], output: &str| DistanceSource {
        name: name.to_string(),
        inputs: inputs.iter().map(PathBuf::from).collect(),
        output: output.to_string(),
    };
    vec![
        source("dist_rios", &["rios.shp"], "distancia_rios.tif"),
        source("dist_lagos", &["lagos.shp"], "distancia_lagos.tif"),
        source("dist_qhapaq", &["qhapaqnan.shp"], "distancia_qhapaq_nan.tif"),
        source("dist_declarados", &["sitios_declarados.shp"], "distancia_declarados.tif"),
        source("dist_g1", &["sitios_g1.shp"], "distancia_g1.tif"),
        source("dist_g2", &["sitios_g2.shp"], "distancia_g2.tif"),
        source("dist_g3", &["sitios_g3.shp"], "distancia_g3.tif"),
    ]
}
