//! Stage orchestration over the configured directories.
//!
//! Every stage reads its inputs from disk and writes its outputs back, so
//! stages can be re-run independently. The elevation raster written by
//! [`Pipeline::assemble`] defines the reference grid for everything after it.

use crate::config::{LayerSpec, PipelineConfig};
use crate::core::{
    ensure_aligned, predict_probability_map, presence_points, DerivativeKind, DistanceRasterBuilder, LayerStack,
    Sampler, TerrainAnalyzer, TerrainParams, TrainedModel, Trainer,
};
use crate::io::dem::TileAssembler;
use crate::io::raster::RasterIo;
use crate::io::table::{read_training_table, write_training_table};
use crate::io::vector::{read_vector, read_vectors};
use crate::types::{GridSpec, PipelineError, PipelineResult, RasterLayer, VarType};
use std::path::{Path, PathBuf};

/// Result of one layer in an alignment check
#[derive(Debug, Clone)]
pub struct LayerCheck {
    pub name: String,
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    raster_io: RasterIo,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let raster_io = RasterIo::new(config.crs.clone(), config.nodata);
        Ok(Self { config, raster_io })
    }

    fn dem(&self) -> PipelineResult<RasterLayer> {
        self.raster_io.read(self.config.dem_path(), "altitud")
    }

    fn reference_grid(&self) -> PipelineResult<GridSpec> {
        self.raster_io.read_grid(self.config.dem_path())
    }

    /// Tile Assembler: raw tiles → `dem.tif`
    pub fn assemble(&self) -> PipelineResult<PathBuf> {
        let output = self.config.dem_path();
        TileAssembler::from_config(&self.config)?.assemble(&output)?;
        Ok(output)
    }

    /// Terrain derivatives of `dem.tif`; existing outputs are kept unless
    /// `force` is set
    pub fn derive(&self, force: bool) -> PipelineResult<Vec<PathBuf>> {
        log::info!("⛰️ Computing DEM derivatives");
        let dem = self.dem()?;
        let analyzer = TerrainAnalyzer::with_params(TerrainParams {
            tpi_radius: self.config.tpi_radius,
            ..TerrainParams::default()
        });

        let mut written = Vec::new();
        for kind in DerivativeKind::ALL {
            let path = self.config.raster_dir.join(kind.filename());
            if path.exists() && !force {
                log::info!("Skipping {} (exists)", path.display());
                continue;
            }
            let layer = analyzer.compute(&dem, kind)?;
            self.raster_io.write(&layer, &path)?;
            written.push(path);
        }
        log::info!("✅ {} derivative rasters written", written.len());
        Ok(written)
    }

    /// Distance rasters for every configured source, masked to the DEM
    pub fn distances(&self, force: bool) -> PipelineResult<Vec<PathBuf>> {
        log::info!("📏 Computing distance rasters");
        let dem = self.dem()?;
        let builder = DistanceRasterBuilder::new(dem.grid.clone(), self.config.nodata);

        let mut written = Vec::new();
        for source in &self.config.distances {
            let path = self.config.raster_dir.join(&source.output);
            if path.exists() && !force {
                log::info!("Skipping {} (exists)", path.display());
                continue;
            }
            let inputs: Vec<PathBuf> = source.inputs.iter().map(|p| self.config.vector_dir.join(p)).collect();
            let vectors = read_vectors(&inputs, &source.name, &self.config.crs)?;
            let layer = builder.build(&source.name, &[vectors], Some(&dem))?;
            self.raster_io.write(&layer, &path)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Where `align` stores a layer: the registry file for a registered
    /// name, `<name>.tif` in the raster directory otherwise
    pub fn aligned_path(&self, name: &str) -> PathBuf {
        match self.config.layer(name) {
            Some(spec) => self.config.layer_path(spec),
            None => self.config.raster_dir.join(format!("{}.tif", name)),
        }
    }

    /// Bring an external raster onto the DEM grid and store it at
    /// [`Pipeline::aligned_path`]
    pub fn align(&self, input: &Path, name: &str, var_type: VarType) -> PipelineResult<PathBuf> {
        let grid = self.reference_grid()?;
        let layer = self
            .raster_io
            .read_aligned(input, name, &grid, var_type.resample_method())?;
        ensure_aligned(&[RasterLayer::empty("reference", grid, self.config.nodata), layer.clone()])?;

        let output = self.aligned_path(name);
        self.raster_io.write(&layer, &output)?;
        Ok(output)
    }

    fn version_layers(&self, version: Option<&str>) -> Vec<&LayerSpec> {
        self.config.layers_where(version, None, None)
    }

    /// Verify every registry layer (of `version`) against the DEM grid.
    /// A missing file or any mismatch is fatal.
    pub fn check(&self, version: Option<&str>) -> PipelineResult<Vec<LayerCheck>> {
        let reference = self.reference_grid()?;
        let mut report = Vec::new();
        for spec in self.version_layers(version) {
            let path = self.config.layer_path(spec);
            let grid = self.raster_io.read_grid(&path)?;
            if let Some(reason) = reference.mismatch(&grid) {
                log::error!("❌ {}: {}", spec.name, reason);
                return Err(PipelineError::Alignment {
                    layer: spec.name.clone(),
                    reason,
                });
            }
            log::info!("✓ {} ({}x{})", spec.name, grid.width, grid.height);
            report.push(LayerCheck {
                name: spec.name.clone(),
                path,
                width: grid.width,
                height: grid.height,
            });
        }
        log::info!("All {} layers aligned with {}", report.len(), self.config.dem_path().display());
        Ok(report)
    }

    /// Load the named registry layers as an aligned stack, in the given order
    pub fn load_stack(&self, names: &[String]) -> PipelineResult<LayerStack> {
        let mut layers = Vec::with_capacity(names.len());
        for name in names {
            let spec = self
                .config
                .layer(name)
                .ok_or_else(|| PipelineError::Config(format!("Unknown layer: {}", name)))?;
            layers.push(self.raster_io.read(self.config.layer_path(spec), &spec.name)?);
        }
        LayerStack::new(layers)
    }

    pub fn training_table_path(&self, version: &str) -> PathBuf {
        self.config.samples_dir.join(format!("training_{}.csv", version))
    }

    /// Presence/absence training table for the layers of `version`
    pub fn sample(&self, presence: &Path, version: Option<&str>) -> PipelineResult<PathBuf> {
        log::info!("🎯 Sampling training data");
        let names = self.config.feature_names(version);
        if names.is_empty() {
            return Err(PipelineError::Config(format!("No layers for version {:?}", version)));
        }
        let stack = self.load_stack(&names)?;

        let sites = read_vector(presence, &self.config.crs)?;
        let points = presence_points(&sites);
        let table = Sampler::new(self.config.sampling.clone()).build_table(&stack, &points)?;

        let output = self.training_table_path(version.unwrap_or("all"));
        write_training_table(&table, &output)?;
        Ok(output)
    }

    /// Fit the configured classifier on a training table and save it
    pub fn train(&self, table: &Path, output: Option<&Path>) -> PipelineResult<PathBuf> {
        log::info!("🧠 Training model");
        let table = read_training_table(table)?;
        let trained = Trainer::new(self.config.model.clone()).train(&table)?;

        let output = match output {
            Some(p) => p.to_path_buf(),
            None => self
                .config
                .models_dir
                .join(format!("{}.json", trained.model.kind().as_str())),
        };
        trained.save(&output)?;
        Ok(output)
    }

    /// Probability raster from a saved model over its feature layers
    pub fn predict(&self, model: &Path, output: &Path) -> PipelineResult<RasterLayer> {
        log::info!("🗺️ Predicting probability map");
        let trained = TrainedModel::load(model)?;
        let stack = self.load_stack(&trained.feature_names)?;
        let map = predict_probability_map(&trained, &stack, self.config.nodata)?;
        self.raster_io.write(&map, output)?;
        Ok(map)
    }
}
