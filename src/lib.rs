//! huaca: terrain derivatives, grid alignment and presence/absence sampling
//! for archaeological site prediction.
//!
//! The pipeline assembles an elevation mosaic from raw tiles, derives terrain
//! and distance predictors on that mosaic's grid, checks that every predictor
//! is cell-for-cell aligned, then samples and trains a binary classifier.

pub mod types;
pub mod config;
pub mod io;
pub mod core;
#[cfg(feature = "raster-io")]
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, Cell, Coord, GeoTransform, Geometry, GridSpec, Label, PipelineError, PipelineResult, RasterLayer,
    ResampleMethod, SampleRecord, VarGroup, VarType, VectorLayer, NODATA,
};
pub use config::{LayerSpec, ModelKind, ModelParams, PipelineConfig, SamplingParams};
pub use crate::core::{ensure_aligned, LayerStack, Sampler, TerrainAnalyzer, TrainedModel, Trainer, TrainingTable};
pub use io::TileExtractor;
#[cfg(feature = "raster-io")]
pub use io::{RasterIo, TileAssembler};
#[cfg(feature = "raster-io")]
pub use pipeline::Pipeline;

#[cfg(feature = "python")]
mod python {
    use crate::core::{euclidean_distance, TerrainAnalyzer};
    use crate::types::{GeoTransform, GridSpec, PipelineError, RasterLayer};
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    fn to_py_err(e: PipelineError) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    fn dem_layer(dem: PyReadonlyArray2<f32>, pixel_size: f64, nodata: f32) -> PyResult<RasterLayer> {
        let data = dem.as_array().to_owned();
        let (height, width) = data.dim();
        let grid = GridSpec::new(GeoTransform::north_up(0.0, 0.0, pixel_size, pixel_size), "", width, height);
        RasterLayer::new("dem", data, grid, nodata).map_err(to_py_err)
    }

    fn grid_from_py(transform: Vec<f64>, crs: String, width: usize, height: usize) -> PyResult<GridSpec> {
        if transform.len() != 6 {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                "Geotransform must have 6 coefficients, got {}",
                transform.len()
            )));
        }
        let mut gt = [0.0; 6];
        gt.copy_from_slice(&transform);
        Ok(GridSpec::new(GeoTransform::from_gdal(gt), crs, width, height))
    }

    /// Slope in degrees of a north-up DEM array
    #[pyfunction]
    #[pyo3(signature = (dem, pixel_size, nodata = crate::types::NODATA))]
    fn slope<'py>(
        py: Python<'py>,
        dem: PyReadonlyArray2<f32>,
        pixel_size: f64,
        nodata: f32,
    ) -> PyResult<&'py PyArray2<f32>> {
        let layer = dem_layer(dem, pixel_size, nodata)?;
        let out = TerrainAnalyzer::new().slope(&layer).map_err(to_py_err)?;
        Ok(out.into_pyarray(py))
    }

    /// Terrain ruggedness index of a DEM array
    #[pyfunction]
    #[pyo3(signature = (dem, pixel_size, nodata = crate::types::NODATA))]
    fn roughness<'py>(
        py: Python<'py>,
        dem: PyReadonlyArray2<f32>,
        pixel_size: f64,
        nodata: f32,
    ) -> PyResult<&'py PyArray2<f32>> {
        let layer = dem_layer(dem, pixel_size, nodata)?;
        let out = TerrainAnalyzer::new().roughness(&layer).map_err(to_py_err)?;
        Ok(out.into_pyarray(py))
    }

    /// Euclidean distance to the nearest `True` cell
    #[pyfunction]
    fn distance_transform<'py>(
        py: Python<'py>,
        mask: PyReadonlyArray2<bool>,
        dx: f64,
        dy: f64,
    ) -> PyResult<&'py PyArray2<f64>> {
        let mask = mask.as_array().to_owned();
        Ok(euclidean_distance(&mask, dx, dy).into_pyarray(py))
    }

    /// Reason two grids differ, or None when they are aligned
    #[pyfunction]
    fn grid_mismatch(
        a: (Vec<f64>, String, usize, usize),
        b: (Vec<f64>, String, usize, usize),
    ) -> PyResult<Option<String>> {
        let a = grid_from_py(a.0, a.1, a.2, a.3)?;
        let b = grid_from_py(b.0, b.1, b.2, b.3)?;
        Ok(a.mismatch(&b))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(slope, m)?)?;
        m.add_function(wrap_pyfunction!(roughness, m)?)?;
        m.add_function(wrap_pyfunction!(distance_transform, m)?)?;
        m.add_function(wrap_pyfunction!(grid_mismatch, m)?)?;
        Ok(())
    }
}
