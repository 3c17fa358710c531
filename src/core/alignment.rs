use crate::core::map_cells;
use crate::types::{Cell, Coord, GridSpec, PipelineError, PipelineResult, RasterLayer, ResampleMethod};
use std::collections::HashSet;

/// Check that every layer sits on exactly the same pixel grid as the first.
///
/// Transform coefficients, CRS and dimensions must be bit-identical; this is
/// the only gate through which a [`LayerStack`] is built.
pub fn ensure_aligned(layers: &[RasterLayer]) -> PipelineResult<()> {
    let reference = match layers.first() {
        Some(first) => first,
        None => return Ok(()),
    };

    for layer in &layers[1..] {
        if let Some(reason) = reference.grid.mismatch(&layer.grid) {
            log::error!("Layer '{}' is not aligned with '{}': {}", layer.name, reference.name, reason);
            return Err(PipelineError::Alignment {
                layer: layer.name.clone(),
                reason: format!("{} (reference '{}')", reason, reference.name),
            });
        }
    }

    log::debug!("{} layers share grid {}x{}", layers.len(), reference.grid.width, reference.grid.height);
    Ok(())
}

/// Resample a layer onto `target` (same CRS).
///
/// Every destination cell centre is looked up in the source: outside the
/// source, or on a nodata source cell, the result is nodata. Bilinear
/// weights are renormalised over the valid neighbours.
pub fn resample_to_grid(layer: &RasterLayer, target: &GridSpec, method: ResampleMethod) -> PipelineResult<RasterLayer> {
    if layer.grid.crs != target.crs {
        return Err(PipelineError::Alignment {
            layer: layer.name.clone(),
            reason: "source CRS differs from target grid; reproject before resampling".to_string(),
        });
    }

    if layer.grid.mismatch(target).is_none() {
        return Ok(layer.clone());
    }

    log::debug!(
        "Resampling '{}' ({}x{}) onto {}x{} grid using {:?}",
        layer.name,
        layer.grid.width,
        layer.grid.height,
        target.width,
        target.height,
        method
    );

    let data = map_cells(target.shape(), layer.nodata, |row, col| {
        let centre = target.cell_center(row, col);
        sample(layer, &centre, method).unwrap_or(layer.nodata)
    });

    RasterLayer::new(layer.name.clone(), data, target.clone(), layer.nodata)
}

/// Sample a layer at a map coordinate
pub fn sample(layer: &RasterLayer, at: &Coord, method: ResampleMethod) -> Option<Cell> {
    let (col, row) = layer.grid.transform.world_to_pixel(at)?;
    let (width, height) = (layer.grid.width, layer.grid.height);
    if !(col >= 0.0 && row >= 0.0 && col < width as f64 && row < height as f64) {
        return None;
    }

    let nearest = layer.data[[row.floor() as usize, col.floor() as usize]];
    if !layer.is_valid(nearest) {
        return None;
    }

    match method {
        ResampleMethod::Nearest => Some(nearest),
        ResampleMethod::Bilinear => {
            // centre-based coordinates, clamped at the raster border
            let u = (col - 0.5).clamp(0.0, (width - 1) as f64);
            let v = (row - 0.5).clamp(0.0, (height - 1) as f64);
            let x1 = u.floor() as usize;
            let y1 = v.floor() as usize;
            let x2 = (x1 + 1).min(width - 1);
            let y2 = (y1 + 1).min(height - 1);
            let dx = u - x1 as f64;
            let dy = v - y1 as f64;

            let taps = [
                (y1, x1, (1.0 - dx) * (1.0 - dy)),
                (y1, x2, dx * (1.0 - dy)),
                (y2, x1, (1.0 - dx) * dy),
                (y2, x2, dx * dy),
            ];

            let mut sum = 0.0;
            let mut weight = 0.0;
            for (r, c, w) in taps {
                let value = layer.data[[r, c]];
                if w > 0.0 && layer.is_valid(value) {
                    sum += value as f64 * w;
                    weight += w;
                }
            }

            if weight > 0.0 {
                Some((sum / weight) as Cell)
            } else {
                Some(nearest)
            }
        }
    }
}

/// Ordered set of layers proven to share one grid
#[derive(Debug, Clone)]
pub struct LayerStack {
    layers: Vec<RasterLayer>,
}

impl LayerStack {
    /// Build a stack; fails on any grid mismatch or duplicate layer name
    pub fn new(layers: Vec<RasterLayer>) -> PipelineResult<Self> {
        if layers.is_empty() {
            return Err(PipelineError::Processing("Layer stack is empty".to_string()));
        }

        let mut names = HashSet::new();
        for layer in &layers {
            if !names.insert(layer.name.as_str()) {
                return Err(PipelineError::Processing(format!("Duplicate layer in stack: {}", layer.name)));
            }
        }

        ensure_aligned(&layers)?;
        log::info!("Layer stack ready: {} layers", layers.len());
        Ok(Self { layers })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.layers[0].grid
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    /// Feature vector of one cell; `None` if any layer is nodata there
    pub fn features_at(&self, row: usize, col: usize) -> Option<Vec<Cell>> {
        let mut values = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let v = layer.data[[row, col]];
            if !layer.is_valid(v) {
                return None;
            }
            values.push(v);
        }
        Some(values)
    }

    /// Feature vector of the cell containing a map coordinate
    pub fn features_at_coord(&self, at: &Coord) -> Option<Vec<Cell>> {
        let (row, col) = self.grid().cell_of(at)?;
        self.features_at(row, col)
    }

    /// Whether every layer holds a valid value at (row, col)
    pub fn is_valid_cell(&self, row: usize, col: usize) -> bool {
        self.layers.iter().all(|l| l.is_valid(l.data[[row, col]]))
    }

    /// Number of cells where every layer holds a valid value
    pub fn valid_count(&self) -> usize {
        let grid = self.grid();
        (0..grid.height)
            .map(|row| (0..grid.width).filter(|&col| self.is_valid_cell(row, col)).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, GeoTransform, NODATA};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn grid(min_x: f64, min_y: f64, size: f64, pixel: f64) -> GridSpec {
        let extent = BoundingBox { min_x, max_x: min_x + size, min_y, max_y: min_y + size };
        GridSpec::covering(&extent, pixel, "ESRI:102033").unwrap()
    }

    fn ramp(name: &str, grid: GridSpec) -> RasterLayer {
        let data = Array2::from_shape_fn(grid.shape(), |(_, c)| c as f32);
        RasterLayer::new(name, data, grid, NODATA).unwrap()
    }

    #[test]
    fn test_ensure_aligned_rejects_shifted_layer() {
        let a = ramp("a", grid(0.0, 0.0, 300.0, 30.0));
        let b = ramp("b", grid(15.0, 0.0, 300.0, 30.0));
        let err = ensure_aligned(&[a.clone(), b]).unwrap_err();
        match err {
            PipelineError::Alignment { layer, reason } => {
                assert_eq!(layer, "b");
                assert!(reason.contains("geotransform"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(LayerStack::new(vec![a]).is_ok());
    }

    #[test]
    fn test_resampled_layers_share_grid_exactly() {
        let reference = grid(0.0, 0.0, 600.0, 30.0);
        let coarse = ramp("coarse", grid(-45.0, -45.0, 700.0, 90.0));
        let aligned = resample_to_grid(&coarse, &reference, ResampleMethod::Bilinear).unwrap();
        let base = ramp("base", reference.clone());

        assert!(reference.mismatch(&aligned.grid).is_none());
        assert_eq!(aligned.grid.transform.to_gdal(), base.grid.transform.to_gdal());
        assert!(LayerStack::new(vec![base, aligned]).is_ok());
    }

    #[test]
    fn test_bilinear_reproduces_linear_ramp() {
        // value = column index on a 10 m grid → x/10 - 0.5 at any centre
        let source = ramp("src", grid(0.0, 0.0, 100.0, 10.0));
        let target = GridSpec::new(GeoTransform::north_up(20.0, 80.0, 5.0, 5.0), "ESRI:102033", 8, 8);
        let out = resample_to_grid(&source, &target, ResampleMethod::Bilinear).unwrap();
        for col in 0..8 {
            let x = target.cell_center(3, col).x;
            assert_relative_eq!(out.data[[3, col]], (x / 10.0 - 0.5) as f32, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_nearest_keeps_categories_and_marks_outside_nodata() {
        let mut source = ramp("zones", grid(0.0, 0.0, 90.0, 30.0));
        source.data[[1, 1]] = 5.0;
        let target = grid(-30.0, -30.0, 150.0, 15.0);
        let out = resample_to_grid(&source, &target, ResampleMethod::Nearest).unwrap();
        assert_eq!(out.data[[0, 0]], NODATA);
        assert!(out.data.iter().all(|&v| v == NODATA || v.fract() == 0.0));
        let inside = out.value_at(&Coord::new(45.0, 45.0)).unwrap();
        assert_eq!(inside, 5.0);
    }

    #[test]
    fn test_different_crs_is_fatal() {
        let source = ramp("src", grid(0.0, 0.0, 90.0, 30.0));
        let mut target = source.grid.clone();
        target.crs = "EPSG:32718".to_string();
        assert!(matches!(
            resample_to_grid(&source, &target, ResampleMethod::Nearest),
            Err(PipelineError::Alignment { .. })
        ));
    }

    #[test]
    fn test_features_skip_nodata_cells() {
        let g = grid(0.0, 0.0, 90.0, 30.0);
        let a = ramp("a", g.clone());
        let mut b = ramp("b", g);
        b.data[[0, 0]] = NODATA;
        let stack = LayerStack::new(vec![a, b]).unwrap();
        assert_eq!(stack.features_at(0, 0), None);
        assert_eq!(stack.features_at(0, 2), Some(vec![2.0, 2.0]));
        assert_eq!(stack.valid_count(), 8);
        assert!(!stack.is_valid_cell(0, 0));
    }
}
