use crate::core::alignment::resample_to_grid;
use crate::types::{BoundingBox, GridSpec, PipelineError, PipelineResult, RasterLayer, ResampleMethod};
use ndarray::{s, Zip};

/// Grid covering the union of all tile extents at `pixel_size`
pub fn target_grid(extents: &[BoundingBox], pixel_size: f64, crs: &str) -> PipelineResult<GridSpec> {
    let union = extents
        .iter()
        .copied()
        .reduce(|a, b| a.union(&b))
        .ok_or_else(|| PipelineError::Processing("No tile extents to mosaic".to_string()))?;

    let grid = GridSpec::covering(&union, pixel_size, crs)?;
    log::info!(
        "Mosaic grid: {}x{} pixels at {} m, extent x [{:.1}, {:.1}] y [{:.1}, {:.1}]",
        grid.width,
        grid.height,
        pixel_size,
        union.min_x,
        union.max_x,
        union.min_y,
        union.max_y
    );
    Ok(grid)
}

/// Merge tiles that already sit on `grid`.
///
/// Overlaps resolve first-write-wins in slice order: a cell is taken from the
/// first tile holding a valid value there. Nodata never overwrites.
pub fn merge_aligned(name: &str, tiles: &[RasterLayer], grid: &GridSpec, nodata: f32) -> PipelineResult<RasterLayer> {
    if tiles.is_empty() {
        return Err(PipelineError::Processing("No tiles to merge".to_string()));
    }

    let mut mosaic = RasterLayer::empty(name, grid.clone(), nodata);
    let mut written = 0usize;

    for tile in tiles {
        if let Some(reason) = grid.mismatch(&tile.grid) {
            return Err(PipelineError::Alignment {
                layer: tile.name.clone(),
                reason: format!("tile is not on the mosaic grid: {}", reason),
            });
        }
        written += merge_into(&mut mosaic, tile, 0, 0)?;
    }

    let coverage = written as f64 / grid.cell_count().max(1) as f64 * 100.0;
    log::info!("Merged {} tiles, {:.2}% of mosaic cells hold data", tiles.len(), coverage);
    Ok(mosaic)
}

/// Copy the valid cells of `window` into `mosaic` at (row, col) where the
/// mosaic is still nodata; returns the number of cells written
pub fn merge_into(mosaic: &mut RasterLayer, window: &RasterLayer, row: usize, col: usize) -> PipelineResult<usize> {
    let (h, w) = window.data.dim();
    if row + h > mosaic.grid.height || col + w > mosaic.grid.width {
        return Err(PipelineError::Alignment {
            layer: window.name.clone(),
            reason: format!(
                "{}x{} window at ({}, {}) exceeds the {}x{} mosaic",
                w, h, row, col, mosaic.grid.width, mosaic.grid.height
            ),
        });
    }

    let mut written = 0;
    let nodata = mosaic.nodata;
    let mut target = mosaic.data.slice_mut(s![row..row + h, col..col + w]);
    Zip::from(&mut target).and(&window.data).for_each(|dst, &src| {
        if window.is_valid(src) && (*dst == nodata || !dst.is_finite()) {
            *dst = src;
            written += 1;
        }
    });
    Ok(written)
}

/// Mosaics tiles that are already expressed in the project CRS
#[derive(Debug, Clone)]
pub struct TileMosaicker {
    crs: String,
    pixel_size: f64,
    nodata: f32,
    method: ResampleMethod,
}

impl TileMosaicker {
    pub fn new(crs: impl Into<String>, pixel_size: f64, nodata: f32) -> Self {
        Self {
            crs: crs.into(),
            pixel_size,
            nodata,
            method: ResampleMethod::Bilinear,
        }
    }

    pub fn with_method(mut self, method: ResampleMethod) -> Self {
        self.method = method;
        self
    }

    /// Resample every tile onto the union grid and merge first-write-wins.
    /// Tiles are taken in the order given.
    pub fn mosaic(&self, name: &str, tiles: &[RasterLayer]) -> PipelineResult<RasterLayer> {
        log::info!("Creating mosaic '{}' from {} tiles", name, tiles.len());

        for tile in tiles {
            if tile.grid.crs != self.crs {
                return Err(PipelineError::Alignment {
                    layer: tile.name.clone(),
                    reason: format!("tile CRS is not the project CRS {}", self.crs),
                });
            }
        }

        let extents: Vec<BoundingBox> = tiles.iter().map(|t| t.grid.extent()).collect();
        let grid = target_grid(&extents, self.pixel_size, &self.crs)?;

        let mut on_grid = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let mut resampled = resample_to_grid(tile, &grid, self.method)?;
            if resampled.nodata != self.nodata {
                let src_nodata = resampled.nodata;
                resampled.data.mapv_inplace(|v| if v == src_nodata || !v.is_finite() { self.nodata } else { v });
                resampled.nodata = self.nodata;
            }
            on_grid.push(resampled);
        }

        merge_aligned(name, &on_grid, &grid, self.nodata)
    }
}
