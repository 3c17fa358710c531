//! Euclidean distance rasters from vector features.
//!
//! Features are burned onto the reference grid and an exact separable
//! squared-distance transform (Felzenszwalb & Huttenlocher) gives, for every
//! cell centre, the planar distance in CRS units to the nearest burned cell.

use crate::types::{Cell, Coord, Geometry, GridSpec, PipelineError, PipelineResult, RasterLayer, VectorLayer};
use ndarray::{Array2, ArrayViewMut1, Axis};

#[cfg(feature = "parallel")]
use ndarray::parallel::prelude::*;

/// Burns geometries into a boolean mask on a north-up grid
#[derive(Debug, Clone)]
pub struct Rasterizer {
    grid: GridSpec,
    /// Line sampling step in CRS units
    step: f64,
}

impl Rasterizer {
    pub fn new(grid: &GridSpec) -> PipelineResult<Self> {
        if !grid.transform.is_north_up() {
            return Err(PipelineError::Processing(
                "Rasterization requires a north-up grid".to_string(),
            ));
        }
        let (dx, dy) = grid.transform.pixel_size();
        Ok(Self {
            grid: grid.clone(),
            step: dx.min(dy) / 4.0,
        })
    }

    /// Mask with every cell touched by any of the geometries
    pub fn rasterize(&self, geometries: &[Geometry]) -> Array2<bool> {
        let mut mask = Array2::from_elem(self.grid.shape(), false);
        for geometry in geometries {
            self.burn(geometry, &mut mask);
        }
        mask
    }

    /// Burn one geometry into `mask`
    pub fn burn(&self, geometry: &Geometry, mask: &mut Array2<bool>) {
        match geometry {
            Geometry::Point(c) => self.burn_coord(c, mask),
            Geometry::LineString(coords) => self.burn_path(coords, false, mask),
            Geometry::Polygon { exterior, interiors } => {
                self.fill_polygon(exterior, interiors, mask);
                self.burn_path(exterior, true, mask);
                for ring in interiors {
                    self.burn_path(ring, true, mask);
                }
            }
        }
    }

    fn burn_coord(&self, c: &Coord, mask: &mut Array2<bool>) {
        if let Some((row, col)) = self.grid.cell_of(c) {
            mask[[row, col]] = true;
        }
    }

    fn burn_path(&self, coords: &[Coord], closed: bool, mask: &mut Array2<bool>) {
        match coords.len() {
            0 => return,
            1 => return self.burn_coord(&coords[0], mask),
            _ => {}
        }

        let mut segments: Vec<(Coord, Coord)> = coords.windows(2).map(|w| (w[0], w[1])).collect();
        if closed {
            segments.push((coords[coords.len() - 1], coords[0]));
        }

        for (a, b) in segments {
            let steps = (a.distance(&b) / self.step).ceil().max(1.0) as usize;
            for i in 0..=steps {
                let t = i as f64 / steps as f64;
                let p = Coord::new(a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t);
                self.burn_coord(&p, mask);
            }
        }
    }

    /// Even-odd scanline fill over cell centres
    fn fill_polygon(&self, exterior: &[Coord], interiors: &[Vec<Coord>], mask: &mut Array2<bool>) {
        let bbox = match crate::types::BoundingBox::from_coords(exterior) {
            Some(b) => b,
            None => return,
        };
        let gt = &self.grid.transform;
        let rings: Vec<&[Coord]> = std::iter::once(exterior)
            .chain(interiors.iter().map(|r| r.as_slice()))
            .collect();

        let mut crossings = Vec::new();
        for row in 0..self.grid.height {
            let y = gt.top_left_y + (row as f64 + 0.5) * gt.pixel_height;
            if y < bbox.min_y || y > bbox.max_y {
                continue;
            }

            crossings.clear();
            for ring in &rings {
                let n = ring.len();
                for i in 0..n {
                    let a = ring[i];
                    let b = ring[(i + 1) % n];
                    if (a.y > y) != (b.y > y) {
                        crossings.push(a.x + (y - a.y) / (b.y - a.y) * (b.x - a.x));
                    }
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));

            for span in crossings.chunks_exact(2) {
                let first = ((span[0] - gt.top_left_x) / gt.pixel_width - 0.5).ceil();
                let last = ((span[1] - gt.top_left_x) / gt.pixel_width - 0.5).ceil();
                let first = first.clamp(0.0, self.grid.width as f64) as usize;
                let last = last.clamp(0.0, self.grid.width as f64) as usize;
                for col in first..last {
                    mask[[row, col]] = true;
                }
            }
        }
    }
}

/// Exact Euclidean distance from every cell centre to the nearest `true`
/// cell, with pixel sizes `dx` (columns) and `dy` (rows).
///
/// Cells are infinite when the mask is empty.
pub fn euclidean_distance(mask: &Array2<bool>, dx: f64, dy: f64) -> Array2<f64> {
    let mut sq = mask.mapv(|burned| if burned { 0.0 } else { f64::INFINITY });
    // columns first (row spacing), then rows (column spacing)
    transform_lanes(&mut sq, Axis(1), dy);
    transform_lanes(&mut sq, Axis(0), dx);
    sq.mapv_inplace(f64::sqrt);
    sq
}

fn transform_lanes(grid: &mut Array2<f64>, axis: Axis, spacing: f64) {
    let run = |mut lane: ArrayViewMut1<f64>| {
        let f = lane.to_vec();
        let d = squared_distance_1d(&f, spacing);
        lane.iter_mut().zip(d).for_each(|(v, d)| *v = d);
    };

    #[cfg(feature = "parallel")]
    grid.axis_iter_mut(axis).into_par_iter().for_each(run);

    #[cfg(not(feature = "parallel"))]
    grid.axis_iter_mut(axis).for_each(run);
}

/// 1D lower envelope of parabolas `((i - q) * spacing)^2 + f[q]`
fn squared_distance_1d(f: &[f64], spacing: f64) -> Vec<f64> {
    let n = f.len();
    let sites: Vec<usize> = (0..n).filter(|&q| f[q].is_finite()).collect();
    if sites.is_empty() {
        return vec![f64::INFINITY; n];
    }

    let pos = |q: usize| q as f64 * spacing;
    let intersect = |p: usize, q: usize| {
        ((f[q] + pos(q) * pos(q)) - (f[p] + pos(p) * pos(p))) / (2.0 * (pos(q) - pos(p)))
    };

    let mut hull: Vec<usize> = Vec::with_capacity(sites.len());
    let mut bounds: Vec<f64> = Vec::with_capacity(sites.len() + 1);
    hull.push(sites[0]);
    bounds.push(f64::NEG_INFINITY);
    bounds.push(f64::INFINITY);

    for &q in &sites[1..] {
        let mut s = intersect(hull[hull.len() - 1], q);
        while hull.len() > 1 && s <= bounds[hull.len() - 1] {
            hull.pop();
            bounds.pop();
            s = intersect(hull[hull.len() - 1], q);
        }
        hull.push(q);
        let k = hull.len() - 1;
        bounds[k] = s;
        bounds.push(f64::INFINITY);
    }

    let mut out = vec![0.0; n];
    let mut k = 0;
    for (i, d) in out.iter_mut().enumerate() {
        let x = pos(i);
        while bounds[k + 1] < x {
            k += 1;
        }
        let diff = x - pos(hull[k]);
        *d = diff * diff + f[hull[k]];
    }
    out
}

/// Builds distance rasters on a reference grid
#[derive(Debug, Clone)]
pub struct DistanceRasterBuilder {
    grid: GridSpec,
    nodata: Cell,
}

impl DistanceRasterBuilder {
    pub fn new(grid: GridSpec, nodata: Cell) -> Self {
        Self { grid, nodata }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Distance to the nearest feature of any source layer.
    ///
    /// Sources must already be in the grid CRS. Cells where `valid_mask` is
    /// nodata are written as nodata.
    pub fn build(
        &self,
        name: &str,
        sources: &[VectorLayer],
        valid_mask: Option<&RasterLayer>,
    ) -> PipelineResult<RasterLayer> {
        log::info!("Computing distance raster '{}' from {} source(s)", name, sources.len());

        for source in sources {
            if source.crs != self.grid.crs {
                return Err(PipelineError::Alignment {
                    layer: source.name.clone(),
                    reason: format!("vector CRS differs from grid CRS {}; reproject first", self.grid.crs),
                });
            }
        }
        if let Some(mask) = valid_mask {
            if let Some(reason) = self.grid.mismatch(&mask.grid) {
                return Err(PipelineError::Alignment {
                    layer: mask.name.clone(),
                    reason,
                });
            }
        }

        let rasterizer = Rasterizer::new(&self.grid)?;
        let mut burned = Array2::from_elem(self.grid.shape(), false);
        let mut n_features = 0usize;
        for source in sources {
            for geometry in &source.geometries {
                rasterizer.burn(geometry, &mut burned);
                n_features += 1;
            }
        }

        let n_burned = burned.iter().filter(|&&b| b).count();
        log::debug!("Burned {} cells from {} features", n_burned, n_features);
        if n_burned == 0 {
            return Err(PipelineError::Processing(format!(
                "No features of '{}' fall on the {}x{} grid",
                name, self.grid.width, self.grid.height
            )));
        }

        let (dx, dy) = self.grid.transform.pixel_size();
        let distance = euclidean_distance(&burned, dx, dy);

        let mut data = distance.mapv(|d| d as Cell);
        if let Some(mask) = valid_mask {
            ndarray::Zip::from(&mut data).and(&mask.data).for_each(|d, &m| {
                if !mask.is_valid(m) {
                    *d = self.nodata;
                }
            });
        }

        let layer = RasterLayer::new(name, data, self.grid.clone(), self.nodata)?;
        if let Some((lo, hi)) = layer.min_max() {
            log::info!("'{}' distance range: {:.1} - {:.1} m", name, lo, hi);
        }
        Ok(layer)
    }
}
