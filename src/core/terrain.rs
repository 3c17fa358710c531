use crate::core::map_cells;
use crate::types::{Cell, PipelineError, PipelineResult, RasterLayer};
use std::f64::consts::PI;

/// Terrain derivative products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivativeKind {
    /// Slope in degrees
    Slope,
    /// Terrain Ruggedness Index (Riley)
    Roughness,
    /// Elevation copy
    Altitude,
    /// Downslope azimuth in degrees, north = 0
    Aspect,
    /// Laplacian of elevation (1/m)
    Curvature,
    /// Topographic Position Index
    Tpi,
    /// Topographic Wetness Index
    Twi,
    /// Pulgar Vidal altitudinal zones
    EcologicalZones,
}

impl DerivativeKind {
    pub const ALL: [DerivativeKind; 8] = [
        DerivativeKind::Slope,
        DerivativeKind::Roughness,
        DerivativeKind::Altitude,
        DerivativeKind::EcologicalZones,
        DerivativeKind::Aspect,
        DerivativeKind::Curvature,
        DerivativeKind::Tpi,
        DerivativeKind::Twi,
    ];

    /// Registry layer name
    pub fn layer_name(self) -> &'static str {
        match self {
            DerivativeKind::Slope => "pendiente",
            DerivativeKind::Roughness => "rugosidad",
            DerivativeKind::Altitude => "altitud",
            DerivativeKind::Aspect => "aspecto",
            DerivativeKind::Curvature => "curvatura",
            DerivativeKind::Tpi => "tpi",
            DerivativeKind::Twi => "twi",
            DerivativeKind::EcologicalZones => "pisos_ecologicos",
        }
    }

    pub fn filename(self) -> String {
        format!("{}.tif", self.layer_name())
    }
}

/// Terrain analysis parameters
#[derive(Debug, Clone)]
pub struct TerrainParams {
    /// TPI annulus radius in pixels
    pub tpi_radius: usize,
    /// Slope floor (degrees) used by TWI to keep tan(beta) positive
    pub twi_min_slope_deg: f64,
    /// Altitudinal zones as (lower bound inclusive, upper bound exclusive, code)
    pub zones: Vec<(f64, f64, u8)>,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            tpi_radius: 10,          // 300 m at 30 m resolution
            twi_min_slope_deg: 0.1,
            zones: vec![
                (0.0, 500.0, 1),          // Chala (Costa)
                (500.0, 2300.0, 2),       // Yunga
                (2300.0, 3500.0, 3),      // Quechua
                (3500.0, 4000.0, 4),      // Suni (Jalca)
                (4000.0, 4800.0, 5),      // Puna
                (4800.0, f64::INFINITY, 6), // Janca (Cordillera)
            ],
        }
    }
}

/// Computes DEM derivatives on the elevation grid.
///
/// Neighbourhood operators mark a cell nodata when the cell, or any cell of
/// its window, is nodata. 3x3 operators also mark the outer ring nodata.
pub struct TerrainAnalyzer {
    params: TerrainParams,
}

impl TerrainAnalyzer {
    pub fn new() -> Self {
        Self {
            params: TerrainParams::default(),
        }
    }

    pub fn with_params(params: TerrainParams) -> Self {
        Self { params }
    }

    /// Compute one derivative
    pub fn compute(&self, dem: &RasterLayer, kind: DerivativeKind) -> PipelineResult<RasterLayer> {
        log::info!("Computing: {}", kind.layer_name());
        let data = match kind {
            DerivativeKind::Slope => self.slope(dem)?,
            DerivativeKind::Roughness => self.roughness(dem)?,
            DerivativeKind::Altitude => dem.data.clone(),
            DerivativeKind::Aspect => self.aspect(dem)?,
            DerivativeKind::Curvature => self.curvature(dem)?,
            DerivativeKind::Tpi => self.tpi(dem)?,
            DerivativeKind::Twi => self.twi(dem)?,
            DerivativeKind::EcologicalZones => self.ecological_zones(dem),
        };
        RasterLayer::new(kind.layer_name(), data, dem.grid.clone(), dem.nodata)
    }

    /// Compute every derivative in registry order
    pub fn compute_all(&self, dem: &RasterLayer) -> PipelineResult<Vec<RasterLayer>> {
        DerivativeKind::ALL.iter().map(|&kind| self.compute(dem, kind)).collect()
    }

    /// Slope in degrees using Horn's weighted gradient
    pub fn slope(&self, dem: &RasterLayer) -> PipelineResult<ndarray::Array2<Cell>> {
        let (dx, dy) = cell_size(dem)?;
        Ok(map_cells(dem.data.dim(), dem.nodata, |row, col| {
            match window3(dem, row, col) {
                Some(w) => {
                    let (p, q) = horn_gradient(&w, dx, dy);
                    ((p * p + q * q).sqrt().atan() * 180.0 / PI) as Cell
                }
                None => dem.nodata,
            }
        }))
    }

    /// Terrain Ruggedness Index, Riley et al. (1999): sqrt of the summed
    /// squared differences between the centre and its 8 neighbours
    pub fn roughness(&self, dem: &RasterLayer) -> PipelineResult<ndarray::Array2<Cell>> {
        Ok(map_cells(dem.data.dim(), dem.nodata, |row, col| match window3(dem, row, col) {
            Some(w) => {
                let centre = w[4];
                let sum: f64 = w.iter().map(|z| (z - centre).powi(2)).sum();
                sum.sqrt() as Cell
            }
            None => dem.nodata,
        }))
    }

    /// Downslope azimuth in degrees (0 = north, clockwise); flat cells are 0
    pub fn aspect(&self, dem: &RasterLayer) -> PipelineResult<ndarray::Array2<Cell>> {
        Ok(map_cells(dem.data.dim(), dem.nodata, |row, col| match window3(dem, row, col) {
            Some(w) => {
                let dzdx = (w[2] + 2.0 * w[5] + w[8]) - (w[0] + 2.0 * w[3] + w[6]);
                // rows grow southwards
                let dzdy = (w[6] + 2.0 * w[7] + w[8]) - (w[0] + 2.0 * w[1] + w[2]);
                if dzdx == 0.0 && dzdy == 0.0 {
                    return 0.0;
                }
                let angle = dzdy.atan2(-dzdx) * 180.0 / PI;
                let mut azimuth = if angle > 90.0 { 450.0 - angle } else { 90.0 - angle };
                if azimuth >= 360.0 {
                    azimuth -= 360.0;
                }
                azimuth as Cell
            }
            None => dem.nodata,
        }))
    }

    /// 4-neighbour Laplacian divided by the squared cell size; the raster
    /// border replicates the nearest cell
    pub fn curvature(&self, dem: &RasterLayer) -> PipelineResult<ndarray::Array2<Cell>> {
        let (dx, dy) = cell_size(dem)?;
        let cell2 = dx * dy;
        Ok(map_cells(dem.data.dim(), dem.nodata, |row, col| {
            let centre = match valid(dem, row as isize, col as isize) {
                Some(z) => z,
                None => return dem.nodata,
            };
            let mut sum = 0.0;
            for (dr, dc) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                match valid(dem, row as isize + dr, col as isize + dc) {
                    Some(z) => sum += z,
                    None => return dem.nodata,
                }
            }
            ((sum - 4.0 * centre) / cell2) as Cell
        }))
    }

    /// Elevation minus the mean over the annulus 0 < d <= radius (pixels);
    /// the raster border replicates the nearest cell
    pub fn tpi(&self, dem: &RasterLayer) -> PipelineResult<ndarray::Array2<Cell>> {
        let radius = self.params.tpi_radius as isize;
        if radius == 0 {
            return Err(PipelineError::Config("TPI radius must be at least 1 pixel".to_string()));
        }
        log::debug!("TPI radius: {} px", radius);

        let mut offsets = Vec::new();
        for dr in -radius..=radius {
            for dc in -radius..=radius {
                let d2 = dr * dr + dc * dc;
                if d2 > 0 && d2 <= radius * radius {
                    offsets.push((dr, dc));
                }
            }
        }
        let n = offsets.len() as f64;

        Ok(map_cells(dem.data.dim(), dem.nodata, |row, col| {
            let centre = match valid(dem, row as isize, col as isize) {
                Some(z) => z,
                None => return dem.nodata,
            };
            let mut sum = 0.0;
            for &(dr, dc) in &offsets {
                match valid(dem, row as isize + dr, col as isize + dc) {
                    Some(z) => sum += z,
                    None => return dem.nodata,
                }
            }
            (centre - sum / n) as Cell
        }))
    }

    /// ln(a / tan(beta)) with a uniform contributing area a = cell size
    pub fn twi(&self, dem: &RasterLayer) -> PipelineResult<ndarray::Array2<Cell>> {
        let (dx, dy) = cell_size(dem)?;
        let sca = (dx + dy) / 2.0;
        let min_slope = self.params.twi_min_slope_deg.to_radians();
        let slope = self.slope(dem)?;
        let nodata = dem.nodata;

        Ok(slope.mapv(|s| {
            if s == nodata || !s.is_finite() {
                return nodata;
            }
            let beta = (s as f64).to_radians().max(min_slope);
            let twi = (sca / beta.tan()).ln();
            if twi.is_finite() {
                twi as Cell
            } else {
                nodata
            }
        }))
    }

    /// Reclassify elevation into altitudinal zones; unmatched cells are nodata
    pub fn ecological_zones(&self, dem: &RasterLayer) -> ndarray::Array2<Cell> {
        let zones = &self.params.zones;
        dem.data.mapv(|z| {
            if !dem.is_valid(z) {
                return dem.nodata;
            }
            let z = z as f64;
            zones
                .iter()
                .find(|(lo, hi, _)| z >= *lo && z < *hi)
                .map(|(_, _, code)| *code as Cell)
                .unwrap_or(dem.nodata)
        })
    }
}

impl Default for TerrainAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn cell_size(dem: &RasterLayer) -> PipelineResult<(f64, f64)> {
    let (dx, dy) = dem.grid.transform.pixel_size();
    if !(dx > 0.0 && dy > 0.0) {
        return Err(PipelineError::Processing(format!(
            "Layer '{}' has a degenerate pixel size ({}, {})",
            dem.name, dx, dy
        )));
    }
    Ok((dx, dy))
}

/// Value at (row, col) clamped to the raster, `None` if nodata
fn valid(dem: &RasterLayer, row: isize, col: isize) -> Option<f64> {
    let (height, width) = dem.data.dim();
    let r = row.clamp(0, height as isize - 1) as usize;
    let c = col.clamp(0, width as isize - 1) as usize;
    let v = dem.data[[r, c]];
    if dem.is_valid(v) {
        Some(v as f64)
    } else {
        None
    }
}

/// 3x3 window in row-major order (NW, N, NE, W, C, E, SW, S, SE).
/// `None` on the raster border or when any cell is nodata.
fn window3(dem: &RasterLayer, row: usize, col: usize) -> Option<[f64; 9]> {
    let (height, width) = dem.data.dim();
    if row == 0 || col == 0 || row + 1 >= height || col + 1 >= width {
        return None;
    }
    let mut w = [0.0f64; 9];
    let mut k = 0;
    for r in row - 1..=row + 1 {
        for c in col - 1..=col + 1 {
            let v = dem.data[[r, c]];
            if !dem.is_valid(v) {
                return None;
            }
            w[k] = v as f64;
            k += 1;
        }
    }
    Some(w)
}

/// Horn (1981) gradient (dz/dx, dz/dy); y is measured southwards
fn horn_gradient(w: &[f64; 9], dx: f64, dy: f64) -> (f64, f64) {
    let p = ((w[2] + 2.0 * w[5] + w[8]) - (w[0] + 2.0 * w[3] + w[6])) / (8.0 * dx);
    let q = ((w[6] + 2.0 * w[7] + w[8]) - (w[0] + 2.0 * w[1] + w[2])) / (8.0 * dy);
    (p, q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, GridSpec, NODATA};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn dem_from<F: Fn(usize, usize) -> f32>(n: usize, f: F) -> RasterLayer {
        let grid = GridSpec::new(GeoTransform::north_up(0.0, n as f64 * 30.0, 30.0, 30.0), "ESRI:102033", n, n);
        let data = Array2::from_shape_fn((n, n), |(r, c)| f(r, c));
        RasterLayer::new("dem", data, grid, NODATA).unwrap()
    }

    #[test]
    fn test_slope_of_tilted_plane() {
        // rises 30 m per 30 m cell eastwards → 45°
        let dem = dem_from(5, |_, c| c as f32 * 30.0);
        let analyzer = TerrainAnalyzer::new();
        let slope = analyzer.slope(&dem).unwrap();
        assert_relative_eq!(slope[[2, 2]], 45.0, epsilon = 1e-4);
        assert_eq!(slope[[0, 2]], NODATA);
        assert_eq!(slope[[2, 4]], NODATA);
    }

    #[test]
    fn test_aspect_points_downslope() {
        let analyzer = TerrainAnalyzer::new();
        let east_up = dem_from(3, |_, c| c as f32 * 10.0);
        assert_relative_eq!(analyzer.aspect(&east_up).unwrap()[[1, 1]], 270.0, epsilon = 1e-4);

        // row 0 is north; elevation grows southwards → faces north
        let south_up = dem_from(3, |r, _| r as f32 * 10.0);
        assert_relative_eq!(analyzer.aspect(&south_up).unwrap()[[1, 1]], 0.0, epsilon = 1e-4);

        let flat = dem_from(3, |_, _| 100.0);
        assert_eq!(analyzer.aspect(&flat).unwrap()[[1, 1]], 0.0);
    }

    #[test]
    fn test_roughness_of_single_peak() {
        let dem = dem_from(3, |r, c| if r == 1 && c == 1 { 3.0 } else { 0.0 });
        let tri = TerrainAnalyzer::new().roughness(&dem).unwrap();
        assert_relative_eq!(tri[[1, 1]], (8.0f32 * 9.0).sqrt(), epsilon = 1e-5);
    }

    #[test]
    fn test_nodata_spreads_through_window() {
        let mut dem = dem_from(6, |r, c| (r + c) as f32);
        dem.data[[2, 2]] = NODATA;
        let analyzer = TerrainAnalyzer::new();
        let slope = analyzer.slope(&dem).unwrap();
        assert_eq!(slope[[1, 1]], NODATA);
        assert_eq!(slope[[3, 3]], NODATA);
        assert_ne!(slope[[4, 4]], NODATA);
        let curv = analyzer.curvature(&dem).unwrap();
        assert_eq!(curv[[2, 3]], NODATA);
        assert_ne!(curv[[4, 4]], NODATA);
    }

    #[test]
    fn test_curvature_of_bowl_is_positive() {
        let dem = dem_from(5, |r, c| ((r as f32 - 2.0).powi(2) + (c as f32 - 2.0).powi(2)) * 9.0);
        let curv = TerrainAnalyzer::new().curvature(&dem).unwrap();
        // Laplacian of 9(x² + y²) in pixel units is 36, divided by 900 m²
        assert_relative_eq!(curv[[2, 2]], 36.0 / 900.0, epsilon = 1e-6);
    }

    #[test]
    fn test_tpi_flags_peak_and_valley() {
        let params = TerrainParams { tpi_radius: 1, ..TerrainParams::default() };
        let analyzer = TerrainAnalyzer::with_params(params);
        let peak = dem_from(3, |r, c| if r == 1 && c == 1 { 8.0 } else { 0.0 });
        assert_relative_eq!(analyzer.tpi(&peak).unwrap()[[1, 1]], 8.0);
        let valley = dem_from(3, |r, c| if r == 1 && c == 1 { 0.0 } else { 4.0 });
        assert_relative_eq!(analyzer.tpi(&valley).unwrap()[[1, 1]], -4.0);
    }

    #[test]
    fn test_twi_uses_slope_floor_on_flats() {
        let dem = dem_from(3, |_, _| 10.0);
        let twi = TerrainAnalyzer::new().twi(&dem).unwrap();
        let expected = (30.0f64 / 0.1f64.to_radians().tan()).ln() as f32;
        assert_relative_eq!(twi[[1, 1]], expected, epsilon = 1e-4);
        assert_eq!(twi[[0, 0]], NODATA);
    }

    #[test]
    fn test_ecological_zones_bounds() {
        let values = [-5.0, 0.0, 499.9, 500.0, 2300.0, 3600.0, 4100.0, 6000.0, NODATA];
        let grid = GridSpec::new(GeoTransform::north_up(0.0, 30.0, 30.0, 30.0), "ESRI:102033", 9, 1);
        let dem = RasterLayer::new("dem", Array2::from_shape_vec((1, 9), values.to_vec()).unwrap(), grid, NODATA).unwrap();
        let zones = TerrainAnalyzer::new().ecological_zones(&dem);
        assert_eq!(
            zones.row(0).to_vec(),
            vec![NODATA, 1.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, NODATA]
        );
    }

    #[test]
    fn test_compute_all_shares_dem_grid() {
        let dem = dem_from(12, |r, c| (r * 3 + c * 2) as f32);
        let layers = TerrainAnalyzer::new().compute_all(&dem).unwrap();
        assert_eq!(layers.len(), 8);
        assert!(crate::core::ensure_aligned(&layers).is_ok());
        assert_eq!(layers[0].name, "pendiente");
    }
}
