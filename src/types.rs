use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Nodata sentinel shared by every raster written by the pipeline
pub const NODATA: f32 = -9999.0;

/// Raster cell values
pub type Cell = f32;

/// 2D raster grid (rows x cols)
pub type Grid = Array2<Cell>;

/// Planar coordinate in the CRS of the layer that owns it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Coord) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned extent in CRS units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Smallest box containing all the given coordinates
    pub fn from_coords(coords: &[Coord]) -> Option<Self> {
        let first = coords.first()?;
        let mut bbox = BoundingBox {
            min_x: first.x,
            max_x: first.x,
            min_y: first.y,
            max_y: first.y,
        };
        for c in &coords[1..] {
            bbox.min_x = bbox.min_x.min(c.x);
            bbox.max_x = bbox.max_x.max(c.x);
            bbox.min_y = bbox.min_y.min(c.y);
            bbox.max_y = bbox.max_y.max(c.y);
        }
        Some(bbox)
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            max_x: self.max_x.max(other.max_x),
            min_y: self.min_y.min(other.min_y),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, c: &Coord) -> bool {
        c.x >= self.min_x && c.x <= self.max_x && c.y >= self.min_y && c.y <= self.max_y
    }
}

/// Geospatial transformation parameters (GDAL coefficient order)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-or-rectangular pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinate of a fractional pixel position (col, row)
    pub fn pixel_to_world(&self, col: f64, row: f64) -> Coord {
        Coord {
            x: self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            y: self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        }
    }

    /// Fractional pixel position (col, row) of a map coordinate.
    /// Integer parts index the cell; 0.5 is the cell centre.
    pub fn world_to_pixel(&self, c: &Coord) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det == 0.0 {
            return None;
        }
        let dx = c.x - self.top_left_x;
        let dy = c.y - self.top_left_y;
        let col = (self.pixel_height * dx - self.rotation_x * dy) / det;
        let row = (-self.rotation_y * dx + self.pixel_width * dy) / det;
        Some((col, row))
    }

    /// Ground size of one pixel along x and y
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            (self.pixel_width.powi(2) + self.rotation_y.powi(2)).sqrt(),
            (self.pixel_height.powi(2) + self.rotation_x.powi(2)).sqrt(),
        )
    }

    pub fn is_north_up(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0 && self.pixel_height < 0.0
    }
}

/// Pixel grid definition shared by every aligned layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub transform: GeoTransform,
    /// CRS definition (authority code or WKT)
    pub crs: String,
    pub width: usize,
    pub height: usize,
}

impl GridSpec {
    pub fn new(transform: GeoTransform, crs: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            transform,
            crs: crs.into(),
            width,
            height,
        }
    }

    /// North-up grid covering `extent`, anchored at its upper-left corner.
    /// The extent is grown to a whole number of pixels.
    pub fn covering(extent: &BoundingBox, pixel_size: f64, crs: impl Into<String>) -> PipelineResult<Self> {
        if !(pixel_size > 0.0) || !pixel_size.is_finite() {
            return Err(PipelineError::Config(format!("Invalid pixel size: {}", pixel_size)));
        }
        if !(extent.width() > 0.0) || !(extent.height() > 0.0) {
            return Err(PipelineError::Processing(format!("Degenerate extent: {:?}", extent)));
        }

        let width = ((extent.width() / pixel_size) - 1e-9).ceil().max(1.0) as usize;
        let height = ((extent.height() / pixel_size) - 1e-9).ceil().max(1.0) as usize;

        Ok(Self {
            transform: GeoTransform::north_up(extent.min_x, extent.max_y, pixel_size, pixel_size),
            crs: crs.into(),
            width,
            height,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    /// Centre of cell (row, col)
    pub fn cell_center(&self, row: usize, col: usize) -> Coord {
        self.transform.pixel_to_world(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Cell (row, col) containing a map coordinate, if inside the grid
    pub fn cell_of(&self, c: &Coord) -> Option<(usize, usize)> {
        let (col, row) = self.transform.world_to_pixel(c)?;
        if col < 0.0 || row < 0.0 || !col.is_finite() || !row.is_finite() {
            return None;
        }
        let (col, row) = (col.floor() as usize, row.floor() as usize);
        if col < self.width && row < self.height {
            Some((row, col))
        } else {
            None
        }
    }

    /// Map extent of the grid
    pub fn extent(&self) -> BoundingBox {
        let corners = [
            self.transform.pixel_to_world(0.0, 0.0),
            self.transform.pixel_to_world(self.width as f64, 0.0),
            self.transform.pixel_to_world(0.0, self.height as f64),
            self.transform.pixel_to_world(self.width as f64, self.height as f64),
        ];
        // four corners are never empty
        BoundingBox::from_coords(&corners).unwrap_or(BoundingBox {
            min_x: 0.0,
            max_x: 0.0,
            min_y: 0.0,
            max_y: 0.0,
        })
    }

    /// Describe the first property that differs from `other`, if any.
    /// Comparison is exact: transform coefficients must be bit-identical.
    pub fn mismatch(&self, other: &GridSpec) -> Option<String> {
        let a = self.transform.to_gdal();
        let b = other.transform.to_gdal();
        if a.iter().zip(b.iter()).any(|(x, y)| x.to_bits() != y.to_bits()) {
            return Some(format!("geotransform {:?} != {:?}", b, a));
        }
        if self.crs != other.crs {
            return Some("coordinate reference system differs".to_string());
        }
        if self.width != other.width || self.height != other.height {
            return Some(format!(
                "dimensions {}x{} != {}x{}",
                other.width, other.height, self.width, self.height
            ));
        }
        None
    }
}

/// Single-band raster bound to a grid
#[derive(Debug, Clone)]
pub struct RasterLayer {
    pub name: String,
    pub data: Grid,
    pub grid: GridSpec,
    pub nodata: Cell,
}

impl RasterLayer {
    pub fn new(name: impl Into<String>, data: Grid, grid: GridSpec, nodata: Cell) -> PipelineResult<Self> {
        let name = name.into();
        if data.dim() != grid.shape() {
            return Err(PipelineError::InvalidFormat(format!(
                "Layer '{}' data shape {:?} does not match grid {}x{}",
                name,
                data.dim(),
                grid.width,
                grid.height
            )));
        }
        Ok(Self { name, data, grid, nodata })
    }

    /// Layer filled with `nodata` on the given grid
    pub fn empty(name: impl Into<String>, grid: GridSpec, nodata: Cell) -> Self {
        Self {
            name: name.into(),
            data: Array2::from_elem(grid.shape(), nodata),
            grid,
            nodata,
        }
    }

    pub fn is_valid(&self, value: Cell) -> bool {
        value.is_finite() && value != self.nodata
    }

    /// Value of the cell containing `c`, `None` when outside or nodata
    pub fn value_at(&self, c: &Coord) -> Option<Cell> {
        let (row, col) = self.grid.cell_of(c)?;
        let v = self.data[[row, col]];
        if self.is_valid(v) {
            Some(v)
        } else {
            None
        }
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| self.is_valid(v)).count()
    }

    /// (min, max) over valid cells
    pub fn min_max(&self) -> Option<(Cell, Cell)> {
        self.data
            .iter()
            .copied()
            .filter(|&v| self.is_valid(v))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Vector geometry; multi-part geometries are flattened into several of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon {
        exterior: Vec<Coord>,
        interiors: Vec<Vec<Coord>>,
    },
}

impl Geometry {
    /// Representative location: the point itself, the vertex mean of a line,
    /// or the area centroid of a polygon's exterior ring
    pub fn representative_point(&self) -> Option<Coord> {
        match self {
            Geometry::Point(c) => Some(*c),
            Geometry::LineString(coords) => vertex_mean(coords),
            Geometry::Polygon { exterior, .. } => ring_centroid(exterior).or_else(|| vertex_mean(exterior)),
        }
    }

    pub fn coords(&self) -> Vec<Coord> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::LineString(coords) => coords.clone(),
            Geometry::Polygon { exterior, interiors } => {
                let mut all = exterior.clone();
                for ring in interiors {
                    all.extend_from_slice(ring);
                }
                all
            }
        }
    }
}

fn vertex_mean(coords: &[Coord]) -> Option<Coord> {
    if coords.is_empty() {
        return None;
    }
    let n = coords.len() as f64;
    let (sx, sy) = coords.iter().fold((0.0, 0.0), |(sx, sy), c| (sx + c.x, sy + c.y));
    Some(Coord::new(sx / n, sy / n))
}

fn ring_centroid(ring: &[Coord]) -> Option<Coord> {
    if ring.len() < 3 {
        return None;
    }
    let mut area2 = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        let cross = a.x * b.y - b.x * a.y;
        area2 += cross;
        cx += (a.x + b.x) * cross;
        cy += (a.y + b.y) * cross;
    }
    if area2.abs() < f64::EPSILON {
        return None;
    }
    Some(Coord::new(cx / (3.0 * area2), cy / (3.0 * area2)))
}

/// Set of geometries sharing one CRS
#[derive(Debug, Clone)]
pub struct VectorLayer {
    pub name: String,
    pub crs: String,
    pub geometries: Vec<Geometry>,
}

impl VectorLayer {
    pub fn new(name: impl Into<String>, crs: impl Into<String>, geometries: Vec<Geometry>) -> Self {
        Self {
            name: name.into(),
            crs: crs.into(),
            geometries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }
}

/// Training label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Absence,
    Presence,
}

impl Label {
    pub fn as_u8(self) -> u8 {
        match self {
            Label::Absence => 0,
            Label::Presence => 1,
        }
    }

    pub fn from_u8(value: u8) -> PipelineResult<Self> {
        match value {
            0 => Ok(Label::Absence),
            1 => Ok(Label::Presence),
            other => Err(PipelineError::InvalidFormat(format!("Invalid label: {}", other))),
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Absence => write!(f, "absence"),
            Label::Presence => write!(f, "presence"),
        }
    }
}

/// One row of the training table
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub location: Coord,
    pub label: Label,
    pub features: Vec<Cell>,
}

/// Predictor variable type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Continuous,
    Categorical,
    Distance,
}

impl VarType {
    /// Categorical codes must never be blended
    pub fn resample_method(self) -> ResampleMethod {
        match self {
            VarType::Categorical => ResampleMethod::Nearest,
            VarType::Continuous | VarType::Distance => ResampleMethod::Bilinear,
        }
    }
}

/// Logical grouping of predictor layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarGroup {
    Terrain,
    Ecological,
    Hydrology,
    Road,
    Context,
}

/// Resampling kernel used when moving a layer onto another grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    Nearest,
    Bilinear,
}

/// Error types for the pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Archive error in {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },

    #[error("Missing source file: {}", .0.display())]
    MissingSource(PathBuf),

    #[error("Grid alignment mismatch for layer '{layer}': {reason}")]
    Alignment { layer: String, reason: String },

    #[error("Training error: {0}")]
    Training(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "raster-io")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_grid_covering_rounds_up() {
        let extent = BoundingBox { min_x: 0.0, max_x: 2000.0, min_y: 0.0, max_y: 2000.0 };
        let grid = GridSpec::covering(&extent, 30.0, "ESRI:102033").unwrap();
        assert_eq!((grid.width, grid.height), (67, 67));
        assert_eq!(grid.transform.top_left_y, 2000.0);

        let exact = GridSpec::covering(&extent, 20.0, "ESRI:102033").unwrap();
        assert_eq!((exact.width, exact.height), (100, 100));
    }

    #[test]
    fn test_cell_lookup_round_trips_centres() {
        let extent = BoundingBox { min_x: 100.0, max_x: 400.0, min_y: -300.0, max_y: 0.0 };
        let grid = GridSpec::covering(&extent, 30.0, "ESRI:102033").unwrap();
        let centre = grid.cell_center(3, 7);
        assert_relative_eq!(centre.x, 100.0 + 7.5 * 30.0);
        assert_relative_eq!(centre.y, 0.0 - 3.5 * 30.0);
        assert_eq!(grid.cell_of(&centre), Some((3, 7)));
        assert_eq!(grid.cell_of(&Coord::new(99.0, -10.0)), None);
        assert_eq!(grid.cell_of(&Coord::new(500.0, -10.0)), None);
    }

    #[test]
    fn test_mismatch_detects_each_property() {
        let extent = BoundingBox { min_x: 0.0, max_x: 300.0, min_y: 0.0, max_y: 300.0 };
        let grid = GridSpec::covering(&extent, 30.0, "ESRI:102033").unwrap();
        assert!(grid.mismatch(&grid.clone()).is_none());

        let mut shifted = grid.clone();
        shifted.transform.top_left_x += 1e-9;
        assert!(grid.mismatch(&shifted).unwrap().contains("geotransform"));

        let mut other_crs = grid.clone();
        other_crs.crs = "EPSG:32718".to_string();
        assert!(grid.mismatch(&other_crs).unwrap().contains("reference system"));

        let mut wider = grid.clone();
        wider.width += 1;
        assert!(grid.mismatch(&wider).unwrap().contains("dimensions"));
    }

    #[test]
    fn test_polygon_representative_point_is_centroid() {
        let square = Geometry::Polygon {
            exterior: vec![
                Coord::new(0.0, 0.0),
                Coord::new(10.0, 0.0),
                Coord::new(10.0, 10.0),
                Coord::new(0.0, 10.0),
            ],
            interiors: vec![],
        };
        let c = square.representative_point().unwrap();
        assert_relative_eq!(c.x, 5.0);
        assert_relative_eq!(c.y, 5.0);
    }
}
