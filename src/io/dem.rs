use crate::config::PipelineConfig;
use crate::core::mosaic::target_grid;
use crate::io::archive::TileExtractor;
use crate::io::raster::RasterIo;
use crate::types::{BoundingBox, PipelineResult, RasterLayer, ResampleMethod};
use std::path::{Path, PathBuf};

/// Builds the elevation mosaic from raw tiles: archive extraction, target
/// grid computation, then one warp of the combined tiles onto that grid
pub struct TileAssembler {
    raster_io: RasterIo,
    extractor: TileExtractor,
    crs: String,
    pixel_size: f64,
    nodata: f32,
    tile_dir: PathBuf,
    extract_dir: Option<PathBuf>,
}

impl TileAssembler {
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        Ok(Self {
            raster_io: RasterIo::new(config.crs.clone(), config.nodata),
            extractor: TileExtractor::new(&config.tile_pattern)?,
            crs: config.crs.clone(),
            pixel_size: config.pixel_size,
            nodata: config.nodata,
            tile_dir: config.tile_dir.clone(),
            extract_dir: config.extract_dir.clone(),
        })
    }

    /// Tiles to mosaic, in merge order.
    ///
    /// Archives found under the tile directory are extracted first (into the
    /// extraction directory, or `scratch` when none is configured) and only
    /// the tiles they yield are used; otherwise loose tiles are used.
    pub fn collect_tiles(&self, scratch: &Path) -> PipelineResult<Vec<PathBuf>> {
        let archives = self.extractor.find_archives(&self.tile_dir)?;
        if archives.is_empty() {
            return self.extractor.find_tiles(&self.tile_dir);
        }

        let out_dir = self.extract_dir.clone().unwrap_or_else(|| scratch.to_path_buf());
        let tiles = self.extractor.extract_all(&archives, &out_dir)?;
        log::info!("{} tiles extracted from {} archives", tiles.len(), archives.len());
        Ok(tiles)
    }

    /// Assemble the mosaic and write it to `output`
    pub fn assemble(&self, output: &Path) -> PipelineResult<RasterLayer> {
        log::info!("🏔️ Assembling elevation mosaic from {}", self.tile_dir.display());
        let scratch = tempfile::tempdir()?;
        let tiles = self.collect_tiles(scratch.path())?;
        let mosaic = self.mosaic_tiles(&tiles, scratch.path())?;
        self.raster_io.write(&mosaic, output)?;
        log::info!("✅ Mosaic written: {}", output.display());
        Ok(mosaic)
    }

    /// Combine `tiles` into one VRT (first tile wins on overlaps) and warp
    /// it once onto the union grid in the project CRS. The VRT is written
    /// to `scratch`.
    pub fn mosaic_tiles(&self, tiles: &[PathBuf], scratch: &Path) -> PipelineResult<RasterLayer> {
        let footprints = tiles
            .iter()
            .map(|t| self.raster_io.footprint(t))
            .collect::<PipelineResult<Vec<BoundingBox>>>()?;
        let grid = target_grid(&footprints, self.pixel_size, &self.crs)?;

        let vrt = scratch.join("tiles.vrt");
        self.raster_io.build_vrt(tiles, &vrt)?;
        let mosaic = self.raster_io.warp_to_grid(&vrt, "dem", &grid, ResampleMethod::Bilinear)?;

        let coverage = mosaic.valid_count() as f64 / grid.cell_count().max(1) as f64 * 100.0;
        log::info!(
            "Mosaic {}x{} at {} m, {:.2}% valid",
            grid.width,
            grid.height,
            self.pixel_size,
            coverage
        );
        Ok(mosaic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, GridSpec, NODATA};
    use ndarray::Array2;

    #[test]
    fn test_tiles_in_project_crs_are_merged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let crs = "EPSG:32718";
        let io = RasterIo::new(crs, NODATA);
        let tile = |x0: f64, value: f32, name: &str| {
            let grid = GridSpec::new(GeoTransform::north_up(x0, 9_000_000.0, 30.0, 30.0), crs, 10, 10);
            let layer = RasterLayer::new(name, Array2::from_elem((10, 10), value), grid, NODATA).unwrap();
            let path = dir.path().join(format!("{}_dem.tif", name));
            io.write(&layer, &path).unwrap();
            path
        };
        let a = tile(500_000.0, 100.0, "a");
        let b = tile(500_150.0, 200.0, "b");

        let config = PipelineConfig {
            crs: crs.to_string(),
            tile_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let assembler = TileAssembler::from_config(&config).unwrap();
        let tiles = assembler.collect_tiles(dir.path()).unwrap();
        assert_eq!(tiles, vec![a, b]);

        let mosaic = assembler.mosaic_tiles(&tiles, dir.path()).unwrap();
        assert_eq!((mosaic.grid.width, mosaic.grid.height), (15, 10));
        assert_eq!(mosaic.data[[5, 2]], 100.0);
        assert_eq!(mosaic.data[[5, 7]], 100.0);
        assert_eq!(mosaic.data[[5, 12]], 200.0);

        let again = assembler.mosaic_tiles(&tiles, dir.path()).unwrap();
        assert_eq!(again.data, mosaic.data);
    }

    #[test]
    fn test_resampling_across_tile_seam_is_continuous() {
        let dir = tempfile::tempdir().unwrap();
        let crs = "EPSG:32718";
        let io = RasterIo::new(crs, NODATA);
        // value = metres east of the western edge, split across two tiles
        for (name, x0) in [("west", 500_000.0), ("east", 500_300.0)] {
            let grid = GridSpec::new(GeoTransform::north_up(x0, 9_000_000.0, 30.0, 30.0), crs, 10, 10);
            let data = Array2::from_shape_fn((10, 10), |(_, c)| (x0 - 500_000.0 + 15.0 + 30.0 * c as f64) as f32);
            let layer = RasterLayer::new(name, data, grid, NODATA).unwrap();
            io.write(&layer, dir.path().join(format!("{}_dem.tif", name))).unwrap();
        }

        let config = PipelineConfig {
            crs: crs.to_string(),
            tile_dir: dir.path().to_path_buf(),
            pixel_size: 20.0,
            ..PipelineConfig::default()
        };
        let assembler = TileAssembler::from_config(&config).unwrap();
        let tiles = assembler.collect_tiles(dir.path()).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mosaic = assembler.mosaic_tiles(&tiles, scratch.path()).unwrap();
        assert_eq!((mosaic.grid.width, mosaic.grid.height), (30, 15));

        for row in 2..13 {
            for col in 2..28 {
                let expected = 10.0 + 20.0 * col as f32;
                assert!(
                    (mosaic.data[[row, col]] - expected).abs() < 1e-3,
                    "cell ({}, {}) = {}, expected {}",
                    row,
                    col,
                    mosaic.data[[row, col]],
                    expected
                );
            }
        }
    }

    #[test]
    fn test_only_freshly_extracted_tiles_are_used() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let tile_dir = dir.path().join("raw");
        let extract_dir = dir.path().join("extracted");
        std::fs::create_dir_all(&tile_dir).unwrap();
        std::fs::create_dir_all(extract_dir.join("S13W072")).unwrap();
        std::fs::write(extract_dir.join("old_dem.tif"), b"stale").unwrap();
        std::fs::write(extract_dir.join("S13W072/leftover_dem.tif"), b"stale").unwrap();

        let mut zip = zip::ZipWriter::new(std::fs::File::create(tile_dir.join("S13W072.zip")).unwrap());
        zip.start_file("S13W072_dem.tif", zip::write::FileOptions::default()).unwrap();
        zip.write_all(b"tile").unwrap();
        zip.finish().unwrap();

        let config = PipelineConfig {
            tile_dir,
            extract_dir: Some(extract_dir.clone()),
            ..PipelineConfig::default()
        };
        let assembler = TileAssembler::from_config(&config).unwrap();
        let tiles = assembler.collect_tiles(dir.path()).unwrap();
        assert_eq!(tiles, vec![extract_dir.join("S13W072/S13W072_dem.tif")]);
    }
}
