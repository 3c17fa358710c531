use crate::types::{
    BoundingBox, Cell, Coord, GeoTransform, GridSpec, PipelineError, PipelineResult, RasterLayer, ResampleMethod,
};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};

/// Points per footprint edge when projecting tile extents
const FOOTPRINT_DENSIFY: usize = 21;

/// GDAL-backed raster reader/writer bound to the project CRS.
///
/// Layers whose spatial reference is equivalent to the project CRS carry the
/// project CRS identifier; others carry their WKT.
pub struct RasterIo {
    crs: String,
    nodata: Cell,
}

impl RasterIo {
    pub fn new(crs: impl Into<String>, nodata: Cell) -> Self {
        Self {
            crs: crs.into(),
            nodata,
        }
    }

    pub fn project_srs(&self) -> PipelineResult<SpatialRef> {
        let srs = SpatialRef::from_definition(&self.crs)?;
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(srs)
    }

    fn open(&self, path: &Path) -> PipelineResult<Dataset> {
        if !path.exists() {
            return Err(PipelineError::MissingSource(path.to_path_buf()));
        }
        Dataset::open(path)
            .map_err(|e| PipelineError::InvalidFormat(format!("Cannot read raster {}: {}", path.display(), e)))
    }

    fn crs_label(&self, dataset: &Dataset) -> PipelineResult<String> {
        let srs = dataset.spatial_ref()?;
        if srs == self.project_srs()? {
            Ok(self.crs.clone())
        } else {
            Ok(srs.to_wkt()?)
        }
    }

    /// Grid of a raster file without reading its pixels
    pub fn read_grid<P: AsRef<Path>>(&self, path: P) -> PipelineResult<GridSpec> {
        let dataset = self.open(path.as_ref())?;
        let (width, height) = dataset.raster_size();
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        Ok(GridSpec::new(transform, self.crs_label(&dataset)?, width, height))
    }

    /// Read band 1 as a layer; the band's nodata value (and non-finite
    /// cells) are mapped to the project sentinel
    pub fn read<P: AsRef<Path>>(&self, path: P, name: &str) -> PipelineResult<RasterLayer> {
        let path = path.as_ref();
        log::debug!("Reading raster '{}' from: {}", name, path.display());

        let dataset = self.open(path)?;
        let (width, height) = dataset.raster_size();
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let grid = GridSpec::new(transform, self.crs_label(&dataset)?, width, height);

        let band = dataset.rasterband(1)?;
        let band_nodata = band.no_data_value().map(|v| v as Cell);
        let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let mut data = Array2::from_shape_vec((height, width), buffer.data)
            .map_err(|e| PipelineError::Processing(format!("Failed to reshape raster data: {}", e)))?;

        let nodata = self.nodata;
        data.mapv_inplace(|v| {
            if !v.is_finite() || Some(v) == band_nodata {
                nodata
            } else {
                v
            }
        });

        RasterLayer::new(name, data, grid, nodata)
    }

    /// Write a layer as a tiled, LZW-compressed GeoTIFF
    pub fn write<P: AsRef<Path>>(&self, layer: &RasterLayer, path: P) -> PipelineResult<()> {
        let path = path.as_ref();
        log::info!("Saving '{}' as GeoTIFF: {}", layer.name, path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (height, width) = layer.data.dim();
        let options = [
            RasterCreationOption { key: "COMPRESS", value: "LZW" },
            RasterCreationOption { key: "PREDICTOR", value: "2" },
            RasterCreationOption { key: "TILED", value: "YES" },
            RasterCreationOption { key: "BIGTIFF", value: "IF_SAFER" },
        ];
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
            path,
            width as isize,
            height as isize,
            1,
            &options,
        )?;

        dataset.set_geo_transform(&layer.grid.transform.to_gdal())?;
        dataset.set_spatial_ref(&SpatialRef::from_definition(&layer.grid.crs)?)?;

        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(layer.nodata as f64))?;
        let buffer = Buffer::new((width, height), layer.data.iter().copied().collect::<Vec<f32>>());
        band.write((0, 0), (width, height), &buffer)?;
        Ok(())
    }

    /// Extent of a raster in the project CRS, from its densified outline
    pub fn footprint<P: AsRef<Path>>(&self, path: P) -> PipelineResult<BoundingBox> {
        let dataset = self.open(path.as_ref())?;
        let (width, height) = dataset.raster_size();
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);

        let mut xs = Vec::with_capacity(4 * FOOTPRINT_DENSIFY);
        let mut ys = Vec::with_capacity(4 * FOOTPRINT_DENSIFY);
        let n = (FOOTPRINT_DENSIFY - 1) as f64;
        for i in 0..FOOTPRINT_DENSIFY {
            let t = i as f64 / n;
            for (col, row) in [
                (t * width as f64, 0.0),
                (t * width as f64, height as f64),
                (0.0, t * height as f64),
                (width as f64, t * height as f64),
            ] {
                let c = transform.pixel_to_world(col, row);
                xs.push(c.x);
                ys.push(c.y);
            }
        }

        let src = dataset.spatial_ref()?;
        let dst = self.project_srs()?;
        if src != dst {
            src.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
            let ct = CoordTransform::new(&src, &dst)?;
            let mut zs = vec![0.0; xs.len()];
            ct.transform_coords(&mut xs, &mut ys, &mut zs)?;
        }

        let coords: Vec<Coord> = xs.iter().zip(&ys).map(|(&x, &y)| Coord::new(x, y)).collect();
        BoundingBox::from_coords(&coords)
            .ok_or_else(|| PipelineError::Processing(format!("Empty footprint for {}", path.as_ref().display())))
    }

    /// Warp a raster file onto `grid` with GDAL
    pub fn warp_to_grid<P: AsRef<Path>>(
        &self,
        path: P,
        name: &str,
        grid: &GridSpec,
        method: ResampleMethod,
    ) -> PipelineResult<RasterLayer> {
        let path = path.as_ref();
        log::debug!(
            "Warping {} onto {}x{} grid ({:?})",
            path.display(),
            grid.width,
            grid.height,
            method
        );

        let src = self.open(path)?;
        if src.rasterband(1)?.no_data_value().is_none() {
            log::warn!("{} declares no nodata value; all source cells are treated as valid", path.display());
        }

        let driver = DriverManager::get_driver_by_name("MEM")?;
        let mut dst = driver.create_with_band_type::<f32, _>("", grid.width as isize, grid.height as isize, 1)?;
        dst.set_geo_transform(&grid.transform.to_gdal())?;
        dst.set_spatial_ref(&SpatialRef::from_definition(&grid.crs)?)?;
        {
            let mut band = dst.rasterband(1)?;
            band.set_no_data_value(Some(self.nodata as f64))?;
            band.fill(self.nodata as f64, None)?;
        }

        let alg = match method {
            ResampleMethod::Nearest => gdal_sys::GDALResampleAlg::GRA_NearestNeighbour,
            ResampleMethod::Bilinear => gdal_sys::GDALResampleAlg::GRA_Bilinear,
        };
        let rv = unsafe {
            gdal_sys::GDALReprojectImage(
                src.c_dataset(),
                std::ptr::null(),
                dst.c_dataset(),
                std::ptr::null(),
                alg,
                0.0,
                0.0,
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rv != gdal_sys::CPLErr::CE_None {
            return Err(PipelineError::Processing(format!("GDAL warp failed for {}", path.display())));
        }

        let band = dst.rasterband(1)?;
        let buffer = band.read_as::<f32>((0, 0), (grid.width, grid.height), (grid.width, grid.height), None)?;
        let mut data = Array2::from_shape_vec(grid.shape(), buffer.data)
            .map_err(|e| PipelineError::Processing(format!("Failed to reshape warped data: {}", e)))?;
        let nodata = self.nodata;
        data.mapv_inplace(|v| if v.is_finite() { v } else { nodata });

        RasterLayer::new(name, data, grid.clone(), self.nodata)
    }

    /// Write a VRT mosaic of `sources` to `path`.
    ///
    /// Where sources overlap the first one in `sources` wins; the VRT takes
    /// the finest source resolution so no source is downsampled before a
    /// warp reads it.
    pub fn build_vrt<P: AsRef<Path>>(&self, sources: &[PathBuf], path: P) -> PipelineResult<()> {
        let path = path.as_ref();
        if sources.is_empty() {
            return Err(PipelineError::Processing("No rasters to combine into a VRT".to_string()));
        }
        log::debug!("Building VRT of {} rasters: {}", sources.len(), path.display());

        // GDAL takes later VRT sources over earlier ones
        let datasets = sources
            .iter()
            .rev()
            .map(|s| self.open(s))
            .collect::<PipelineResult<Vec<Dataset>>>()?;
        let mut handles: Vec<gdal_sys::GDALDatasetH> = datasets.iter().map(|d| unsafe { d.c_dataset() }).collect();

        let c_string = |v: &str| {
            CString::new(v).map_err(|e| PipelineError::Processing(format!("Invalid GDAL argument '{}': {}", v, e)))
        };
        let args = [c_string("-resolution")?, c_string("highest")?];
        let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr() as *mut c_char).collect();
        argv.push(std::ptr::null_mut());
        let c_path = c_string(&path.to_string_lossy())?;

        let vrt = unsafe {
            let options = gdal_sys::GDALBuildVRTOptionsNew(argv.as_mut_ptr(), std::ptr::null_mut());
            let mut usage_error: c_int = 0;
            let vrt = gdal_sys::GDALBuildVRT(
                c_path.as_ptr(),
                handles.len() as c_int,
                handles.as_mut_ptr(),
                std::ptr::null(),
                options,
                &mut usage_error,
            );
            gdal_sys::GDALBuildVRTOptionsFree(options);
            vrt
        };
        if vrt.is_null() {
            return Err(PipelineError::Processing(format!(
                "GDAL could not build a VRT of {} rasters (mixed reference systems or band layouts?)",
                sources.len()
            )));
        }
        unsafe {
            gdal_sys::GDALClose(vrt);
        }
        Ok(())
    }

    /// Layer on exactly `grid`: read as-is when already aligned, otherwise
    /// warped with `method`
    pub fn read_aligned<P: AsRef<Path>>(
        &self,
        path: P,
        name: &str,
        grid: &GridSpec,
        method: ResampleMethod,
    ) -> PipelineResult<RasterLayer> {
        let path = path.as_ref();
        match self.read_grid(path)?.mismatch(grid) {
            None => {
                let mut layer = self.read(path, name)?;
                layer.grid = grid.clone();
                Ok(layer)
            }
            Some(reason) => {
                log::info!("Aligning '{}' to reference grid ({})", name, reason);
                self.warp_to_grid(path, name, grid, method)
            }
        }
    }
}
