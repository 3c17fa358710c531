#![cfg(feature = "raster-io")]

use huaca::config::{DistanceSource, LayerSpec, ModelKind, ModelParams, PipelineConfig, SamplingParams};
use huaca::io::{read_training_table, RasterIo};
use huaca::pipeline::Pipeline;
use huaca::types::{GeoTransform, GridSpec, Label, PipelineError, RasterLayer, VarGroup, VarType, NODATA};
use ndarray::Array2;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const CRS: &str = "EPSG:32718";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_raster(path: &Path, x0: f64, y0: f64, pixel: f64, width: usize, height: usize, f: impl Fn(f64, f64) -> f32) {
    let grid = GridSpec::new(GeoTransform::north_up(x0, y0, pixel, pixel), CRS, width, height);
    let data = Array2::from_shape_fn((height, width), |(r, c)| {
        let centre = grid.cell_center(r, c);
        f(centre.x, centre.y)
    });
    let layer = RasterLayer::new("fixture", data, grid, NODATA).unwrap();
    RasterIo::new(CRS, NODATA).write(&layer, path).unwrap();
}

fn hills(x: f64, y: f64) -> f32 {
    (3200.0 + 0.05 * (x - 500_000.0) + 25.0 * ((x - 500_000.0) / 300.0).sin() * ((9_000_000.0 - y) / 250.0).cos())
        as f32
}

/// Two 1.2 km ASTER-style tiles zipped with a companion file each
fn write_tile_archives(staging: &Path, tile_dir: &Path) {
    std::fs::create_dir_all(tile_dir).unwrap();
    for (name, x0) in [("ASTGTMV003_S13W072", 500_000.0), ("ASTGTMV003_S13W071", 501_200.0)] {
        let tif = staging.join(format!("{}_dem.tif", name));
        write_raster(&tif, x0, 9_000_000.0, 30.0, 40, 40, hills);

        let mut zip = zip::ZipWriter::new(File::create(tile_dir.join(format!("{}.zip", name))).unwrap());
        let options = zip::write::FileOptions::default();
        zip.start_file(format!("{}/{}_dem.tif", name, name), options).unwrap();
        zip.write_all(&std::fs::read(&tif).unwrap()).unwrap();
        zip.start_file(format!("{}/{}_num.tif", name, name), options).unwrap();
        zip.write_all(b"not a tile").unwrap();
        zip.finish().unwrap();
    }
}

fn write_geojson(path: &Path, features: &[&str]) {
    let text = format!(
        r#"{{"type": "FeatureCollection",
  "crs": {{"type": "name", "properties": {{"name": "urn:ogc:def:crs:EPSG::32718"}}}},
  "features": [{}]}}"#,
        features
            .iter()
            .map(|g| format!(r#"{{"type": "Feature", "properties": {{}}, "geometry": {}}}"#, g))
            .collect::<Vec<_>>()
            .join(",")
    );
    std::fs::write(path, text).unwrap();
}

fn layer(name: &str, filename: &str, var_type: VarType, group: VarGroup) -> LayerSpec {
    LayerSpec::new(name, filename, var_type, group, name, "", "v1", "")
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        crs: CRS.to_string(),
        tile_dir: root.join("raw/dem_tiles"),
        vector_dir: root.join("raw"),
        raster_dir: root.join("processed/rasters"),
        samples_dir: root.join("processed/samples"),
        models_dir: root.join("models"),
        tpi_radius: 3,
        layers: vec![
            layer("pendiente", "pendiente.tif", VarType::Continuous, VarGroup::Terrain),
            layer("rugosidad", "rugosidad.tif", VarType::Continuous, VarGroup::Terrain),
            layer("dist_rios", "distancia_rios.tif", VarType::Distance, VarGroup::Hydrology),
            layer("precipitacion", "precipitacion.tif", VarType::Continuous, VarGroup::Ecological),
        ],
        distances: vec![DistanceSource {
            name: "dist_rios".to_string(),
            inputs: vec!["rios.geojson".into()],
            output: "distancia_rios.tif".to_string(),
        }],
        sampling: SamplingParams {
            seed: 11,
            absence_ratio: 2.0,
            min_distance_m: 100.0,
            max_attempts_per_point: 100,
        },
        model: ModelParams {
            kind: ModelKind::RandomForest,
            n_trees: 10,
            max_depth: 4,
            min_samples_leaf: 1,
            ..ModelParams::default()
        },
        ..PipelineConfig::default()
    }
}

#[test]
fn test_full_pipeline_from_tile_archives() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let staging = root.join("staging");
    std::fs::create_dir_all(&staging).unwrap();

    let config = config(root);
    write_tile_archives(&staging, &config.tile_dir);
    std::fs::create_dir_all(&config.vector_dir).unwrap();
    write_geojson(
        &config.vector_dir.join("rios.geojson"),
        &[r#"{"type": "LineString", "coordinates": [[500015, 8999400], [502385, 8999400]]}"#],
    );
    let sites = config.vector_dir.join("sitios.geojson");
    write_geojson(
        &sites,
        &[
            r#"{"type": "Point", "coordinates": [500300, 8999700]}"#,
            r#"{"type": "Point", "coordinates": [501500, 8999250]}"#,
            r#"{"type": "Point", "coordinates": [502100, 8999100]}"#,
        ],
    );

    let pipeline = Pipeline::new(config.clone()).unwrap();

    // Tile Assembler
    let dem_path = pipeline.assemble().unwrap();
    let io = RasterIo::new(CRS, NODATA);
    let dem = io.read(&dem_path, "altitud").unwrap();
    assert_eq!((dem.grid.width, dem.grid.height), (80, 40));
    assert_eq!(dem.grid.crs, CRS);
    assert_eq!(dem.valid_count(), 80 * 40);

    let again = pipeline.assemble().unwrap();
    assert_eq!(io.read(&again, "altitud").unwrap().data, dem.data);

    // Derivatives are skipped once present
    let derived = pipeline.derive(false).unwrap();
    assert_eq!(derived.len(), 8);
    assert!(pipeline.derive(false).unwrap().is_empty());
    assert_eq!(pipeline.derive(true).unwrap().len(), 8);

    // Distance raster is zero on the river row
    pipeline.distances(false).unwrap();
    let rios = io.read(config.raster_dir.join("distancia_rios.tif"), "dist_rios").unwrap();
    assert!(rios.grid.mismatch(&dem.grid).is_none());
    assert_eq!(rios.data[[20, 40]], 0.0);
    assert_eq!(rios.data[[10, 40]], 300.0);

    // Coarser external raster is warped onto the reference grid
    let raw = staging.join("chirps_precip.tif");
    write_raster(&raw, 499_940.0, 9_000_060.0, 60.0, 42, 22, |_, _| 850.0);
    pipeline.align(&raw, "precipitacion", VarType::Continuous).unwrap();

    let report = pipeline.check(Some("v1")).unwrap();
    assert_eq!(report.len(), 4);

    // Sampler and Trainer
    let table_path = pipeline.sample(&sites, Some("v1")).unwrap();
    let table = read_training_table(&table_path).unwrap();
    assert_eq!(table.label_counts(), (6, 3));
    assert_eq!(table.feature_names().len(), 4);
    assert!(table
        .records()
        .iter()
        .filter(|r| r.label == Label::Presence)
        .all(|r| r.features[3] == 850.0));

    let model_path = pipeline.train(&table_path, None).unwrap();
    assert_eq!(model_path, config.models_dir.join("random_forest.json"));

    let output = config.raster_dir.join("probabilidad.tif");
    let map = pipeline.predict(&model_path, &output).unwrap();
    assert!(map.grid.mismatch(&dem.grid).is_none());
    assert!(map.data.iter().all(|&p| (0.0..=1.0).contains(&p)));
    assert!(output.exists());

    // A misaligned registry raster is fatal
    std::fs::copy(&raw, config.raster_dir.join("precipitacion.tif")).unwrap();
    match pipeline.check(Some("v1")) {
        Err(PipelineError::Alignment { layer, .. }) => assert_eq!(layer, "precipitacion"),
        other => panic!("expected alignment error, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn test_missing_registry_layer_is_fatal() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::create_dir_all(&config.raster_dir).unwrap();
    write_raster(&config.dem_path(), 500_000.0, 9_000_000.0, 30.0, 10, 10, hills);

    let pipeline = Pipeline::new(config).unwrap();
    assert!(matches!(pipeline.check(None), Err(PipelineError::MissingSource(_))));
}

#[test]
fn test_empty_tile_directory_is_fatal() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::create_dir_all(&config.tile_dir).unwrap();

    let pipeline = Pipeline::new(config).unwrap();
    assert!(matches!(pipeline.assemble(), Err(PipelineError::Processing(_))));
}

#[test]
fn test_align_writes_registered_layers_to_their_registry_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    write_raster(&config.dem_path(), 500_000.0, 9_000_000.0, 30.0, 20, 20, hills);
    let raw = dir.path().join("proximity_60m.tif");
    write_raster(&raw, 500_000.0, 9_000_000.0, 60.0, 10, 10, |x, _| (x - 500_000.0) as f32);

    let pipeline = Pipeline::new(config.clone()).unwrap();
    let registered = pipeline.align(&raw, "dist_rios", VarType::Distance).unwrap();
    assert_eq!(registered, config.raster_dir.join("distancia_rios.tif"));
    assert!(registered.exists());
    assert!(!config.raster_dir.join("dist_rios.tif").exists());

    let unregistered = pipeline.align(&raw, "ndvi", VarType::Continuous).unwrap();
    assert_eq!(unregistered, config.raster_dir.join("ndvi.tif"));

    let io = RasterIo::new(CRS, NODATA);
    let dem = io.read(config.dem_path(), "altitud").unwrap();
    let aligned = io.read(&registered, "dist_rios").unwrap();
    assert!(aligned.grid.mismatch(&dem.grid).is_none());
}
