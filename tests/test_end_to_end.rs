use approx::assert_relative_eq;
use huaca::config::{ModelKind, ModelParams, SamplingParams};
use huaca::core::{
    ensure_aligned, predict_probability_map, DistanceRasterBuilder, LayerStack, Sampler, TileMosaicker, Trainer,
};
use huaca::types::{Coord, GeoTransform, Geometry, GridSpec, Label, RasterLayer, VectorLayer, NODATA};
use ndarray::Array2;

const CRS: &str = "ESRI:102033";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn elevation(x: f64, y: f64) -> f32 {
    (120.0 + 0.08 * x + 0.03 * y + 40.0 * (x / 400.0).sin() * (y / 500.0).cos()) as f32
}

/// Four 1 km tiles at 10 m covering [0, 2000] x [0, 2000]
fn tiles() -> Vec<RasterLayer> {
    let mut tiles = Vec::new();
    for (i, (x0, y0)) in [(0.0, 2000.0), (1000.0, 2000.0), (0.0, 1000.0), (1000.0, 1000.0)]
        .iter()
        .enumerate()
    {
        let grid = GridSpec::new(GeoTransform::north_up(*x0, *y0, 10.0, 10.0), CRS, 100, 100);
        let data = Array2::from_shape_fn((100, 100), |(r, c)| {
            let centre = grid.cell_center(r, c);
            elevation(centre.x, centre.y)
        });
        tiles.push(RasterLayer::new(format!("tile_{}", i), data, grid, NODATA).unwrap());
    }
    tiles
}

fn sites() -> VectorLayer {
    VectorLayer::new(
        "sitios",
        CRS,
        vec![
            Geometry::Point(Coord::new(315.0, 1695.0)),
            Geometry::Point(Coord::new(1005.0, 1005.0)),
            Geometry::Point(Coord::new(1605.0, 405.0)),
        ],
    )
}

#[test]
fn test_four_tiles_three_points_end_to_end() {
    init_logging();

    let mosaicker = TileMosaicker::new(CRS, 30.0, NODATA);
    let dem = mosaicker.mosaic("altitud", &tiles()).unwrap();
    println!("Mosaic: {}x{}", dem.grid.width, dem.grid.height);

    // 2 km at 30 m rounds up to 67 cells per side
    assert_eq!((dem.grid.width, dem.grid.height), (67, 67));
    assert_eq!(dem.grid.transform.top_left_x, 0.0);
    assert_eq!(dem.grid.transform.top_left_y, 2000.0);
    assert_eq!(dem.valid_count(), 67 * 67);

    let again = mosaicker.mosaic("altitud", &tiles()).unwrap();
    assert_eq!(again.data, dem.data);

    let builder = DistanceRasterBuilder::new(dem.grid.clone(), NODATA);
    let distance = builder.build("dist_sitios", &[sites()], Some(&dem)).unwrap();
    ensure_aligned(&[dem.clone(), distance.clone()]).unwrap();

    let feature_cells: Vec<(usize, usize)> = sites()
        .geometries
        .iter()
        .map(|g| match g {
            Geometry::Point(c) => dem.grid.cell_of(c).unwrap(),
            other => panic!("unexpected geometry {:?}", other),
        })
        .collect();
    for &(r, c) in &feature_cells {
        assert_eq!(distance.data[[r, c]], 0.0);
    }

    let centres: Vec<Coord> = feature_cells.iter().map(|&(r, c)| dem.grid.cell_center(r, c)).collect();
    for ((r, c), &d) in distance.data.indexed_iter() {
        let here = dem.grid.cell_center(r, c);
        let expected = centres.iter().map(|f| f.distance(&here)).fold(f64::INFINITY, f64::min);
        assert_relative_eq!(d as f64, expected, epsilon = 1e-2);
    }
    assert_eq!(distance.min_max().unwrap().0, 0.0);
}

#[test]
fn test_sampling_and_training_are_deterministic() {
    init_logging();

    let dem = TileMosaicker::new(CRS, 30.0, NODATA).mosaic("altitud", &tiles()).unwrap();
    let distance = DistanceRasterBuilder::new(dem.grid.clone(), NODATA)
        .build("dist_sitios", &[sites()], Some(&dem))
        .unwrap();
    let stack = LayerStack::new(vec![dem, distance]).unwrap();

    let presences: Vec<Coord> = sites().geometries.iter().filter_map(|g| g.representative_point()).collect();
    let params = SamplingParams {
        seed: 7,
        absence_ratio: 4.0,
        min_distance_m: 300.0,
        max_attempts_per_point: 50,
    };

    let first = Sampler::new(params.clone()).build_table(&stack, &presences).unwrap();
    let second = Sampler::new(params).build_table(&stack, &presences).unwrap();
    assert_eq!(first.records(), second.records());
    assert_eq!(first.label_counts(), (12, 3));
    assert_eq!(first.feature_names(), ["altitud".to_string(), "dist_sitios".to_string()]);

    for record in first.records().iter().filter(|r| r.label == Label::Absence) {
        for p in &presences {
            assert!(record.location.distance(p) >= 300.0);
        }
    }

    let model_params = ModelParams {
        kind: ModelKind::RandomForest,
        n_trees: 15,
        max_depth: 4,
        min_samples_leaf: 1,
        test_fraction: 0.0,
        ..ModelParams::default()
    };
    let a = Trainer::new(model_params.clone()).train(&first).unwrap();
    let b = Trainer::new(model_params).train(&first).unwrap();
    assert_eq!(a.n_train, 15);
    assert_eq!(a.n_test, 0);

    let map_a = predict_probability_map(&a, &stack, NODATA).unwrap();
    let map_b = predict_probability_map(&b, &stack, NODATA).unwrap();
    assert_eq!(map_a.data, map_b.data);
    assert!(map_a.data.iter().all(|&p| (0.0..=1.0).contains(&p)));
    assert!(map_a.grid.mismatch(stack.grid()).is_none());
}
