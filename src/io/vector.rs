use crate::types::{Coord, Geometry, PipelineError, PipelineResult, VectorLayer};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use std::path::Path;

/// Read the first layer of a vector file (shapefile, GeoPackage, ...) and
/// reproject it into `crs`.
///
/// Multi-part geometries and collections are flattened; empty geometries are
/// skipped.
pub fn read_vector<P: AsRef<Path>>(path: P, crs: &str) -> PipelineResult<VectorLayer> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PipelineError::MissingSource(path.to_path_buf()));
    }
    log::info!("Reading vector layer: {}", path.display());

    let dataset = Dataset::open(path)
        .map_err(|e| PipelineError::InvalidFormat(format!("Cannot read vector {}: {}", path.display(), e)))?;
    let mut layer = dataset.layer(0)?;

    let target = SpatialRef::from_definition(crs)?;
    target.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    let source = layer.spatial_ref().ok_or_else(|| {
        PipelineError::InvalidFormat(format!("{} has no coordinate reference system", path.display()))
    })?;
    source.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);

    let transform = if source == target {
        None
    } else {
        log::debug!("Reprojecting {} into {}", path.display(), crs);
        Some(CoordTransform::new(&source, &target)?)
    };

    let mut geometries = Vec::new();
    let mut skipped = 0usize;
    for feature in layer.features() {
        let geometry = match feature.geometry() {
            Some(g) => g,
            None => {
                skipped += 1;
                continue;
            }
        };
        match &transform {
            Some(ct) => flatten(&geometry.transform(ct)?, &mut geometries),
            None => flatten(geometry, &mut geometries),
        }
    }
    if skipped > 0 {
        log::warn!("Skipped {} features without geometry in {}", skipped, path.display());
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    log::info!("'{}': {} geometries", name, geometries.len());
    Ok(VectorLayer::new(name, crs, geometries))
}

/// Read several vector files into one layer
pub fn read_vectors<P: AsRef<Path>>(paths: &[P], name: &str, crs: &str) -> PipelineResult<VectorLayer> {
    let mut geometries = Vec::new();
    for path in paths {
        geometries.extend(read_vector(path, crs)?.geometries);
    }
    Ok(VectorLayer::new(name, crs, geometries))
}

fn ring(g: &gdal::vector::Geometry) -> Vec<Coord> {
    g.get_point_vec().into_iter().map(|(x, y, _)| Coord::new(x, y)).collect()
}

fn flatten(g: &gdal::vector::Geometry, out: &mut Vec<Geometry>) {
    match g.geometry_name().as_str() {
        "POINT" => {
            if let Some(c) = ring(g).first() {
                out.push(Geometry::Point(*c));
            }
        }
        "LINESTRING" | "LINEARRING" => {
            let coords = ring(g);
            if !coords.is_empty() {
                out.push(Geometry::LineString(coords));
            }
        }
        "POLYGON" => {
            let n = g.geometry_count();
            if n == 0 {
                return;
            }
            let exterior = ring(&g.get_geometry(0));
            let interiors = (1..n).map(|i| ring(&g.get_geometry(i))).collect();
            out.push(Geometry::Polygon { exterior, interiors });
        }
        "MULTIPOINT" | "MULTILINESTRING" | "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => {
            for i in 0..g.geometry_count() {
                flatten(&g.get_geometry(i), out);
            }
        }
        other => log::warn!("Unsupported geometry type skipped: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wkt_geometries_are_flattened() {
        let multi = gdal::vector::Geometry::from_wkt("MULTIPOINT ((1 2), (3 4))").unwrap();
        let poly = gdal::vector::Geometry::from_wkt(
            "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0), (2 2, 4 2, 4 4, 2 2))",
        )
        .unwrap();

        let mut out = Vec::new();
        flatten(&multi, &mut out);
        flatten(&poly, &mut out);

        assert_eq!(out[0], Geometry::Point(Coord::new(1.0, 2.0)));
        assert_eq!(out[1], Geometry::Point(Coord::new(3.0, 4.0)));
        match &out[2] {
            Geometry::Polygon { exterior, interiors } => {
                assert_eq!(exterior.len(), 5);
                assert_eq!(interiors.len(), 1);
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_vector_is_missing_source() {
        assert!(matches!(
            read_vector("/nonexistent/rios.shp", "ESRI:102033"),
            Err(PipelineError::MissingSource(_))
        ));
    }
}
