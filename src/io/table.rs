//! Training table CSV: header `x,y,label,<feature…>`, one sample per row.

use crate::core::sampling::TrainingTable;
use crate::types::{Cell, Coord, Label, PipelineError, PipelineResult, SampleRecord};
use std::path::Path;

const FIXED_COLUMNS: [&str; 3] = ["x", "y", "label"];

pub fn write_training_table<P: AsRef<Path>>(table: &TrainingTable, path: P) -> PipelineResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    let header: Vec<&str> = FIXED_COLUMNS
        .iter()
        .copied()
        .chain(table.feature_names().iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;

    for record in table.records() {
        let mut row = Vec::with_capacity(header.len());
        row.push(record.location.x.to_string());
        row.push(record.location.y.to_string());
        row.push(record.label.as_u8().to_string());
        row.extend(record.features.iter().map(|v| v.to_string()));
        writer.write_record(&row)?;
    }
    writer.flush()?;

    log::info!("Wrote {} samples to {}", table.len(), path.display());
    Ok(())
}

pub fn read_training_table<P: AsRef<Path>>(path: P) -> PipelineResult<TrainingTable> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PipelineError::MissingSource(path.to_path_buf()));
    }

    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    if headers.len() < FIXED_COLUMNS.len() || headers[..3] != FIXED_COLUMNS {
        return Err(PipelineError::InvalidFormat(format!(
            "{}: expected header to start with x,y,label, got {:?}",
            path.display(),
            headers
        )));
    }
    let feature_names = headers[3..].to_vec();

    let mut records = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let row = result?;
        let field = |i: usize| -> PipelineResult<f64> {
            let raw = row.get(i).unwrap_or("");
            raw.trim().parse::<f64>().map_err(|_| {
                PipelineError::InvalidFormat(format!(
                    "Row {}, column '{}': '{}' is not a number",
                    row_no, headers[i], raw
                ))
            })
        };

        let label = field(2)?;
        if label != 0.0 && label != 1.0 {
            return Err(PipelineError::InvalidFormat(format!("Row {}: label {} is not 0/1", row_no, label)));
        }
        let features = (3..headers.len())
            .map(|i| field(i).map(|v| v as Cell))
            .collect::<PipelineResult<Vec<Cell>>>()?;

        records.push(SampleRecord {
            location: Coord::new(field(0)?, field(1)?),
            label: Label::from_u8(label as u8)?,
            features,
        });
    }

    log::info!("Read {} samples ({} features) from {}", records.len(), feature_names.len(), path.display());
    TrainingTable::new(feature_names, records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_survives_csv() {
        let records = vec![
            SampleRecord { location: Coord::new(500.5, -20.25), label: Label::Presence, features: vec![12.5, 3.0] },
            SampleRecord { location: Coord::new(800.0, 10.0), label: Label::Absence, features: vec![0.0, -9.75] },
        ];
        let table = TrainingTable::new(vec!["pendiente".into(), "tpi".into()], records).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples").join("training_v1.csv");
        write_training_table(&table, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("x,y,label,pendiente,tpi\n"));
        assert_eq!(read_training_table(&path).unwrap(), table);
    }

    #[test]
    fn test_bad_header_and_label_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad_header = dir.path().join("h.csv");
        std::fs::write(&bad_header, "lon,lat,label,a\n1,2,1,3\n").unwrap();
        assert!(matches!(read_training_table(&bad_header), Err(PipelineError::InvalidFormat(_))));

        let bad_label = dir.path().join("l.csv");
        std::fs::write(&bad_label, "x,y,label,a\n1,2,7,3\n").unwrap();
        assert!(matches!(read_training_table(&bad_label), Err(PipelineError::InvalidFormat(_))));
    }
}
