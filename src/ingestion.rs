use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::orchestrator::RecordResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: String,
    pub raw_address: String,
}

impl AddressRecord {
    pub fn new(id: impl Into<String>, raw_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            raw_address: raw_address.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InputRow {
    #[serde(default)]
    id: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    id: &'a str,
    latitude: Option<f64>,
    longitude: Option<f64>,
    status: &'static str,
    source: &'static str,
}

/// Reads `id,address` rows. The `id` column is optional and defaults to the row index.
pub fn read_records(path: &Path) -> AppResult<Vec<AddressRecord>> {
    let reader = csv::Reader::from_path(path)?;
    let records = parse_records(reader)?;
    info!(
        path = %path.display(),
        rows = records.len(),
        "loaded address records"
    );
    Ok(records)
}

pub fn parse_records<R: io::Read>(mut reader: csv::Reader<R>) -> AppResult<Vec<AddressRecord>> {
    let headers: csv::StringRecord = reader.headers()?.iter().map(str::trim).collect();
    reader.set_headers(headers.clone());
    if !headers.iter().any(|h| h == "address") {
        return Err(AppError::Config(
            "input CSV has no `address` column".to_string(),
        ));
    }

    let mut records = Vec::new();
    for (index, row) in reader.deserialize::<InputRow>().enumerate() {
        let row = row?;
        let id = row
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| index.to_string());
        let address = row.address.unwrap_or_default().trim().to_string();
        records.push(AddressRecord::new(id, address));
    }
    Ok(records)
}

pub fn write_results(path: &Path, results: &[RecordResult]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let writer = csv::Writer::from_path(path)?;
    emit_results(writer, results)?;
    info!(path = %path.display(), rows = results.len(), "results written");
    Ok(())
}

pub fn emit_results<W: io::Write>(
    mut writer: csv::Writer<W>,
    results: &[RecordResult],
) -> AppResult<()> {
    for record in results {
        writer.serialize(OutputRow {
            id: &record.id,
            latitude: record.result.latitude,
            longitude: record.result.longitude,
            status: record.result.status.as_str(),
            source: record.result.source.as_str(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::client::{Coordinates, GeocodeResult, ResultSource};

    #[test]
    fn reads_ids_and_trims_addresses() {
        let data = "id,address\nA-1,\"  10 Downing St, London SW1A 2AA \"\nA-2,1 Main St\n";
        let records = parse_records(csv::Reader::from_reader(data.as_bytes())).unwrap();

        assert_eq!(
            records,
            vec![
                AddressRecord::new("A-1", "10 Downing St, London SW1A 2AA"),
                AddressRecord::new("A-2", "1 Main St"),
            ]
        );
    }

    #[test]
    fn missing_id_column_uses_row_index() {
        let data = "name,address\nShop,1 High St\nPub,\n";
        let records = parse_records(csv::Reader::from_reader(data.as_bytes())).unwrap();

        assert_eq!(
            records,
            vec![
                AddressRecord::new("0", "1 High St"),
                AddressRecord::new("1", ""),
            ]
        );
    }

    #[test]
    fn padded_header_names_still_map_to_columns() {
        let data = " id , address\n7,\"1 High St, Bath BA1 1AA\"\n";
        let records = parse_records(csv::Reader::from_reader(data.as_bytes())).unwrap();

        assert_eq!(records, vec![AddressRecord::new("7", "1 High St, Bath BA1 1AA")]);
    }

    #[test]
    fn rejects_input_without_address_column() {
        let data = "id,street\n1,High St\n";
        let err = parse_records(csv::Reader::from_reader(data.as_bytes())).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn writes_one_row_per_result() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("results.csv");
        let results = vec![
            RecordResult {
                id: "1".into(),
                result: GeocodeResult::found(
                    Coordinates {
                        latitude: 51.5034,
                        longitude: -0.1276,
                    },
                    ResultSource::Postcode,
                ),
            },
            RecordResult {
                id: "2".into(),
                result: GeocodeResult::not_found(ResultSource::Address),
            },
        ];

        write_results(&path, &results).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "id,latitude,longitude,status,source\n\
             1,51.5034,-0.1276,OK,POSTCODE\n\
             2,,,NOT_FOUND,ADDRESS\n"
        );
    }
}
