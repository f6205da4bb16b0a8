//! Export encoder and the upload step that turns an artifact into a download URL.

use crate::{
    error::{Result, ServiceError},
    store::{ObjectStorage, Row},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Unknown formats (`xlsx`, `parquet`, ...) fall back to CSV.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    #[default]
    #[serde(other)]
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedExport {
    pub bytes: Vec<u8>,
    pub format: ExportFormat,
}

/// Serializes `rows`. `columns` fixes the cell order; `headers` is the CSV
/// header row and must be the same length.
pub fn encode(
    format: ExportFormat,
    columns: &[String],
    headers: &[String],
    rows: &[Row],
) -> Result<EncodedExport> {
    let bytes = match format {
        ExportFormat::Csv => encode_csv(columns, headers, rows)?,
        ExportFormat::Json => serde_json::to_vec_pretty(rows).map_err(|err| {
            ServiceError::Internal(anyhow::anyhow!("json export failed: {err}"))
        })?,
    };
    Ok(EncodedExport { bytes, format })
}

fn encode_csv(columns: &[String], headers: &[String], rows: &[Row]) -> Result<Vec<u8>> {
    let failed =
        |err: csv::Error| ServiceError::Internal(anyhow::anyhow!("csv export failed: {err}"));

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !headers.is_empty() {
        writer.write_record(headers).map_err(failed)?;
    }
    for row in rows {
        writer
            .write_record(columns.iter().map(|column| cell(row.get(column))))
            .map_err(failed)?;
    }
    writer
        .into_inner()
        .map_err(|err| ServiceError::Internal(anyhow::anyhow!("csv export failed: {err}")))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
    pub file_url: String,
    pub file_name: String,
    pub file_size: usize,
    pub row_count: usize,
    pub expires_at: DateTime<Utc>,
}

/// Stores the artifact under `prefix/file_name` and returns a time-limited URL.
pub async fn publish(
    storage: &dyn ObjectStorage,
    prefix: &str,
    file_stem: &str,
    encoded: EncodedExport,
    row_count: usize,
    ttl: Duration,
) -> Result<ExportResponse> {
    let file_name = format!("{file_stem}.{}", encoded.format.extension());
    let object = format!("{prefix}/{file_name}");
    let file_size = encoded.bytes.len();

    storage
        .put(&object, encoded.bytes, encoded.format.content_type())
        .await?;
    let file_url = storage.presigned_url(&object, ttl).await?;

    let expires_at = Utc::now()
        + chrono::Duration::from_std(ttl).map_err(|err| ServiceError::Internal(err.into()))?;
    info!(object = %object, row_count, file_size, "export published");

    Ok(ExportResponse {
        file_url,
        file_name,
        file_size,
        row_count,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        serde_json::from_value(value).unwrap()
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn unknown_formats_fall_back_to_csv() {
        let format: ExportFormat = serde_json::from_value(json!("xlsx")).unwrap();
        assert_eq!(format, ExportFormat::Csv);
        let format: ExportFormat = serde_json::from_value(json!("json")).unwrap();
        assert_eq!(format, ExportFormat::Json);
    }

    #[test]
    fn csv_uses_headers_and_column_order() {
        let data = rows(json!([
            {"value": 10.5, "territory": "North, East", "note": null},
            {"value": 7, "territory": "South", "note": true}
        ]));
        let encoded = encode(
            ExportFormat::Csv,
            &names(&["territory", "value", "note"]),
            &names(&["Territory", "Value", "Note"]),
            &data,
        )
        .unwrap();

        assert_eq!(
            String::from_utf8(encoded.bytes).unwrap(),
            "Territory,Value,Note\n\"North, East\",10.5,\nSouth,7,true\n"
        );
    }

    #[test]
    fn empty_results_are_well_formed() {
        let csv = encode(
            ExportFormat::Csv,
            &names(&["territory", "value"]),
            &names(&["territory", "value"]),
            &[],
        )
        .unwrap();
        assert_eq!(String::from_utf8(csv.bytes).unwrap(), "territory,value\n");

        let json = encode(ExportFormat::Json, &[], &[], &[]).unwrap();
        assert_eq!(String::from_utf8(json.bytes).unwrap(), "[]");
    }
}
