//! Reshapes executor output into the caller-facing result shapes.

use super::assemble::{SERIES_ALIAS, X_ALIAS, Y_ALIAS};
use crate::{
    models::{ChartPoint, ChartSeries, ChartType, ColumnMeta},
    pagination::PageMeta,
    store::{ResultSet, Row},
};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct PagedRows {
    pub columns: Vec<ColumnMeta>,
    pub data: Vec<Row>,
    #[serde(flatten)]
    pub page: PageMeta,
    pub query_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationTable {
    pub columns: Vec<String>,
    pub data: Vec<Row>,
    pub total_rows: usize,
    pub query_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartData {
    pub chart_type: ChartType,
    pub series: Vec<ChartSeries>,
    pub x_axis_label: Option<String>,
    pub y_axis_label: Option<String>,
    pub total_points: usize,
    pub query_time_ms: f64,
}

pub fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0
}

/// Rows with column metadata; `label` supplies display names where known.
pub fn paged_rows<F>(result: ResultSet, page: PageMeta, label: F, started: Instant) -> PagedRows
where
    F: Fn(&str) -> Option<String>,
{
    let columns = result
        .columns
        .into_iter()
        .map(|column| {
            let mut meta = ColumnMeta::from(column);
            meta.label = label(&meta.name);
            meta
        })
        .collect();

    PagedRows {
        columns,
        data: result.rows,
        page,
        query_time_ms: elapsed_ms(started),
    }
}

/// Rows are passed through untouched; `columns` is the planned output order.
pub fn aggregation_table(
    columns: Vec<String>,
    result: ResultSet,
    started: Instant,
) -> AggregationTable {
    AggregationTable {
        total_rows: result.rows.len(),
        columns,
        data: result.rows,
        query_time_ms: elapsed_ms(started),
    }
}

fn point(row: &Row) -> ChartPoint {
    ChartPoint {
        x: row.get(X_ALIAS).cloned().unwrap_or(Value::Null),
        y: row.get(Y_ALIAS).cloned().unwrap_or(Value::Null),
    }
}

pub fn single_series(name: impl Into<String>, rows: &[Row]) -> ChartSeries {
    ChartSeries {
        name: name.into(),
        data: rows.iter().map(point).collect(),
    }
}

/// Series name for a NULL discriminator.
pub const NULL_SERIES: &str = "(null)";

/// Display name of a discriminator value.
pub fn series_name(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => NULL_SERIES.to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// One series per distinct discriminator value, in order of first appearance.
/// With a prefix, names read `"{prefix}: {value}"`.
pub fn split_series(rows: &[Row], prefix: Option<&str>) -> Vec<ChartSeries> {
    let mut series: Vec<(&Value, ChartSeries)> = Vec::new();
    for row in rows {
        let key = row.get(SERIES_ALIAS).unwrap_or(&Value::Null);
        match series.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, existing)) => existing.data.push(point(row)),
            None => {
                let value = series_name(Some(key));
                let name = match prefix {
                    Some(prefix) => format!("{prefix}: {value}"),
                    None => value,
                };
                series.push((
                    key,
                    ChartSeries {
                        name,
                        data: vec![point(row)],
                    },
                ));
            }
        }
    }
    series.into_iter().map(|(_, series)| series).collect()
}

pub fn total_points(series: &[ChartSeries]) -> usize {
    series.iter().map(|s| s.data.len()).sum()
}
