//! Collaborators the engine talks to: the columnar store and object storage.

mod clickhouse;
mod storage;

pub use clickhouse::ClickHouseExecutor;
pub use storage::{ObjectStorage, S3Storage};

use crate::{error::Result, models::ColumnMeta, sql::Statement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row, keyed by column name in select order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl From<ResultColumn> for ColumnMeta {
    fn from(column: ResultColumn) -> Self {
        ColumnMeta {
            name: column.name,
            data_type: column.data_type,
            label: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Reads an unsigned integer cell from the first row, e.g. a `count()`.
    pub fn first_u64(&self, column: &str) -> Option<u64> {
        let value = self.rows.first()?.get(column)?;
        match value {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        }
    }

    /// Column names from metadata, falling back to the first row's keys.
    pub fn column_names(&self) -> Vec<String> {
        if !self.columns.is_empty() {
            return self.columns.iter().map(|c| c.name.clone()).collect();
        }
        self.rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Runs rendered statements. Parameters always travel apart from the SQL text.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<()>;

    async fn fetch_all(&self, statement: &Statement) -> Result<ResultSet>;

    async fn fetch_one(&self, statement: &Statement) -> Result<Option<Row>> {
        let result = self.fetch_all(statement).await?;
        Ok(result.rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn reads_counts_as_numbers_or_strings() {
        let set = ResultSet {
            columns: Vec::new(),
            rows: vec![row(json!({"total": 42}))],
        };
        assert_eq!(set.first_u64("total"), Some(42));

        let quoted = ResultSet {
            columns: Vec::new(),
            rows: vec![row(json!({"total": "7"}))],
        };
        assert_eq!(quoted.first_u64("total"), Some(7));
        assert_eq!(ResultSet::default().first_u64("total"), None);
    }

    #[test]
    fn column_names_fall_back_to_row_keys() {
        let set = ResultSet {
            columns: Vec::new(),
            rows: vec![row(json!({"b": 1, "a": 2}))],
        };
        assert_eq!(set.column_names(), vec!["b", "a"]);
    }
}
