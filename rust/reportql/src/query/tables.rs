//! Table metadata from `system.tables` / `system.columns`, plus row samples.

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    sql::{
        redact, BindParam, CompareOp, Expr, Identifier, Logic, Param, Predicate, Select,
        SortOrder, Source, Statement,
    },
    store::{QueryExecutor, Row},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

const SYSTEM_DATABASES: [&str; 3] = ["system", "INFORMATION_SCHEMA", "information_schema"];
const SAMPLE_DEFAULT_LIMIT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub default_kind: String,
    #[serde(default)]
    pub default_expression: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    database: String,
    table_name: String,
    #[serde(default)]
    engine: String,
    #[serde(default)]
    total_rows: Option<u64>,
    #[serde(default)]
    total_bytes: Option<u64>,
}

/// A `system.columns` row from the all-tables listing.
#[derive(Debug, Deserialize)]
struct ListedColumn {
    database: String,
    table_name: String,
    #[serde(flatten)]
    column: TableColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMetadata {
    pub table_name: String,
    pub database: String,
    pub engine: String,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub columns: Vec<TableColumn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSample {
    pub columns: Vec<TableColumn>,
    pub data: Vec<Row>,
    pub row_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableQuery {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

fn ident(name: &str) -> Result<Identifier> {
    Identifier::parse(name)
}

fn eq(column: &str, name: &str, value: &str) -> Result<Predicate> {
    Ok(Predicate::Compare {
        expr: Expr::Column(ident(column)?),
        op: CompareOp::Eq,
        param: Param::new(name, value),
    })
}

fn decode<T: DeserializeOwned>(row: Row) -> Result<T> {
    serde_json::from_value(Value::Object(row))
        .map_err(|err| ServiceError::executor("decode", err.to_string()))
}

/// User databases only, optionally narrowed to one.
fn database_scope(database: Option<&str>) -> Result<Vec<Predicate>> {
    let mut clauses = vec![Predicate::InList {
        expr: Expr::Column(ident("database")?),
        negated: true,
        param: Param::new("system_databases", SYSTEM_DATABASES.to_vec()),
    }];
    if let Some(database) = database.filter(|db| !db.is_empty()) {
        clauses.push(eq("database", "database", database)?);
    }
    Ok(clauses)
}

fn tables_statement(table: Option<&str>, database: Option<&str>) -> Result<Statement> {
    let database_column = ident("database")?;
    let mut clauses = database_scope(database)?;
    if let Some(table) = table {
        clauses.push(eq("name", "table_name", table)?);
    }

    Select::from(Source::Table(Identifier::parse_qualified("system.tables")?))
        .column(Expr::column(&database_column))
        .column_as(Expr::Column(ident("name")?), ident("table_name")?)
        .column(Expr::Column(ident("engine")?))
        .column(Expr::Column(ident("total_rows")?))
        .column(Expr::Column(ident("total_bytes")?))
        .filter(Predicate::group(Logic::And, clauses))
        .order_by(Expr::column(&database_column), SortOrder::Asc)
        .order_by(Expr::Column(ident("name")?), SortOrder::Asc)
        .render()
}

fn columns_statement(table: &str, database: Option<&str>) -> Result<Statement> {
    let mut clauses = vec![eq("table", "table_name", table)?];
    if let Some(database) = database.filter(|db| !db.is_empty()) {
        clauses.push(eq("database", "database", database)?);
    }

    let mut select = Select::from(Source::Table(Identifier::parse_qualified("system.columns")?));
    for column in COLUMN_FIELDS {
        select = select.column(Expr::Column(ident(column)?));
    }
    select
        .filter(Predicate::group(Logic::And, clauses))
        .order_by(Expr::Column(ident("position")?), SortOrder::Asc)
        .render()
}

const COLUMN_FIELDS: [&str; 5] = ["name", "type", "default_kind", "default_expression", "comment"];

/// Columns of every listed table in one pass, ordered per table.
fn listing_columns_statement(database: Option<&str>) -> Result<Statement> {
    let database_column = ident("database")?;
    let table_column = ident("table")?;
    let mut select = Select::from(Source::Table(Identifier::parse_qualified("system.columns")?))
        .column(Expr::column(&database_column))
        .column_as(Expr::column(&table_column), ident("table_name")?);
    for column in COLUMN_FIELDS {
        select = select.column(Expr::Column(ident(column)?));
    }
    select
        .filter(Predicate::group(Logic::And, database_scope(database)?))
        .order_by(Expr::column(&database_column), SortOrder::Asc)
        .order_by(Expr::column(&table_column), SortOrder::Asc)
        .order_by(Expr::Column(ident("position")?), SortOrder::Asc)
        .render()
}

#[derive(Clone)]
pub struct TableService {
    executor: Arc<dyn QueryExecutor>,
    config: Arc<AppConfig>,
}

impl TableService {
    pub fn new(executor: Arc<dyn QueryExecutor>, config: Arc<AppConfig>) -> Self {
        Self { executor, config }
    }

    /// Two statements regardless of how many tables there are.
    pub async fn list(&self, database: Option<&str>) -> Result<Vec<TableMetadata>> {
        let tables_query = tables_statement(None, database)?;
        let columns_query = listing_columns_statement(database)?;
        let (tables, columns) = tokio::try_join!(
            self.executor.fetch_all(&tables_query),
            self.executor.fetch_all(&columns_query),
        )?;

        let mut by_table: HashMap<(String, String), Vec<TableColumn>> = HashMap::new();
        for row in columns.rows {
            let listed: ListedColumn = decode(row)?;
            by_table
                .entry((listed.database, listed.table_name))
                .or_default()
                .push(listed.column);
        }

        tables
            .rows
            .into_iter()
            .map(|row| {
                let table: TableRow = decode(row)?;
                let columns = by_table
                    .remove(&(table.database.clone(), table.table_name.clone()))
                    .unwrap_or_default();
                Ok(table.into_metadata(columns))
            })
            .collect()
    }

    pub async fn metadata(&self, table: &str, database: Option<&str>) -> Result<TableMetadata> {
        let statement = tables_statement(Some(table), database)?;
        let Some(row) = self.executor.fetch_one(&statement).await? else {
            return Err(ServiceError::NotFound(format!(
                "table '{}' not found",
                redact(table)
            )));
        };
        self.with_columns(decode(row)?).await
    }

    pub async fn columns(&self, table: &str, database: Option<&str>) -> Result<Vec<TableColumn>> {
        let statement = columns_statement(table, database)?;
        self.executor
            .fetch_all(&statement)
            .await?
            .rows
            .into_iter()
            .map(decode)
            .collect()
    }

    /// First `limit` rows of a table. Accepts `name` or `database.name`.
    pub async fn sample(&self, table: &str, limit: Option<u64>) -> Result<TableSample> {
        let identifier = Identifier::parse_qualified(table)?;
        let statement = Select::from(Source::Table(identifier.clone()))
            .limit(self.config.determine_limit(limit, SAMPLE_DEFAULT_LIMIT))
            .render()?;

        let (columns, result) = tokio::try_join!(
            self.columns(identifier.name(), identifier.qualifier()),
            self.executor.fetch_all(&statement),
        )?;

        Ok(TableSample {
            columns,
            row_count: result.rows.len(),
            data: result.rows,
        })
    }

    async fn with_columns(&self, table: TableRow) -> Result<TableMetadata> {
        let columns = self
            .columns(&table.table_name, Some(&table.database))
            .await?;
        Ok(table.into_metadata(columns))
    }
}

impl TableRow {
    fn into_metadata(self, columns: Vec<TableColumn>) -> TableMetadata {
        TableMetadata {
            table_name: self.table_name,
            database: self.database,
            engine: self.engine,
            total_rows: self.total_rows.unwrap_or_default(),
            total_bytes: self.total_bytes.unwrap_or_default(),
            columns,
        }
    }
}
