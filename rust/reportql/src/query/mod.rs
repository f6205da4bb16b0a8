//! Query engine: generic data operations over any table or stored data source.

pub mod assemble;
pub mod dimensions;
pub mod filter;
pub mod reports;
pub mod reshape;
pub mod tables;

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    export::{self, ExportFormat, ExportResponse},
    models::{AggregationFunction, ChartType, ColumnAggregation, FilterSet, SortSpec},
    pagination::PageMeta,
    sql::{
        CompareOp, Expr, Identifier, Param, Predicate, Sanitizer, Select, Source, Statement,
    },
    store::{ObjectStorage, QueryExecutor},
    time,
};
use assemble::{
    resolve_aggregations, resolve_sort, AggregationPlan, ChartPlan, PagedStatements,
    QueryEnvelope, TOTAL_ALIAS,
};
use chrono::Utc;
use filter::FilterTranslator;
use futures::future::try_join_all;
use reshape::{AggregationTable, ChartData, PagedRows};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const SANITIZER: Sanitizer = Sanitizer::CharacterClass;
const EXPORT_PREFIX: &str = "exports";

fn default_page() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataQueryRequest {
    #[serde(default)]
    pub data_source_id: Option<Uuid>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Option<FilterSet>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default)]
    pub page_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationRequest {
    #[serde(default)]
    pub data_source_id: Option<Uuid>,
    #[serde(default)]
    pub table_name: Option<String>,
    pub aggregations: Vec<ColumnAggregation>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filters: Option<FilterSet>,
    #[serde(default)]
    pub time_column: Option<String>,
    #[serde(default)]
    pub time_granularity: Option<String>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChartDataRequest {
    #[serde(default)]
    pub data_source_id: Option<Uuid>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub chart_type: ChartType,
    pub x_column: String,
    pub y_columns: Vec<String>,
    #[serde(default)]
    pub y_aggregations: Option<Vec<AggregationFunction>>,
    #[serde(default)]
    pub series_by: Option<String>,
    #[serde(default)]
    pub filters: Option<FilterSet>,
    #[serde(default)]
    pub time_granularity: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub data_source_id: Option<Uuid>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub filters: Option<FilterSet>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateResponse {
    pub rows: Statement,
    pub count: Statement,
}

/// Server-side data source record. Decoded structurally, never evaluated.
#[derive(Debug, Deserialize)]
struct StoredSource {
    #[serde(default)]
    table_name: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Clone)]
pub struct QueryEngine {
    executor: Arc<dyn QueryExecutor>,
    storage: Arc<dyn ObjectStorage>,
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        storage: Arc<dyn ObjectStorage>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            executor,
            storage,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn query_data(&self, request: DataQueryRequest) -> Result<PagedRows> {
        let started = Instant::now();
        let page_size = self.config.determine_page_size(request.page_size);
        let statements = self.paged_statements(&request, page_size).await?;

        let (rows, count) = tokio::try_join!(
            self.executor.fetch_all(&statements.rows),
            self.executor.fetch_all(&statements.count),
        )?;
        let total = count.first_u64(TOTAL_ALIAS).unwrap_or_default();

        Ok(reshape::paged_rows(
            rows,
            PageMeta::new(total, request.page, page_size),
            |_| None,
            started,
        ))
    }

    /// Dry run of [`Self::query_data`]: the statements it would execute.
    pub async fn translate(&self, request: DataQueryRequest) -> Result<TranslateResponse> {
        let page_size = self.config.determine_page_size(request.page_size);
        let statements = self.paged_statements(&request, page_size).await?;
        Ok(TranslateResponse {
            rows: statements.rows,
            count: statements.count,
        })
    }

    async fn paged_statements(
        &self,
        request: &DataQueryRequest,
        page_size: u64,
    ) -> Result<PagedStatements> {
        let columns = SANITIZER.columns(request.columns.as_deref().unwrap_or_default())?;
        let filter = FilterTranslator::new(&SANITIZER).translate(request.filters.as_ref())?;
        let sort = resolve_sort(&SANITIZER, &request.sort)?;
        let source = self
            .resolve_source(request.data_source_id, request.table_name.as_deref())
            .await?;

        QueryEnvelope {
            source,
            columns,
            filter,
            sort,
        }
        .paged(request.page, page_size)
    }

    pub async fn aggregate_data(&self, request: AggregationRequest) -> Result<AggregationTable> {
        let started = Instant::now();
        if request.aggregations.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "at least one aggregation is required".into(),
            ));
        }

        let time_bucket = match (&request.time_column, &request.time_granularity) {
            (Some(column), Some(granularity)) => Some(time::bucket_column(
                &SANITIZER.column(column)?,
                granularity,
            )),
            _ => None,
        };
        let group_by = SANITIZER.columns(&request.group_by)?;
        let aggregations = resolve_aggregations(&SANITIZER, &request.aggregations)?;
        let filter = FilterTranslator::new(&SANITIZER).translate(request.filters.as_ref())?;
        let sort = resolve_sort(&SANITIZER, &request.sort)?;

        // Source lookup is a store call; validate the plan first.
        let mut plan = AggregationPlan {
            source: Source::Derived(String::new()),
            filter,
            time_bucket,
            group_by,
            aggregations,
            sort,
            limit: self
                .config
                .determine_limit(request.limit, self.config.default_limit),
        };
        plan.validate()?;
        plan.source = self
            .resolve_source(request.data_source_id, request.table_name.as_deref())
            .await?;

        let statement = plan.statement()?;
        let result = self.executor.fetch_all(&statement).await?;
        Ok(reshape::aggregation_table(
            plan.output_columns(),
            result,
            started,
        ))
    }

    pub async fn chart_data(&self, request: ChartDataRequest) -> Result<ChartData> {
        let started = Instant::now();
        if request.y_columns.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "at least one y column is required".into(),
            ));
        }

        let x_column = SANITIZER.column(&request.x_column)?;
        let x = match &request.time_granularity {
            Some(granularity) => time::bucket_column(&x_column, granularity),
            None => Expr::column(&x_column),
        };
        let series_by = request
            .series_by
            .as_deref()
            .map(|column| SANITIZER.column(column))
            .transpose()?;
        let y_columns = SANITIZER.columns(&request.y_columns)?;
        let filter = FilterTranslator::new(&SANITIZER).translate(request.filters.as_ref())?;

        let mut plan = ChartPlan {
            source: Source::Derived(String::new()),
            filter,
            x,
            series_by,
            limit: self
                .config
                .determine_limit(request.limit, self.config.default_limit),
        };
        plan.validate(&y_columns)?;
        plan.source = self
            .resolve_source(request.data_source_id, request.table_name.as_deref())
            .await?;

        let statements = y_columns
            .iter()
            .enumerate()
            .map(|(index, y)| {
                let function = request
                    .y_aggregations
                    .as_ref()
                    .and_then(|functions| functions.get(index).copied())
                    .unwrap_or(AggregationFunction::Avg);
                plan.statement(function, y)
            })
            .collect::<Result<Vec<_>>>()?;

        let results = try_join_all(
            statements
                .iter()
                .map(|statement| self.executor.fetch_all(statement)),
        )
        .await?;

        let multi = y_columns.len() > 1;
        let mut series = Vec::new();
        for (y, result) in y_columns.iter().zip(results) {
            if plan.series_by.is_some() {
                let prefix = multi.then_some(y.name());
                series.extend(reshape::split_series(&result.rows, prefix));
            } else {
                series.push(reshape::single_series(y.name(), &result.rows));
            }
        }

        Ok(ChartData {
            chart_type: request.chart_type,
            total_points: reshape::total_points(&series),
            series,
            x_axis_label: Some(request.x_column.clone()),
            y_axis_label: (!multi).then(|| request.y_columns[0].clone()),
            query_time_ms: reshape::elapsed_ms(started),
        })
    }

    pub async fn export_data(&self, request: ExportRequest) -> Result<ExportResponse> {
        let columns = SANITIZER.columns(request.columns.as_deref().unwrap_or_default())?;
        let filter = FilterTranslator::new(&SANITIZER).translate(request.filters.as_ref())?;
        let sort = resolve_sort(&SANITIZER, &request.sort)?;
        let source = self
            .resolve_source(request.data_source_id, request.table_name.as_deref())
            .await?;

        let statement = QueryEnvelope {
            source,
            columns,
            filter,
            sort,
        }
        .export(request.limit.map(|limit| limit.max(1)))?;
        let result = self.executor.fetch_all(&statement).await?;

        let names = result.column_names();
        let encoded = export::encode(request.format, &names, &names, &result.rows)?;
        let file_stem = format!(
            "export_{}_{}",
            &Uuid::new_v4().simple().to_string()[..8],
            Utc::now().format("%Y%m%d_%H%M%S")
        );

        export::publish(
            self.storage.as_ref(),
            EXPORT_PREFIX,
            &file_stem,
            encoded,
            result.rows.len(),
            self.config.export_url_ttl,
        )
        .await
    }

    /// A direct table name wins; otherwise the data source record is looked up.
    async fn resolve_source(
        &self,
        data_source_id: Option<Uuid>,
        table_name: Option<&str>,
    ) -> Result<Source> {
        if let Some(table) = table_name.filter(|name| !name.trim().is_empty()) {
            return Ok(Source::Table(Identifier::parse_qualified(table)?));
        }
        let Some(id) = data_source_id else {
            return Err(ServiceError::MissingSource);
        };

        let statement = Select::from(Source::Table(Identifier::parse("data_sources")?))
            .column(Expr::Column(Identifier::parse("table_name")?))
            .column(Expr::Column(Identifier::parse("query")?))
            .filter(Some(Predicate::Compare {
                expr: Expr::Column(Identifier::parse("id")?),
                op: CompareOp::Eq,
                param: Param::new("source_id", id.to_string()),
            }))
            .limit(1)
            .render()?;

        let Some(row) = self.executor.fetch_one(&statement).await? else {
            debug!(%id, "data source not found");
            return Err(ServiceError::MissingSource);
        };

        let stored: StoredSource = serde_json::from_value(Value::Object(row)).map_err(|err| {
            warn!(%id, error = %err, "malformed data source record");
            ServiceError::MissingSource
        })?;

        match (stored.table_name, stored.query) {
            (Some(table), _) if !table.trim().is_empty() => {
                Ok(Source::Table(Identifier::parse_qualified(table.trim())?))
            }
            (_, Some(query)) if !query.trim().is_empty() => {
                Ok(Source::Derived(query.trim().to_string()))
            }
            _ => Err(ServiceError::MissingSource),
        }
    }
}
