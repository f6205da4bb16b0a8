//! S&OP reports over the `sop_facts` fact table.
//!
//! Column names are checked against a fixed allow-list, and report filters are
//! a typed structure rather than free-form conditions.

use super::{
    assemble::{
        resolve_sort, AggregateColumn, AggregationPlan, ChartPlan, QueryEnvelope, SortKey,
        TOTAL_ALIAS,
    },
    reshape::{self, AggregationTable, ChartData, PagedRows},
};
use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    export::{self, ExportFormat, ExportResponse},
    models::{AggregationFunction, ChartType, Logic, SortOrder, SortSpec},
    pagination::PageMeta,
    sql::{BindParam, Expr, Identifier, Param, Predicate, Sanitizer, Select, Source, Statement},
    store::{ObjectStorage, QueryExecutor, Row},
    time,
};
use chrono::Utc;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tracing::debug;

pub const FACT_TABLE: &str = "sop_facts";
const EXPORT_PREFIX: &str = "exports/sop";
const CHART_DEFAULT_LIMIT: u64 = 100;

pub const COLUMN_LABELS: &[(&str, &str)] = &[
    ("model", "Модель"),
    ("priznak", "Признак"),
    ("driver", "Драйвер"),
    ("finkod_code", "Финкод Код"),
    ("finkod_name", "Финкод код_назв"),
    ("category_code", "Категория"),
    ("category_name", "Категория название"),
    ("macroregion_code", "Макрорегион код"),
    ("macroregion_name", "Макрорегион название"),
    ("territory", "Территория название"),
    ("year", "Год"),
    ("month", "Месяц"),
    ("unit", "ЕИ"),
    ("value", "Прогноз"),
];

const ALLOWED_COLUMNS: &[&str] = &[
    "model",
    "priznak",
    "driver",
    "finkod_code",
    "finkod_name",
    "category_code",
    "category_name",
    "macroregion_code",
    "macroregion_name",
    "territory",
    "year",
    "month",
    "unit",
    "value",
    "id",
    "created_at",
    "updated_at",
];

const SEARCH_COLUMNS: [&str; 4] = [
    "finkod_name",
    "category_name",
    "macroregion_name",
    "territory",
];

pub const SANITIZER: Sanitizer = Sanitizer::AllowList(ALLOWED_COLUMNS);

pub fn label(column: &str) -> Option<&'static str> {
    COLUMN_LABELS
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(_, label)| *label)
}

fn display_name(column: &str) -> String {
    label(column).unwrap_or(column).to_string()
}

fn ident(name: &str) -> Result<Identifier> {
    Identifier::parse(name)
}

fn fact_table() -> Result<Source> {
    Ok(Source::Table(ident(FACT_TABLE)?))
}

fn labelled_columns() -> Vec<String> {
    COLUMN_LABELS
        .iter()
        .map(|(name, _)| name.to_string())
        .collect()
}

/// `year DESC, month ASC` unless the caller asked for something else.
fn report_sort(sort: &[SortSpec]) -> Result<Vec<SortKey>> {
    if !sort.is_empty() {
        return resolve_sort(&SANITIZER, sort);
    }
    Ok(vec![
        SortKey {
            column: ident("year")?,
            order: SortOrder::Desc,
        },
        SortKey {
            column: ident("month")?,
            order: SortOrder::Asc,
        },
    ])
}

/// Typed report filters. Absent or empty lists do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportFilters {
    pub years: Option<Vec<i64>>,
    pub months: Option<Vec<i64>>,
    pub priznaks: Option<Vec<String>>,
    pub drivers: Option<Vec<String>>,
    pub finkod_codes: Option<Vec<String>>,
    /// Code prefixes: `A` matches `AA`, `A1`, ...
    pub finkod_groups: Option<Vec<String>>,
    pub category_codes: Option<Vec<String>>,
    pub territories: Option<Vec<String>>,
    pub macroregion_codes: Option<Vec<String>>,
    pub units: Option<Vec<String>>,
    pub search: Option<String>,
}

fn in_list<T>(column: &str, name: &str, values: Option<&[T]>) -> Result<Option<Predicate>>
where
    T: Clone + Into<BindParam>,
{
    match values {
        Some(values) if !values.is_empty() => Ok(Some(Predicate::InList {
            expr: Expr::Column(ident(column)?),
            negated: false,
            param: Param::new(name, values.to_vec()),
        })),
        _ => Ok(None),
    }
}

impl ReportFilters {
    pub fn predicate(&self) -> Result<Option<Predicate>> {
        let mut clauses = Vec::new();

        clauses.extend(in_list("year", "years", self.years.as_deref())?);
        clauses.extend(in_list("month", "months", self.months.as_deref())?);
        clauses.extend(in_list("priznak", "priznaks", self.priznaks.as_deref())?);
        clauses.extend(in_list("driver", "drivers", self.drivers.as_deref())?);
        clauses.extend(in_list("finkod_code", "finkod_codes", self.finkod_codes.as_deref())?);

        if let Some(groups) = self.finkod_groups.as_ref().filter(|g| !g.is_empty()) {
            let finkod = ident("finkod_code")?;
            let prefixes = groups
                .iter()
                .enumerate()
                .map(|(index, group)| Predicate::StartsWith {
                    expr: Expr::column(&finkod),
                    param: Param::new(format!("finkod_group_{index}"), group.as_str()),
                })
                .collect();
            clauses.extend(Predicate::group(Logic::Or, prefixes));
        }

        clauses.extend(in_list(
            "category_code",
            "category_codes",
            self.category_codes.as_deref(),
        )?);
        clauses.extend(in_list("territory", "territories", self.territories.as_deref())?);
        clauses.extend(in_list(
            "macroregion_code",
            "macroregion_codes",
            self.macroregion_codes.as_deref(),
        )?);
        clauses.extend(in_list("unit", "units", self.units.as_deref())?);

        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{search}%");
            let matches = SEARCH_COLUMNS
                .iter()
                .map(|column| {
                    Ok(Predicate::ILike {
                        expr: Expr::Column(ident(column)?),
                        param: Param::new("search", pattern.as_str()),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            clauses.extend(Predicate::group(Logic::Or, matches));
        }

        Ok(Predicate::group(Logic::And, clauses))
    }
}

fn default_page() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportQueryRequest {
    #[serde(default)]
    pub filters: Option<ReportFilters>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default)]
    pub page_size: Option<u64>,
}

fn default_aggregations() -> Vec<AggregationFunction> {
    vec![AggregationFunction::Sum]
}

fn default_value_column() -> String {
    "value".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportAggregateRequest {
    #[serde(default)]
    pub filters: Option<ReportFilters>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default = "default_aggregations")]
    pub aggregations: Vec<AggregationFunction>,
    #[serde(default = "default_value_column")]
    pub value_column: String,
    /// `month`, `quarter` or `year`, applied to the period date.
    #[serde(default)]
    pub time_granularity: Option<String>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub limit: Option<u64>,
}

fn default_chart_aggregation() -> AggregationFunction {
    AggregationFunction::Sum
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportChartRequest {
    #[serde(default)]
    pub filters: Option<ReportFilters>,
    #[serde(default)]
    pub chart_type: ChartType,
    pub x_axis: String,
    #[serde(default = "default_value_column")]
    pub y_axis: String,
    #[serde(default)]
    pub series_by: Option<String>,
    #[serde(default = "default_chart_aggregation")]
    pub aggregation: AggregationFunction,
    #[serde(default)]
    pub time_granularity: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportExportRequest {
    #[serde(default)]
    pub filters: Option<ReportFilters>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionValue {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_code: Option<String>,
}

impl DimensionValue {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            code: text(row.get("code")),
            name: text(row.get("name")),
            count: row.get("count").and_then(count_value),
            parent_code: row
                .get("parent_code")
                .filter(|value| !value.is_null())
                .map(|value| text(Some(value))),
        }
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn count_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOptions {
    pub years: Vec<Value>,
    pub territories: Vec<DimensionValue>,
    pub macroregions: Vec<DimensionValue>,
    pub categories: Vec<DimensionValue>,
    pub finkod_codes: Vec<DimensionValue>,
    pub drivers: Vec<DimensionValue>,
    pub priznaks: Vec<DimensionValue>,
    pub units: Vec<DimensionValue>,
}

/// One option list: code/name (and parent) columns with a row count.
struct OptionList {
    code: &'static str,
    name: &'static str,
    parent: Option<&'static str>,
    order: &'static [&'static str],
}

const OPTION_LISTS: [OptionList; 7] = [
    OptionList {
        code: "territory",
        name: "territory",
        parent: None,
        order: &["territory"],
    },
    OptionList {
        code: "macroregion_code",
        name: "macroregion_name",
        parent: Some("territory"),
        order: &["territory", "macroregion_name"],
    },
    OptionList {
        code: "category_code",
        name: "category_name",
        parent: None,
        order: &["category_name"],
    },
    OptionList {
        code: "finkod_code",
        name: "finkod_code",
        parent: None,
        order: &["finkod_code"],
    },
    OptionList {
        code: "driver",
        name: "driver",
        parent: None,
        order: &["driver"],
    },
    OptionList {
        code: "priznak",
        name: "priznak",
        parent: None,
        order: &["priznak"],
    },
    OptionList {
        code: "unit",
        name: "unit",
        parent: None,
        order: &["unit"],
    },
];

impl OptionList {
    fn statement(&self, filter: Option<Predicate>) -> Result<Statement> {
        let code = ident(self.code)?;
        let name = ident(self.name)?;

        let mut select = Select::from(fact_table()?)
            .column_as(Expr::column(&code), ident("code")?)
            .column_as(Expr::column(&name), ident("name")?);
        let mut keys = vec![code.clone()];
        if name != code {
            keys.push(name);
        }
        if let Some(parent) = self.parent {
            let parent = ident(parent)?;
            select = select.column_as(Expr::column(&parent), ident("parent_code")?);
            keys.push(parent);
        }

        select = select
            .column_as(Expr::CountAll, ident("count")?)
            .filter(filter);
        for key in &keys {
            select = select.group_by(Expr::column(key));
        }
        for column in self.order {
            select = select.order_by(Expr::Column(ident(column)?), SortOrder::Asc);
        }
        select.render()
    }
}

pub(crate) fn years_statement(filter: Option<Predicate>) -> Result<Statement> {
    let year = ident("year")?;
    Select::from(fact_table()?)
        .distinct()
        .column(Expr::column(&year))
        .filter(filter)
        .order_by(Expr::column(&year), SortOrder::Desc)
        .render()
}

#[derive(Clone)]
pub struct ReportService {
    executor: Arc<dyn QueryExecutor>,
    storage: Arc<dyn ObjectStorage>,
    config: Arc<AppConfig>,
}

impl ReportService {
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

    pub async fn query(&self, request: ReportQueryRequest) -> Result<PagedRows> {
        let started = Instant::now();
        let page_size = self.config.determine_page_size(request.page_size);
        let requested = request.columns.unwrap_or_else(labelled_columns);

        let statements = QueryEnvelope {
            source: fact_table()?,
            columns: SANITIZER.columns(&requested)?,
            filter: predicate(request.filters.as_ref())?,
            sort: report_sort(&request.sort)?,
        }
        .paged(request.page, page_size)?;

        let (rows, count) = tokio::try_join!(
            self.executor.fetch_all(&statements.rows),
            self.executor.fetch_all(&statements.count),
        )?;
        let total = count.first_u64(TOTAL_ALIAS).unwrap_or_default();

        Ok(reshape::paged_rows(
            rows,
            PageMeta::new(total, request.page, page_size),
            |name| Some(display_name(name)),
            started,
        ))
    }

    /// Option lists for every filterable dimension, scoped by `filters`.
    pub async fn filter_options(&self, filters: Option<&ReportFilters>) -> Result<FilterOptions> {
        let filter = predicate(filters)?;

        let mut statements = vec![years_statement(filter.clone())?];
        for list in &OPTION_LISTS {
            statements.push(list.statement(filter.clone())?);
        }

        let mut results = try_join_all(
            statements
                .iter()
                .map(|statement| self.executor.fetch_all(statement)),
        )
        .await?
        .into_iter();

        let years = results
            .next()
            .map(|result| {
                result
                    .rows
                    .into_iter()
                    .filter_map(|mut row| row.remove("year"))
                    .collect()
            })
            .unwrap_or_default();
        let mut lists = results.map(|result| {
            result
                .rows
                .iter()
                .map(DimensionValue::from_row)
                .collect::<Vec<_>>()
        });
        let mut next = || lists.next().unwrap_or_default();

        Ok(FilterOptions {
            years,
            territories: next(),
            macroregions: next(),
            categories: next(),
            finkod_codes: next(),
            drivers: next(),
            priznaks: next(),
            units: next(),
        })
    }

    pub async fn aggregate(&self, request: ReportAggregateRequest) -> Result<AggregationTable> {
        let started = Instant::now();
        if request.aggregations.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "at least one aggregation is required".into(),
            ));
        }

        let value = SANITIZER.column(&request.value_column)?;
        let aggregations = request
            .aggregations
            .iter()
            .map(|function| {
                let expr = match function {
                    AggregationFunction::Count => Expr::CountAll,
                    other => Expr::aggregate(*other, Expr::column(&value)),
                };
                Ok(AggregateColumn {
                    expr,
                    alias: ident(&format!("{function}_{}", value.name()))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let time_bucket = match request.time_granularity.as_deref() {
            Some(granularity) => Some(time::bucket(period_date()?, granularity)),
            None => None,
        };

        let plan = AggregationPlan {
            source: fact_table()?,
            filter: predicate(request.filters.as_ref())?,
            time_bucket,
            group_by: SANITIZER.columns(&request.group_by)?,
            aggregations,
            sort: resolve_sort(&SANITIZER, &request.sort)?,
            limit: self
                .config
                .determine_limit(request.limit, self.config.default_limit),
        };

        let statement = plan.statement()?;
        let result = self.executor.fetch_all(&statement).await?;
        Ok(reshape::aggregation_table(
            plan.output_columns(),
            result,
            started,
        ))
    }

    pub async fn chart(&self, request: ReportChartRequest) -> Result<ChartData> {
        let started = Instant::now();

        let x_column = SANITIZER.column(&request.x_axis)?;
        let y_column = SANITIZER.column(&request.y_axis)?;
        let series_by = request
            .series_by
            .as_deref()
            .map(|column| SANITIZER.column(column))
            .transpose()?;
        let x = match request.time_granularity.as_deref() {
            Some(granularity) => time::bucket(period_date()?, granularity),
            None => Expr::column(&x_column),
        };

        let plan = ChartPlan {
            source: fact_table()?,
            filter: predicate(request.filters.as_ref())?,
            x,
            series_by,
            limit: self
                .config
                .determine_limit(request.limit, CHART_DEFAULT_LIMIT),
        };
        let statement = plan.statement(request.aggregation, &y_column)?;
        let result = self.executor.fetch_all(&statement).await?;

        let y_label = display_name(&request.y_axis);
        let series = if plan.series_by.is_some() {
            reshape::split_series(&result.rows, None)
        } else {
            vec![reshape::single_series(y_label.clone(), &result.rows)]
        };

        Ok(ChartData {
            chart_type: request.chart_type,
            total_points: reshape::total_points(&series),
            series,
            x_axis_label: Some(display_name(&request.x_axis)),
            y_axis_label: Some(y_label),
            query_time_ms: reshape::elapsed_ms(started),
        })
    }

    /// Writes matching rows with display-name headers and returns a download URL.
    pub async fn export(&self, request: ReportExportRequest) -> Result<ExportResponse> {
        let requested = request.columns.unwrap_or_else(labelled_columns);

        let statement = QueryEnvelope {
            source: fact_table()?,
            columns: SANITIZER.columns(&requested)?,
            filter: predicate(request.filters.as_ref())?,
            sort: report_sort(&request.sort)?,
        }
        .export(request.limit.map(|limit| limit.max(1)))?;
        let result = self.executor.fetch_all(&statement).await?;
        debug!(rows = result.rows.len(), "report export fetched");

        let headers: Vec<String> = requested.iter().map(|name| display_name(name)).collect();
        let encoded = export::encode(request.format, &requested, &headers, &result.rows)?;
        let file_stem = format!("sop_export_{}", Utc::now().format("%Y%m%d_%H%M%S"));

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
}

fn predicate(filters: Option<&ReportFilters>) -> Result<Option<Predicate>> {
    match filters {
        Some(filters) => filters.predicate(),
        None => Ok(None),
    }
}

fn period_date() -> Result<Expr> {
    Ok(Expr::PeriodDate {
        year: ident("year")?,
        month: ident("month")?,
    })
}
