use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    export::ExportResponse,
    query::{
        dimensions::{DimensionKind, DimensionQuery},
        reports::{
            FilterOptions, ReportAggregateRequest, ReportChartRequest, ReportExportRequest,
            ReportFilters, ReportQueryRequest,
        },
        reshape::{AggregationTable, ChartData, PagedRows},
        tables::{TableColumn, TableMetadata, TableQuery, TableSample},
        AggregationRequest, ChartDataRequest, DataQueryRequest, ExportRequest, TranslateResponse,
    },
    state::AppState,
    store::{ClickHouseExecutor, ObjectStorage, QueryExecutor, S3Storage},
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Body and query-string extraction failures surface as `ServiceError`s once
/// the caller is authenticated.
type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;
type QueryString<T> = std::result::Result<Query<T>, QueryRejection>;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let executor = ClickHouseExecutor::new(&config.clickhouse, config.request_timeout)?;
        let storage = S3Storage::new(&config.storage)?;
        info!(
            clickhouse = %config.clickhouse.url,
            bucket = %config.storage.bucket,
            "store clients configured"
        );
        Ok(Self::with_services(
            config,
            Arc::new(executor),
            Arc::new(storage),
        ))
    }

    /// Builds the server around already constructed store clients.
    pub fn with_services(
        config: AppConfig,
        executor: Arc<dyn QueryExecutor>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), executor, storage);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/v1/data/query", post(Self::query_data))
            .route("/api/v1/data/aggregate", post(Self::aggregate_data))
            .route("/api/v1/data/chart", post(Self::chart_data))
            .route("/api/v1/data/export", post(Self::export_data))
            .route("/api/v1/data/translate", post(Self::translate))
            .route("/api/v1/reports/query", post(Self::report_query))
            .route("/api/v1/reports/filters", get(Self::report_filters))
            .route(
                "/api/v1/reports/filters/scoped",
                post(Self::report_filters_scoped),
            )
            .route("/api/v1/reports/aggregate", post(Self::report_aggregate))
            .route("/api/v1/reports/chart", post(Self::report_chart))
            .route("/api/v1/reports/export", post(Self::report_export))
            .route("/api/v1/dimensions/:kind", get(Self::dimension))
            .route("/api/v1/tables", get(Self::list_tables))
            .route("/api/v1/tables/:name", get(Self::table_metadata))
            .route("/api/v1/tables/:name/columns", get(Self::table_columns))
            .route("/api/v1/tables/:name/sample", get(Self::table_sample))
            .with_state(self.state.clone())
            .layer(cors_layer(self.config.allowed_origins.as_deref()))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "reportql listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
    }

    async fn query_data(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<DataQueryRequest>,
    ) -> Result<Json<PagedRows>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.query.query_data(request).await?))
    }

    async fn aggregate_data(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<AggregationRequest>,
    ) -> Result<Json<AggregationTable>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.query.aggregate_data(request).await?))
    }

    async fn chart_data(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<ChartDataRequest>,
    ) -> Result<Json<ChartData>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.query.chart_data(request).await?))
    }

    async fn export_data(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<ExportRequest>,
    ) -> Result<Json<ExportResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.query.export_data(request).await?))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<DataQueryRequest>,
    ) -> Result<Json<TranslateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.query.translate(request).await?))
    }

    async fn report_query(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<ReportQueryRequest>,
    ) -> Result<Json<PagedRows>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.reports.query(request).await?))
    }

    async fn report_filters(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<FilterOptions>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.reports.filter_options(None).await?))
    }

    async fn report_filters_scoped(
        State(state): State<AppState>,
        headers: HeaderMap,
        filters: JsonBody<ReportFilters>,
    ) -> Result<Json<FilterOptions>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(filters) = filters?;
        Ok(Json(state.reports.filter_options(Some(&filters)).await?))
    }

    async fn report_aggregate(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<ReportAggregateRequest>,
    ) -> Result<Json<AggregationTable>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.reports.aggregate(request).await?))
    }

    async fn report_chart(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<ReportChartRequest>,
    ) -> Result<Json<ChartData>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.reports.chart(request).await?))
    }

    async fn report_export(
        State(state): State<AppState>,
        headers: HeaderMap,
        request: JsonBody<ReportExportRequest>,
    ) -> Result<Json<ExportResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let Json(request) = request?;
        Ok(Json(state.reports.export(request).await?))
    }

    async fn dimension(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(kind): Path<String>,
        query: QueryString<DimensionQuery>,
    ) -> Result<Json<Vec<Value>>> {
        enforce_api_key(&headers, &state.config)?;
        let Query(query) = query?;
        let kind: DimensionKind = kind.parse()?;
        Ok(Json(state.dimensions.list(kind, &query).await?))
    }

    async fn list_tables(
        State(state): State<AppState>,
        headers: HeaderMap,
        query: QueryString<TableQuery>,
    ) -> Result<Json<Vec<TableMetadata>>> {
        enforce_api_key(&headers, &state.config)?;
        let Query(query) = query?;
        Ok(Json(state.tables.list(query.database.as_deref()).await?))
    }

    async fn table_metadata(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(name): Path<String>,
        query: QueryString<TableQuery>,
    ) -> Result<Json<TableMetadata>> {
        enforce_api_key(&headers, &state.config)?;
        let Query(query) = query?;
        let metadata = state
            .tables
            .metadata(&name, query.database.as_deref())
            .await?;
        Ok(Json(metadata))
    }

    async fn table_columns(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(name): Path<String>,
        query: QueryString<TableQuery>,
    ) -> Result<Json<Vec<TableColumn>>> {
        enforce_api_key(&headers, &state.config)?;
        let Query(query) = query?;
        let columns = state
            .tables
            .columns(&name, query.database.as_deref())
            .await?;
        Ok(Json(columns))
    }

    async fn table_sample(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(name): Path<String>,
        query: QueryString<TableQuery>,
    ) -> Result<Json<TableSample>> {
        enforce_api_key(&headers, &state.config)?;
        let Query(query) = query?;
        Ok(Json(state.tables.sample(&name, query.limit).await?))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}

/// Any origin when none are configured; otherwise only the listed ones.
fn cors_layer(origins: Option<&[String]>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(origins) => {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match origin.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(origin = %origin, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            layer.allow_origin(parsed)
        }
        None => layer.allow_origin(Any),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
