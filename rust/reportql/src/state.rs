use crate::{
    config::AppConfig,
    query::{
        dimensions::DimensionService, reports::ReportService, tables::TableService, QueryEngine,
    },
    store::{ObjectStorage, QueryExecutor},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
    pub reports: ReportService,
    pub dimensions: DimensionService,
    pub tables: TableService,
}

impl AppState {
    /// Every service shares the same executor and storage handles.
    pub fn new(
        config: Arc<AppConfig>,
        executor: Arc<dyn QueryExecutor>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            query: QueryEngine::new(
                Arc::clone(&executor),
                Arc::clone(&storage),
                Arc::clone(&config),
            ),
            reports: ReportService::new(
                Arc::clone(&executor),
                storage,
                Arc::clone(&config),
            ),
            dimensions: DimensionService::new(Arc::clone(&executor)),
            tables: TableService::new(executor, Arc::clone(&config)),
            config,
        }
    }
}
