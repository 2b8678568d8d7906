use crate::{
    cache::{CacheReconciler, CacheStore, ContainerSource},
    config::AppConfig,
    query::{catalog::Catalog, QueryExecutor, QueryService, SqlBackend},
    templates::{TagRepository, TemplateExecutor, TemplateRepository, TemplateService},
    time::Clock,
};
use std::sync::Arc;

/// External collaborators the service is assembled from.
pub struct Backends {
    pub sql: Arc<dyn SqlBackend>,
    pub templates: Arc<dyn TemplateRepository>,
    pub tags: Arc<dyn TagRepository>,
    pub cache: Arc<dyn CacheStore>,
    pub containers: Arc<dyn ContainerSource>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryService,
    pub catalog: Catalog,
    pub templates: TemplateService,
    pub template_executor: TemplateExecutor,
    pub cache: CacheReconciler,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, backends: Backends) -> Self {
        let executor = QueryExecutor::new(Arc::clone(&backends.sql));
        let query = QueryService::new(&config.query, executor.clone());
        let catalog = Catalog::new(Arc::clone(&backends.sql), config.catalog_schema.clone());
        let templates = TemplateService::new(
            backends.templates,
            backends.tags,
            Arc::clone(&backends.clock),
        );
        let template_executor = TemplateExecutor::new(templates.clone(), executor, query.limits());
        let cache = CacheReconciler::new(
            backends.containers,
            backends.cache,
            config.cache.scan_page_size,
        );

        Self {
            config,
            query,
            catalog,
            templates,
            template_executor,
            cache,
            clock: backends.clock,
        }
    }
}
