use crate::{
    cache::{CacheSyncResult, RedisCacheStore, SqlContainerSource, SyncScheduler},
    config::AppConfig,
    db,
    error::{Result, ServiceError},
    extract::{ApiJson, ApiPath, ApiQuery},
    models::{QueryTag, QueryTemplate, TagSummary, TemplateSummary},
    pagination::PageParams,
    query::{
        catalog::{ObjectKind, TableInfo, TableMetadata},
        postgres::PgBackend,
        PagedResult, QueryRequest, QueryResponse, SqlBackend,
    },
    state::{AppState, Backends},
    templates::{PgTemplateStore, TagRequest, TemplateDto, TemplateExecuteRequest},
    time::{CronSchedule, SystemClock},
};
use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SchemaParams {
    schema: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: DateTime<Utc>,
    database: &'static str,
    cache: &'static str,
}

impl Server {
    /// Connects the database pools and the cache store described by `config`.
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let client_pool = db::connect_client_pool(&config).await?;
        let template_pool = db::connect_template_pool(&config).await?;
        let cache = RedisCacheStore::connect(&config.cache.valkey_url)
            .await
            .context("failed to connect to the Valkey cache")?;

        let sql: Arc<dyn SqlBackend> = Arc::new(PgBackend::new(client_pool));
        let store = Arc::new(PgTemplateStore::new(template_pool));
        let containers = Arc::new(SqlContainerSource::new(
            Arc::clone(&sql),
            config.cache.source_query.clone(),
        ));
        let backends = Backends {
            sql,
            templates: store.clone(),
            tags: store,
            cache: Arc::new(cache),
            containers,
            clock: Arc::new(SystemClock),
        };

        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), backends);
        Ok(Self { config, state })
    }

    pub fn from_state(state: AppState) -> Self {
        Self {
            config: Arc::clone(&state.config),
            state,
        }
    }

    pub fn router(&self) -> Router {
        let protected = Router::new()
            .route("/api/query/execute", post(Self::execute))
            .route("/api/query/execute/paged", post(Self::execute_paged))
            .route(
                "/api/query/templates",
                get(Self::list_templates).post(Self::create_template),
            )
            .route("/api/query/templates/execute", post(Self::execute_template))
            .route(
                "/api/query/templates/:id",
                get(Self::get_template)
                    .put(Self::update_template)
                    .delete(Self::delete_template),
            )
            .route("/api/query/templates/:id/tag", post(Self::create_tag))
            .route("/api/query/templates/:id/tags", get(Self::list_tags))
            .route(
                "/api/query/tags/:id",
                get(Self::get_tag).delete(Self::delete_tag),
            )
            .route("/api/cache/containers", post(Self::sync_containers))
            .route("/api/tables", get(Self::list_tables))
            .route("/api/tables/views", get(Self::list_views))
            .route("/api/metadata/table/:name", get(Self::describe_table))
            .route("/api/metadata/view/:name", get(Self::describe_view))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_api_key,
            ));

        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/health", get(Self::health))
            .merge(protected)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serves HTTP and runs the cache scheduler until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let schedule = CronSchedule::parse(&self.config.cache.cron_expression)
            .context("invalid cache sync schedule")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = SyncScheduler::new(
            Arc::new(self.state.cache.clone()),
            schedule,
            Arc::clone(&self.state.clock),
        )
        .enabled(self.config.cache.scheduler_enabled)
        .spawn(shutdown_rx);

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "querygate listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to listen for shutdown signal");
                }
                info!("shutdown requested");
            })
            .await?;

        let _ = shutdown_tx.send(true);
        scheduler.await.context("cache scheduler task panicked")?;
        Ok(())
    }

    async fn health(State(state): State<AppState>) -> impl IntoResponse {
        let database = state.query.executor().backend().ping().await;
        let cache = state.cache.store().ping().await;
        if let Err(err) = &database {
            warn!(error = %err, "health check: database unreachable");
        }
        if let Err(err) = &cache {
            warn!(error = %err, "health check: cache unreachable");
        }

        let healthy = database.is_ok() && cache.is_ok();
        let body = HealthBody {
            status: if healthy { "Healthy" } else { "Unhealthy" },
            timestamp: state.clock.now(),
            database: if database.is_ok() { "Connected" } else { "Disconnected" },
            cache: if cache.is_ok() { "Connected" } else { "Disconnected" },
        };
        let status = if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, Json(body))
    }

    async fn execute(
        State(state): State<AppState>,
        ApiJson(request): ApiJson<QueryRequest>,
    ) -> Result<Json<QueryResponse>> {
        Ok(Json(state.query.execute(&request).await?))
    }

    async fn execute_paged(
        State(state): State<AppState>,
        ApiQuery(page): ApiQuery<PageParams>,
        ApiJson(request): ApiJson<QueryRequest>,
    ) -> Result<Json<PagedResult>> {
        Ok(Json(state.query.execute_paged(&request, page).await?))
    }

    async fn list_templates(
        State(state): State<AppState>,
        ApiQuery(params): ApiQuery<ListParams>,
    ) -> Result<Json<Vec<TemplateSummary>>> {
        Ok(Json(state.templates.list_summaries(params.active_only).await?))
    }

    async fn get_template(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
    ) -> Result<Json<QueryTemplate>> {
        Ok(Json(state.templates.get_by_id(id).await?))
    }

    async fn create_template(
        State(state): State<AppState>,
        ApiJson(dto): ApiJson<TemplateDto>,
    ) -> Result<(StatusCode, Json<QueryTemplate>)> {
        let created = state.templates.create(&dto).await?;
        Ok((StatusCode::CREATED, Json(created)))
    }

    async fn update_template(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
        ApiJson(dto): ApiJson<TemplateDto>,
    ) -> Result<Json<QueryTemplate>> {
        Ok(Json(state.templates.update(id, &dto).await?))
    }

    async fn delete_template(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
    ) -> Result<StatusCode> {
        state.templates.delete(id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn create_tag(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
        ApiJson(request): ApiJson<TagRequest>,
    ) -> Result<(StatusCode, Json<QueryTag>)> {
        let tag = state.templates.create_tag(id, &request).await?;
        Ok((StatusCode::CREATED, Json(tag)))
    }

    async fn list_tags(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
    ) -> Result<Json<Vec<TagSummary>>> {
        Ok(Json(state.templates.tags(id).await?))
    }

    async fn get_tag(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
    ) -> Result<Json<QueryTag>> {
        Ok(Json(state.templates.tag(id).await?))
    }

    async fn delete_tag(
        State(state): State<AppState>,
        ApiPath(id): ApiPath<i32>,
    ) -> Result<StatusCode> {
        state.templates.delete_tag(id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn execute_template(
        State(state): State<AppState>,
        ApiJson(request): ApiJson<TemplateExecuteRequest>,
    ) -> Result<Json<QueryResponse>> {
        Ok(Json(state.template_executor.execute(&request).await?))
    }

    async fn sync_containers(
        State(state): State<AppState>,
    ) -> Result<Json<CacheSyncResult>> {
        Ok(Json(state.cache.reconcile().await?))
    }

    async fn list_tables(
        State(state): State<AppState>,
    ) -> Result<Json<Vec<TableInfo>>> {
        Ok(Json(state.catalog.list_tables().await?))
    }

    async fn list_views(
        State(state): State<AppState>,
    ) -> Result<Json<Vec<TableInfo>>> {
        Ok(Json(state.catalog.list_views().await?))
    }

    async fn describe_table(
        State(state): State<AppState>,
        ApiPath(name): ApiPath<String>,
        ApiQuery(params): ApiQuery<SchemaParams>,
    ) -> Result<Json<TableMetadata>> {
        let metadata = state
            .catalog
            .describe(ObjectKind::Table, &name, params.schema.as_deref())
            .await?;
        Ok(Json(metadata))
    }

    async fn describe_view(
        State(state): State<AppState>,
        ApiPath(name): ApiPath<String>,
        ApiQuery(params): ApiQuery<SchemaParams>,
    ) -> Result<Json<TableMetadata>> {
        let metadata = state
            .catalog
            .describe(ObjectKind::View, &name, params.schema.as_deref())
            .await?;
        Ok(Json(metadata))
    }
}

/// Rejects requests without a configured `X-API-Key` before any body or path parsing.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    enforce_api_key(request.headers(), &state.config)?;
    Ok(next.run(request).await)
}

/// Accepts any configured key; no keys configured leaves the API open.
fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if config.api_keys.is_empty() {
        return Ok(());
    }

    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(key) if config.api_keys.iter().any(|expected| expected == key) => Ok(()),
        _ => Err(ServiceError::Auth),
    }
}
