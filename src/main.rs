mod ai;
mod config;
mod http;
mod ledger;
mod marketplace;
mod metrics;
mod models;
mod pipeline;
mod recovery;
mod runs;
mod security;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use config::AppConfig;
use eyre::WrapErr;
use ledger::{Job, JobLedger, JobStage, JobStatus};
use marketplace::{ListingPatch, ListingRequest, MarketplaceAdapter, MarketplaceRegistry};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Product, TrendData};
use pipeline::{ListOutcome, Pipeline, PipelineError, PipelineErrorKind, ScrapeReport, StoreHooks};
use recovery::{Alert, FrequencyStore, MemoryFrequencyStore, RecoveryEngine, RedisFrequencyStore};
use runs::{RunInfo, RunQueue};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, Store};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "trendforge.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env();
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    let openapi: Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .wrap_err("parsing bundled openapi document")?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let counter: Arc<dyn FrequencyStore> = match &config.redis_url {
        Some(url) => {
            info!(target = "trendforge.recovery", "error_counter_backend_redis");
            Arc::new(RedisFrequencyStore::open(url).wrap_err("opening REDIS_URL")?)
        }
        None => Arc::new(MemoryFrequencyStore::new()),
    };
    let recovery = Arc::new(RecoveryEngine::new(
        config.recovery.clone(),
        counter,
        Arc::new(StoreHooks::new(store.clone())),
    ));
    let marketplaces = Arc::new(MarketplaceRegistry::from_config(&config));
    for name in marketplaces.names() {
        let available = marketplaces
            .get(&name)
            .is_some_and(|adapter| adapter.is_available());
        info!(target = "trendforge.marketplace", marketplace = %name, available, "marketplace_registered");
    }
    let ai = ai::build_provider(&config.ai_provider, &config.ai)
        .wrap_err_with(|| format!("selecting AI provider '{}'", config.ai_provider))?;
    info!(target = "trendforge.ai", provider = ai.name(), "ai_provider_selected");

    let pipeline = Pipeline::new(
        store,
        JobLedger::new(),
        recovery,
        marketplaces,
        ai,
        config.pipeline.clone(),
    );
    let (runs, _worker) = RunQueue::spawn(pipeline.clone(), config.run_queue_capacity);
    let state = AppState {
        pipeline,
        runs,
        openapi: Arc::new(openapi),
        prometheus,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);
    let app = router(state, AuthState::from_env())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "trendforge.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    runs: RunQueue,
    openapi: Arc<Value>,
    prometheus: PrometheusHandle,
}

fn router(state: AppState, auth: AuthState) -> Router {
    let protected = Router::new()
        .route(
            "/listings",
            post(create_listing).put(update_listing).delete(delete_listing),
        )
        .nest(
            "/stages",
            Router::new()
                .route("/scrape", post(stage_scrape))
                .route("/analyze", post(stage_analyze))
                .route("/generate", post(stage_generate))
                .route("/list", post(stage_list))
                .route("/listing-content", post(stage_listing_content))
                .route("/image", post(stage_image)),
        )
        .route("/pipeline/runs", post(enqueue_run))
        .route("/pipeline/runs/{id}", get(get_run))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/products", get(list_products))
        .route("/trends", get(list_trends))
        .route("/marketplaces/{name}/categories", get(marketplace_categories))
        .route("/recovery/alerts", get(recovery_alerts))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
}

/// Liveness check. No auth.
async fn health(State(state): State<AppState>) -> Json<Value> {
    let store_ok = state.pipeline.store().health_check().await.is_ok();
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "service": "trendforge",
        "marketplaces": state.pipeline.marketplaces().names(),
    }))
}

async fn openapi_json(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !header_matches_env(&headers, "X-Docs-Key", "OPENAPI_KEY") {
        return unauthorized();
    }
    Json((*state.openapi).clone()).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !header_matches_env(&headers, "X-Metrics-Key", "METRICS_KEY") {
        return unauthorized();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

/// True when `env_key` is unset or the header carries its value.
fn header_matches_env(headers: &HeaderMap, header: &str, env_key: &str) -> bool {
    match std::env::var(env_key) {
        Ok(secret) => headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|presented| presented == secret),
        Err(_) => true,
    }
}

fn unauthorized() -> Response {
    let payload = ApiError {
        error: "unauthorized".into(),
        details: Vec::new(),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

// -------- Dashboard listing endpoints --------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingEnvelope<P> {
    marketplace: String,
    product: P,
    #[serde(default)]
    listing_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteEnvelope {
    marketplace: String,
    #[serde(default)]
    listing_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListingData {
    listing: Option<Value>,
    listing_id: Option<String>,
    external_id: Option<String>,
    marketplace: String,
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ListingEnvelopeResponse {
    success: bool,
    data: ListingData,
}

fn available_adapter(
    state: &AppState,
    stage: &'static str,
    name: &str,
) -> Result<Arc<dyn MarketplaceAdapter>, AppError> {
    let adapter = state.pipeline.marketplaces().get(name).ok_or_else(|| {
        PipelineError::validation(stage, format!("unknown marketplace '{name}'"), Vec::new())
    })?;
    if !adapter.is_available() {
        return Err(PipelineError::configuration(
            stage,
            format!("{} marketplace is not configured", adapter.name()),
        )
        .into());
    }
    Ok(adapter)
}

fn required_listing_id(stage: &'static str, listing_id: Option<String>) -> Result<String, AppError> {
    listing_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PipelineError::validation(stage, "listingId is required", Vec::new()).into())
}

/// Publishes a listing directly on a marketplace.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Body: `{marketplace, product: ListingRequest}`
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<ListingEnvelope<ListingRequest>>,
) -> Result<Json<ListingEnvelopeResponse>, AppError> {
    crate::metrics::inc_requests("/listings");
    const STAGE: &str = "listings";
    let adapter = available_adapter(&state, STAGE, &payload.marketplace)?;
    info!(
        target = "trendforge.api",
        org_id = %context.org_id,
        marketplace = adapter.name(),
        "listing_requested"
    );

    let validation = adapter.validate_listing(&payload.product);
    if !validation.valid {
        return Err(PipelineError::validation(STAGE, "listing failed validation", validation.errors).into());
    }

    let context_key = format!("list:{}", adapter.name());
    let adapter_ref = adapter.as_ref();
    let request_ref = &payload.product;
    let outcome = state
        .pipeline
        .recovery()
        .run(&context_key, move || adapter_ref.list_product(request_ref))
        .await;
    let Some(published) = outcome.value else {
        return Err(outcome
            .last_error
            .as_ref()
            .map(|err| PipelineError::from_marketplace(STAGE, err))
            .unwrap_or_else(|| PipelineError::external(STAGE, "listing produced no result"))
            .into());
    };
    if !published.success {
        let reason = published.error.unwrap_or_else(|| "listing was rejected".into());
        return Err(PipelineError::external(STAGE, reason).into());
    }

    Ok(Json(ListingEnvelopeResponse {
        success: true,
        data: ListingData {
            listing: published.listing,
            listing_id: published.listing_id,
            external_id: published.external_id,
            marketplace: adapter.name().to_string(),
            status: "active",
            timestamp: Utc::now(),
        },
    }))
}

/// Applies a partial update to a live listing.
///
/// - Method: `PUT`
/// - Path: `/listings`
/// - Body: `{marketplace, listingId, product: ListingPatch}`
async fn update_listing(
    State(state): State<AppState>,
    Json(payload): Json<ListingEnvelope<ListingPatch>>,
) -> Result<Json<ListingEnvelopeResponse>, AppError> {
    crate::metrics::inc_requests("/listings");
    const STAGE: &str = "listings";
    let listing_id = required_listing_id(STAGE, payload.listing_id)?;
    let adapter = available_adapter(&state, STAGE, &payload.marketplace)?;

    let context_key = format!("update:{}", adapter.name());
    let adapter_ref = adapter.as_ref();
    let id_ref = listing_id.as_str();
    let patch_ref = &payload.product;
    let outcome = state
        .pipeline
        .recovery()
        .run(&context_key, move || adapter_ref.update_product(id_ref, patch_ref))
        .await;
    let Some(updated) = outcome.value else {
        return Err(outcome
            .last_error
            .as_ref()
            .map(|err| PipelineError::from_marketplace(STAGE, err))
            .unwrap_or_else(|| PipelineError::external(STAGE, "update produced no result"))
            .into());
    };
    if !updated.success {
        let reason = updated.error.unwrap_or_else(|| "update was rejected".into());
        return Err(PipelineError::external(STAGE, reason).into());
    }

    Ok(Json(ListingEnvelopeResponse {
        success: true,
        data: ListingData {
            listing: updated.listing,
            listing_id: Some(listing_id),
            external_id: None,
            marketplace: adapter.name().to_string(),
            status: "updated",
            timestamp: Utc::now(),
        },
    }))
}

/// Removes a listing. A listing the marketplace no longer knows reports
/// `success: false` with status `not_found`.
async fn delete_listing(
    State(state): State<AppState>,
    Json(payload): Json<DeleteEnvelope>,
) -> Result<Json<ListingEnvelopeResponse>, AppError> {
    crate::metrics::inc_requests("/listings");
    const STAGE: &str = "listings";
    let listing_id = required_listing_id(STAGE, payload.listing_id)?;
    let adapter = available_adapter(&state, STAGE, &payload.marketplace)?;

    let context_key = format!("delete:{}", adapter.name());
    let adapter_ref = adapter.as_ref();
    let id_ref = listing_id.as_str();
    let outcome = state
        .pipeline
        .recovery()
        .run(&context_key, move || adapter_ref.delete_product(id_ref))
        .await;
    let Some(deleted) = outcome.value else {
        return Err(outcome
            .last_error
            .as_ref()
            .map(|err| PipelineError::from_marketplace(STAGE, err))
            .unwrap_or_else(|| PipelineError::external(STAGE, "delete produced no result"))
            .into());
    };

    Ok(Json(ListingEnvelopeResponse {
        success: deleted,
        data: ListingData {
            listing: None,
            listing_id: Some(listing_id),
            external_id: None,
            marketplace: adapter.name().to_string(),
            status: if deleted { "deleted" } else { "not_found" },
            timestamp: Utc::now(),
        },
    }))
}

// -------- Stage endpoints (manual control) --------

async fn stage_scrape(State(state): State<AppState>) -> Result<Json<ScrapeReport>, AppError> {
    crate::metrics::inc_requests("/stages/scrape");
    Ok(Json(state.pipeline.scrape().await?))
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    trends: Vec<TrendData>,
}

async fn stage_analyze(State(state): State<AppState>) -> Result<Json<AnalyzeResponse>, AppError> {
    crate::metrics::inc_requests("/stages/analyze");
    let trends = state.pipeline.analyze().await?;
    Ok(Json(AnalyzeResponse { trends }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    keyword: String,
    #[serde(default)]
    custom_prompt: Option<String>,
}

async fn stage_generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Product>, AppError> {
    crate::metrics::inc_requests("/stages/generate");
    let product = state
        .pipeline
        .generate(&req.keyword, req.custom_prompt.as_deref())
        .await?;
    Ok(Json(product))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListStageRequest {
    product_id: Uuid,
    marketplace: String,
}

async fn stage_list(
    State(state): State<AppState>,
    Json(req): Json<ListStageRequest>,
) -> Result<Json<ListOutcome>, AppError> {
    crate::metrics::inc_requests("/stages/list");
    Ok(Json(state.pipeline.list(req.product_id, &req.marketplace).await?))
}

async fn stored_product(state: &AppState, stage: &'static str, id: Uuid) -> Result<Product, AppError> {
    state
        .pipeline
        .store()
        .get_product(id)
        .await
        .map_err(|err| PipelineError::from_store(stage, err))?
        .ok_or_else(|| AppError::NotFound(format!("product {id}")))
}

/// Marketplace-tailored title, description, and tags for a stored product.
async fn stage_listing_content(
    State(state): State<AppState>,
    Json(req): Json<ListStageRequest>,
) -> Result<Json<ai::ListingContent>, AppError> {
    crate::metrics::inc_requests("/stages/listing-content");
    const STAGE: &str = "listing_content";
    let product = stored_product(&state, STAGE, req.product_id).await?;
    let provider = state.pipeline.ai().as_ref();
    let product_ref = &product;
    let marketplace = req.marketplace.as_str();
    let outcome = state
        .pipeline
        .recovery()
        .run(STAGE, move || provider.generate_listing_content(product_ref, marketplace))
        .await;
    match outcome.value {
        Some(content) => Ok(Json(content)),
        None => Err(outcome
            .last_error
            .as_ref()
            .map(|err| PipelineError::from_ai(STAGE, err))
            .unwrap_or_else(|| PipelineError::external(STAGE, "no content produced"))
            .into()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest {
    product_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ImageResponse {
    url: String,
}

async fn stage_image(
    State(state): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<ImageResponse>, AppError> {
    crate::metrics::inc_requests("/stages/image");
    const STAGE: &str = "image";
    let product = stored_product(&state, STAGE, req.product_id).await?;
    let prompt = if product.image_prompt.trim().is_empty() {
        product.title.clone()
    } else {
        product.image_prompt.clone()
    };
    let provider = state.pipeline.ai().as_ref();
    let prompt_ref = prompt.as_str();
    let outcome = state
        .pipeline
        .recovery()
        .run(STAGE, move || provider.generate_image(prompt_ref))
        .await;
    match outcome.value {
        Some(url) => Ok(Json(ImageResponse { url })),
        None => Err(outcome
            .last_error
            .as_ref()
            .map(|err| PipelineError::from_ai(STAGE, err))
            .unwrap_or_else(|| PipelineError::external(STAGE, "no image produced"))
            .into()),
    }
}

// -------- Runs, jobs, and read models --------

async fn enqueue_run(State(state): State<AppState>) -> Result<(StatusCode, Json<RunInfo>), AppError> {
    crate::metrics::inc_requests("/pipeline/runs");
    let info = state
        .runs
        .enqueue()
        .await
        .map_err(|err| PipelineError::internal("runs", err.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(info)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunInfo>, AppError> {
    state
        .runs
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("run {id}")))
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    status: Option<String>,
    stage: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    crate::metrics::inc_requests("/jobs");
    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::from_str(raw).ok_or_else(|| {
            PipelineError::validation("jobs", format!("unknown job status '{raw}'"), Vec::new())
        })?),
        None => None,
    };
    let stage = match query.stage.as_deref() {
        Some(raw) => Some(JobStage::from_str(raw).ok_or_else(|| {
            PipelineError::validation("jobs", format!("unknown job stage '{raw}'"), Vec::new())
        })?),
        None => None,
    };
    let jobs = state
        .pipeline
        .ledger()
        .list_all()
        .await
        .into_iter()
        .filter(|job| status.is_none_or(|status| job.status == status))
        .filter(|job| stage.is_none_or(|stage| job.stage == stage))
        .collect();
    Ok(Json(jobs))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Job>, AppError> {
    state
        .pipeline
        .ledger()
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))
}

async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<Product>>, AppError> {
    let products = state
        .pipeline
        .store()
        .list_products()
        .await
        .map_err(|err| PipelineError::from_store("products", err))?;
    Ok(Json(products))
}

#[derive(Debug, Deserialize)]
struct TrendQuery {
    limit: Option<usize>,
}

async fn list_trends(
    State(state): State<AppState>,
    Query(query): Query<TrendQuery>,
) -> Result<Json<Vec<TrendData>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let trends = state
        .pipeline
        .store()
        .top_trends(limit)
        .await
        .map_err(|err| PipelineError::from_store("trends", err))?;
    Ok(Json(trends))
}

async fn marketplace_categories(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    const STAGE: &str = "categories";
    let adapter = available_adapter(&state, STAGE, &name)?;
    let context_key = format!("categories:{}", adapter.name());
    let adapter_ref = adapter.as_ref();
    state
        .pipeline
        .recovery()
        .with_recovery(&context_key, move || adapter_ref.get_categories())
        .await
        .map(Json)
        .ok_or_else(|| {
            PipelineError::external(STAGE, format!("{} categories are unavailable", adapter.name())).into()
        })
}

async fn recovery_alerts(State(state): State<AppState>) -> Json<Vec<Alert>> {
    Json(state.pipeline.recovery().alerts().await)
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound(String),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::Validation | PipelineErrorKind::InsufficientData => {
                        StatusCode::BAD_REQUEST
                    }
                    PipelineErrorKind::DuplicateJob => StatusCode::CONFLICT,
                    PipelineErrorKind::ExternalService
                    | PipelineErrorKind::Generation
                    | PipelineErrorKind::Configuration
                    | PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.to_string(),
                    details: err.details().to_vec(),
                };
                (status, Json(payload)).into_response()
            }
            AppError::NotFound(what) => {
                let payload = ApiError {
                    error: format!("{what} not found"),
                    details: Vec::new(),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
