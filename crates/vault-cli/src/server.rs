//! HTTP boundary: one JSON endpoint per service operation.

use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vault_core::memory::{DEFAULT_MAX_AGE_DAYS, DEFAULT_SEARCH_LIMIT};
use vault_core::signal::DEFAULT_QUALITY;
use vault_core::{
    Consent, Context, ContextManager, ContextUpdate, DataSource, DateRange, DividendCalculation,
    DividendEngine, Earnings, Error, Gatekeeper, LedgerStore, Memory, MemoryStore, MemoryUpdate,
    MergeStrategy, NewVaultEntry, Payout, Permission, ProcessorLog, Range, SchemaRegistryEntry,
    ScoredMemory, Timestamp, UsageLog, Vault, VaultEntry,
};

use crate::config::Config;

/// Services shared by every handler, all backed by one ledger.
#[derive(Clone)]
pub struct AppState {
    pub vault: Vault,
    pub gatekeeper: Gatekeeper,
    pub memories: MemoryStore,
    pub contexts: ContextManager,
    pub dividends: DividendEngine,
}

impl AppState {
    pub fn new(ledger: Arc<dyn LedgerStore>, config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            vault: Vault::new(ledger.clone()),
            gatekeeper: Gatekeeper::new(ledger.clone()),
            memories: config.memory_store(ledger.clone()),
            contexts: ContextManager::new(ledger.clone()),
            dividends: DividendEngine::new(ledger, config.rate_table()?),
        })
    }
}

/// Service error rendered as `{"detail": ...}`.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Ledger(_) | Error::Codec { .. } => StatusCode::BAD_REQUEST,
        };
        if status == StatusCode::BAD_REQUEST {
            tracing::error!(error = %self.0, "ledger failure");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/vault/entries", post(create_entry).get(list_entries))
        .route("/vault/entries/{id}", get(get_entry))
        .route("/schemas/register", post(register_schema))
        .route("/schemas/{schema_type}", get(list_schemas))
        .route("/dividends/calculate", post(calculate_dividend))
        .route("/dividends/{user_id}", get(user_dividends))
        .route("/dividends/{user_id}/earnings", get(total_earnings))
        .route("/payouts", post(create_payout).get(payout_history))
        .route("/payouts/{id}/status", put(update_payout_status))
        .route("/contexts", post(create_context).get(list_contexts))
        .route("/contexts/merge", post(merge_contexts))
        .route("/contexts/active", get(active_contexts))
        .route(
            "/contexts/{id}",
            get(get_context).put(update_context).delete(delete_context),
        )
        .route("/memories", post(store_memory).get(list_memories))
        .route("/memories/search", post(search_memories))
        .route("/memories/prune", post(prune_memories))
        .route(
            "/memories/{id}",
            get(get_memory).put(update_memory).delete(delete_memory),
        )
        .route("/permissions", post(grant_permission))
        .route("/permissions/check", get(check_permission))
        .route("/permissions/revoke", post(revoke_permission))
        .route("/permissions/{user_id}", get(list_permissions))
        .route("/consents", post(create_consent))
        .route("/consents/check", get(check_consent))
        .route("/consents/revoke", post(revoke_consent))
        .route("/usage", post(track_usage))
        .route("/signals/{source}", post(process_signal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "vault API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// --- query and body shapes ---

#[derive(Deserialize)]
struct ListParams {
    user_id: String,
    #[serde(default)]
    data_type: Option<String>,
    #[serde(default)]
    context_type: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

impl ListParams {
    fn page(&self) -> Range {
        Range::new(
            self.offset.unwrap_or(0),
            self.limit.unwrap_or(Range::DEFAULT_LIMIT),
        )
    }
}

#[derive(Deserialize)]
struct DateParams {
    #[serde(default)]
    start_date: Option<Timestamp>,
    #[serde(default)]
    end_date: Option<Timestamp>,
}

impl DateParams {
    fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

#[derive(Deserialize)]
struct DividendRequest {
    user_id: String,
    data_type: String,
    usage_count: u64,
    #[serde(default = "default_quality")]
    quality_score: f64,
}

fn default_quality() -> f64 {
    DEFAULT_QUALITY
}

#[derive(Deserialize)]
struct PayoutRequest {
    user_id: String,
    amount: f64,
    payment_method: String,
}

#[derive(Deserialize)]
struct PayoutStatusRequest {
    status: String,
    #[serde(default)]
    transaction_id: Option<String>,
}

#[derive(Deserialize)]
struct NewContext {
    user_id: String,
    context_type: String,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct MergeRequest {
    context_ids: Vec<String>,
    #[serde(default)]
    merge_strategy: Option<String>,
}

#[derive(Deserialize)]
struct ActiveParams {
    user_id: String,
    #[serde(default)]
    now: Option<Timestamp>,
}

#[derive(Deserialize)]
struct NewMemory {
    user_id: String,
    #[serde(default)]
    content: Map<String, Value>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct SearchRequest {
    user_id: String,
    query_embedding: Vec<f32>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct PruneRequest {
    user_id: String,
    #[serde(default)]
    max_age_days: Option<i64>,
}

#[derive(Deserialize)]
struct PermissionRequest {
    user_id: String,
    resource: String,
    action: String,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct ConsentRequest {
    user_id: String,
    data_type: String,
    purpose: String,
    duration_days: i64,
}

#[derive(Deserialize)]
struct ConsentKey {
    user_id: String,
    data_type: String,
    purpose: String,
}

// --- handlers ---

async fn root() -> Json<Value> {
    Json(json!({ "message": "Welcome to the Vault API" }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn create_entry(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<NewVaultEntry>,
) -> ApiResult<VaultEntry> {
    Ok(Json(state.vault.create_entry(entry)?))
}

async fn list_entries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<VaultEntry>> {
    let entries =
        state
            .vault
            .list_entries(&params.user_id, params.data_type.as_deref(), params.page())?;
    Ok(Json(entries))
}

async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<VaultEntry> {
    Ok(Json(state.vault.get_entry(&id)?))
}

async fn register_schema(
    State(state): State<Arc<AppState>>,
    Json(schema): Json<SchemaRegistryEntry>,
) -> ApiResult<Value> {
    let schema = state.vault.register_schema(schema)?;
    Ok(Json(json!({
        "message": "Schema registered successfully",
        "schema": schema,
    })))
}

async fn list_schemas(
    State(state): State<Arc<AppState>>,
    Path(schema_type): Path<String>,
) -> ApiResult<Vec<SchemaRegistryEntry>> {
    Ok(Json(state.vault.list_schemas(&schema_type)?))
}

async fn calculate_dividend(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DividendRequest>,
) -> ApiResult<Value> {
    let dividend = state.dividends.calculate_dividend(
        &req.user_id,
        &req.data_type,
        req.usage_count,
        req.quality_score,
    )?;
    Ok(Json(json!({
        "user_id": req.user_id,
        "data_type": req.data_type,
        "dividend": dividend,
    })))
}

async fn user_dividends(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(dates): Query<DateParams>,
) -> ApiResult<Vec<DividendCalculation>> {
    Ok(Json(
        state.dividends.get_user_dividends(&user_id, &dates.range())?,
    ))
}

async fn total_earnings(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(dates): Query<DateParams>,
) -> ApiResult<Earnings> {
    Ok(Json(
        state
            .dividends
            .calculate_total_earnings(&user_id, &dates.range())?,
    ))
}

async fn create_payout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PayoutRequest>,
) -> ApiResult<Payout> {
    Ok(Json(state.dividends.process_payout(
        &req.user_id,
        req.amount,
        &req.payment_method,
    )?))
}

async fn payout_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Payout>> {
    Ok(Json(
        state
            .dividends
            .get_payout_history(&params.user_id, params.page())?,
    ))
}

async fn update_payout_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PayoutStatusRequest>,
) -> ApiResult<Payout> {
    Ok(Json(state.dividends.update_payout_status(
        &id,
        &req.status,
        req.transaction_id.as_deref(),
    )?))
}

async fn create_context(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewContext>,
) -> ApiResult<Context> {
    Ok(Json(state.contexts.create_context(
        &req.user_id,
        &req.context_type,
        req.data,
        req.metadata,
    )?))
}

async fn list_contexts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Context>> {
    Ok(Json(state.contexts.list_contexts(
        &params.user_id,
        params.context_type.as_deref(),
        params.page(),
    )?))
}

async fn get_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Context> {
    Ok(Json(state.contexts.get_context(&id)?))
}

async fn update_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ContextUpdate>,
) -> ApiResult<Context> {
    Ok(Json(state.contexts.update_context(&id, update)?))
}

async fn delete_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let deleted = state.contexts.delete_context(&id)?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn merge_contexts(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MergeRequest>,
) -> ApiResult<Context> {
    let strategy = match req.merge_strategy.as_deref() {
        Some(raw) => raw.parse::<MergeStrategy>()?,
        None => MergeStrategy::default(),
    };
    Ok(Json(state.contexts.merge_contexts(&req.context_ids, strategy)?))
}

async fn active_contexts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActiveParams>,
) -> ApiResult<Vec<Context>> {
    Ok(Json(
        state
            .contexts
            .get_active_contexts(&params.user_id, params.now)?,
    ))
}

async fn store_memory(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewMemory>,
) -> ApiResult<Value> {
    let id = state
        .memories
        .store_memory(&req.user_id, req.content, req.embedding, req.metadata)?;
    Ok(Json(json!({ "id": id })))
}

async fn list_memories(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Memory>> {
    Ok(Json(
        state
            .memories
            .list_memories(&params.user_id, params.page())?,
    ))
}

async fn get_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Memory> {
    Ok(Json(state.memories.retrieve_memory(&id)?))
}

async fn update_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<MemoryUpdate>,
) -> ApiResult<Memory> {
    Ok(Json(state.memories.update_memory(&id, update)?))
}

async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let deleted = state.memories.delete_memory(&id)?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn search_memories(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Vec<ScoredMemory>> {
    let limit = req.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    Ok(Json(state.memories.search_memories(
        &req.user_id,
        &req.query_embedding,
        limit,
    )?))
}

async fn prune_memories(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PruneRequest>,
) -> ApiResult<Value> {
    let days = req.max_age_days.unwrap_or(DEFAULT_MAX_AGE_DAYS);
    let pruned = state.memories.prune_memories(&req.user_id, days)?;
    Ok(Json(json!({ "pruned": pruned })))
}

async fn grant_permission(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PermissionRequest>,
) -> ApiResult<Permission> {
    Ok(Json(state.gatekeeper.grant_permission(
        &req.user_id,
        &req.resource,
        &req.action,
        req.metadata,
    )?))
}

async fn check_permission(
    State(state): State<Arc<AppState>>,
    Query(req): Query<PermissionRequest>,
) -> ApiResult<Value> {
    let allowed = state
        .gatekeeper
        .check_permission(&req.user_id, &req.resource, &req.action)?;
    Ok(Json(json!({ "allowed": allowed })))
}

async fn revoke_permission(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PermissionRequest>,
) -> ApiResult<Value> {
    let revoked = state
        .gatekeeper
        .revoke_permission(&req.user_id, &req.resource, &req.action)?;
    Ok(Json(json!({ "revoked": revoked })))
}

async fn list_permissions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<Permission>> {
    Ok(Json(state.gatekeeper.list_permissions(&user_id)?))
}

async fn create_consent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConsentRequest>,
) -> ApiResult<Consent> {
    Ok(Json(state.gatekeeper.create_consent(
        &req.user_id,
        &req.data_type,
        &req.purpose,
        req.duration_days,
    )?))
}

async fn check_consent(
    State(state): State<Arc<AppState>>,
    Query(key): Query<ConsentKey>,
) -> ApiResult<Value> {
    let granted = state
        .gatekeeper
        .check_consent(&key.user_id, &key.data_type, &key.purpose)?;
    Ok(Json(json!({ "granted": granted })))
}

async fn revoke_consent(
    State(state): State<Arc<AppState>>,
    Json(key): Json<ConsentKey>,
) -> ApiResult<Value> {
    let revoked = state
        .gatekeeper
        .revoke_consent(&key.user_id, &key.data_type, &key.purpose)?;
    Ok(Json(json!({ "revoked": revoked })))
}

async fn track_usage(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PermissionRequest>,
) -> ApiResult<UsageLog> {
    Ok(Json(state.gatekeeper.track_usage(
        &req.user_id,
        &req.resource,
        &req.action,
        req.metadata,
    )?))
}

async fn process_signal(
    Path(source): Path<String>,
    Json(raw): Json<Map<String, Value>>,
) -> ApiResult<Value> {
    let source: DataSource = source.parse()?;
    let mut log = ProcessorLog::new(source);
    let (signal, quality) = log.ingest(&raw)?;
    Ok(Json(json!({
        "source": source,
        "signal": signal,
        "quality_score": quality,
    })))
}
