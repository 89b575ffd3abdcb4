use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    models::QueryParams,
    options::{RuntimeOptions, EVENT_RETENTION_DAYS, SNQL_FORCE_STRUCTURED, SNQL_REFERRER_RATE},
    query::{BulkQueryRequest, BulkQueryResponse, GroupedResponse, QueryEngine},
    state::AppState,
};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Upper bound on queries accepted in one bulk request.
const MAX_BULK_QUERIES: usize = 100;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let (query, options) = QueryEngine::from_config(&config)?;
        Ok(Self::with_engine(config, query, options))
    }

    /// Serves an already-built engine, e.g. one backed by a test executor.
    pub fn with_engine(config: AppConfig, query: QueryEngine, options: Arc<RuntimeOptions>) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), query, options);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/query", post(Self::query))
            .route("/api/bulk_query", post(Self::bulk_query))
            .route("/api/options", post(Self::set_option))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, remote = %self.config.remote.url, "eventquery listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(params): Json<QueryParams>,
    ) -> Result<Json<GroupedResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let counts = state.query.query(&params).await?;
        Ok(Json(GroupedResponse::from(counts)))
    }

    async fn bulk_query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<BulkQueryRequest>,
    ) -> Result<Json<BulkQueryResponse>> {
        enforce_api_key(&headers, &state.config)?;
        if request.queries.len() > MAX_BULK_QUERIES {
            return Err(ServiceError::InvalidRequest(format!(
                "at most {MAX_BULK_QUERIES} queries per bulk request"
            )));
        }

        let results = state
            .query
            .bulk_query(&request.queries, request.options)
            .await?;
        Ok(Json(BulkQueryResponse { results }))
    }

    /// Sets or clears (`value: null`) one of the runtime options.
    async fn set_option(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(update): Json<OptionUpdate>,
    ) -> Result<Json<Value>> {
        enforce_api_key(&headers, &state.config)?;

        let valid = match update.key.as_str() {
            SNQL_REFERRER_RATE | SNQL_FORCE_STRUCTURED => {
                update.value.as_ref().map_or(true, Value::is_number)
            }
            EVENT_RETENTION_DAYS => update.value.as_ref().map_or(true, Value::is_i64),
            other => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unknown option '{other}'"
                )))
            }
        };
        if !valid {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid value for option '{}'",
                update.key
            )));
        }

        match update.value {
            Some(value) => state.options.set(&update.key, value),
            None => state.options.unset(&update.key),
        }
        info!(key = %update.key, "runtime option updated");
        Ok(Json(json!({ "key": update.key })))
    }
}

#[derive(Debug, Deserialize)]
struct OptionUpdate {
    key: String,
    #[serde(default)]
    value: Option<Value>,
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
