use super::FakeStore;
use axum::{
    body::{self, Body},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use eventquery::{
    config::AppConfig,
    models::{Aggregation, QueryParams},
    options::RuntimeOptions,
    query::QueryEngine,
    server::Server,
};
use http::{Request, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Once};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// An engine and router wired to a freshly served [`FakeStore`].
#[allow(dead_code)]
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub engine: QueryEngine,
    pub options: Arc<RuntimeOptions>,
    router: Router,
}

#[allow(dead_code)]
impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    pub async fn start_with(configure: impl FnOnce(AppConfig) -> AppConfig) -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });

        let store = FakeStore::new();
        let url = store.serve().await;
        let mut config = configure(AppConfig::embedded(url));
        config.api_key = Some(API_KEY.to_string());

        let (engine, options) =
            QueryEngine::from_config(&config).expect("engine should build from config");
        let router = Server::with_engine(config, engine.clone(), options.clone()).router();

        Self {
            store,
            engine,
            options,
            router,
        }
    }

    pub async fn post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.request(path, payload, Some(API_KEY)).await
    }

    pub async fn post_with_key<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
        api_key: Option<&str>,
    ) -> http::Response<Body> {
        self.request(path, payload, api_key).await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }

    async fn request<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
        api_key: Option<&str>,
    ) -> http::Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }

        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = builder
            .body(Body::from(body))
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

/// Grouped count of `project_id` over the last `days` days, ending just
/// after `now` so freshly inserted events are inside the range.
#[allow(dead_code)]
pub fn project_counts(now: DateTime<Utc>, days: i64, projects: &[i64]) -> QueryParams {
    QueryParams::new(now - Duration::days(days), now + Duration::minutes(1))
        .groupby(["project_id"])
        .filter("project_id", projects.iter().copied())
        .aggregate(Aggregation::count("aggregate"))
        .referrer("tests.project_counts")
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
