//! Remote execution of encoded queries.

use crate::{
    codec::WireQuery,
    error::RemoteQueryError,
    models::QueryResult,
    protocol::Protocol,
};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Sends a batch of wire queries and returns one result per query, in
/// submission order. Any failed slot fails the whole batch.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, batch: Vec<WireQuery>) -> Result<Vec<QueryResult>, RemoteQueryError>;
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    config: Arc<RemoteConfig>,
}

impl HttpExecutor {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn endpoint(&self, query: &WireQuery) -> String {
        let base = self.config.url.trim_end_matches('/');
        match query.protocol {
            Protocol::Legacy => format!("{base}/query"),
            Protocol::Structured => format!("{base}/{}/snql", query.dataset),
        }
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    async fn execute(&self, batch: Vec<WireQuery>) -> Result<Vec<QueryResult>, RemoteQueryError> {
        let total = batch.len();
        let mut tasks = JoinSet::new();
        for (index, query) in batch.into_iter().enumerate() {
            let client = self.client.clone();
            let url = self.endpoint(&query);
            tasks.spawn(async move {
                (index, dispatch(client, url, &query.referrer, query.body).await)
            });
        }

        let mut slots: Vec<Option<QueryResult>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(result))) => slots[index] = Some(result),
                Ok((index, Err(err))) => {
                    warn!(index, error = %err, "remote query failed; aborting batch");
                    tasks.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    tasks.abort_all();
                    return Err(RemoteQueryError::unavailable(format!(
                        "remote request task failed: {err}"
                    )));
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| RemoteQueryError::execution("remote store dropped a result"))
            })
            .collect()
    }
}

async fn dispatch(
    client: Client,
    url: String,
    referrer: &str,
    body: Value,
) -> Result<QueryResult, RemoteQueryError> {
    debug!(%url, referrer, "dispatching remote query");
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|err| RemoteQueryError::unavailable(err.to_string()))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| RemoteQueryError::unavailable(err.to_string()))?;

    if status.is_success() {
        return serde_json::from_str::<QueryResult>(&text).map_err(|err| {
            RemoteQueryError::execution(format!("malformed response from remote store: {err}"))
        });
    }

    let message = error_message(&text).unwrap_or_else(|| format!("remote store returned {status}"));
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Err(RemoteQueryError::unavailable(message))
        }
        _ => Err(RemoteQueryError::execution(message)),
    }
}

/// Pulls the diagnostic out of `{"error": {"message": ..}}` or `{"error": ".."}`.
fn error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    match parsed.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(details) => details
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
