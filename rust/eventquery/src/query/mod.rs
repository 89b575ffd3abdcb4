mod grouped;

pub use grouped::DEFAULT_AGGREGATE_ALIAS;

use crate::{
    cache::{CacheKey, ResultCache},
    codec,
    config::AppConfig,
    error::RemoteQueryError,
    executor::{HttpExecutor, RemoteExecutor},
    models::{GroupKey, GroupedCounts, QueryParams, QueryResult},
    options::{OptionsProvider, OptionsSnapshot, RuntimeOptions},
    protocol::{self, Protocol, ProtocolOverride, RolloutSource, ThreadRandom},
    retention::Clamped,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, warn};

const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default)]
    pub protocol: ProtocolOverride,
}

impl BulkOptions {
    pub fn cached() -> Self {
        Self {
            use_cache: true,
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolOverride) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Query still needing a remote round trip.
struct Pending {
    slot: usize,
    query: QueryParams,
    key: Option<CacheKey>,
}

/// Entry point for all queries: clamps to retention, serves what it can
/// from cache, and sends the rest to the store in one batch.
#[derive(Clone)]
pub struct QueryEngine {
    executor: Arc<dyn RemoteExecutor>,
    cache: Arc<ResultCache>,
    options: Arc<dyn OptionsProvider>,
    rollout: Arc<dyn RolloutSource>,
    remote_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        cache: Arc<ResultCache>,
        options: Arc<dyn OptionsProvider>,
    ) -> Self {
        Self {
            executor,
            cache,
            options,
            rollout: Arc::new(ThreadRandom),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    /// Builds an engine talking HTTP to the configured store. The returned
    /// options handle stays live: values set on it apply to later calls.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<(Self, Arc<RuntimeOptions>)> {
        let executor = HttpExecutor::new(config.remote.clone())?;
        let options = Arc::new(config.runtime_options());
        let engine = Self::new(
            Arc::new(executor),
            Arc::new(ResultCache::new(config.cache.clone())),
            options.clone(),
        )
        .with_remote_timeout(config.remote.timeout);
        Ok((engine, options))
    }

    pub fn with_rollout_source(mut self, source: Arc<dyn RolloutSource>) -> Self {
        self.rollout = source;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Runs every query in `batch` and returns one result per query, in
    /// input order. Any failure fails the whole call.
    pub async fn bulk_query(
        &self,
        batch: &[QueryParams],
        options: BulkOptions,
    ) -> Result<Vec<QueryResult>, RemoteQueryError> {
        let snapshot = OptionsSnapshot::load(self.options.as_ref());
        let now = Utc::now();

        let mut slots: Vec<Option<QueryResult>> = vec![None; batch.len()];
        let mut pending = Vec::new();

        for (slot, params) in batch.iter().enumerate() {
            if params.start > params.end {
                return Err(RemoteQueryError::invalid(format!(
                    "query {slot}: start must not be after end"
                )));
            }
            codec::validate(params)?;

            let query = match snapshot.retention.clamp(params, now) {
                Clamped::Query(query) => query,
                Clamped::Empty => {
                    debug!(slot, referrer = %params.referrer, "range is outside retention");
                    slots[slot] = Some(QueryResult::empty());
                    continue;
                }
            };

            let key = if options.use_cache {
                Some(CacheKey::for_query(&query)?)
            } else {
                None
            };

            if let Some(hit) = key.as_ref().and_then(|key| self.cache.lookup(key)) {
                debug!(slot, referrer = %params.referrer, "served from result cache");
                slots[slot] = Some(hit);
                continue;
            }

            pending.push(Pending { slot, query, key });
        }

        if !pending.is_empty() {
            let results = self.execute_pending(&pending, options, &snapshot).await?;
            for (entry, result) in pending.into_iter().zip(results) {
                if let Some(key) = entry.key {
                    self.cache.store(key, result.clone());
                }
                slots[entry.slot] = Some(result);
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| RemoteQueryError::execution("query slot left unresolved")))
            .collect()
    }

    async fn execute_pending(
        &self,
        pending: &[Pending],
        options: BulkOptions,
        snapshot: &OptionsSnapshot,
    ) -> Result<Vec<QueryResult>, RemoteQueryError> {
        let mut decisions: HashMap<&str, Protocol> = HashMap::new();
        let mut wire = Vec::with_capacity(pending.len());
        for entry in pending {
            let referrer = entry.query.referrer.as_str();
            let protocol = *decisions.entry(referrer).or_insert_with(|| {
                protocol::resolve(
                    referrer,
                    options.protocol,
                    snapshot.rollout,
                    self.rollout.as_ref(),
                )
            });
            wire.push(codec::encode(&entry.query, protocol)?);
        }

        debug!(
            queries = wire.len(),
            referrers = decisions.len(),
            "executing remote batch"
        );

        let results = tokio::time::timeout(self.remote_timeout, self.executor.execute(wire))
            .await
            .map_err(|_| {
                warn!(timeout = ?self.remote_timeout, "remote batch timed out");
                RemoteQueryError::unavailable(format!(
                    "remote store did not answer within {:?}",
                    self.remote_timeout
                ))
            })??;

        if results.len() != pending.len() {
            return Err(RemoteQueryError::execution(format!(
                "remote store returned {} results for {} queries",
                results.len(),
                pending.len()
            )));
        }

        Ok(results)
    }

    /// Grouped-count query: a batch of one whose rows are collapsed into
    /// `groupby values -> aggregate`. Defaults to `count()`.
    pub async fn query(&self, params: &QueryParams) -> Result<GroupedCounts, RemoteQueryError> {
        self.query_with(params, BulkOptions::default()).await
    }

    pub async fn query_with(
        &self,
        params: &QueryParams,
        options: BulkOptions,
    ) -> Result<GroupedCounts, RemoteQueryError> {
        let prepared = grouped::prepare(params)?;
        let results = self
            .bulk_query(std::slice::from_ref(&prepared), options)
            .await?;
        match results.first() {
            Some(result) => grouped::collapse(&prepared, result),
            None => Ok(GroupedCounts::new()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkQueryRequest {
    pub queries: Vec<QueryParams>,
    #[serde(flatten)]
    pub options: BulkOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkQueryResponse {
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub key: GroupKey,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedResponse {
    pub groups: Vec<GroupEntry>,
}

impl From<GroupedCounts> for GroupedResponse {
    fn from(counts: GroupedCounts) -> Self {
        Self {
            groups: counts
                .into_iter()
                .map(|(key, value)| GroupEntry { key, value })
                .collect(),
        }
    }
}
