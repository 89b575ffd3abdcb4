use crate::{
    cache::CacheConfig,
    executor::RemoteConfig,
    options::{RuntimeOptions, EVENT_RETENTION_DAYS, SNQL_FORCE_STRUCTURED, SNQL_REFERRER_RATE},
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub api_key: Option<String>,
    pub referrer_rate: f64,
    pub force_structured: f64,
    pub retention_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    eventquery_listen_addr: Option<String>,
    #[serde(default)]
    eventquery_listen_host: Option<String>,
    #[serde(default)]
    eventquery_listen_port: Option<u16>,
    #[serde(default)]
    eventquery_remote_url: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    eventquery_remote_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    eventquery_cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    eventquery_cache_max_entries: usize,
    #[serde(default)]
    eventquery_api_key: Option<String>,
    #[serde(default)]
    eventquery_snql_referrer_rate: f64,
    #[serde(default)]
    eventquery_snql_force_structured: f64,
    #[serde(default)]
    eventquery_event_retention_days: Option<i64>,
}

const fn default_remote_timeout_ms() -> u64 {
    30_000
}

const fn default_cache_ttl_secs() -> u64 {
    5
}

const fn default_cache_max_entries() -> usize {
    10_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse EVENTQUERY_* environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.eventquery_listen_addr,
            raw.eventquery_listen_host,
            raw.eventquery_listen_port,
        )?;

        let url = raw
            .eventquery_remote_url
            .filter(|url| !url.trim().is_empty())
            .context("EVENTQUERY_REMOTE_URL must be set")?;

        let api_key = raw.eventquery_api_key.filter(|key| !key.is_empty());

        Ok(Self {
            listen_addr,
            remote: RemoteConfig {
                url,
                timeout: Duration::from_millis(raw.eventquery_remote_timeout_ms.max(1)),
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(raw.eventquery_cache_ttl_secs),
                max_entries: raw.eventquery_cache_max_entries.max(1),
            },
            api_key,
            referrer_rate: raw.eventquery_snql_referrer_rate,
            force_structured: raw.eventquery_snql_force_structured,
            retention_days: raw.eventquery_event_retention_days,
        })
    }

    /// Configuration for running the engine in-process against `remote_url`.
    pub fn embedded(remote_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            remote: RemoteConfig {
                url: remote_url,
                timeout: Duration::from_millis(default_remote_timeout_ms()),
            },
            cache: CacheConfig::default(),
            api_key: None,
            referrer_rate: 0.0,
            force_structured: 0.0,
            retention_days: None,
        }
    }

    /// Seeds the runtime options store with the configured defaults.
    pub fn runtime_options(&self) -> RuntimeOptions {
        let options = RuntimeOptions::new()
            .with(SNQL_REFERRER_RATE, self.referrer_rate)
            .with(SNQL_FORCE_STRUCTURED, self.force_structured);
        match self.retention_days {
            Some(days) => options.with(EVENT_RETENTION_DAYS, days),
            None => options,
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid EVENTQUERY_LISTEN_ADDR value")?
            .next()
            .context("EVENTQUERY_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
