pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod migrations;
pub mod models;
pub mod options;
pub mod protocol;
pub mod query;
pub mod retention;
pub mod server;
pub mod state;
pub mod telemetry;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the query service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config)?.run().await
}
