use crate::{config::AppConfig, options::RuntimeOptions, query::QueryEngine};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
    pub options: Arc<RuntimeOptions>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, query: QueryEngine, options: Arc<RuntimeOptions>) -> Self {
        Self {
            config,
            query,
            options,
        }
    }
}
