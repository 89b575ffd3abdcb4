//! Runtime-tunable settings consumed by the query engine.
//!
//! Values are read through [`OptionsProvider`] on every call so that a flag
//! flipped at runtime takes effect on the next query.

use crate::{protocol::RolloutSettings, retention::RetentionPolicy};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

pub const SNQL_REFERRER_RATE: &str = "snql.referrer_rate";
pub const SNQL_FORCE_STRUCTURED: &str = "snql.force_structured";
pub const EVENT_RETENTION_DAYS: &str = "event_retention_days";

pub trait OptionsProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|value| value.as_f64())
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|value| value.as_i64())
    }
}

/// In-process key/value store of option values.
#[derive(Debug, Default)]
pub struct RuntimeOptions {
    values: RwLock<HashMap<String, Value>>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.values.write().insert(key.to_string(), value.into());
    }

    pub fn unset(&self, key: &str) {
        self.values.write().remove(key);
    }
}

impl OptionsProvider for RuntimeOptions {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }
}

/// Typed view over the three settings the engine consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionsSnapshot {
    pub rollout: RolloutSettings,
    pub retention: RetentionPolicy,
}

impl OptionsSnapshot {
    pub fn load(provider: &dyn OptionsProvider) -> Self {
        Self {
            rollout: RolloutSettings {
                referrer_rate: unit_interval(provider.get_f64(SNQL_REFERRER_RATE)),
                force_structured: unit_interval(provider.get_f64(SNQL_FORCE_STRUCTURED)),
            },
            retention: RetentionPolicy::from_option(provider.get_i64(EVENT_RETENTION_DAYS)),
        }
    }
}

fn unit_interval(raw: Option<f64>) -> f64 {
    match raw {
        Some(value) if value.is_finite() => value.clamp(0.0, 1.0),
        _ => 0.0,
    }
}
