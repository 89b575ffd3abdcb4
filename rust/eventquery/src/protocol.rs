//! Legacy/structured protocol rollout.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Legacy,
    Structured,
}

/// Caller-side pin of the protocol decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolOverride {
    #[default]
    Auto,
    Legacy,
    Structured,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RolloutSettings {
    /// Fraction of each referrer's traffic routed to the structured protocol.
    pub referrer_rate: f64,
    /// `1.0` routes everything to the structured protocol.
    pub force_structured: f64,
}

/// Source of the uniform draw in `[0, 1)` used for rollout decisions.
pub trait RolloutSource: Send + Sync {
    fn draw(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RolloutSource for ThreadRandom {
    fn draw(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Always returns the same draw; `0.0` takes the structured branch whenever
/// the rate is non-zero and `1.0` never does.
#[derive(Debug, Clone, Copy)]
pub struct FixedDraw(pub f64);

impl RolloutSource for FixedDraw {
    fn draw(&self) -> f64 {
        self.0
    }
}

pub fn select(referrer: &str, settings: RolloutSettings, source: &dyn RolloutSource) -> Protocol {
    if settings.force_structured >= 1.0 {
        debug!(referrer, "structured protocol forced");
        return Protocol::Structured;
    }

    let draw = source.draw();
    let protocol = if draw < settings.referrer_rate {
        Protocol::Structured
    } else {
        Protocol::Legacy
    };
    debug!(
        referrer,
        rate = settings.referrer_rate,
        draw,
        ?protocol,
        "protocol selected"
    );
    protocol
}

/// Applies a caller override, falling back to [`select`] for `Auto`.
pub fn resolve(
    referrer: &str,
    requested: ProtocolOverride,
    settings: RolloutSettings,
    source: &dyn RolloutSource,
) -> Protocol {
    match requested {
        ProtocolOverride::Auto => select(referrer, settings, source),
        ProtocolOverride::Legacy => Protocol::Legacy,
        ProtocolOverride::Structured => Protocol::Structured,
    }
}
