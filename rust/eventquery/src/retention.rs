//! Tenant retention window applied to query time ranges.

use crate::models::QueryParams;
use chrono::{DateTime, Duration, DurationRound, Utc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    days: Option<u32>,
}

/// Outcome of clamping one query against the retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clamped {
    Query(QueryParams),
    /// Nothing inside `[start, end]` is still retained.
    Empty,
}

impl RetentionPolicy {
    pub fn unlimited() -> Self {
        Self { days: None }
    }

    /// Zero days means no limit.
    pub fn days(days: u32) -> Self {
        Self {
            days: (days > 0).then_some(days),
        }
    }

    /// Reads the raw option value; absent, zero, or negative values disable retention.
    pub fn from_option(raw: Option<i64>) -> Self {
        match raw {
            Some(days) if days > 0 => Self::days(u32::try_from(days).unwrap_or(u32::MAX)),
            _ => Self::unlimited(),
        }
    }

    pub fn retention_days(&self) -> Option<u32> {
        self.days
    }

    /// Oldest timestamp still queryable at `now`, rounded up to the next
    /// whole minute so clamped queries keep a stable cache key.
    pub fn floor(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = self.days?;
        let exact = now
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Some(ceil_to_minute(exact))
    }

    pub fn clamp(&self, query: &QueryParams, now: DateTime<Utc>) -> Clamped {
        let Some(floor) = self.floor(now) else {
            return Clamped::Query(query.clone());
        };

        if floor > query.end {
            return Clamped::Empty;
        }

        if floor > query.start {
            Clamped::Query(query.with_start(floor))
        } else {
            Clamped::Query(query.clone())
        }
    }
}

fn ceil_to_minute(value: DateTime<Utc>) -> DateTime<Utc> {
    let minute = Duration::minutes(1);
    match value.duration_trunc(minute) {
        Ok(truncated) if truncated == value => value,
        Ok(truncated) => truncated.checked_add_signed(minute).unwrap_or(value),
        Err(_) => value,
    }
}
