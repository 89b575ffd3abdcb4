//! Single grouped-count queries collapsed into `group key -> value` maps.

use crate::{
    error::RemoteQueryError,
    models::{Aggregation, GroupedCounts, QueryParams, QueryResult, Scalar},
};
use serde_json::Value;

pub const DEFAULT_AGGREGATE_ALIAS: &str = "aggregate";

/// Fills in the default `count()` aggregation and checks the query can be
/// collapsed into a flat map.
pub(super) fn prepare(params: &QueryParams) -> Result<QueryParams, RemoteQueryError> {
    if params.groupby.is_empty() {
        return Err(RemoteQueryError::invalid(
            "grouped query requires at least one groupby column",
        ));
    }

    match params.aggregations.len() {
        0 => Ok(params
            .clone()
            .aggregate(Aggregation::count(DEFAULT_AGGREGATE_ALIAS))),
        1 => Ok(params.clone()),
        n => Err(RemoteQueryError::invalid(format!(
            "grouped query supports a single aggregation, got {n}"
        ))),
    }
}

pub(super) fn collapse(
    params: &QueryParams,
    result: &QueryResult,
) -> Result<GroupedCounts, RemoteQueryError> {
    let alias = params
        .aggregations
        .first()
        .map(|agg| agg.alias.as_str())
        .unwrap_or(DEFAULT_AGGREGATE_ALIAS);

    let mut counts = GroupedCounts::new();
    for row in &result.data {
        let key = params
            .groupby
            .iter()
            .map(|column| {
                row.get(column).and_then(Scalar::from_json).ok_or_else(|| {
                    RemoteQueryError::execution(format!(
                        "row is missing a usable value for groupby column '{column}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let value = row.get(alias).and_then(integral).ok_or_else(|| {
            RemoteQueryError::execution(format!("aggregate '{alias}' is not an integer"))
        })?;

        let total = counts.entry(key).or_insert(0);
        *total = total.checked_add(value).ok_or_else(|| {
            RemoteQueryError::execution(format!("aggregate '{alias}' overflowed while merging rows"))
        })?;
    }

    Ok(counts)
}

fn integral(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64)
            .map(|v| v as i64)
    })
}
