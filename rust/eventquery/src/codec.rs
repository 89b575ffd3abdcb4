//! Encoding of clamped queries into the legacy JSON body or SnQL text.

use crate::{
    error::RemoteQueryError,
    models::{Aggregation, QueryParams, Scalar},
    protocol::Protocol,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
const PROJECT_COLUMN: &str = "project_id";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// A query ready to be posted to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireQuery {
    pub protocol: Protocol,
    pub dataset: String,
    pub referrer: String,
    pub body: Value,
}

pub fn encode(query: &QueryParams, protocol: Protocol) -> Result<WireQuery, RemoteQueryError> {
    validate(query)?;

    let body = match protocol {
        Protocol::Legacy => legacy_body(query),
        Protocol::Structured => json!({
            "dataset": query.dataset,
            "query": snql_text(query),
            "referrer": query.referrer,
        }),
    };

    Ok(WireQuery {
        protocol,
        dataset: query.dataset.clone(),
        referrer: query.referrer.clone(),
        body,
    })
}

pub fn validate(query: &QueryParams) -> Result<(), RemoteQueryError> {
    ensure_identifier("dataset", &query.dataset)?;

    for column in query.selected_columns.iter().chain(&query.groupby) {
        ensure_identifier("column", column)?;
    }

    for (column, values) in &query.filter_keys {
        ensure_identifier("filter column", column)?;
        if values.is_empty() {
            return Err(RemoteQueryError::invalid(format!(
                "filter on '{column}' has no values"
            )));
        }
    }

    for aggregation in &query.aggregations {
        validate_aggregation(aggregation)?;
    }

    if query.aggregations.is_empty() && query.selected_columns.is_empty() && query.groupby.is_empty()
    {
        return Err(RemoteQueryError::invalid(
            "query must select columns, group by columns, or aggregate",
        ));
    }

    Ok(())
}

fn validate_aggregation(aggregation: &Aggregation) -> Result<(), RemoteQueryError> {
    let function = aggregation
        .function
        .strip_suffix("()")
        .unwrap_or(&aggregation.function);
    ensure_identifier("aggregate function", function)?;
    if let Some(column) = aggregation.column.as_deref().filter(|c| !c.is_empty()) {
        ensure_identifier("aggregate column", column)?;
    }
    ensure_identifier("aggregate alias", &aggregation.alias)
}

fn ensure_identifier(kind: &str, raw: &str) -> Result<(), RemoteQueryError> {
    if is_identifier(raw) {
        Ok(())
    } else {
        Err(RemoteQueryError::invalid(format!("invalid {kind} '{raw}'")))
    }
}

fn is_identifier(raw: &str) -> bool {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

fn legacy_body(query: &QueryParams) -> Value {
    let conditions: Vec<Value> = query
        .filter_keys
        .iter()
        .map(|(column, values)| {
            json!([
                column,
                "IN",
                values.iter().map(Scalar::to_json).collect::<Vec<_>>()
            ])
        })
        .collect();

    let aggregations: Vec<Value> = query
        .aggregations
        .iter()
        .map(|agg| json!([agg.function, agg.column.clone().unwrap_or_default(), agg.alias]))
        .collect();

    let project: Vec<Value> = query
        .filter_keys
        .get(PROJECT_COLUMN)
        .map(|values| values.iter().map(Scalar::to_json).collect())
        .unwrap_or_default();

    json!({
        "dataset": query.dataset,
        "from_date": format_timestamp(query.start),
        "to_date": format_timestamp(query.end),
        "selected_columns": query.selected_columns,
        "groupby": query.groupby,
        "conditions": conditions,
        "aggregations": aggregations,
        "project": project,
        "referrer": query.referrer,
    })
}

fn snql_text(query: &QueryParams) -> String {
    let mut select: Vec<String> = query.aggregations.iter().map(snql_aggregation).collect();
    select.extend(
        query
            .selected_columns
            .iter()
            .filter(|column| !query.groupby.contains(column))
            .cloned(),
    );
    if select.is_empty() {
        select.extend(query.groupby.iter().cloned());
    }

    let mut text = format!("MATCH ({}) SELECT {}", query.dataset, select.join(", "));
    if !query.groupby.is_empty() {
        text.push_str(" BY ");
        text.push_str(&query.groupby.join(", "));
    }

    text.push_str(&format!(
        " WHERE {TIMESTAMP_COLUMN} >= toDateTime('{}') AND {TIMESTAMP_COLUMN} < toDateTime('{}')",
        format_timestamp(query.start),
        format_timestamp(query.end)
    ));
    for (column, values) in &query.filter_keys {
        let rendered: Vec<String> = values.iter().map(snql_literal).collect();
        text.push_str(&format!(" AND {column} IN tuple({})", rendered.join(", ")));
    }

    text
}

fn snql_aggregation(aggregation: &Aggregation) -> String {
    let function = aggregation
        .function
        .strip_suffix("()")
        .unwrap_or(&aggregation.function);
    let column = aggregation.column.as_deref().unwrap_or_default();
    format!("{function}({column}) AS {}", aggregation.alias)
}

fn snql_literal(value: &Scalar) -> String {
    match value {
        Scalar::Int(v) => v.to_string(),
        Scalar::Bool(v) => v.to_string(),
        Scalar::Str(v) => format!("'{}'", v.replace('\\', "\\\\").replace('\'', "\\'")),
    }
}
