use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use eventquery::{models::Row, protocol::Protocol};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::net::TcpListener;

const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone)]
struct StoredEvent {
    timestamp: DateTime<Utc>,
    fields: Row,
}

/// Columnar-store stand-in that understands both wire protocols well enough
/// to answer grouped counts and plain column selections.
#[derive(Default)]
pub struct FakeStore {
    events: Mutex<Vec<StoredEvent>>,
    requests: Mutex<Vec<Protocol>>,
    unavailable: AtomicBool,
}

/// Normalized form of either wire body.
#[derive(Debug, Default)]
struct Plan {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    columns: Vec<String>,
    groupby: Vec<String>,
    filters: Vec<(String, Vec<Value>)>,
    aggregations: Vec<(String, String, String)>,
}

#[derive(Debug)]
enum StoreError {
    BadQuery(String),
    Unavailable,
}

#[allow(dead_code)]
impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, timestamp: DateTime<Utc>, fields: Value) {
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.events.lock().push(StoredEvent { timestamp, fields });
    }

    /// Number of queries the store has answered or rejected.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.requests.lock().clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Serves the store on an ephemeral local port and returns its base URL.
    pub async fn serve(self: &Arc<Self>) -> String {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("fake store should bind");
        let addr = listener.local_addr().expect("listener has an address");

        let router = Router::new()
            .route("/query", post(legacy))
            .route("/:dataset/snql", post(structured))
            .with_state(Arc::clone(self));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        format!("http://{addr}")
    }

    fn answer(&self, protocol: Protocol, body: &Value) -> Result<Value, StoreError> {
        self.requests.lock().push(protocol);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }

        let plan = match protocol {
            Protocol::Legacy => parse_legacy(body)?,
            Protocol::Structured => {
                let text = body["query"]
                    .as_str()
                    .ok_or_else(|| StoreError::BadQuery("missing query".to_string()))?;
                parse_snql(text)?
            }
        };

        let data = self.evaluate(&plan)?;
        Ok(json!({ "data": data, "meta": [] }))
    }

    fn evaluate(&self, plan: &Plan) -> Result<Vec<Value>, StoreError> {
        let events = self.events.lock();
        let matching: Vec<&StoredEvent> = events
            .iter()
            .filter(|event| plan.start.map_or(true, |start| event.timestamp >= start))
            .filter(|event| plan.end.map_or(true, |end| event.timestamp < end))
            .filter(|event| {
                plan.filters.iter().all(|(column, values)| {
                    let value = field(event, column);
                    values.contains(&value)
                })
            })
            .collect();

        if plan.aggregations.is_empty() {
            return Ok(matching
                .iter()
                .map(|event| {
                    let row: Map<String, Value> = plan
                        .columns
                        .iter()
                        .chain(&plan.groupby)
                        .map(|column| (column.clone(), field(event, column)))
                        .collect();
                    Value::Object(row)
                })
                .collect());
        }

        let mut groups: BTreeMap<String, (Vec<Value>, Vec<&StoredEvent>)> = BTreeMap::new();
        for event in matching {
            let key: Vec<Value> = plan.groupby.iter().map(|c| field(event, c)).collect();
            groups
                .entry(Value::Array(key.clone()).to_string())
                .or_insert_with(|| (key, Vec::new()))
                .1
                .push(event);
        }

        groups
            .into_values()
            .map(|(key, members)| -> Result<Value, StoreError> {
                let mut row = Map::new();
                for (column, value) in plan.groupby.iter().zip(key) {
                    row.insert(column.clone(), value);
                }
                for (function, column, alias) in &plan.aggregations {
                    row.insert(alias.clone(), aggregate(function, column, &members)?);
                }
                Ok(Value::Object(row))
            })
            .collect()
    }
}

fn field(event: &StoredEvent, column: &str) -> Value {
    if column == "timestamp" {
        return json!(event.timestamp.to_rfc3339());
    }
    event.fields.get(column).cloned().unwrap_or(Value::Null)
}

fn aggregate(function: &str, column: &str, members: &[&StoredEvent]) -> Result<Value, StoreError> {
    match function.trim_end_matches("()") {
        "count" => Ok(json!(members.len())),
        "uniq" => {
            let mut seen: Vec<Value> = members.iter().map(|e| field(e, column)).collect();
            seen.sort_by_key(|v| v.to_string());
            seen.dedup();
            Ok(json!(seen.len()))
        }
        other => Err(StoreError::BadQuery(format!("unknown function '{other}'"))),
    }
}

fn parse_wire_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, WIRE_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| StoreError::BadQuery(format!("bad timestamp '{raw}': {err}")))
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_legacy(body: &Value) -> Result<Plan, StoreError> {
    let mut plan = Plan {
        columns: strings(&body["selected_columns"]),
        groupby: strings(&body["groupby"]),
        ..Plan::default()
    };
    if let Some(raw) = body["from_date"].as_str() {
        plan.start = Some(parse_wire_timestamp(raw)?);
    }
    if let Some(raw) = body["to_date"].as_str() {
        plan.end = Some(parse_wire_timestamp(raw)?);
    }

    for condition in body["conditions"].as_array().into_iter().flatten() {
        let column = condition[0].as_str().unwrap_or_default().to_string();
        let values = condition[2].as_array().cloned().unwrap_or_default();
        plan.filters.push((column, values));
    }
    for aggregation in body["aggregations"].as_array().into_iter().flatten() {
        plan.aggregations.push((
            aggregation[0].as_str().unwrap_or_default().to_string(),
            aggregation[1].as_str().unwrap_or_default().to_string(),
            aggregation[2].as_str().unwrap_or_default().to_string(),
        ));
    }

    Ok(plan)
}

/// Parses the subset of SnQL the encoder emits:
/// `MATCH (ds) SELECT .. [BY ..] WHERE .. AND col IN tuple(..)`.
fn parse_snql(text: &str) -> Result<Plan, StoreError> {
    let bad = |what: &str| StoreError::BadQuery(format!("cannot parse {what} in '{text}'"));

    let rest = text.strip_prefix("MATCH (").ok_or_else(|| bad("MATCH"))?;
    let (_, rest) = rest.split_once(") SELECT ").ok_or_else(|| bad("SELECT"))?;
    let (head, conditions) = rest.split_once(" WHERE ").ok_or_else(|| bad("WHERE"))?;
    let (select, by) = match head.split_once(" BY ") {
        Some((select, by)) => (select, Some(by)),
        None => (head, None),
    };

    let mut plan = Plan {
        groupby: by
            .map(|by| by.split(", ").map(str::to_string).collect())
            .unwrap_or_default(),
        ..Plan::default()
    };

    for item in select.split(", ") {
        match item.split_once(" AS ") {
            Some((call, alias)) => {
                let (function, column) = call
                    .trim_end_matches(')')
                    .split_once('(')
                    .ok_or_else(|| bad("aggregate"))?;
                plan.aggregations
                    .push((function.to_string(), column.to_string(), alias.to_string()));
            }
            None if plan.groupby.iter().any(|column| column == item) => {}
            None => plan.columns.push(item.to_string()),
        }
    }

    for clause in conditions.split(" AND ") {
        if let Some(raw) = clause.strip_prefix("timestamp >= toDateTime('") {
            plan.start = Some(parse_wire_timestamp(raw.trim_end_matches("')"))?);
        } else if let Some(raw) = clause.strip_prefix("timestamp < toDateTime('") {
            plan.end = Some(parse_wire_timestamp(raw.trim_end_matches("')"))?);
        } else {
            let (column, tuple) = clause.split_once(" IN tuple(").ok_or_else(|| bad("condition"))?;
            let values = tuple
                .trim_end_matches(')')
                .split(", ")
                .map(snql_literal)
                .collect();
            plan.filters.push((column.to_string(), values));
        }
    }

    Ok(plan)
}

fn snql_literal(raw: &str) -> Value {
    if let Some(quoted) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        return json!(quoted.replace("\\'", "'").replace("\\\\", "\\"));
    }
    match raw {
        "true" => json!(true),
        "false" => json!(false),
        _ => raw.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        match self {
            StoreError::BadQuery(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"type": "invalid_query", "message": message}})),
            )
                .into_response(),
            StoreError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "store is restarting"})),
            )
                .into_response(),
        }
    }
}

async fn legacy(
    State(store): State<Arc<FakeStore>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StoreError> {
    store.answer(Protocol::Legacy, &body).map(Json)
}

async fn structured(
    State(store): State<Arc<FakeStore>>,
    Path(_dataset): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StoreError> {
    store.answer(Protocol::Structured, &body).map(Json)
}
