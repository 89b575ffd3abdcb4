//! Value types shared by the query pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_DATASET: &str = "events";

/// Scalar used in filter sets and group keys. Totally ordered so that
/// filter sets serialize the same way regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Scalar {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Scalar::Int),
            Value::String(text) => Some(Scalar::Str(text.clone())),
            Value::Bool(flag) => Some(Scalar::Bool(*flag)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Int(v) => Value::from(*v),
            Scalar::Str(v) => Value::from(v.as_str()),
            Scalar::Bool(v) => Value::from(*v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(i64::from(value))
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Scalar::Int(i64::from(value))
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Aggregation descriptor such as `count()` or `uniq(user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: String,
    #[serde(default)]
    pub column: Option<String>,
    pub alias: String,
}

impl Aggregation {
    pub fn new(function: impl Into<String>, column: Option<&str>, alias: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            column: column.map(str::to_string),
            alias: alias.into(),
        }
    }

    pub fn count(alias: impl Into<String>) -> Self {
        Self {
            function: "count()".to_string(),
            column: None,
            alias: alias.into(),
        }
    }
}

/// One logical query. Callers own it; the pipeline only ever borrows it and
/// derives new values (see [`QueryParams::with_start`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub selected_columns: Vec<String>,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub filter_keys: BTreeMap<String, BTreeSet<Scalar>>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub referrer: String,
}

fn default_dataset() -> String {
    DEFAULT_DATASET.to_string()
}

impl QueryParams {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            dataset: default_dataset(),
            selected_columns: Vec::new(),
            groupby: Vec::new(),
            filter_keys: BTreeMap::new(),
            aggregations: Vec::new(),
            referrer: String::new(),
        }
    }

    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn groupby<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groupby = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Scalar>,
    {
        self.filter_keys
            .insert(column.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = referrer.into();
        self
    }

    /// Copy of this query with a different lower bound.
    pub fn with_start(&self, start: DateTime<Utc>) -> Self {
        Self {
            start,
            ..self.clone()
        }
    }
}

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type", default)]
    pub column_type: String,
}

/// Rows returned for one query slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub data: Vec<Row>,
    #[serde(default)]
    pub meta: Vec<ColumnMeta>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Values of the groupby columns for one row, in groupby order.
pub type GroupKey = Vec<Scalar>;

pub type GroupedCounts = BTreeMap<GroupKey, i64>;
