//! Source records and the normalized rows written to the local store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scalar value used for primary keys and ordering markers.
///
/// Integers order before text so a mixed column still has a total order.
///
/// # Examples
/// ```
/// use hubsync_core::Scalar;
/// use serde_json::json;
///
/// assert_eq!(Scalar::from_value(&json!(7)), Some(Scalar::Int(7)));
/// assert_eq!(Scalar::from_value(&json!(7.0)), Some(Scalar::Int(7)));
/// assert_eq!(Scalar::from_value(&json!(7.5)), None);
/// assert_eq!(Scalar::from_value(&json!("a")), Some(Scalar::Text("a".into())));
/// assert_eq!(Scalar::from_value(&json!("")), None);
/// assert!(Scalar::Int(99) < Scalar::Text("0".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Signed integer value.
    Int(i64),
    /// Non-empty text value.
    Text(String),
}

/// 2^63, the first float outside the `i64` range.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

impl Scalar {
    /// Interpret a JSON value as a scalar.
    ///
    /// Floats holding a whole number within the `i64` range, such as
    /// `1700000000.0`, become integers. Returns `None` for nulls, empty
    /// strings, fractional floats, booleans and containers; none of those
    /// can serve as a key or an ordering marker.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().and_then(whole_number))
                .map(Self::Int),
            Value::String(text) if !text.is_empty() => Some(Self::Text(text.clone())),
            _ => None,
        }
    }

    /// Convert the scalar back into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
        }
    }
}

fn whole_number(value: f64) -> Option<i64> {
    (value.trunc() == value && (-I64_BOUND..I64_BOUND).contains(&value)).then(|| value as i64)
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Raw record as returned by a remote source.
///
/// The engine treats it as an opaque field map; the table definition decides
/// which fields form the key, the marker and the retained columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRecord {
    fields: Map<String, Value>,
}

impl SourceRecord {
    /// Wrap an existing field map.
    #[must_use]
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build a record from a JSON value, returning `None` unless it is an
    /// object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Look up a field by name.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field, replacing any existing value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Borrow the underlying field map.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the record and return its fields.
    #[must_use]
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Normalized row destined for a local table.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRow {
    /// Primary-key value; one row per key is kept.
    pub key: Scalar,
    /// Retained analytic columns keyed by column name. Absent source fields
    /// are stored as `null`.
    pub columns: BTreeMap<String, Value>,
    /// Unix timestamp (seconds) of the run that wrote the row.
    pub synced_at: i64,
}
