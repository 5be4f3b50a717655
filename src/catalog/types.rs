use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcreteType {
    String,
    Boolean,
    Integer,
    Timestamp,
    Date,
    Uuid,
    Composite,
}

impl std::fmt::Display for ConcreteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConcreteType::String => "string",
            ConcreteType::Boolean => "boolean",
            ConcreteType::Integer => "integer",
            ConcreteType::Timestamp => "timestamp",
            ConcreteType::Date => "date",
            ConcreteType::Uuid => "uuid",
            ConcreteType::Composite => "composite",
        };
        f.write_str(name)
    }
}

/// Reason a raw input could not be coerced into a typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionError {
    pub expected: String,
    pub got: String,
}

impl std::fmt::Display for CoercionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected {}, got {}", self.expected, self.got)
    }
}

impl CoercionError {
    fn new(expected: impl ToString, got: impl ToString) -> Self {
        Self {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

/// A typed profile value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Boolean(bool),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Composite(BTreeMap<String, Value>),
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) => 1,
            Value::Timestamp(_) => 2,
            Value::Date(_) => 3,
            Value::Uuid(_) => 4,
            Value::String(_) => 5,
            Value::Composite(_) => 6,
        }
    }

    pub fn concrete_type(&self) -> ConcreteType {
        match self {
            Value::String(_) => ConcreteType::String,
            Value::Boolean(_) => ConcreteType::Boolean,
            Value::Integer(_) => ConcreteType::Integer,
            Value::Timestamp(_) => ConcreteType::Timestamp,
            Value::Date(_) => ConcreteType::Date,
            Value::Uuid(_) => ConcreteType::Uuid,
            Value::Composite(_) => ConcreteType::Composite,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Timestamp(t) => {
                JsonValue::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Value::Uuid(u) => JsonValue::String(u.to_string()),
            Value::Composite(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Plain string rendering used as transformer input.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Composite(_) => self.to_json().to_string(),
            other => match other.to_json() {
                JsonValue::String(s) => s,
                json => json.to_string(),
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::Composite(a), Value::Composite(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl ConcreteType {
    /// Coerces a JSON scalar into a value of this type.
    ///
    /// Strings are accepted for every scalar type so that normalizer output and
    /// selector bind values share one path.
    pub fn coerce_json(self, raw: &JsonValue) -> Result<Value, CoercionError> {
        match (self, raw) {
            (ConcreteType::String, JsonValue::String(s)) => Ok(Value::String(s.clone())),
            (ConcreteType::Boolean, JsonValue::Bool(b)) => Ok(Value::Boolean(*b)),
            (ConcreteType::Integer, JsonValue::Number(n)) => n
                .as_i64()
                .map(Value::Integer)
                .ok_or_else(|| CoercionError::new(self, n)),
            (ConcreteType::Composite, _) => Err(CoercionError::new(
                "scalar type",
                "composite; composite values are coerced by their data type",
            )),
            (_, JsonValue::String(s)) => self.parse_str(s),
            (_, other) => Err(CoercionError::new(self, json_kind(other))),
        }
    }

    pub fn parse_str(self, raw: &str) -> Result<Value, CoercionError> {
        let trimmed = raw.trim();
        match self {
            ConcreteType::String => Ok(Value::String(raw.to_string())),
            ConcreteType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(CoercionError::new(self, format!("'{raw}'"))),
            },
            ConcreteType::Integer => trimmed
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| CoercionError::new(self, format!("'{raw}'"))),
            ConcreteType::Timestamp => DateTime::parse_from_rfc3339(trimmed)
                .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
                .map_err(|_| CoercionError::new("RFC 3339 timestamp", format!("'{raw}'"))),
            ConcreteType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| CoercionError::new("YYYY-MM-DD date", format!("'{raw}'"))),
            ConcreteType::Uuid => Uuid::parse_str(trimmed)
                .map(Value::Uuid)
                .map_err(|_| CoercionError::new(self, format!("'{raw}'"))),
            ConcreteType::Composite => Err(CoercionError::new(
                "scalar type",
                "composite; composite values are coerced by their data type",
            )),
        }
    }
}

pub(crate) fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Canonical key used to match requested values against stored ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueKey(String);

impl ValueKey {
    pub(crate) fn new(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ValueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConcreteType, Value};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            (0i64..4_000_000_000).prop_map(|secs| {
                Value::Timestamp(Utc.timestamp_opt(secs, 0).single().expect("ts"))
            }),
            any::<u128>().prop_map(|n| Value::Uuid(Uuid::from_u128(n))),
            "\\PC{0,24}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn ordering_is_total_and_antisymmetric(a in arb_value(), b in arb_value()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            prop_assert_eq!(a.cmp(&b).is_eq(), a == b);
        }

        #[test]
        fn json_rendering_coerces_back(v in arb_value()) {
            let back = v.concrete_type().coerce_json(&v.to_json()).expect("coerce");
            prop_assert_eq!(back, v);
        }
    }

    #[test]
    fn string_inputs_coerce_to_every_scalar_type() {
        assert_eq!(
            ConcreteType::Boolean.coerce_json(&json!("TRUE")).expect("bool"),
            Value::Boolean(true)
        );
        assert_eq!(
            ConcreteType::Integer.coerce_json(&json!(" 42 ")).expect("int"),
            Value::Integer(42)
        );
        assert_eq!(
            ConcreteType::Date
                .coerce_json(&json!("2024-02-29"))
                .expect("date")
                .to_json(),
            json!("2024-02-29")
        );
        assert!(ConcreteType::Integer.coerce_json(&json!(1.5)).is_err());
        assert!(ConcreteType::Uuid.coerce_json(&json!("not-a-uuid")).is_err());
        assert!(ConcreteType::Boolean.coerce_json(&json!(null)).is_err());
    }
}
