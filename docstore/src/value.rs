use std::collections::BTreeMap;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Timestamp, Value};
use time::OffsetDateTime;

/// Document data: a map of top-level field names to values.
pub type Fields = BTreeMap<String, Value>;

/// Conversion of plain Rust values into document field values.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::StringValue(self.to_string())),
        }
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::StringValue(self)),
        }
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::NumberValue(self as f64)),
        }
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::NumberValue(self)),
        }
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::BoolValue(self)),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::ListValue(ListValue {
                values: self.into_iter().map(IntoValue::into_value).collect(),
            })),
        }
    }
}

impl IntoValue for Fields {
    fn into_value(self) -> Value {
        Value {
            kind: Some(Kind::StructValue(Struct { fields: self })),
        }
    }
}

pub fn null_value() -> Value {
    Value {
        kind: Some(Kind::NullValue(0)),
    }
}

/// Builds a field map from name/value pairs.
pub fn fields<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Fields
where
    K: Into<String>,
    V: IntoValue,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into_value()))
        .collect()
}

pub fn timestamp_from(dt: OffsetDateTime) -> Timestamp {
    Timestamp {
        seconds: dt.unix_timestamp(),
        nanos: dt.nanosecond() as i32,
    }
}

pub fn timestamp_to(ts: &Timestamp) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts.seconds)
        .ok()?
        .replace_nanosecond(ts.nanos as u32)
        .ok()
}
