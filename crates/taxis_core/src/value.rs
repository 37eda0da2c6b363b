use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Id, Timestamp};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ValueType {
    Str = 1,
    I64 = 2,
    F64 = 3,
    Bool = 4,
    Time = 5,
    Ref = 6,
    Blob = 7,
    Json = 8,
}

impl ValueType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(ValueType::Str),
            2 => Some(ValueType::I64),
            3 => Some(ValueType::F64),
            4 => Some(ValueType::Bool),
            5 => Some(ValueType::Time),
            6 => Some(ValueType::Ref),
            7 => Some(ValueType::Blob),
            8 => Some(ValueType::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Str(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Time(Timestamp),
    Ref(Id),
    Blob(Vec<u8>),
    Json(JsonValue),
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Str(_) => Some(ValueType::Str),
            Value::I64(_) => Some(ValueType::I64),
            Value::F64(_) => Some(ValueType::F64),
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Time(_) => Some(ValueType::Time),
            Value::Ref(_) => Some(ValueType::Ref),
            Value::Blob(_) => Some(ValueType::Blob),
            Value::Json(_) => Some(ValueType::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(value) => Some(*value),
            Value::Time(value) => Some(value.as_i64()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Reads an identifier stored either as text or as raw bytes.
    pub fn as_id(&self) -> Option<Id> {
        match self {
            Value::Ref(id) => Some(*id),
            Value::Str(value) => Id::parse(value).ok(),
            Value::Blob(bytes) => Id::from_slice(bytes),
            _ => None,
        }
    }

    /// JSON rendering used when a stored value is copied back into a payload.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Str(value) => JsonValue::String(value.clone()),
            Value::I64(value) => JsonValue::from(*value),
            Value::F64(value) => JsonValue::from(*value),
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::Time(value) => JsonValue::from(value.as_i64()),
            Value::Ref(id) => JsonValue::String(id.to_uuid_string()),
            Value::Blob(bytes) => JsonValue::from(bytes.clone()),
            Value::Json(value) => value.clone(),
        }
    }
}

impl From<Id> for Value {
    fn from(value: Id) -> Self {
        Value::Ref(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}
