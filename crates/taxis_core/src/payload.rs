//! Payload documents and the identifier/coercion collaborators.

use serde_json::{Map, Value as JsonValue};

use crate::{ErrorCode, Feedback, Id, TaxisError, TaxisResult, Timestamp, Value, ValueType};

/// Nested key-value document describing desired or persisted entity state.
pub type Payload = Map<String, JsonValue>;

pub const ENTITY_TYPE_KEY: &str = "__entityType";
pub const VERSION_KEY: &str = "__version";
pub const DEFAULT_IDENTIFIER_KEY: &str = "__identifier";

/// Reads and writes the identifier field of payload maps.
pub trait IdentifierProvider: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self) -> Id;

    fn read(&self, payload: &Payload) -> TaxisResult<Option<Id>> {
        match payload.get(self.name()) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::String(raw)) => Id::parse(raw).map(Some),
            Some(other) => Err(TaxisError::validation(Feedback::new(
                ErrorCode::InvalidPayloadValue,
                "",
                format!("identifier must be a string, got {other}"),
            ))),
        }
    }

    fn write(&self, payload: &mut Payload, id: Id) {
        payload.insert(self.name().to_string(), JsonValue::String(id.to_uuid_string()));
    }
}

#[derive(Clone, Debug)]
pub struct UuidIdentifierProvider {
    key: String,
}

impl UuidIdentifierProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for UuidIdentifierProvider {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFIER_KEY)
    }
}

impl IdentifierProvider for UuidIdentifierProvider {
    fn name(&self) -> &str {
        &self.key
    }

    fn generate(&self) -> Id {
        Id::new()
    }
}

/// Converts payload values into storage-ready typed values.
pub trait Coercer: Send + Sync {
    fn coerce(&self, value: &JsonValue, target: ValueType) -> TaxisResult<Value>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCoercer;

impl Coercer for DefaultCoercer {
    fn coerce(&self, value: &JsonValue, target: ValueType) -> TaxisResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let coerced = match (target, value) {
            (ValueType::Str, JsonValue::String(raw)) => Some(Value::Str(raw.clone())),
            (ValueType::I64, JsonValue::Number(number)) => number
                .as_i64()
                .or_else(|| {
                    number
                        .as_f64()
                        .filter(|float| float.fract() == 0.0)
                        .map(|float| float as i64)
                })
                .map(Value::I64),
            (ValueType::I64, JsonValue::String(raw)) => raw.trim().parse().ok().map(Value::I64),
            (ValueType::F64, JsonValue::Number(number)) => number.as_f64().map(Value::F64),
            (ValueType::F64, JsonValue::String(raw)) => raw.trim().parse().ok().map(Value::F64),
            (ValueType::Bool, JsonValue::Bool(flag)) => Some(Value::Bool(*flag)),
            (ValueType::Bool, JsonValue::String(raw)) => match raw.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (ValueType::Time, JsonValue::Number(number)) => {
                number.as_i64().map(|micros| Value::Time(Timestamp(micros)))
            }
            (ValueType::Time, JsonValue::String(raw)) => raw
                .trim()
                .parse()
                .ok()
                .map(|micros| Value::Time(Timestamp(micros))),
            (ValueType::Ref, JsonValue::String(raw)) => Id::parse(raw).ok().map(Value::Ref),
            (ValueType::Blob, JsonValue::Array(items)) => items
                .iter()
                .map(|item| item.as_u64().and_then(|byte| u8::try_from(byte).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(Value::Blob),
            (ValueType::Json, other) => Some(Value::Json(other.clone())),
            _ => None,
        };
        coerced.ok_or_else(|| {
            TaxisError::validation(Feedback::new(
                ErrorCode::InvalidPayloadValue,
                "",
                format!("cannot coerce {value} to {target:?}"),
            ))
        })
    }
}

/// True when the key is reserved for identity/bookkeeping rather than data.
pub fn is_reserved_key(key: &str, identifiers: &dyn IdentifierProvider) -> bool {
    key == identifiers.name() || key == ENTITY_TYPE_KEY || key == VERSION_KEY
}

pub fn entity_type_tag(payload: &Payload) -> Option<&str> {
    payload.get(ENTITY_TYPE_KEY).and_then(JsonValue::as_str)
}

pub fn version_of(payload: &Payload) -> Option<i64> {
    payload.get(VERSION_KEY).and_then(JsonValue::as_i64)
}

/// `None` for absent keys and explicit nulls alike.
pub fn present<'a>(payload: &'a Payload, key: &str) -> Option<&'a JsonValue> {
    payload.get(key).filter(|value| !value.is_null())
}

pub fn child_location(parent: &str, member: &str) -> String {
    if parent.is_empty() {
        member.to_string()
    } else {
        format!("{parent}.{member}")
    }
}

pub fn element_location(parent: &str, member: &str, index: usize) -> String {
    format!("{}[{index}]", child_location(parent, member))
}
