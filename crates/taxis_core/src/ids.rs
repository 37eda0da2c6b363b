use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{ErrorCode, Feedback, TaxisError, TaxisResult};

/// Record identifier shared by every table row of one instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; 16]);

impl Id {
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_uuid_str(value: &str) -> TaxisResult<Self> {
        let uuid = Uuid::parse_str(value).map_err(|err| {
            TaxisError::validation(Feedback::new(
                ErrorCode::InvalidPayloadValue,
                "",
                format!("invalid uuid '{value}': {err}"),
            ))
        })?;
        Ok(Self(*uuid.as_bytes()))
    }

    pub fn from_ulid_str(value: &str) -> TaxisResult<Self> {
        let ulid = ulid::Ulid::from_string(value).map_err(|err| {
            TaxisError::validation(Feedback::new(
                ErrorCode::InvalidPayloadValue,
                "",
                format!("invalid ulid '{value}': {err}"),
            ))
        })?;
        Ok(Self(ulid.to_bytes()))
    }

    /// Accepts either textual form; UUID is tried first.
    pub fn parse(value: &str) -> TaxisResult<Self> {
        if let Ok(uuid) = Uuid::parse_str(value) {
            return Ok(Self(*uuid.as_bytes()));
        }
        Self::from_ulid_str(value)
    }

    pub fn to_uuid_string(self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    pub fn to_ulid_string(self) -> String {
        ulid::Ulid::from_bytes(self.0).to_string()
    }

    pub fn as_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn as_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 16 {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(bytes);
            Some(Self(buf))
        } else {
            None
        }
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = Uuid::from_bytes(self.0);
        write!(f, "{uuid}")
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_uuid_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Id::parse(&value).map_err(|_| serde::de::Error::custom("invalid Id string"))
    }
}
