use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Id;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IdentifierMandatory,
    IdentifierNotAllowed,
    IdentifierMismatch,
    DuplicateIdentifier,
    UnexpectedPayloadContent,
    InvalidPayloadValue,
    MissingRequiredAttribute,
    EntityNotFound,
    OutdatedInstance,
    MandatoryConstraintViolation,
    CardinalityViolation,
    CircularMandatoryReference,
    InsertRowCountMismatch,
    UpdateRowCountMismatch,
    DeleteRowCountMismatch,
    ReferenceRowCountMismatch,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::IdentifierMandatory => "IDENTIFIER_MANDATORY",
            ErrorCode::IdentifierNotAllowed => "IDENTIFIER_NOT_ALLOWED",
            ErrorCode::IdentifierMismatch => "IDENTIFIER_MISMATCH",
            ErrorCode::DuplicateIdentifier => "DUPLICATE_IDENTIFIER",
            ErrorCode::UnexpectedPayloadContent => "UNEXPECTED_PAYLOAD_CONTENT",
            ErrorCode::InvalidPayloadValue => "INVALID_PAYLOAD_VALUE",
            ErrorCode::MissingRequiredAttribute => "MISSING_REQUIRED_ATTRIBUTE",
            ErrorCode::EntityNotFound => "ENTITY_NOT_FOUND",
            ErrorCode::OutdatedInstance => "OUTDATED_INSTANCE",
            ErrorCode::MandatoryConstraintViolation => "MANDATORY_CONSTRAINT_VIOLATION",
            ErrorCode::CardinalityViolation => "CARDINALITY_VIOLATION",
            ErrorCode::CircularMandatoryReference => "CIRCULAR_MANDATORY_REFERENCE",
            ErrorCode::InsertRowCountMismatch => "INSERT_ROW_COUNT_MISMATCH",
            ErrorCode::UpdateRowCountMismatch => "UPDATE_ROW_COUNT_MISMATCH",
            ErrorCode::DeleteRowCountMismatch => "DELETE_ROW_COUNT_MISMATCH",
            ErrorCode::ReferenceRowCountMismatch => "REFERENCE_ROW_COUNT_MISMATCH",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-correctable problem located inside a payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub code: ErrorCode,
    /// Dotted path into the payload, `items[1].product` style; empty for the root.
    pub location: String,
    pub identifier: Option<Id>,
    pub message: String,
}

impl Feedback {
    pub fn new(code: ErrorCode, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            location: location.into(),
            identifier: None,
            message: message.into(),
        }
    }

    pub fn with_identifier(mut self, id: Id) -> Self {
        self.identifier = Some(id);
        self
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_empty() {
            write!(f, "{}: {}", self.code, self.message)
        } else {
            write!(f, "{} at {}: {}", self.code, self.location, self.message)
        }
    }
}

fn join_feedback(feedback: &[Feedback]) -> String {
    feedback
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum TaxisError {
    #[error("validation error: {}", join_feedback(.feedback))]
    Validation { feedback: Vec<Feedback> },
    #[error("consistency violation {code}: {message}")]
    Consistency {
        code: ErrorCode,
        message: String,
        identifiers: Vec<Id>,
    },
    #[error("execution error {code}: {message}")]
    Execution { code: ErrorCode, message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
}

impl TaxisError {
    pub fn validation(feedback: Feedback) -> Self {
        Self::Validation {
            feedback: vec![feedback],
        }
    }

    pub fn consistency(code: ErrorCode, message: impl Into<String>, identifiers: Vec<Id>) -> Self {
        Self::Consistency {
            code,
            message: message.into(),
            identifiers,
        }
    }

    pub fn execution(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Execution {
            code,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::configuration(message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Primary error code; the first feedback entry for validation errors.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TaxisError::Validation { feedback } => feedback.first().map(|entry| entry.code),
            TaxisError::Consistency { code, .. } | TaxisError::Execution { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    pub fn feedback(&self) -> &[Feedback] {
        match self {
            TaxisError::Validation { feedback } => feedback,
            _ => &[],
        }
    }
}

pub type TaxisResult<T> = Result<T, TaxisError>;
