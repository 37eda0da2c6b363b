//! Payload processors: turn nested payload documents into flat statement
//! collections. They never touch storage directly; persisted identity comes
//! from an [`InstanceGraphCollector`](crate::InstanceGraphCollector).

mod delete;
mod insert;
mod reference;
mod update;

pub use delete::DeletePayloadProcessor;
pub use insert::InsertPayloadProcessor;
pub use reference::ReferencePayloadProcessor;
pub use update::UpdatePayloadProcessor;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::payload::{self, Payload};
use crate::{
    Audit, Coercer, ErrorCode, Feedback, Id, IdentifierProvider, MetadataResolver, ReferenceDef,
    TaxisError, TaxisResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackMode {
    /// Return the first validation problem as an error.
    FailFast,
    /// Keep processing and return every problem in one error.
    Collect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub optimistic_lock: bool,
    pub check_mandatory: bool,
    pub feedback: FeedbackMode,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            optimistic_lock: true,
            check_mandatory: true,
            feedback: FeedbackMode::Collect,
        }
    }
}

/// Collaborators and per-request settings shared by all processors.
#[derive(Clone)]
pub struct ProcessorContext<'a> {
    pub resolver: &'a dyn MetadataResolver,
    pub identifiers: &'a dyn IdentifierProvider,
    pub coercer: &'a dyn Coercer,
    pub options: WriteOptions,
    pub audit: Audit,
}

impl<'a> ProcessorContext<'a> {
    pub fn new(
        resolver: &'a dyn MetadataResolver,
        identifiers: &'a dyn IdentifierProvider,
        coercer: &'a dyn Coercer,
    ) -> Self {
        Self {
            resolver,
            identifiers,
            coercer,
            options: WriteOptions::default(),
            audit: Audit::default(),
        }
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = audit;
        self
    }

    pub(crate) fn feedback(&self) -> FeedbackCollector {
        FeedbackCollector::new(self.options.feedback)
    }

    /// Identifier of a payload; malformed identifiers are reported and read as `None`.
    pub(crate) fn read_id(
        &self,
        payload: &Payload,
        location: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<Option<Id>> {
        match self.identifiers.read(payload) {
            Ok(id) => Ok(id),
            Err(err) => {
                feedback.absorb(err, location)?;
                Ok(None)
            }
        }
    }

    /// Declared type, or the payload's type tag when it names a subtype.
    pub(crate) fn concrete_type(&self, declared: &str, payload: &Payload) -> TaxisResult<String> {
        self.resolver.entity_type(declared)?;
        match payload::entity_type_tag(payload) {
            Some(tag)
                if self.resolver.entity_type(tag).is_ok()
                    && self.resolver.is_assignable(tag, declared) =>
            {
                Ok(tag.to_string())
            }
            _ => Ok(declared.to_string()),
        }
    }

    /// An association element may only carry identity; returns its target id.
    pub(crate) fn association_target(
        &self,
        element: &Payload,
        location: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<Option<Id>> {
        self.reject_association_content(element, location, feedback)?;
        self.association_id(element, location, feedback)
    }

    /// Target id of an association element, without looking at its content.
    pub(crate) fn association_id(
        &self,
        element: &Payload,
        location: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<Option<Id>> {
        let id = self.read_id(element, location, feedback)?;
        if id.is_none() {
            feedback.report(Feedback::new(
                ErrorCode::IdentifierMandatory,
                location,
                "an identifier is required to attach an existing instance",
            ))?;
        }
        Ok(id)
    }

    /// Reports attributes on an element that attaches an existing instance.
    pub(crate) fn reject_association_content(
        &self,
        element: &Payload,
        location: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let extraneous: Vec<&str> = element
            .keys()
            .filter(|key| !payload::is_reserved_key(key, self.identifiers))
            .map(String::as_str)
            .collect();
        if extraneous.is_empty() {
            return Ok(());
        }
        feedback.report(Feedback::new(
            ErrorCode::UnexpectedPayloadContent,
            location,
            format!(
                "association element carries attributes {}",
                extraneous.join(", ")
            ),
        ))
    }

    /// Payload elements of a reference value; shape errors are reported.
    pub(crate) fn reference_elements<'p>(
        &self,
        def: &ReferenceDef,
        value: Option<&'p JsonValue>,
        location: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<Vec<&'p Payload>> {
        match value {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(JsonValue::Object(element)) if !def.is_many() => Ok(vec![element]),
            Some(JsonValue::Array(items)) if def.is_many() => {
                let mut elements = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    match item {
                        JsonValue::Object(element) => elements.push(element),
                        _ => feedback.report(Feedback::new(
                            ErrorCode::InvalidPayloadValue,
                            format!("{location}[{index}]"),
                            "reference elements must be objects",
                        ))?,
                    }
                }
                Ok(elements)
            }
            Some(_) => {
                let expected = if def.is_many() { "a list" } else { "an object" };
                feedback.report(Feedback::new(
                    ErrorCode::InvalidPayloadValue,
                    location,
                    format!("{} expects {expected}", def.name),
                ))?;
                Ok(Vec::new())
            }
        }
    }

    pub(crate) fn check_multiplicity(
        &self,
        def: &ReferenceDef,
        count: usize,
        location: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        if let Some(upper) = def.upper {
            if count > upper as usize {
                feedback.report(Feedback::new(
                    ErrorCode::CardinalityViolation,
                    location,
                    format!("{} accepts at most {upper} elements, got {count}", def.name),
                ))?;
            }
        }
        if self.options.check_mandatory && count < def.lower as usize {
            feedback.report(Feedback::new(
                ErrorCode::MissingRequiredAttribute,
                location,
                format!("{} requires at least {} elements", def.name, def.lower),
            ))?;
        }
        Ok(())
    }

    /// Target type of an association element: its type tag if it names a subtype.
    pub(crate) fn target_type(&self, def: &ReferenceDef, element: &Payload) -> String {
        self.concrete_type(&def.target, element)
            .unwrap_or_else(|_| def.target.clone())
    }

    pub(crate) fn element_location(&self, def: &ReferenceDef, parent: &str, index: usize) -> String {
        if def.is_many() {
            payload::element_location(parent, &def.name, index)
        } else {
            payload::child_location(parent, &def.name)
        }
    }
}

/// Accumulates validation feedback according to the configured mode.
pub(crate) struct FeedbackCollector {
    mode: FeedbackMode,
    entries: Vec<Feedback>,
}

impl FeedbackCollector {
    pub(crate) fn new(mode: FeedbackMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
        }
    }

    pub(crate) fn report(&mut self, feedback: Feedback) -> TaxisResult<()> {
        match self.mode {
            FeedbackMode::FailFast => Err(TaxisError::validation(feedback)),
            FeedbackMode::Collect => {
                self.entries.push(feedback);
                Ok(())
            }
        }
    }

    /// Re-reports validation errors at `location`; other errors propagate.
    pub(crate) fn absorb(&mut self, err: TaxisError, location: &str) -> TaxisResult<()> {
        match err {
            TaxisError::Validation { feedback } => {
                for mut entry in feedback {
                    if entry.location.is_empty() {
                        entry.location = location.to_string();
                    }
                    self.report(entry)?;
                }
                Ok(())
            }
            other => Err(other),
        }
    }

    pub(crate) fn finish(self) -> TaxisResult<()> {
        if self.entries.is_empty() {
            Ok(())
        } else {
            Err(TaxisError::Validation {
                feedback: self.entries,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FeedbackCollector, FeedbackMode};
    use crate::{ErrorCode, Feedback, TaxisError};

    #[test]
    fn fail_fast_returns_first_problem() {
        let mut collector = FeedbackCollector::new(FeedbackMode::FailFast);
        let err = collector
            .report(Feedback::new(ErrorCode::IdentifierMandatory, "items[0]", "missing"))
            .expect_err("fail fast");
        assert_eq!(err.code(), Some(ErrorCode::IdentifierMandatory));
    }

    #[test]
    fn collect_mode_relocates_and_aggregates() {
        let mut collector = FeedbackCollector::new(FeedbackMode::Collect);
        collector
            .absorb(
                TaxisError::validation(Feedback::new(ErrorCode::InvalidPayloadValue, "", "bad")),
                "quantity",
            )
            .expect("collected");
        collector
            .report(Feedback::new(ErrorCode::MissingRequiredAttribute, "name", "required"))
            .expect("collected");
        let err = collector.finish().expect_err("two problems");
        assert_eq!(err.feedback().len(), 2);
        assert_eq!(err.feedback()[0].location, "quantity");
        assert!(
            collector_passthrough().is_err(),
            "non-validation errors are never swallowed"
        );
    }

    fn collector_passthrough() -> Result<(), TaxisError> {
        let mut collector = FeedbackCollector::new(FeedbackMode::Collect);
        collector.absorb(TaxisError::storage("disk"), "x")
    }
}
