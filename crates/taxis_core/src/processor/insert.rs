use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use super::{FeedbackCollector, ProcessorContext};
use crate::payload::{self, Payload};
use crate::{
    AddReferenceStatement, ContainerLink, ErrorCode, Feedback, Id, Instance, InsertStatement,
    ReferenceChange, Statement, TaxisResult,
};

/// Turns a create payload into insert, add-reference and existence statements.
pub struct InsertPayloadProcessor<'a> {
    ctx: ProcessorContext<'a>,
}

impl<'a> InsertPayloadProcessor<'a> {
    pub fn new(ctx: ProcessorContext<'a>) -> Self {
        Self { ctx }
    }

    /// Returns the payload completed with generated identifiers, type tags and
    /// versions, plus the statements that persist it.
    pub fn insert(
        &self,
        entity_type: &str,
        payload: &Payload,
    ) -> TaxisResult<(Payload, Vec<Statement>)> {
        let mut feedback = self.ctx.feedback();
        let mut statements = Vec::new();
        let (created, _) = insert_node(
            &self.ctx,
            entity_type,
            payload,
            None,
            "",
            &mut statements,
            &mut feedback,
        )?;
        feedback.finish()?;
        Ok((created, statements))
    }
}

/// Inserts one node and, recursively, its contained children.
pub(crate) fn insert_node(
    ctx: &ProcessorContext<'_>,
    declared_type: &str,
    source: &Payload,
    container: Option<ContainerLink>,
    location: &str,
    out: &mut Vec<Statement>,
    feedback: &mut FeedbackCollector,
) -> TaxisResult<(Payload, Id)> {
    if ctx.read_id(source, location, feedback)?.is_some() {
        feedback.report(Feedback::new(
            ErrorCode::IdentifierNotAllowed,
            location,
            "new instances must not carry an identifier",
        ))?;
    }
    let entity_type = concrete_insert_type(ctx, declared_type, source, location, feedback)?;
    let id = ctx.identifiers.generate();

    let mut created = source.clone();
    ctx.identifiers.write(&mut created, id);
    created.insert(
        payload::ENTITY_TYPE_KEY.to_string(),
        JsonValue::String(entity_type.clone()),
    );
    created.insert(payload::VERSION_KEY.to_string(), JsonValue::from(1));

    let mut instance = Instance::new(&entity_type, id);
    instance.version = Some(1);
    instance.audit = ctx.audit.clone();
    for (_, attribute) in ctx.resolver.all_attributes(&entity_type)? {
        let attribute_location = payload::child_location(location, &attribute.name);
        match payload::present(source, &attribute.name) {
            Some(raw) => match ctx.coercer.coerce(raw, attribute.value_type) {
                Ok(value) => {
                    instance.attributes.insert(attribute.name.clone(), value);
                }
                Err(err) => feedback.absorb(err, &attribute_location)?,
            },
            None if attribute.required && ctx.options.check_mandatory => {
                feedback.report(Feedback::new(
                    ErrorCode::MissingRequiredAttribute,
                    attribute_location,
                    format!("{} is required", attribute.name),
                ))?;
            }
            None => {}
        }
    }
    out.push(Statement::Insert(InsertStatement {
        instance,
        container,
    }));

    for (key, def) in ctx.resolver.all_references(&entity_type)? {
        let reference_location = payload::child_location(location, &def.name);
        let elements =
            ctx.reference_elements(def, source.get(&def.name), &reference_location, feedback)?;
        ctx.check_multiplicity(def, elements.len(), &reference_location, feedback)?;
        if elements.is_empty() {
            continue;
        }

        if def.containment {
            let mut children = Vec::with_capacity(elements.len());
            for (index, element) in elements.into_iter().enumerate() {
                let child_location = ctx.element_location(def, location, index);
                let link = ContainerLink {
                    reference: key.clone(),
                    owner: id,
                };
                let (child, _) = insert_node(
                    ctx,
                    &def.target,
                    element,
                    Some(link),
                    &child_location,
                    out,
                    feedback,
                )?;
                children.push(JsonValue::Object(child));
            }
            let value = if def.is_many() {
                JsonValue::Array(children)
            } else {
                children.pop().unwrap_or(JsonValue::Null)
            };
            created.insert(def.name.clone(), value);
            continue;
        }

        let mut targets = BTreeSet::new();
        for (index, element) in elements.into_iter().enumerate() {
            let element_location = ctx.element_location(def, location, index);
            let Some(target) = ctx.association_target(element, &element_location, feedback)? else {
                continue;
            };
            if !targets.insert(target) {
                feedback.report(
                    Feedback::new(
                        ErrorCode::DuplicateIdentifier,
                        element_location,
                        format!("{target} is listed twice"),
                    )
                    .with_identifier(target),
                )?;
                continue;
            }
            out.push(Statement::exists(ctx.target_type(def, element), target));
        }
        if !targets.is_empty() {
            out.push(Statement::AddReference(AddReferenceStatement {
                entity_type: entity_type.clone(),
                id,
                reference: key,
                referenced_ids: targets,
                already_referencing_instances: false,
                change: ReferenceChange::Attach,
            }));
        }
    }

    Ok((created, id))
}

fn concrete_insert_type(
    ctx: &ProcessorContext<'_>,
    declared_type: &str,
    source: &Payload,
    location: &str,
    feedback: &mut FeedbackCollector,
) -> TaxisResult<String> {
    let entity_type = ctx.concrete_type(declared_type, source)?;
    if let Some(tag) = payload::entity_type_tag(source) {
        if tag != entity_type {
            feedback.report(Feedback::new(
                ErrorCode::InvalidPayloadValue,
                payload::child_location(location, payload::ENTITY_TYPE_KEY),
                format!("{tag} is not a subtype of {declared_type}"),
            ))?;
        }
    }
    if ctx.resolver.entity_type(&entity_type)?.is_abstract {
        feedback.report(Feedback::new(
            ErrorCode::InvalidPayloadValue,
            location,
            format!("{entity_type} is abstract and cannot be created"),
        ))?;
    }
    Ok(entity_type)
}
