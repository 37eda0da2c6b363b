use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use super::delete::delete_graph;
use super::insert::insert_node;
use super::{FeedbackCollector, ProcessorContext};
use crate::payload::{self, Payload};
use crate::{
    ContainerLink, ErrorCode, Feedback, Id, Instance, InstanceGraph, InstanceGraphCollector,
    ReferenceDef, ReferenceKey, ReferenceStatement, Statement, TaxisError, TaxisResult,
    UpdateStatement, Value,
};

/// Compares an original payload with an updated one and emits the statements
/// that move persisted state from the former to the latter.
pub struct UpdatePayloadProcessor<'a> {
    ctx: ProcessorContext<'a>,
    collector: &'a dyn InstanceGraphCollector,
}

/// One entity node under comparison.
struct Node<'p, 'g> {
    entity_type: String,
    original: &'p Payload,
    updated: &'p Payload,
    graph: &'g InstanceGraph,
    location: String,
}

impl<'a> UpdatePayloadProcessor<'a> {
    pub fn new(ctx: ProcessorContext<'a>, collector: &'a dyn InstanceGraphCollector) -> Self {
        Self { ctx, collector }
    }

    pub fn diff(
        &self,
        entity_type: &str,
        original: &Payload,
        updated: &Payload,
        check_mandatory: bool,
    ) -> TaxisResult<Vec<Statement>> {
        let mut ctx = self.ctx.clone();
        ctx.options.check_mandatory = check_mandatory;
        let mut feedback = ctx.feedback();

        let original_id = root_id(&ctx, original, "original")?;
        let updated_id = root_id(&ctx, updated, "updated")?;
        if original_id != updated_id {
            return Err(TaxisError::validation(
                Feedback::new(
                    ErrorCode::IdentifierMismatch,
                    "",
                    format!("updated payload targets {updated_id}, original is {original_id}"),
                )
                .with_identifier(original_id),
            ));
        }

        let declared = ctx.concrete_type(entity_type, original)?;
        let graph = self.collector.collect_graph(&declared, original_id)?;
        let concrete = match payload::entity_type_tag(original) {
            None if ctx.resolver.is_assignable(&graph.entity_type, &declared) => {
                graph.entity_type.clone()
            }
            _ => declared,
        };
        let mut statements = Vec::new();
        let node = Node {
            entity_type: concrete,
            original,
            updated,
            graph: &graph,
            location: String::new(),
        };
        self.diff_node(&ctx, &node, &mut statements, &mut feedback)?;
        feedback.finish()?;
        debug!(
            "taxis: diff of {entity_type} {original_id} produced {} statements",
            statements.len()
        );
        Ok(statements)
    }

    fn diff_node(
        &self,
        ctx: &ProcessorContext<'_>,
        node: &Node<'_, '_>,
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let id = node.graph.id;
        let previous_version = payload::version_of(node.original);
        if ctx.options.optimistic_lock {
            if let Some(version) = payload::version_of(node.updated) {
                if Some(version) != previous_version {
                    feedback.report(
                        Feedback::new(
                            ErrorCode::OutdatedInstance,
                            node.location.as_str(),
                            format!(
                                "{} {id} was modified: version {version} is not {}",
                                node.entity_type,
                                previous_version
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "unversioned".into())
                            ),
                        )
                        .with_identifier(id),
                    )?;
                }
            }
        }

        let changed = self.changed_attributes(ctx, node, feedback)?;
        if !changed.is_empty() {
            let mut instance = Instance::new(&node.entity_type, id);
            instance.attributes = changed;
            instance.version = previous_version.map(|version| version + 1);
            instance.audit = ctx.audit.clone();
            out.push(Statement::exists(&node.entity_type, id));
            out.push(Statement::Update(UpdateStatement {
                instance,
                previous_version,
            }));
        }

        for (key, def) in ctx.resolver.all_references(&node.entity_type)? {
            if !def.mutable {
                continue;
            }
            let Some(update_value) = node.updated.get(&def.name) else {
                continue;
            };
            let location = payload::child_location(&node.location, &def.name);
            let update_elements =
                ctx.reference_elements(def, Some(update_value), &location, feedback)?;
            ctx.check_multiplicity(def, update_elements.len(), &location, feedback)?;

            let mut original_elements = BTreeMap::new();
            let original_ids = match node.original.get(&def.name) {
                Some(value) => {
                    let mut ids = Vec::new();
                    let elements =
                        ctx.reference_elements(def, Some(value), &location, feedback)?;
                    for (index, element) in elements.into_iter().enumerate() {
                        let element_location = ctx.element_location(def, &node.location, index);
                        match ctx.read_id(element, &element_location, feedback)? {
                            Some(original_id) => {
                                original_elements.insert(original_id, element);
                                ids.push(original_id);
                            }
                            None => feedback.report(Feedback::new(
                                ErrorCode::IdentifierMandatory,
                                element_location,
                                "original elements must carry their identifier",
                            ))?,
                        }
                    }
                    ids
                }
                None if def.containment => node.graph.contained_ids(&key),
                None => node.graph.referenced_ids(&key),
            };

            let reference = ReferenceDiff {
                node,
                key: &key,
                def,
                original_ids: &original_ids,
                original_elements: &original_elements,
                location: &location,
            };
            let single = update_elements.first().copied();
            match (def.containment, def.is_many()) {
                (true, true) => {
                    self.diff_containments(ctx, &reference, &update_elements, out, feedback)?
                }
                (true, false) => self.diff_containment(ctx, &reference, single, out, feedback)?,
                (false, true) => {
                    self.diff_associations(ctx, &reference, &update_elements, out, feedback)?
                }
                (false, false) => self.diff_association(ctx, &reference, single, out, feedback)?,
            }
        }
        Ok(())
    }

    fn changed_attributes(
        &self,
        ctx: &ProcessorContext<'_>,
        node: &Node<'_, '_>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<BTreeMap<String, Value>> {
        let mut changed = BTreeMap::new();
        for (_, attribute) in ctx.resolver.all_attributes(&node.entity_type)? {
            if !attribute.mutable {
                continue;
            }
            let location = payload::child_location(&node.location, &attribute.name);
            let before = payload::present(node.original, &attribute.name);
            let after = payload::present(node.updated, &attribute.name);
            match (before, after) {
                (None, None) => {}
                (Some(_), None) => {
                    if attribute.required && ctx.options.check_mandatory {
                        feedback.report(Feedback::new(
                            ErrorCode::MissingRequiredAttribute,
                            location,
                            format!("{} is required", attribute.name),
                        ))?;
                        continue;
                    }
                    changed.insert(attribute.name.clone(), Value::Null);
                }
                (before, Some(raw)) => {
                    let after = match ctx.coercer.coerce(raw, attribute.value_type) {
                        Ok(value) => value,
                        Err(err) => {
                            feedback.absorb(err, &location)?;
                            continue;
                        }
                    };
                    let before =
                        before.and_then(|raw| ctx.coercer.coerce(raw, attribute.value_type).ok());
                    if before.as_ref() != Some(&after) {
                        changed.insert(attribute.name.clone(), after);
                    }
                }
            }
        }
        Ok(changed)
    }

    fn diff_containments(
        &self,
        ctx: &ProcessorContext<'_>,
        reference: &ReferenceDiff<'_, '_, '_>,
        update_elements: &[&Payload],
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let mut seen = BTreeSet::new();
        for (index, element) in update_elements.iter().enumerate() {
            let location = ctx.element_location(reference.def, &reference.node.location, index);
            match ctx.read_id(element, &location, feedback)? {
                None => reference.insert_child(ctx, element, &location, out, feedback)?,
                Some(child_id) if !seen.insert(child_id) => {
                    feedback.report(duplicate(child_id, location))?;
                }
                Some(child_id) if reference.original_ids.contains(&child_id) => {
                    self.recurse(ctx, reference, child_id, element, location, out, feedback)?;
                }
                Some(child_id) => feedback.report(
                    Feedback::new(
                        ErrorCode::IdentifierNotAllowed,
                        location,
                        format!("{child_id} is not contained in {}", reference.key),
                    )
                    .with_identifier(child_id),
                )?,
            }
        }
        for original_id in reference.original_ids {
            if !seen.contains(original_id) {
                self.remove_child(reference, *original_id, out)?;
            }
        }
        Ok(())
    }

    fn diff_containment(
        &self,
        ctx: &ProcessorContext<'_>,
        reference: &ReferenceDiff<'_, '_, '_>,
        update_element: Option<&Payload>,
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let location = reference.location;
        let original_id = reference.original_ids.first().copied();
        let Some(element) = update_element else {
            if let Some(original_id) = original_id {
                self.remove_child(reference, original_id, out)?;
            }
            return Ok(());
        };
        match (original_id, ctx.read_id(element, location, feedback)?) {
            (original_id, None) => {
                reference.insert_child(ctx, element, location, out, feedback)?;
                if let Some(original_id) = original_id {
                    self.remove_child(reference, original_id, out)?;
                }
            }
            (Some(original_id), Some(child_id)) if original_id == child_id => {
                let location = location.to_string();
                self.recurse(ctx, reference, child_id, element, location, out, feedback)?;
            }
            (Some(original_id), Some(child_id)) => feedback.report(
                Feedback::new(
                    ErrorCode::IdentifierMismatch,
                    location,
                    format!("{} holds {original_id}, not {child_id}", reference.key),
                )
                .with_identifier(child_id),
            )?,
            (None, Some(child_id)) => feedback.report(
                Feedback::new(
                    ErrorCode::IdentifierNotAllowed,
                    location,
                    format!("{} is empty; new children must not carry an identifier", reference.key),
                )
                .with_identifier(child_id),
            )?,
        }
        Ok(())
    }

    fn diff_associations(
        &self,
        ctx: &ProcessorContext<'_>,
        reference: &ReferenceDiff<'_, '_, '_>,
        update_elements: &[&Payload],
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let mut seen = BTreeSet::new();
        let mut added = Vec::new();
        for (index, element) in update_elements.iter().enumerate() {
            let location = ctx.element_location(reference.def, &reference.node.location, index);
            let Some(target) = ctx.association_id(element, &location, feedback)? else {
                continue;
            };
            if !seen.insert(target) {
                feedback.report(duplicate(target, location))?;
                continue;
            }
            if !reference.original_ids.contains(&target) {
                ctx.reject_association_content(element, &location, feedback)?;
                added.push((target, ctx.target_type(reference.def, element)));
            }
        }

        let snapshot = !reference.original_ids.is_empty();
        for original_id in reference.original_ids {
            if !seen.contains(original_id) {
                out.push(Statement::RemoveReference(
                    reference.statement(*original_id).with_snapshot(true),
                ));
            }
        }
        for (target, target_type) in added {
            out.push(Statement::exists(target_type, target));
            out.push(Statement::AddReference(
                reference.statement(target).with_snapshot(snapshot),
            ));
        }
        Ok(())
    }

    fn diff_association(
        &self,
        ctx: &ProcessorContext<'_>,
        reference: &ReferenceDiff<'_, '_, '_>,
        update_element: Option<&Payload>,
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let original_id = reference.original_ids.first().copied();
        let target = match update_element {
            Some(element) => match ctx.association_id(element, reference.location, feedback)? {
                Some(target) => {
                    if original_id != Some(target) {
                        ctx.reject_association_content(element, reference.location, feedback)?;
                    }
                    Some((target, ctx.target_type(reference.def, element)))
                }
                None => return Ok(()),
            },
            None => None,
        };
        match (original_id, target) {
            (None, None) => {}
            (Some(original_id), None) => {
                out.push(Statement::RemoveReference(
                    reference.statement(original_id).with_snapshot(true),
                ));
            }
            (Some(original_id), Some((target, _))) if original_id == target => {}
            (Some(original_id), Some((target, target_type))) => {
                out.push(Statement::RemoveReference(
                    reference.statement(original_id).with_snapshot(true),
                ));
                out.push(Statement::exists(target_type, target));
                out.push(Statement::AddReference(
                    reference.statement(target).with_snapshot(true).repointing(),
                ));
            }
            (None, Some((target, target_type))) => {
                out.push(Statement::exists(target_type, target));
                out.push(Statement::AddReference(reference.statement(target)));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn recurse(
        &self,
        ctx: &ProcessorContext<'_>,
        reference: &ReferenceDiff<'_, '_, '_>,
        child_id: Id,
        element: &Payload,
        location: String,
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let Some(child_graph) = reference.node.graph.contained(reference.key, child_id) else {
            return feedback.report(
                Feedback::new(
                    ErrorCode::EntityNotFound,
                    location,
                    format!("{child_id} is no longer contained in {}", reference.key),
                )
                .with_identifier(child_id),
            );
        };
        let placeholder;
        let original = match reference.original_elements.get(&child_id) {
            Some(original) => *original,
            None => {
                let mut identity = Payload::new();
                ctx.identifiers.write(&mut identity, child_id);
                placeholder = identity;
                &placeholder
            }
        };
        let entity_type = match payload::entity_type_tag(original) {
            Some(tag) if ctx.resolver.is_assignable(tag, &reference.def.target) => tag.to_string(),
            _ => child_graph.entity_type.clone(),
        };
        let child = Node {
            entity_type,
            original,
            updated: element,
            graph: child_graph,
            location,
        };
        self.diff_node(ctx, &child, out, feedback)
    }

    /// Detaches a contained child and deletes its subtree.
    fn remove_child(
        &self,
        reference: &ReferenceDiff<'_, '_, '_>,
        child_id: Id,
        out: &mut Vec<Statement>,
    ) -> TaxisResult<()> {
        out.push(Statement::RemoveReference(
            reference.statement(child_id).with_snapshot(true),
        ));
        match reference.node.graph.contained(reference.key, child_id) {
            Some(child_graph) => out.extend(delete_graph(child_graph)),
            None => {
                let child_graph = self.collector.collect_graph(&reference.def.target, child_id)?;
                out.extend(delete_graph(&child_graph));
            }
        }
        Ok(())
    }
}

/// A reference of one node being compared.
struct ReferenceDiff<'n, 'p, 'g> {
    node: &'n Node<'p, 'g>,
    key: &'n ReferenceKey,
    def: &'n ReferenceDef,
    original_ids: &'n [Id],
    original_elements: &'n BTreeMap<Id, &'p Payload>,
    location: &'n str,
}

impl ReferenceDiff<'_, '_, '_> {
    fn statement(&self, target: Id) -> ReferenceStatement {
        ReferenceStatement::single(
            &self.node.entity_type,
            self.node.graph.id,
            self.key.clone(),
            target,
        )
    }

    fn insert_child(
        &self,
        ctx: &ProcessorContext<'_>,
        element: &Payload,
        location: &str,
        out: &mut Vec<Statement>,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<()> {
        let link = ContainerLink {
            reference: self.key.clone(),
            owner: self.node.graph.id,
        };
        insert_node(ctx, &self.def.target, element, Some(link), location, out, feedback)?;
        Ok(())
    }
}

fn root_id(ctx: &ProcessorContext<'_>, payload: &Payload, which: &str) -> TaxisResult<Id> {
    ctx.identifiers.read(payload)?.ok_or_else(|| {
        TaxisError::validation(Feedback::new(
            ErrorCode::IdentifierMandatory,
            "",
            format!("the {which} payload has no identifier"),
        ))
    })
}

fn duplicate(id: Id, location: String) -> Feedback {
    Feedback::new(
        ErrorCode::DuplicateIdentifier,
        location,
        format!("{id} is listed twice"),
    )
    .with_identifier(id)
}
