use std::collections::BTreeSet;

use super::{FeedbackCollector, ProcessorContext};
use crate::{
    ErrorCode, Feedback, Id, InstanceGraph, InstanceGraphCollector, ReferenceDef, ReferenceKey,
    ReferenceStatement, Statement, TaxisError, TaxisResult,
};

/// Explicit association maintenance on an existing owner instance.
pub struct ReferencePayloadProcessor<'a> {
    ctx: ProcessorContext<'a>,
    collector: &'a dyn InstanceGraphCollector,
}

struct Resolved<'m> {
    graph: InstanceGraph,
    key: ReferenceKey,
    def: &'m ReferenceDef,
    current: BTreeSet<Id>,
}

impl<'a> ReferencePayloadProcessor<'a> {
    pub fn new(ctx: ProcessorContext<'a>, collector: &'a dyn InstanceGraphCollector) -> Self {
        Self { ctx, collector }
    }

    pub fn add_references(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        targets: &[Id],
    ) -> TaxisResult<Vec<Statement>> {
        let mut feedback = self.ctx.feedback();
        let resolved = self.resolve(entity_type, id, reference, &mut feedback)?;
        let requested: BTreeSet<Id> = targets.iter().copied().collect();
        if requested.len() != targets.len() {
            feedback.report(Feedback::new(
                ErrorCode::DuplicateIdentifier,
                reference,
                "identifiers must be distinct",
            ))?;
        }
        if !resolved.def.is_many() && resolved.current.len() + requested.len() > 1 {
            feedback.report(Feedback::new(
                ErrorCode::CardinalityViolation,
                reference,
                format!("{} holds a single instance", resolved.key),
            ))?;
        }
        let added: BTreeSet<Id> = requested.difference(&resolved.current).copied().collect();
        feedback.finish()?;
        if added.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = vec![Statement::exists(&resolved.graph.entity_type, id)];
        out.extend(
            added
                .iter()
                .map(|target| Statement::exists(&resolved.def.target, *target)),
        );
        out.push(Statement::AddReference(ReferenceStatement {
            referenced_ids: added,
            ..ReferenceStatement::single(&resolved.graph.entity_type, id, resolved.key, id)
                .with_snapshot(!resolved.current.is_empty())
        }));
        Ok(out)
    }

    pub fn remove_references(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        targets: &[Id],
    ) -> TaxisResult<Vec<Statement>> {
        let mut feedback = self.ctx.feedback();
        let resolved = self.resolve(entity_type, id, reference, &mut feedback)?;
        let mut removed = BTreeSet::new();
        for target in targets {
            if !resolved.current.contains(target) {
                feedback.report(
                    Feedback::new(
                        ErrorCode::EntityNotFound,
                        reference,
                        format!("{} does not reference {target}", resolved.key),
                    )
                    .with_identifier(*target),
                )?;
                continue;
            }
            removed.insert(*target);
        }
        feedback.finish()?;
        if removed.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Statement::RemoveReference(ReferenceStatement {
            referenced_ids: removed,
            ..ReferenceStatement::single(&resolved.graph.entity_type, id, resolved.key, id)
                .with_snapshot(true)
        })])
    }

    /// Points a single-valued association at `target`, or clears it.
    pub fn set_reference(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        target: Option<Id>,
    ) -> TaxisResult<Vec<Statement>> {
        let mut feedback = self.ctx.feedback();
        let resolved = self.resolve(entity_type, id, reference, &mut feedback)?;
        if resolved.def.is_many() {
            feedback.report(Feedback::new(
                ErrorCode::CardinalityViolation,
                reference,
                format!("{} is multi-valued; add or remove elements instead", resolved.key),
            ))?;
        }
        feedback.finish()?;

        let owner_type = resolved.graph.entity_type.as_str();
        let current = resolved.current.iter().next().copied();
        let mut out = Vec::new();
        match (current, target) {
            (Some(old), Some(new)) if old == new => {}
            (Some(old), Some(new)) => {
                out.push(Statement::RemoveReference(
                    ReferenceStatement::single(owner_type, id, resolved.key.clone(), old)
                        .with_snapshot(true),
                ));
                out.push(Statement::exists(&resolved.def.target, new));
                out.push(Statement::AddReference(
                    ReferenceStatement::single(owner_type, id, resolved.key, new)
                        .with_snapshot(true)
                        .repointing(),
                ));
            }
            (None, Some(new)) => {
                out.push(Statement::exists(owner_type, id));
                out.push(Statement::exists(&resolved.def.target, new));
                out.push(Statement::AddReference(ReferenceStatement::single(
                    owner_type,
                    id,
                    resolved.key,
                    new,
                )));
            }
            (Some(old), None) => {
                out.push(Statement::RemoveReference(
                    ReferenceStatement::single(owner_type, id, resolved.key, old)
                        .with_snapshot(true),
                ));
            }
            (None, None) => {}
        }
        Ok(out)
    }

    fn resolve(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        feedback: &mut FeedbackCollector,
    ) -> TaxisResult<Resolved<'a>> {
        let graph = self.collector.collect_graph(entity_type, id)?;
        let (key, def) = self
            .ctx
            .resolver
            .reference(&graph.entity_type, reference)?
            .ok_or_else(|| TaxisError::not_found(format!("reference {entity_type}.{reference}")))?;
        if def.containment {
            feedback.report(Feedback::new(
                ErrorCode::UnexpectedPayloadContent,
                reference,
                format!("{key} is a containment; children are created through their container"),
            ))?;
        }
        if !def.mutable {
            feedback.report(Feedback::new(
                ErrorCode::UnexpectedPayloadContent,
                reference,
                format!("{key} is not mutable"),
            ))?;
        }
        let current = graph.referenced_ids(&key).into_iter().collect();
        Ok(Resolved {
            graph,
            key,
            def,
            current,
        })
    }
}
