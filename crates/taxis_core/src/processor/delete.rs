use std::collections::{BTreeMap, BTreeSet};

use super::ProcessorContext;
use crate::{
    DeleteStatement, Id, InstanceGraph, InstanceGraphCollector, ReferenceChange, ReferenceKey,
    RemoveReferenceStatement, Statement, TaxisResult,
};

/// Emits the statements that delete an instance and its containment subtree.
pub struct DeletePayloadProcessor<'a> {
    ctx: ProcessorContext<'a>,
    collector: &'a dyn InstanceGraphCollector,
}

impl<'a> DeletePayloadProcessor<'a> {
    pub fn new(ctx: ProcessorContext<'a>, collector: &'a dyn InstanceGraphCollector) -> Self {
        Self { ctx, collector }
    }

    pub fn delete(&self, entity_type: &str, id: Id) -> TaxisResult<Vec<Statement>> {
        self.ctx.resolver.entity_type(entity_type)?;
        let graph = self.collector.collect_graph(entity_type, id)?;
        Ok(delete_graph(&graph))
    }

    pub fn delete_graph(&self, graph: &InstanceGraph) -> Vec<Statement> {
        delete_graph(graph)
    }
}

/// Children before containers; detaches associations before each delete.
pub(crate) fn delete_graph(graph: &InstanceGraph) -> Vec<Statement> {
    let mut out = Vec::new();
    for node in graph.subtree_post_order() {
        let mut associations: BTreeMap<&ReferenceKey, BTreeSet<Id>> = BTreeMap::new();
        for edge in &node.references {
            associations.entry(&edge.reference).or_default().insert(edge.id);
        }
        for (reference, referenced_ids) in associations {
            out.push(Statement::RemoveReference(RemoveReferenceStatement {
                entity_type: node.entity_type.clone(),
                id: node.id,
                reference: reference.clone(),
                referenced_ids,
                already_referencing_instances: true,
                change: ReferenceChange::Attach,
            }));
        }
        out.push(Statement::Delete(DeleteStatement {
            entity_type: node.entity_type.clone(),
            id: node.id,
        }));
    }
    out
}
