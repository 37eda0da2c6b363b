use serde::{Deserialize, Serialize};

use crate::{Id, ReferenceKey, TaxisResult};

/// Snapshot of a persisted instance with its contained children and the
/// identifiers it references. Carries identity only, never attribute values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceGraph {
    pub id: Id,
    pub entity_type: String,
    pub containments: Vec<ContainmentEdge>,
    pub references: Vec<ReferenceEdge>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainmentEdge {
    pub reference: ReferenceKey,
    pub graph: InstanceGraph,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub reference: ReferenceKey,
    pub id: Id,
    pub entity_type: String,
}

impl InstanceGraph {
    pub fn new(entity_type: impl Into<String>, id: Id) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            containments: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn with_child(mut self, reference: ReferenceKey, graph: InstanceGraph) -> Self {
        self.containments.push(ContainmentEdge { reference, graph });
        self
    }

    pub fn with_reference(
        mut self,
        reference: ReferenceKey,
        entity_type: impl Into<String>,
        id: Id,
    ) -> Self {
        self.references.push(ReferenceEdge {
            reference,
            id,
            entity_type: entity_type.into(),
        });
        self
    }

    pub fn contained(&self, reference: &ReferenceKey, id: Id) -> Option<&InstanceGraph> {
        self.containments
            .iter()
            .find(|edge| &edge.reference == reference && edge.graph.id == id)
            .map(|edge| &edge.graph)
    }

    pub fn contained_ids(&self, reference: &ReferenceKey) -> Vec<Id> {
        self.containments
            .iter()
            .filter(|edge| &edge.reference == reference)
            .map(|edge| edge.graph.id)
            .collect()
    }

    pub fn referenced_ids(&self, reference: &ReferenceKey) -> Vec<Id> {
        self.references
            .iter()
            .filter(|edge| &edge.reference == reference)
            .map(|edge| edge.id)
            .collect()
    }

    /// Children before their container, so deletes can run in this order.
    pub fn subtree_post_order(&self) -> Vec<&InstanceGraph> {
        let mut out = Vec::new();
        collect_post_order(self, &mut out);
        out
    }
}

fn collect_post_order<'a>(graph: &'a InstanceGraph, out: &mut Vec<&'a InstanceGraph>) {
    for edge in &graph.containments {
        collect_post_order(&edge.graph, out);
    }
    out.push(graph);
}

/// Loads the persisted containment tree and direct references of an instance.
pub trait InstanceGraphCollector {
    fn collect_graph(&self, entity_type: &str, id: Id) -> TaxisResult<InstanceGraph>;
}

#[cfg(test)]
mod tests {
    use super::InstanceGraph;
    use crate::{Id, ReferenceKey};

    #[test]
    fn post_order_visits_children_first() {
        let items = ReferenceKey::new("Order", "items");
        let (order, first, second) = (Id::new(), Id::new(), Id::new());
        let graph = InstanceGraph::new("Order", order)
            .with_child(items.clone(), InstanceGraph::new("OrderItem", first))
            .with_child(items.clone(), InstanceGraph::new("OrderItem", second));
        let ids: Vec<Id> = graph.subtree_post_order().iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![first, second, order]);
        assert_eq!(graph.contained_ids(&items), vec![first, second]);
        assert!(graph.contained(&items, second).is_some());
        assert!(graph.contained(&items, order).is_none());
    }
}
