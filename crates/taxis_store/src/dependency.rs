//! Orders the inserts of one batch so that every constraining foreign key
//! points at a row that already exists when the referencing row is written.

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use aideon_taxis_core::{
    AddReferenceStatement, ErrorCode, Id, InsertStatement, MetadataResolver, ReferenceChange,
    ReferenceKey, ReferenceStatement, StorageRule, TaxisError, TaxisResult,
};

/// A physical link between two instances of the current batch, derived from
/// an add-reference statement or a container link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RdbmsReference {
    pub owner: Id,
    pub target: Id,
    pub reference: ReferenceKey,
    pub storage: StorageRule,
    /// The row holding the column must be written after the other side.
    pub constraining: bool,
}

impl RdbmsReference {
    /// Instance whose row carries the foreign key column.
    pub fn holder(&self) -> Id {
        match self.storage {
            StorageRule::InverseForeignKey => self.target,
            StorageRule::ForeignKey | StorageRule::JoinTable => self.owner,
        }
    }

    /// Instance whose id is written into the holder's column.
    pub fn referenced(&self) -> Id {
        match self.storage {
            StorageRule::InverseForeignKey => self.owner,
            StorageRule::ForeignKey | StorageRule::JoinTable => self.target,
        }
    }
}

/// Foreign key value written as part of a row insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoldedColumn {
    pub table: String,
    pub column: String,
    pub value: Id,
}

#[derive(Clone, Debug, Default)]
pub struct InsertPlan {
    /// Indexes into the insert statements, in execution order.
    pub order: Vec<usize>,
    /// Foreign key columns folded into the insert of the holding row.
    pub folded: HashMap<Id, Vec<FoldedColumn>>,
    /// Links written once every insert has run.
    pub deferred: Vec<AddReferenceStatement>,
}

impl InsertPlan {
    pub fn folded_for(&self, id: Id, table: &str) -> impl Iterator<Item = &FoldedColumn> {
        self.folded
            .get(&id)
            .into_iter()
            .flatten()
            .filter(move |column| column.table == table)
    }
}

/// One owner/target pair of a link statement.
struct Link {
    entity_type: String,
    owner: Id,
    target: Id,
    reference: ReferenceKey,
    already_referencing_instances: bool,
    change: ReferenceChange,
}

pub struct DependencyResolver<'a> {
    resolver: &'a dyn MetadataResolver,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(resolver: &'a dyn MetadataResolver) -> Self {
        Self { resolver }
    }

    /// Ordering references among pending inserts. Join tables never order.
    pub fn references(
        &self,
        inserts: &[InsertStatement],
        adds: &[AddReferenceStatement],
    ) -> TaxisResult<Vec<RdbmsReference>> {
        let pending: BTreeSet<Id> = inserts.iter().map(|insert| insert.instance.id).collect();
        let mut references = Vec::new();
        for link in links(inserts, adds) {
            if !pending.contains(&link.owner) && !pending.contains(&link.target) {
                continue;
            }
            let def = self.resolver.reference_def(&link.reference)?;
            let constraining = match def.storage {
                StorageRule::JoinTable => continue,
                // Containment orders even when optional: containment forms a tree, so these
                // edges cannot close a cycle, and the column is written by the insert itself
                // instead of a deferred update.
                StorageRule::ForeignKey => def.is_mandatory() || def.containment,
                StorageRule::InverseForeignKey => {
                    let opposite_mandatory = match self.resolver.opposite(&link.reference)? {
                        Some(opposite) => self.resolver.is_mandatory(&opposite)?,
                        None => false,
                    };
                    opposite_mandatory || def.containment
                }
            };
            references.push(RdbmsReference {
                owner: link.owner,
                target: link.target,
                reference: link.reference,
                storage: def.storage,
                constraining,
            });
        }
        Ok(references)
    }

    pub fn plan(
        &self,
        inserts: &[InsertStatement],
        adds: &[AddReferenceStatement],
    ) -> TaxisResult<InsertPlan> {
        let mut graph = DiGraph::<Id, ReferenceKey>::new();
        let mut nodes: HashMap<Id, NodeIndex> = HashMap::new();
        for insert in inserts {
            nodes.insert(insert.instance.id, graph.add_node(insert.instance.id));
        }
        for reference in self.references(inserts, adds)? {
            if !reference.constraining {
                continue;
            }
            let (Some(&before), Some(&after)) = (
                nodes.get(&reference.referenced()),
                nodes.get(&reference.holder()),
            ) else {
                continue;
            };
            graph.add_edge(before, after, reference.reference);
        }

        let sorted = toposort(&graph, None).map_err(|_| cycle_error(&graph))?;
        let position: HashMap<Id, usize> = sorted
            .iter()
            .enumerate()
            .map(|(position, node)| (graph[*node], position))
            .collect();
        let index: HashMap<Id, usize> = inserts
            .iter()
            .enumerate()
            .map(|(index, insert)| (insert.instance.id, index))
            .collect();

        let mut plan = InsertPlan {
            order: sorted.iter().map(|node| index[&graph[*node]]).collect(),
            ..InsertPlan::default()
        };
        for link in links(inserts, adds) {
            let def = self.resolver.reference_def(&link.reference)?;
            let (holder, referenced, table) = match def.storage {
                StorageRule::JoinTable => {
                    plan.deferred.push(link.into_statement());
                    continue;
                }
                StorageRule::ForeignKey => (
                    link.owner,
                    link.target,
                    self.resolver.table_name(&link.reference.owner)?,
                ),
                StorageRule::InverseForeignKey => (
                    link.target,
                    link.owner,
                    self.resolver.table_name(&def.target)?,
                ),
            };
            let Some(&holder_position) = position.get(&holder) else {
                plan.deferred.push(link.into_statement());
                continue;
            };
            let available = position
                .get(&referenced)
                .is_none_or(|position| *position < holder_position);
            if available {
                plan.folded.entry(holder).or_default().push(FoldedColumn {
                    table: table.to_string(),
                    column: self.resolver.reference_column(&link.reference)?.to_string(),
                    value: referenced,
                });
            } else {
                warn!(
                    "taxis: optional reference {} of {holder} deferred until {referenced} is inserted",
                    link.reference
                );
                plan.deferred.push(link.into_statement());
            }
        }
        debug!(
            "taxis: planned {} inserts, {} folded holders, {} deferred links",
            plan.order.len(),
            plan.folded.len(),
            plan.deferred.len()
        );
        Ok(plan)
    }
}

fn links(inserts: &[InsertStatement], adds: &[AddReferenceStatement]) -> Vec<Link> {
    let types: HashMap<Id, &str> = inserts
        .iter()
        .map(|insert| (insert.instance.id, insert.instance.entity_type.as_str()))
        .collect();
    let mut out = Vec::new();
    for insert in inserts {
        if let Some(container) = &insert.container {
            out.push(Link {
                entity_type: types
                    .get(&container.owner)
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| container.reference.owner.clone()),
                owner: container.owner,
                target: insert.instance.id,
                reference: container.reference.clone(),
                already_referencing_instances: false,
                change: ReferenceChange::Attach,
            });
        }
    }
    for add in adds {
        for target in &add.referenced_ids {
            out.push(Link {
                entity_type: add.entity_type.clone(),
                owner: add.id,
                target: *target,
                reference: add.reference.clone(),
                already_referencing_instances: add.already_referencing_instances,
                change: add.change,
            });
        }
    }
    out
}

impl Link {
    fn into_statement(self) -> AddReferenceStatement {
        ReferenceStatement {
            entity_type: self.entity_type,
            id: self.owner,
            reference: self.reference,
            referenced_ids: BTreeSet::from([self.target]),
            already_referencing_instances: self.already_referencing_instances,
            change: self.change,
        }
    }
}

fn cycle_error(graph: &DiGraph<Id, ReferenceKey>) -> TaxisError {
    let mut identifiers: Vec<Id> = tarjan_scc(graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || graph.contains_edge(component[0], component[0])
        })
        .flatten()
        .map(|node| graph[node])
        .collect();
    identifiers.sort();
    TaxisError::consistency(
        ErrorCode::CircularMandatoryReference,
        format!("{} instances reference each other mandatorily", identifiers.len()),
        identifiers,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::DependencyResolver;
    use aideon_taxis_core::{
        ContainerLink, ErrorCode, Id, Instance, InsertStatement, Model, ReferenceKey,
        ReferenceStatement,
    };

    fn model() -> Model {
        Model::from_value(json!({"types": [
            {"name": "A", "table": "a", "references": [
                {"name": "b", "target": "B", "lower": 1, "upper": 1,
                 "storage": "foreign_key", "column": "b_id"}]},
            {"name": "B", "table": "b", "references": [
                {"name": "a", "target": "A", "lower": 1, "upper": 1,
                 "storage": "foreign_key", "column": "a_id"},
                {"name": "peer", "target": "A", "upper": 1,
                 "storage": "foreign_key", "column": "peer_id"},
                {"name": "children", "target": "A", "containment": true,
                 "storage": "inverse_foreign_key", "column": "parent_id"}]}
        ]}))
        .expect("model")
    }

    fn insert(entity_type: &str, id: Id) -> InsertStatement {
        InsertStatement {
            instance: Instance::new(entity_type, id),
            container: None,
        }
    }

    fn link(owner_type: &str, owner: Id, reference: &str, target: Id) -> ReferenceStatement {
        ReferenceStatement::single(owner_type, owner, ReferenceKey::new(owner_type, reference), target)
    }

    #[test]
    fn mandatory_foreign_keys_order_targets_first() {
        let model = model();
        let (a, b) = (Id::new(), Id::new());
        let inserts = vec![insert("A", a), insert("B", b)];
        let adds = vec![link("A", a, "b", b)];
        let plan = DependencyResolver::new(&model).plan(&inserts, &adds).expect("plan");
        assert_eq!(plan.order, vec![1, 0]);
        let folded: Vec<_> = plan.folded_for(a, "a").collect();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].column, "b_id");
        assert_eq!(folded[0].value, b);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn mandatory_cycles_fail_with_participants() {
        let model = model();
        let (a, b, other) = (Id::new(), Id::new(), Id::new());
        let inserts = vec![insert("A", a), insert("B", b), insert("A", other)];
        let adds = vec![link("A", a, "b", b), link("B", b, "a", a)];
        let err = DependencyResolver::new(&model)
            .plan(&inserts, &adds)
            .expect_err("cycle");
        assert_eq!(err.code(), Some(ErrorCode::CircularMandatoryReference));
        match err {
            aideon_taxis_core::TaxisError::Consistency { identifiers, .. } => {
                let participants: BTreeSet<Id> = identifiers.into_iter().collect();
                assert_eq!(participants, BTreeSet::from([a, b]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn optional_links_to_later_rows_are_deferred() {
        let model = model();
        let (a, b) = (Id::new(), Id::new());
        let mut child = insert("A", a);
        child.container = Some(ContainerLink {
            reference: ReferenceKey::new("B", "children"),
            owner: b,
        });
        let inserts = vec![child, insert("B", b)];
        let adds = vec![link("B", b, "peer", a), link("A", a, "b", b)];
        let plan = DependencyResolver::new(&model).plan(&inserts, &adds).expect("plan");
        assert_eq!(plan.order, vec![1, 0]);
        assert_eq!(plan.folded_for(a, "a").count(), 2);
        assert_eq!(plan.deferred.len(), 1);
        assert_eq!(plan.deferred[0].reference, ReferenceKey::new("B", "peer"));
    }
}
