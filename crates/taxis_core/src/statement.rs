//! Typed write intents. Statements are plain data; executors turn them into SQL.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Id, ReferenceKey, Timestamp, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub timestamp: Option<Timestamp>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

impl Audit {
    pub fn now(user_id: Option<String>, user_name: Option<String>) -> Self {
        Self {
            timestamp: Some(Timestamp::now_micros()),
            user_id,
            user_name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub entity_type: String,
    pub id: Id,
    pub attributes: BTreeMap<String, Value>,
    pub version: Option<i64>,
    pub audit: Audit,
}

impl Instance {
    pub fn new(entity_type: impl Into<String>, id: Id) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            attributes: BTreeMap::new(),
            version: None,
            audit: Audit::default(),
        }
    }
}

/// Containment context of a newly created child: which reference of which
/// container instance owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLink {
    pub reference: ReferenceKey,
    pub owner: Id,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub instance: Instance,
    pub container: Option<ContainerLink>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub instance: Instance,
    pub previous_version: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub entity_type: String,
    pub id: Id,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceChange {
    /// A new association.
    Attach,
    /// Replaces the target the owner pointed at before this batch.
    Repoint,
}

/// Shared shape of add/remove reference statements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceStatement {
    pub entity_type: String,
    pub id: Id,
    pub reference: ReferenceKey,
    pub referenced_ids: BTreeSet<Id>,
    /// Snapshot: the owner referenced at least one instance through this
    /// reference before the batch started.
    pub already_referencing_instances: bool,
    pub change: ReferenceChange,
}

impl ReferenceStatement {
    pub fn single(
        entity_type: impl Into<String>,
        id: Id,
        reference: ReferenceKey,
        target: Id,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            reference,
            referenced_ids: BTreeSet::from([target]),
            already_referencing_instances: false,
            change: ReferenceChange::Attach,
        }
    }

    pub fn with_snapshot(mut self, already_referencing_instances: bool) -> Self {
        self.already_referencing_instances = already_referencing_instances;
        self
    }

    pub fn repointing(mut self) -> Self {
        self.change = ReferenceChange::Repoint;
        self
    }
}

pub type AddReferenceStatement = ReferenceStatement;
pub type RemoveReferenceStatement = ReferenceStatement;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceExistsValidationStatement {
    pub entity_type: String,
    pub id: Id,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    AddReference(AddReferenceStatement),
    RemoveReference(RemoveReferenceStatement),
    InstanceExists(InstanceExistsValidationStatement),
}

impl Statement {
    pub fn id(&self) -> Id {
        match self {
            Statement::Insert(statement) => statement.instance.id,
            Statement::Update(statement) => statement.instance.id,
            Statement::Delete(statement) => statement.id,
            Statement::AddReference(statement) | Statement::RemoveReference(statement) => {
                statement.id
            }
            Statement::InstanceExists(statement) => statement.id,
        }
    }

    pub fn entity_type(&self) -> &str {
        match self {
            Statement::Insert(statement) => &statement.instance.entity_type,
            Statement::Update(statement) => &statement.instance.entity_type,
            Statement::Delete(statement) => &statement.entity_type,
            Statement::AddReference(statement) | Statement::RemoveReference(statement) => {
                &statement.entity_type
            }
            Statement::InstanceExists(statement) => &statement.entity_type,
        }
    }

    pub fn exists(entity_type: impl Into<String>, id: Id) -> Self {
        Statement::InstanceExists(InstanceExistsValidationStatement {
            entity_type: entity_type.into(),
            id,
        })
    }
}

/// Statements of one batch grouped by kind, preserving emission order.
#[derive(Clone, Debug, Default)]
pub struct StatementSet {
    pub inserts: Vec<InsertStatement>,
    pub updates: Vec<UpdateStatement>,
    pub deletes: Vec<DeleteStatement>,
    pub add_references: Vec<AddReferenceStatement>,
    pub remove_references: Vec<RemoveReferenceStatement>,
    pub exists_checks: Vec<InstanceExistsValidationStatement>,
}

impl StatementSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.add_references.is_empty()
            && self.remove_references.is_empty()
            && self.exists_checks.is_empty()
    }

    pub fn deleted_ids(&self) -> BTreeSet<Id> {
        self.deletes.iter().map(|statement| statement.id).collect()
    }

    pub fn inserted_ids(&self) -> BTreeSet<Id> {
        self.inserts
            .iter()
            .map(|statement| statement.instance.id)
            .collect()
    }
}

impl From<Vec<Statement>> for StatementSet {
    fn from(statements: Vec<Statement>) -> Self {
        let mut set = StatementSet::default();
        for statement in statements {
            match statement {
                Statement::Insert(insert) => set.inserts.push(insert),
                Statement::Update(update) => set.updates.push(update),
                Statement::Delete(delete) => set.deletes.push(delete),
                Statement::AddReference(add) => set.add_references.push(add),
                Statement::RemoveReference(remove) => set.remove_references.push(remove),
                Statement::InstanceExists(check) => set.exists_checks.push(check),
            }
        }
        set
    }
}
