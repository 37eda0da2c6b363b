use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use sea_query::{Alias, Expr, JoinType, Value as SeaValue};
use serde_json::{Map, Value as JsonValue};

use aideon_taxis_core::{Id, MetadataResolver, StorageRule, TaxisError, TaxisResult};

use super::{JoinRole, JoinSource, RdbmsJoin};
use crate::sql::{id_value, json_to_sea_value};
use crate::{ColumnNames, Dialect};

/// A physical column reachable from a query node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberColumn {
    pub alias: String,
    pub column: String,
    /// Holds identifiers, so literal ids bind in the dialect's id encoding.
    pub is_id: bool,
}

impl MemberColumn {
    pub fn expr(&self) -> Expr {
        Expr::col((Alias::new(&self.alias), Alias::new(&self.column)))
    }
}

#[derive(Default)]
struct BuildState {
    nodes: HashMap<String, String>,
    ancestors: HashMap<(String, String), String>,
    descendants: HashMap<(String, String), String>,
    next_ancestor: usize,
    next_descendant: usize,
    pending: Vec<RdbmsJoin>,
    params: HashMap<String, JsonValue>,
}

/// Mutable state of one query build: node types by alias, memoized
/// ancestor/descendant aliases, joins those aliases still need, and the
/// parameter lookups made so far.
pub struct QueryBuildContext<'a> {
    pub resolver: &'a dyn MetadataResolver,
    pub columns: &'a ColumnNames,
    pub dialect: Dialect,
    params: &'a Map<String, JsonValue>,
    state: Mutex<BuildState>,
}

impl<'a> QueryBuildContext<'a> {
    pub fn new(
        resolver: &'a dyn MetadataResolver,
        columns: &'a ColumnNames,
        dialect: Dialect,
        params: &'a Map<String, JsonValue>,
    ) -> Self {
        Self {
            resolver,
            columns,
            dialect,
            params,
            state: Mutex::new(BuildState::default()),
        }
    }

    fn state(&self) -> TaxisResult<MutexGuard<'_, BuildState>> {
        self.state
            .lock()
            .map_err(|_| TaxisError::storage("query build state poisoned"))
    }

    pub fn register_node(&self, alias: &str, entity_type: &str) -> TaxisResult<()> {
        self.resolver.entity_type(entity_type)?;
        let mut state = self.state()?;
        if state.nodes.contains_key(alias) {
            return Err(TaxisError::configuration(format!("alias {alias} is used twice")));
        }
        state.nodes.insert(alias.to_string(), entity_type.to_string());
        Ok(())
    }

    pub fn node_type(&self, alias: &str) -> TaxisResult<String> {
        self.state()?
            .nodes
            .get(alias)
            .cloned()
            .ok_or_else(|| TaxisError::configuration(format!("unknown query alias {alias}")))
    }

    /// Alias under which `ancestor`'s table is joined to `node`. Allocated
    /// once per node and type; the join is queued on first allocation.
    pub fn ancestor_alias(&self, node: &str, ancestor: &str) -> TaxisResult<String> {
        self.extension_alias(node, ancestor, JoinRole::Ancestor)
    }

    pub fn descendant_alias(&self, node: &str, descendant: &str) -> TaxisResult<String> {
        self.extension_alias(node, descendant, JoinRole::Descendant)
    }

    fn extension_alias(
        &self,
        node: &str,
        entity_type: &str,
        role: JoinRole,
    ) -> TaxisResult<String> {
        let table = self.resolver.table_name(entity_type)?.to_string();
        let key = (node.to_string(), entity_type.to_string());
        let mut state = self.state()?;
        let memo = match role {
            JoinRole::Descendant => &state.descendants,
            _ => &state.ancestors,
        };
        if let Some(alias) = memo.get(&key) {
            return Ok(alias.clone());
        }
        let alias = match role {
            JoinRole::Descendant => {
                state.next_descendant += 1;
                format!("{node}_d{:02}", state.next_descendant)
            }
            _ => {
                state.next_ancestor += 1;
                format!("{node}_a{:02}", state.next_ancestor)
            }
        };
        let identifier = self.columns.identifier.as_str();
        state.pending.push(RdbmsJoin {
            join_type: JoinType::LeftJoin,
            source: JoinSource::Table(table),
            alias: alias.clone(),
            condition: Expr::col((Alias::new(&alias), Alias::new(identifier)))
                .equals((Alias::new(node), Alias::new(identifier))),
            role,
        });
        match role {
            JoinRole::Descendant => state.descendants.insert(key, alias.clone()),
            _ => state.ancestors.insert(key, alias.clone()),
        };
        debug!("taxis: {node} reaches {entity_type} through {alias}");
        Ok(alias)
    }

    /// Joins queued by alias allocation since the last call.
    pub fn take_pending(&self) -> TaxisResult<Vec<RdbmsJoin>> {
        Ok(std::mem::take(&mut self.state()?.pending))
    }

    /// Alias of `node` that carries the columns declared on `declaring`.
    pub fn table_alias(&self, node: &str, declaring: &str) -> TaxisResult<String> {
        let node_type = self.node_type(node)?;
        let resolver = self.resolver;
        if resolver.table_name(&node_type)? == resolver.table_name(declaring)? {
            Ok(node.to_string())
        } else if resolver.is_assignable(&node_type, declaring) {
            self.ancestor_alias(node, declaring)
        } else if resolver.is_assignable(declaring, &node_type) {
            self.descendant_alias(node, declaring)
        } else {
            Err(TaxisError::configuration(format!(
                "{declaring} is unrelated to {node_type} at {node}"
            )))
        }
    }

    /// Resolves a member name at a node: reserved columns, attributes and
    /// foreign key references of the type chain, then members declared on
    /// subtypes.
    pub fn member(&self, node: &str, member: &str) -> TaxisResult<MemberColumn> {
        let columns = self.columns;
        if member == columns.identifier
            || member == columns.entity_type
            || member == columns.version
        {
            return Ok(MemberColumn {
                alias: node.to_string(),
                column: member.to_string(),
                is_id: member == columns.identifier,
            });
        }
        let node_type = self.node_type(node)?;
        if let Some((declaring, attribute)) = self.resolver.attribute(&node_type, member)? {
            return Ok(MemberColumn {
                alias: self.table_alias(node, &declaring.name)?,
                column: attribute.column().to_string(),
                is_id: false,
            });
        }
        if let Some((key, def)) = self.resolver.reference(&node_type, member)? {
            if def.storage == StorageRule::ForeignKey {
                return Ok(MemberColumn {
                    alias: self.table_alias(node, &key.owner)?,
                    column: self.resolver.reference_column(&key)?.to_string(),
                    is_id: true,
                });
            }
        }
        for subtype in self.resolver.subtypes(&node_type) {
            if let Some(attribute) = subtype.attributes.iter().find(|attr| attr.name == member) {
                return Ok(MemberColumn {
                    alias: self.descendant_alias(node, &subtype.name)?,
                    column: attribute.column().to_string(),
                    is_id: false,
                });
            }
            if let Some(reference) = subtype
                .references
                .iter()
                .find(|reference| reference.name == member)
            {
                if let (StorageRule::ForeignKey, Some(column)) =
                    (reference.storage, reference.column.as_deref())
                {
                    return Ok(MemberColumn {
                        alias: self.descendant_alias(node, &subtype.name)?,
                        column: column.to_string(),
                        is_id: true,
                    });
                }
            }
        }
        Err(TaxisError::configuration(format!(
            "{member} is not a column of {node_type} or its subtypes"
        )))
    }

    /// Looks up a context parameter; lookups are cached until [`Self::finish`].
    pub fn param(&self, name: &str) -> TaxisResult<JsonValue> {
        let mut state = self.state()?;
        if let Some(value) = state.params.get(name) {
            return Ok(value.clone());
        }
        let value = self
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| TaxisError::configuration(format!("query parameter {name} is not bound")))?;
        state.params.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Binds a JSON value; identifier-like strings use the dialect's id form
    /// when `as_id` is set.
    pub fn bind(&self, value: &JsonValue, as_id: bool) -> SeaValue {
        if as_id {
            if let Some(id) = value.as_str().and_then(|raw| Id::parse(raw).ok()) {
                return id_value(self.dialect, id);
            }
        }
        json_to_sea_value(value)
    }

    /// Drops cached parameter lookups; alias memos stay valid for the build.
    pub fn finish(&self) -> TaxisResult<()> {
        self.state()?.params.clear();
        Ok(())
    }
}
