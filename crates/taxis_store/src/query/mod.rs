//! Logical query graphs resolved into relational join trees.

mod context;
mod custom;
mod resolver;

pub use context::{MemberColumn, QueryBuildContext};
pub use custom::resolve_condition;
pub use resolver::JoinResolver;

use log::debug;
use sea_query::{Alias, Expr, JoinType, Order, Query, SelectStatement, SimpleExpr};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use aideon_taxis_core::payload::ENTITY_TYPE_KEY;
use aideon_taxis_core::{MetadataResolver, ReferenceKey, TaxisError, TaxisResult};

use crate::{ColumnNames, Dialect, SqlStatement};

fn default_root_alias() -> String {
    "t0".to_string()
}

/// Root type, joined nodes and the projection over them. Every node is
/// addressed by its alias.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalQuery {
    pub entity_type: String,
    #[serde(default = "default_root_alias")]
    pub alias: String,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub select: Vec<SelectField>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderField>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl LogicalQuery {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            alias: default_root_alias(),
            joins: Vec::new(),
            select: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }
}

/// A node reached from `partner`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub alias: String,
    pub partner: String,
    pub kind: JoinKind,
    /// Inner join instead of outer join. Casts are always outer.
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinKind {
    /// Follows a reference of the partner's type.
    Reference { reference: String },
    /// Reaches the container of the partner through any of the candidate
    /// containment references; all matching references when empty.
    Container {
        entity_type: String,
        #[serde(default)]
        references: Vec<ReferenceKey>,
    },
    /// The partner seen as another type of its hierarchy, present only when
    /// the filters hold.
    Cast {
        entity_type: String,
        #[serde(default)]
        filters: Vec<Condition>,
    },
    /// The first `limit` targets of a reference in the given order.
    Subselect {
        reference: String,
        #[serde(default)]
        order_by: Vec<MemberOrder>,
        limit: u64,
        #[serde(default)]
        filters: Vec<Condition>,
    },
    /// Configured SQL condition; see [`resolve_condition`].
    Custom {
        entity_type: String,
        condition: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    IsNull,
    IsNotNull,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterValue {
    Literal(JsonValue),
    /// Looked up in the context parameters of the build.
    Param(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub member: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Option<FilterValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub alias: String,
    #[serde(flatten)]
    pub condition: Condition,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectField {
    pub alias: String,
    pub member: String,
    /// Result column name; `member` for the root node, `alias.member` otherwise.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderField {
    pub alias: String,
    pub member: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberOrder {
    pub member: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Clone, Debug)]
pub enum JoinSource {
    Table(String),
    Subselect(SelectStatement),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinRole {
    Ancestor,
    Descendant,
    Reference,
    /// Join-table row between two nodes.
    Link,
    ContainerCandidate,
    Container,
    Cast,
    Subselect,
    Custom,
}

/// One relational join of the resolved tree.
#[derive(Clone, Debug)]
pub struct RdbmsJoin {
    pub join_type: JoinType,
    pub source: JoinSource,
    pub alias: String,
    pub condition: SimpleExpr,
    pub role: JoinRole,
}

impl RdbmsJoin {
    pub fn apply(&self, select: &mut SelectStatement) {
        match &self.source {
            JoinSource::Table(table) => {
                select.join_as(
                    self.join_type,
                    Alias::new(table),
                    Alias::new(&self.alias),
                    self.condition.clone(),
                );
            }
            JoinSource::Subselect(inner) => {
                select.join_subquery(
                    self.join_type,
                    inner.clone(),
                    Alias::new(&self.alias),
                    self.condition.clone(),
                );
            }
        }
    }
}

/// Built select with its result column labels in order.
#[derive(Clone, Debug)]
pub struct SelectQuery {
    pub statement: SelectStatement,
    pub labels: Vec<String>,
    pub joins: Vec<(String, JoinRole)>,
}

impl SelectQuery {
    pub fn to_sql(&self, dialect: Dialect) -> SqlStatement {
        SqlStatement::build(dialect, &self.statement)
    }
}

pub struct QueryBuilder<'a> {
    resolver: &'a dyn MetadataResolver,
    columns: &'a ColumnNames,
    dialect: Dialect,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(
        resolver: &'a dyn MetadataResolver,
        columns: &'a ColumnNames,
        dialect: Dialect,
    ) -> Self {
        Self {
            resolver,
            columns,
            dialect,
        }
    }

    pub fn build(
        &self,
        query: &LogicalQuery,
        params: &Map<String, JsonValue>,
    ) -> TaxisResult<SelectQuery> {
        let ctx = QueryBuildContext::new(self.resolver, self.columns, self.dialect, params);
        let built = self.assemble(&ctx, query);
        ctx.finish()?;
        built
    }

    fn assemble(
        &self,
        ctx: &QueryBuildContext<'_>,
        query: &LogicalQuery,
    ) -> TaxisResult<SelectQuery> {
        let root = query.alias.as_str();
        ctx.register_node(root, &query.entity_type)?;
        let mut select = Query::select();
        select.from_as(
            Alias::new(self.resolver.table_name(&query.entity_type)?),
            Alias::new(root),
        );
        let mut labels = vec![self.columns.identifier.clone(), ENTITY_TYPE_KEY.to_string()];
        select
            .expr_as(
                Expr::col((Alias::new(root), Alias::new(&self.columns.identifier))),
                Alias::new(&self.columns.identifier),
            )
            .expr_as(
                Expr::col((Alias::new(root), Alias::new(&self.columns.entity_type))),
                Alias::new(ENTITY_TYPE_KEY),
            );

        let mut joins = Vec::new();
        let resolver = JoinResolver::new(ctx);
        for join in &query.joins {
            for resolved in resolver.resolve_join(join)? {
                resolved.apply(&mut select);
                joins.push((resolved.alias.clone(), resolved.role));
            }
        }

        for field in &query.select {
            let column = ctx.member(&field.alias, &field.member)?;
            let label = match &field.label {
                Some(label) => label.clone(),
                None if field.alias == root => field.member.clone(),
                None => format!("{}.{}", field.alias, field.member),
            };
            select.expr_as(column.expr(), Alias::new(&label));
            labels.push(label);
        }
        for filter in &query.filters {
            let column = ctx.member(&filter.alias, &filter.condition.member)?;
            select.and_where(condition_expr(ctx, &column, &filter.condition)?);
        }
        for order in &query.order_by {
            let column = ctx.member(&order.alias, &order.member)?;
            select.order_by(
                (Alias::new(&column.alias), Alias::new(&column.column)),
                if order.descending { Order::Desc } else { Order::Asc },
            );
        }
        if let Some(limit) = query.limit {
            select.limit(limit);
        }
        // Members on ancestors or subtypes of joined nodes.
        for extension in ctx.take_pending()? {
            extension.apply(&mut select);
            joins.push((extension.alias.clone(), extension.role));
        }

        debug!(
            "taxis: built query over {} with {} joins",
            query.entity_type,
            joins.len()
        );
        Ok(SelectQuery {
            statement: select,
            labels,
            joins,
        })
    }
}

/// Comparison of a resolved column against a literal or context parameter.
pub(crate) fn condition_expr(
    ctx: &QueryBuildContext<'_>,
    column: &MemberColumn,
    condition: &Condition,
) -> TaxisResult<SimpleExpr> {
    let target = column.expr();
    let value = match condition.op {
        CompareOp::IsNull => return Ok(target.is_null()),
        CompareOp::IsNotNull => return Ok(target.is_not_null()),
        _ => match &condition.value {
            Some(FilterValue::Literal(value)) => value.clone(),
            Some(FilterValue::Param(name)) => ctx.param(name)?,
            None => {
                return Err(TaxisError::configuration(format!(
                    "condition on {} needs a value",
                    condition.member
                )));
            }
        },
    };
    if condition.op == CompareOp::Like {
        let pattern = value.as_str().ok_or_else(|| {
            TaxisError::configuration(format!("like pattern for {} must be text", condition.member))
        })?;
        return Ok(target.like(pattern));
    }
    let bound = ctx.bind(&value, column.is_id);
    Ok(match condition.op {
        CompareOp::Eq => target.eq(bound),
        CompareOp::Ne => target.ne(bound),
        CompareOp::Lt => target.lt(bound),
        CompareOp::Le => target.lte(bound),
        CompareOp::Gt => target.gt(bound),
        CompareOp::Ge => target.gte(bound),
        CompareOp::Like | CompareOp::IsNull | CompareOp::IsNotNull => {
            return Err(TaxisError::configuration("unsupported comparison"));
        }
    })
}
