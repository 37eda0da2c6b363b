use log::debug;
use sea_query::{
    Alias, Expr, Func, JoinType, Order, Query, SelectStatement, SimpleExpr, WindowStatement,
};

use aideon_taxis_core::{
    EntityTypeDef, ReferenceKey, StorageRule, TaxisError, TaxisResult,
};

use super::context::{MemberColumn, QueryBuildContext};
use super::custom::resolve_condition;
use super::{
    Condition, Join, JoinKind, JoinRole, JoinSource, MemberOrder, RdbmsJoin, condition_expr,
};

const PARTNER_COLUMN: &str = "__partner";
const TARGET_COLUMN: &str = "__target";
const ROW_NUMBER_COLUMN: &str = "__row_number";

fn col(alias: &str, column: &str) -> Expr {
    Expr::col((Alias::new(alias), Alias::new(column)))
}

fn same(alias: &str, column: &str, other_alias: &str, other_column: &str) -> SimpleExpr {
    col(alias, column).equals((Alias::new(other_alias), Alias::new(other_column)))
}

/// Columns of a type chain inside a subquery, with the chain tables it needs.
struct InnerScope<'s> {
    base: String,
    entity_type: String,
    joined: Vec<(&'s EntityTypeDef, String)>,
}

/// Turns logical joins into relational joins. Output order: joins queued by
/// ancestor allocation first, then the join's own joins.
pub struct JoinResolver<'c, 'a> {
    ctx: &'c QueryBuildContext<'a>,
}

impl<'c, 'a> JoinResolver<'c, 'a> {
    pub fn new(ctx: &'c QueryBuildContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn resolve_join(&self, join: &Join) -> TaxisResult<Vec<RdbmsJoin>> {
        let partner_type = self.ctx.node_type(&join.partner)?;
        let join_type = if join.required {
            JoinType::InnerJoin
        } else {
            JoinType::LeftJoin
        };
        let (node_type, own) = match &join.kind {
            JoinKind::Reference { reference } => {
                self.reference(join, &partner_type, reference, join_type)?
            }
            JoinKind::Container {
                entity_type,
                references,
            } => self.container(join, &partner_type, entity_type, references, join_type)?,
            JoinKind::Cast {
                entity_type,
                filters,
            } => self.cast(join, entity_type, filters)?,
            JoinKind::Subselect {
                reference,
                order_by,
                limit,
                filters,
            } => self.subselect(join, &partner_type, reference, order_by, *limit, filters, join_type)?,
            JoinKind::Custom {
                entity_type,
                condition,
            } => {
                let condition = resolve_condition(self.ctx, condition, &join.partner, &join.alias)?;
                let own = vec![RdbmsJoin {
                    join_type,
                    source: JoinSource::Table(self.ctx.resolver.table_name(entity_type)?.to_string()),
                    alias: join.alias.clone(),
                    condition,
                    role: JoinRole::Custom,
                }];
                (entity_type.clone(), own)
            }
        };
        self.ctx.register_node(&join.alias, &node_type)?;
        let mut joins = self.ctx.take_pending()?;
        joins.extend(own);
        debug!(
            "taxis: join {} from {} resolved into {} relational joins",
            join.alias,
            join.partner,
            joins.len()
        );
        Ok(joins)
    }

    fn identifier(&self) -> &str {
        &self.ctx.columns.identifier
    }

    fn reference(
        &self,
        join: &Join,
        partner_type: &str,
        reference: &str,
        join_type: JoinType,
    ) -> TaxisResult<(String, Vec<RdbmsJoin>)> {
        let resolver = self.ctx.resolver;
        let (key, def) = resolver.reference(partner_type, reference)?.ok_or_else(|| {
            TaxisError::configuration(format!("{partner_type} has no reference {reference}"))
        })?;
        let target_table = resolver.table_name(&def.target)?.to_string();
        let id = self.identifier();
        let alias = join.alias.as_str();
        let joins = match def.storage {
            StorageRule::ForeignKey => {
                let source = self.ctx.table_alias(&join.partner, &key.owner)?;
                let column = resolver.reference_column(&key)?;
                vec![RdbmsJoin {
                    join_type,
                    source: JoinSource::Table(target_table),
                    alias: alias.to_string(),
                    condition: same(alias, id, &source, column),
                    role: JoinRole::Reference,
                }]
            }
            StorageRule::InverseForeignKey => {
                let column = resolver.reference_column(&key)?;
                vec![RdbmsJoin {
                    join_type,
                    source: JoinSource::Table(target_table),
                    alias: alias.to_string(),
                    condition: same(alias, column, &join.partner, id),
                    role: JoinRole::Reference,
                }]
            }
            StorageRule::JoinTable => {
                let link_table = resolver.join_table(&key)?;
                let link = format!("{alias}_j");
                vec![
                    RdbmsJoin {
                        join_type,
                        source: JoinSource::Table(link_table.table.clone()),
                        alias: link.clone(),
                        condition: same(&link, &link_table.owner_column, &join.partner, id),
                        role: JoinRole::Link,
                    },
                    RdbmsJoin {
                        join_type,
                        source: JoinSource::Table(target_table),
                        alias: alias.to_string(),
                        condition: same(alias, id, &link, &link_table.target_column),
                        role: JoinRole::Reference,
                    },
                ]
            }
        };
        Ok((def.target.clone(), joins))
    }

    fn container(
        &self,
        join: &Join,
        partner_type: &str,
        entity_type: &str,
        references: &[ReferenceKey],
        join_type: JoinType,
    ) -> TaxisResult<(String, Vec<RdbmsJoin>)> {
        let resolver = self.ctx.resolver;
        let candidates = if references.is_empty() {
            self.containers_of(partner_type, entity_type)?
        } else {
            references.to_vec()
        };
        if candidates.is_empty() {
            return Err(TaxisError::configuration(format!(
                "no containment reference leads from {entity_type} to {partner_type}"
            )));
        }

        let id = self.identifier();
        let alias = join.alias.as_str();
        let mut joins = Vec::with_capacity(candidates.len() + 1);
        let mut container_ids: Vec<SimpleExpr> = Vec::with_capacity(candidates.len());
        for (index, key) in candidates.iter().enumerate() {
            let def = resolver.reference_def(key)?;
            if !def.containment {
                return Err(TaxisError::configuration(format!("{key} is not a containment")));
            }
            let candidate = format!("{alias}_c{}", index + 1);
            let (source, condition, container_id) = match def.storage {
                StorageRule::ForeignKey => (
                    resolver.table_name(&key.owner)?.to_string(),
                    same(&candidate, resolver.reference_column(key)?, &join.partner, id),
                    col(&candidate, id),
                ),
                StorageRule::InverseForeignKey => {
                    let child = self.ctx.table_alias(&join.partner, &def.target)?;
                    (
                        resolver.table_name(&key.owner)?.to_string(),
                        same(&candidate, id, &child, resolver.reference_column(key)?),
                        col(&candidate, id),
                    )
                }
                StorageRule::JoinTable => {
                    let link_table = resolver.join_table(key)?;
                    (
                        link_table.table.clone(),
                        same(&candidate, &link_table.target_column, &join.partner, id),
                        col(&candidate, &link_table.owner_column),
                    )
                }
            };
            joins.push(RdbmsJoin {
                join_type: JoinType::LeftJoin,
                source: JoinSource::Table(source),
                alias: candidate,
                condition,
                role: JoinRole::ContainerCandidate,
            });
            container_ids.push(container_id.into());
        }
        let unified: SimpleExpr = if container_ids.len() == 1 {
            container_ids.remove(0)
        } else {
            Func::coalesce(container_ids).into()
        };
        joins.push(RdbmsJoin {
            join_type,
            source: JoinSource::Table(resolver.table_name(entity_type)?.to_string()),
            alias: alias.to_string(),
            condition: col(alias, id).eq(unified),
            role: JoinRole::Container,
        });
        Ok((entity_type.to_string(), joins))
    }

    /// Containment references whose owner and target are related to the
    /// container and child types.
    fn containers_of(
        &self,
        child_type: &str,
        container_type: &str,
    ) -> TaxisResult<Vec<ReferenceKey>> {
        let resolver = self.ctx.resolver;
        let related = |left: &str, right: &str| {
            resolver.is_assignable(left, right) || resolver.is_assignable(right, left)
        };
        resolver.entity_type(container_type)?;
        let mut keys = Vec::new();
        for def in resolver.entity_types() {
            if !related(&def.name, container_type) {
                continue;
            }
            for reference in &def.references {
                if reference.containment && related(child_type, &reference.target) {
                    keys.push(ReferenceKey::new(&def.name, &reference.name));
                }
            }
        }
        Ok(keys)
    }

    fn cast(
        &self,
        join: &Join,
        entity_type: &str,
        filters: &[Condition],
    ) -> TaxisResult<(String, Vec<RdbmsJoin>)> {
        let table = self.ctx.resolver.table_name(entity_type)?.to_string();
        let id = self.identifier();
        let alias = join.alias.as_str();
        let inner = format!("{alias}_x");

        let mut exists = Query::select();
        exists
            .expr(Expr::val(1))
            .from_as(Alias::new(&table), Alias::new(&inner))
            .and_where(same(&inner, id, &join.partner, id));
        let mut scope = InnerScope::new(&inner, entity_type);
        for filter in filters {
            let column = self.inner_member(&mut scope, &filter.member)?;
            exists.and_where(condition_expr(self.ctx, &column, filter)?);
        }
        self.apply_scope(&scope, &mut exists);

        let condition = same(alias, id, &join.partner, id).and(Expr::exists(exists));
        Ok((
            entity_type.to_string(),
            vec![RdbmsJoin {
                join_type: JoinType::LeftJoin,
                source: JoinSource::Table(table),
                alias: alias.to_string(),
                condition,
                role: JoinRole::Cast,
            }],
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn subselect(
        &self,
        join: &Join,
        partner_type: &str,
        reference: &str,
        order_by: &[MemberOrder],
        limit: u64,
        filters: &[Condition],
        join_type: JoinType,
    ) -> TaxisResult<(String, Vec<RdbmsJoin>)> {
        if limit == 0 {
            return Err(TaxisError::configuration(format!(
                "subselect {} needs a positive limit",
                join.alias
            )));
        }
        let resolver = self.ctx.resolver;
        let (key, def) = resolver.reference(partner_type, reference)?.ok_or_else(|| {
            TaxisError::configuration(format!("{partner_type} has no reference {reference}"))
        })?;
        let id = self.identifier();
        let alias = join.alias.as_str();
        let target = format!("{alias}_t");
        let link = format!("{alias}_l");
        let derived = format!("{alias}_s");
        let target_table = resolver.table_name(&def.target)?.to_string();

        let mut inner = Query::select();
        let (partner_alias, partner_column) = match def.storage {
            StorageRule::InverseForeignKey => {
                inner.from_as(Alias::new(&target_table), Alias::new(&target));
                (target.clone(), resolver.reference_column(&key)?.to_string())
            }
            StorageRule::ForeignKey => {
                inner
                    .from_as(Alias::new(resolver.table_name(&key.owner)?), Alias::new(&link))
                    .join_as(
                        JoinType::InnerJoin,
                        Alias::new(&target_table),
                        Alias::new(&target),
                        same(&target, id, &link, resolver.reference_column(&key)?),
                    );
                (link.clone(), id.to_string())
            }
            StorageRule::JoinTable => {
                let link_table = resolver.join_table(&key)?;
                inner
                    .from_as(Alias::new(&link_table.table), Alias::new(&link))
                    .join_as(
                        JoinType::InnerJoin,
                        Alias::new(&target_table),
                        Alias::new(&target),
                        same(&target, id, &link, &link_table.target_column),
                    );
                (link.clone(), link_table.owner_column.clone())
            }
        };
        inner
            .expr_as(col(&partner_alias, &partner_column), Alias::new(PARTNER_COLUMN))
            .expr_as(col(&target, id), Alias::new(TARGET_COLUMN));

        let mut scope = InnerScope::new(&target, &def.target);
        let mut window = WindowStatement::partition_by((
            Alias::new(&partner_alias),
            Alias::new(&partner_column),
        ));
        for order in order_by {
            let column = self.inner_member(&mut scope, &order.member)?;
            window.order_by(
                (Alias::new(&column.alias), Alias::new(&column.column)),
                if order.descending { Order::Desc } else { Order::Asc },
            );
        }
        window.order_by((Alias::new(&target), Alias::new(id)), Order::Asc);
        inner.expr_window_as(
            Expr::cust("ROW_NUMBER()"),
            window,
            Alias::new(ROW_NUMBER_COLUMN),
        );
        for filter in filters {
            let column = self.inner_member(&mut scope, &filter.member)?;
            inner.and_where(condition_expr(self.ctx, &column, filter)?);
        }
        self.apply_scope(&scope, &mut inner);

        let window_limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok((
            def.target.clone(),
            vec![
                RdbmsJoin {
                    join_type,
                    source: JoinSource::Subselect(inner),
                    alias: derived.clone(),
                    condition: same(&derived, PARTNER_COLUMN, &join.partner, id)
                        .and(col(&derived, ROW_NUMBER_COLUMN).lte(window_limit)),
                    role: JoinRole::Subselect,
                },
                RdbmsJoin {
                    join_type,
                    source: JoinSource::Table(target_table),
                    alias: alias.to_string(),
                    condition: same(alias, id, &derived, TARGET_COLUMN),
                    role: JoinRole::Reference,
                },
            ],
        ))
    }

    /// Resolves a member of the scope's type chain, joining the declaring
    /// table when it is not the base table.
    fn inner_member(&self, scope: &mut InnerScope<'a>, member: &str) -> TaxisResult<MemberColumn> {
        let resolver = self.ctx.resolver;
        let columns = self.ctx.columns;
        if member == columns.identifier || member == columns.entity_type || member == columns.version {
            return Ok(MemberColumn {
                alias: scope.base.clone(),
                column: member.to_string(),
                is_id: member == columns.identifier,
            });
        }
        let (declaring, column, is_id) =
            if let Some((declaring, attribute)) = resolver.attribute(&scope.entity_type, member)? {
                (declaring, attribute.column().to_string(), false)
            } else {
                match resolver.reference(&scope.entity_type, member)? {
                    Some((key, def)) if def.storage == StorageRule::ForeignKey => (
                        resolver.entity_type(&key.owner)?,
                        resolver.reference_column(&key)?.to_string(),
                        true,
                    ),
                    _ => {
                        return Err(TaxisError::configuration(format!(
                            "{member} is not a column of {}",
                            scope.entity_type
                        )));
                    }
                }
            };
        let alias = if declaring.table == resolver.table_name(&scope.entity_type)? {
            scope.base.clone()
        } else if let Some((_, alias)) = scope
            .joined
            .iter()
            .find(|(def, _)| def.name == declaring.name)
        {
            alias.clone()
        } else {
            let alias = format!("{}_{}", scope.base, scope.joined.len() + 1);
            scope.joined.push((declaring, alias.clone()));
            alias
        };
        Ok(MemberColumn {
            alias,
            column,
            is_id,
        })
    }

    fn apply_scope(&self, scope: &InnerScope<'_>, select: &mut SelectStatement) {
        let id = self.identifier();
        for (def, alias) in &scope.joined {
            select.join_as(
                JoinType::InnerJoin,
                Alias::new(&def.table),
                Alias::new(alias),
                same(alias, id, &scope.base, id),
            );
        }
    }
}

impl InnerScope<'_> {
    fn new(base: &str, entity_type: &str) -> Self {
        Self {
            base: base.to_string(),
            entity_type: entity_type.to_string(),
            joined: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use sea_query::{Alias, Query, QueryStatementWriter, SqliteQueryBuilder};
    use serde_json::{Map, json};

    use super::JoinResolver;
    use crate::query::{Join, JoinKind, JoinRole, QueryBuildContext};
    use crate::{ColumnNames, Dialect};
    use aideon_taxis_core::Model;

    fn model() -> Model {
        Model::from_value(json!({"types": [
            {"name": "Holder", "table": "holder", "abstract": true},
            {"name": "Folder", "table": "folder", "parent": "Holder", "references": [
                {"name": "docs", "target": "Doc", "containment": true,
                 "storage": "inverse_foreign_key", "column": "folder_id"}]},
            {"name": "Archive", "table": "archive", "parent": "Holder", "references": [
                {"name": "docs", "target": "Doc", "containment": true, "storage": "join_table",
                 "join_table": {"table": "archive_doc", "owner_column": "archive_id",
                                "target_column": "doc_id"}}]},
            {"name": "Doc", "table": "doc"}
        ]}))
        .expect("model")
    }

    #[test]
    fn container_candidates_are_coalesced() {
        let model = model();
        let columns = ColumnNames::default();
        let params = Map::new();
        let ctx = QueryBuildContext::new(&model, &columns, Dialect::Sqlite, &params);
        ctx.register_node("t0", "Doc").expect("root");
        let joins = JoinResolver::new(&ctx)
            .resolve_join(&Join {
                alias: "h".into(),
                partner: "t0".into(),
                kind: JoinKind::Container {
                    entity_type: "Holder".into(),
                    references: Vec::new(),
                },
                required: false,
            })
            .expect("container join");
        let roles: Vec<_> = joins.iter().map(|join| (join.alias.as_str(), join.role)).collect();
        assert_eq!(
            roles,
            vec![
                ("h_c1", JoinRole::ContainerCandidate),
                ("h_c2", JoinRole::ContainerCandidate),
                ("h", JoinRole::Container)
            ]
        );

        let mut select = Query::select();
        select.column((Alias::new("t0"), Alias::new("__identifier")));
        select.from_as(Alias::new("doc"), Alias::new("t0"));
        for join in &joins {
            join.apply(&mut select);
        }
        let sql = select.to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#"LEFT JOIN "folder" AS "h_c1""#), "{sql}");
        assert!(sql.contains(r#"LEFT JOIN "archive_doc" AS "h_c2""#), "{sql}");
        assert!(sql.contains("COALESCE"), "{sql}");
    }

    #[test]
    fn subselect_limits_must_be_positive() {
        let model = model();
        let columns = ColumnNames::default();
        let params = Map::new();
        let ctx = QueryBuildContext::new(&model, &columns, Dialect::Sqlite, &params);
        ctx.register_node("t0", "Folder").expect("root");
        let join = Join {
            alias: "d".into(),
            partner: "t0".into(),
            kind: JoinKind::Subselect {
                reference: "docs".into(),
                order_by: Vec::new(),
                limit: 0,
                filters: Vec::new(),
            },
            required: false,
        };
        assert!(JoinResolver::new(&ctx).resolve_join(&join).is_err());
        assert!(ctx.node_type("d").is_err());
    }
}
