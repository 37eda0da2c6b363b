use sea_query::{Alias, Expr, Order, Query};

use aideon_taxis_core::{
    ErrorCode, Feedback, Id, InstanceGraph, InstanceGraphCollector, ReferenceDef, ReferenceKey,
    StorageRule, TaxisError, TaxisResult,
};

use crate::StoreContext;

/// Loads containment trees and direct references with one query per
/// reference and instance.
pub struct SqlInstanceGraphCollector<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> SqlInstanceGraphCollector<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    /// Concrete type of a persisted instance, read from its discriminator.
    pub fn load_type(&self, entity_type: &str, id: Id) -> TaxisResult<Option<String>> {
        let columns = self.ctx.columns;
        let select = Query::select()
            .column(Alias::new(&columns.entity_type))
            .from(Alias::new(self.ctx.resolver.table_name(entity_type)?))
            .and_where(Expr::col(Alias::new(&columns.identifier)).eq(self.ctx.id(id)))
            .to_owned();
        let rows = self.ctx.query(&select)?;
        match rows.first() {
            Some(row) => Ok(Some(row.str(&columns.entity_type)?.to_string())),
            None => Ok(None),
        }
    }

    fn build(&self, entity_type: &str, id: Id) -> TaxisResult<InstanceGraph> {
        let mut graph = InstanceGraph::new(entity_type, id);
        for (key, def) in self.ctx.resolver.all_references(entity_type)? {
            let targets = self.targets(&key, def, id)?;
            if def.containment {
                for target in targets {
                    let child_type = self.load_type(&def.target, target)?.ok_or_else(|| {
                        TaxisError::storage(format!("contained {} {target} has no row", def.target))
                    })?;
                    let child = self.build(&child_type, target)?;
                    graph = graph.with_child(key.clone(), child);
                }
            } else {
                for target in targets {
                    graph = graph.with_reference(key.clone(), &def.target, target);
                }
            }
        }
        Ok(graph)
    }

    fn targets(&self, key: &ReferenceKey, def: &ReferenceDef, owner: Id) -> TaxisResult<Vec<Id>> {
        let identifier = self.ctx.columns.identifier.as_str();
        let (select, column) = match def.storage {
            StorageRule::ForeignKey => {
                let column = self.ctx.resolver.reference_column(key)?.to_string();
                let select = Query::select()
                    .column(Alias::new(&column))
                    .from(Alias::new(self.ctx.resolver.table_name(&key.owner)?))
                    .and_where(Expr::col(Alias::new(identifier)).eq(self.ctx.id(owner)))
                    .and_where(Expr::col(Alias::new(&column)).is_not_null())
                    .to_owned();
                (select, column)
            }
            StorageRule::InverseForeignKey => {
                let column = self.ctx.resolver.reference_column(key)?;
                let select = Query::select()
                    .column(Alias::new(identifier))
                    .from(Alias::new(self.ctx.resolver.table_name(&def.target)?))
                    .and_where(Expr::col(Alias::new(column)).eq(self.ctx.id(owner)))
                    .order_by(Alias::new(identifier), Order::Asc)
                    .to_owned();
                (select, identifier.to_string())
            }
            StorageRule::JoinTable => {
                let join = self.ctx.resolver.join_table(key)?;
                let select = Query::select()
                    .column(Alias::new(&join.target_column))
                    .from(Alias::new(&join.table))
                    .and_where(Expr::col(Alias::new(&join.owner_column)).eq(self.ctx.id(owner)))
                    .order_by(Alias::new(&join.target_column), Order::Asc)
                    .to_owned();
                (select, join.target_column.clone())
            }
        };
        self.ctx
            .query(&select)?
            .iter()
            .map(|row| row.id(&column))
            .collect()
    }
}

impl InstanceGraphCollector for SqlInstanceGraphCollector<'_> {
    fn collect_graph(&self, entity_type: &str, id: Id) -> TaxisResult<InstanceGraph> {
        let Some(concrete) = self.load_type(entity_type, id)? else {
            return Err(TaxisError::validation(
                Feedback::new(
                    ErrorCode::EntityNotFound,
                    "",
                    format!("{entity_type} {id} does not exist"),
                )
                .with_identifier(id),
            ));
        };
        self.build(&concrete, id)
    }
}
