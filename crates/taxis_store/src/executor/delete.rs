use log::debug;
use sea_query::{Alias, Expr, Query, SimpleExpr, Value as SeaValue};

use aideon_taxis_core::{DeleteStatement, ErrorCode, StorageRule, TaxisResult};

use super::{StoreContext, expect_rows};

/// Detaches the instance from join tables and from containers that hold it
/// through a foreign key, then deletes the chain rows leaf table first.
pub struct DeleteExecutor<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> DeleteExecutor<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, deletes: &[DeleteStatement]) -> TaxisResult<()> {
        for delete in deletes {
            self.detach(delete)?;
            self.delete(delete)?;
        }
        Ok(())
    }

    fn detach(&self, delete: &DeleteStatement) -> TaxisResult<()> {
        let resolver = self.ctx.resolver;
        let id = self.ctx.id(delete.id);
        let mut cleared = 0;
        for (key, def) in resolver.all_references(&delete.entity_type)? {
            if def.storage != StorageRule::JoinTable {
                continue;
            }
            let join = resolver.join_table(&key)?;
            let stmt = Query::delete()
                .from_table(Alias::new(&join.table))
                .and_where(Expr::col(Alias::new(&join.owner_column)).eq(id.clone()))
                .to_owned();
            cleared += self.ctx.exec(&stmt)?;
        }
        for key in resolver.join_table_references_into(&delete.entity_type)? {
            let join = resolver.join_table(&key)?;
            let stmt = Query::delete()
                .from_table(Alias::new(&join.table))
                .and_where(Expr::col(Alias::new(&join.target_column)).eq(id.clone()))
                .to_owned();
            cleared += self.ctx.exec(&stmt)?;
        }
        let chain: Vec<String> = resolver
            .type_chain(&delete.entity_type)?
            .into_iter()
            .map(|def| def.name.clone())
            .collect();
        for owner in resolver.entity_types() {
            for reference in &owner.references {
                let contains_this = reference.containment
                    && reference.storage == StorageRule::ForeignKey
                    && chain.contains(&reference.target);
                let Some(column) = reference.column.as_deref().filter(|_| contains_this) else {
                    continue;
                };
                let mut stmt = Query::update();
                stmt.table(Alias::new(&owner.table))
                    .values([(Alias::new(column), SimpleExpr::from(SeaValue::String(None)))])
                    .and_where(Expr::col(Alias::new(column)).eq(id.clone()));
                cleared += self.ctx.exec(&stmt)?;
            }
        }
        if cleared > 0 {
            debug!("taxis: detached {} from {cleared} rows", delete.id);
        }
        Ok(())
    }

    fn delete(&self, delete: &DeleteStatement) -> TaxisResult<()> {
        for def in self.ctx.resolver.type_chain(&delete.entity_type)? {
            let stmt = Query::delete()
                .from_table(Alias::new(&def.table))
                .and_where(
                    Expr::col(Alias::new(&self.ctx.columns.identifier)).eq(self.ctx.id(delete.id)),
                )
                .to_owned();
            let affected = self.ctx.exec(&stmt)?;
            expect_rows(ErrorCode::DeleteRowCountMismatch, affected, 1, || {
                format!("delete {} {} from {}", delete.entity_type, delete.id, def.table)
            })?;
        }
        debug!("taxis: deleted {} {}", delete.entity_type, delete.id);
        Ok(())
    }
}
