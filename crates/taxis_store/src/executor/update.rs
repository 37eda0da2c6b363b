use log::debug;
use sea_query::{Alias, Expr, Query, SimpleExpr};

use aideon_taxis_core::{ErrorCode, TaxisError, TaxisResult, UpdateStatement};

use super::{StoreContext, expect_rows};

/// Bumps the version on every table of the chain and writes changed columns
/// to the table that declares them.
pub struct UpdateExecutor<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> UpdateExecutor<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, updates: &[UpdateStatement]) -> TaxisResult<()> {
        for update in updates {
            self.update(update)?;
        }
        Ok(())
    }

    fn update(&self, update: &UpdateStatement) -> TaxisResult<()> {
        let instance = &update.instance;
        let columns = self.ctx.columns;
        let locked = self.ctx.options.optimistic_lock && update.previous_version.is_some();
        let mut chain = self.ctx.resolver.type_chain(&instance.entity_type)?;
        chain.reverse();
        for def in chain {
            let mut values: Vec<(Alias, SimpleExpr)> = Vec::new();
            if let Some(version) = instance.version {
                values.push((Alias::new(&columns.version), version.into()));
            }
            for (name, value) in self.ctx.audit_values(&instance.audit, false) {
                values.push((name, value.into()));
            }
            for attribute in &def.attributes {
                if let Some(value) = instance.attributes.get(&attribute.name) {
                    values.push((Alias::new(attribute.column()), self.ctx.value(value).into()));
                }
            }
            if values.is_empty() {
                continue;
            }

            let mut stmt = Query::update();
            stmt.table(Alias::new(&def.table))
                .values(values)
                .and_where(Expr::col(Alias::new(&columns.identifier)).eq(self.ctx.id(instance.id)));
            if let (true, Some(previous)) = (locked, update.previous_version) {
                stmt.and_where(Expr::col(Alias::new(&columns.version)).eq(previous));
            }
            let affected = self.ctx.exec(&stmt)?;
            if affected == 0 && locked {
                return Err(TaxisError::execution(
                    ErrorCode::OutdatedInstance,
                    format!(
                        "{} {} was modified concurrently; expected version {}",
                        instance.entity_type,
                        instance.id,
                        update.previous_version.unwrap_or_default()
                    ),
                ));
            }
            expect_rows(ErrorCode::UpdateRowCountMismatch, affected, 1, || {
                format!("update {} {} in {}", instance.entity_type, instance.id, def.table)
            })?;
        }
        debug!("taxis: updated {} {}", instance.entity_type, instance.id);
        Ok(())
    }
}
