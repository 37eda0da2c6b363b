use log::debug;
use sea_query::{Alias, Query, SimpleExpr, Value as SeaValue};

use aideon_taxis_core::{ErrorCode, InsertStatement, TaxisError, TaxisResult};

use super::{StoreContext, expect_rows};
use crate::dependency::InsertPlan;

/// Writes one row per table of the instance's type chain, root table first.
pub struct InsertExecutor<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> InsertExecutor<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, inserts: &[InsertStatement], plan: &InsertPlan) -> TaxisResult<()> {
        for index in &plan.order {
            let Some(insert) = inserts.get(*index) else {
                return Err(TaxisError::storage(format!("insert plan index {index} out of range")));
            };
            self.insert(insert, plan)?;
        }
        Ok(())
    }

    fn insert(&self, insert: &InsertStatement, plan: &InsertPlan) -> TaxisResult<()> {
        let instance = &insert.instance;
        let columns = self.ctx.columns;
        let mut chain = self.ctx.resolver.type_chain(&instance.entity_type)?;
        chain.reverse();
        for def in chain {
            let mut row: Vec<(Alias, SeaValue)> = vec![
                (Alias::new(&columns.identifier), self.ctx.id(instance.id)),
                (Alias::new(&columns.entity_type), instance.entity_type.clone().into()),
                (Alias::new(&columns.version), instance.version.unwrap_or(1).into()),
            ];
            row.extend(self.ctx.audit_values(&instance.audit, true));
            for attribute in &def.attributes {
                if let Some(value) = instance.attributes.get(&attribute.name) {
                    row.push((Alias::new(attribute.column()), self.ctx.value(value)));
                }
            }
            for folded in plan.folded_for(instance.id, &def.table) {
                row.push((Alias::new(&folded.column), self.ctx.id(folded.value)));
            }

            let (names, values): (Vec<Alias>, Vec<SimpleExpr>) = row
                .into_iter()
                .map(|(name, value)| (name, SimpleExpr::from(value)))
                .unzip();
            let mut stmt = Query::insert();
            stmt.into_table(Alias::new(&def.table)).columns(names);
            stmt.values(values)
                .map_err(|err| TaxisError::storage(format!("insert into {}: {err}", def.table)))?;
            let affected = self.ctx.exec(&stmt)?;
            expect_rows(ErrorCode::InsertRowCountMismatch, affected, 1, || {
                format!("insert {} {} into {}", instance.entity_type, instance.id, def.table)
            })?;
        }
        debug!("taxis: inserted {} {}", instance.entity_type, instance.id);
        Ok(())
    }
}
