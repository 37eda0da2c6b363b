use std::collections::BTreeSet;

use log::debug;
use sea_query::{Alias, Expr, Query, SimpleExpr, Value as SeaValue};

use aideon_taxis_core::{
    AddReferenceStatement, ErrorCode, Id, ReferenceChange, ReferenceKey,
    RemoveReferenceStatement, StorageRule, TaxisError, TaxisResult,
};

use super::{StoreContext, expect_rows};

/// Writes and clears association links according to their storage rule.
pub struct ReferenceExecutor<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> ReferenceExecutor<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    /// Clears links. Links whose storage row disappears with a deleted
    /// instance, and foreign keys about to be repointed, are skipped.
    pub fn remove(
        &self,
        removes: &[RemoveReferenceStatement],
        adds: &[AddReferenceStatement],
        deleted: &BTreeSet<Id>,
    ) -> TaxisResult<usize> {
        let repointed: BTreeSet<(Id, &ReferenceKey)> = adds
            .iter()
            .filter(|add| add.change == ReferenceChange::Repoint)
            .map(|add| (add.id, &add.reference))
            .collect();
        let mut removed = 0;
        for remove in removes {
            let storage = self.ctx.resolver.storage_rule(&remove.reference)?;
            for target in &remove.referenced_ids {
                let skip = match storage {
                    StorageRule::ForeignKey => {
                        deleted.contains(&remove.id)
                            || repointed.contains(&(remove.id, &remove.reference))
                    }
                    StorageRule::InverseForeignKey => deleted.contains(target),
                    StorageRule::JoinTable => {
                        deleted.contains(&remove.id) || deleted.contains(target)
                    }
                };
                if skip {
                    continue;
                }
                self.unlink(&remove.reference, storage, remove.id, *target)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn add(&self, adds: &[AddReferenceStatement]) -> TaxisResult<usize> {
        let mut added = 0;
        for add in adds {
            let storage = self.ctx.resolver.storage_rule(&add.reference)?;
            for target in &add.referenced_ids {
                self.link(&add.reference, storage, add.id, *target)?;
                added += 1;
            }
        }
        Ok(added)
    }

    fn link(
        &self,
        key: &ReferenceKey,
        storage: StorageRule,
        owner: Id,
        target: Id,
    ) -> TaxisResult<()> {
        let affected = match storage {
            StorageRule::ForeignKey => {
                self.set_column(key, &key.owner, owner, self.ctx.id(target), None)?
            }
            StorageRule::InverseForeignKey => {
                let def = self.ctx.resolver.reference_def(key)?;
                self.set_column(key, &def.target, target, self.ctx.id(owner), None)?
            }
            StorageRule::JoinTable => {
                let join = self.ctx.resolver.join_table(key)?;
                let mut stmt = Query::insert();
                stmt.into_table(Alias::new(&join.table)).columns([
                    Alias::new(&join.owner_column),
                    Alias::new(&join.target_column),
                ]);
                stmt.values([
                    SimpleExpr::from(self.ctx.id(owner)),
                    SimpleExpr::from(self.ctx.id(target)),
                ])
                .map_err(|err| TaxisError::storage(format!("insert into {}: {err}", join.table)))?;
                self.ctx.exec(&stmt)?
            }
        };
        expect_rows(ErrorCode::ReferenceRowCountMismatch, affected, 1, || {
            format!("link {key} {owner} -> {target}")
        })?;
        debug!("taxis: linked {key} {owner} -> {target}");
        Ok(())
    }

    fn unlink(
        &self,
        key: &ReferenceKey,
        storage: StorageRule,
        owner: Id,
        target: Id,
    ) -> TaxisResult<()> {
        let affected = match storage {
            StorageRule::ForeignKey => self.set_column(
                key,
                &key.owner,
                owner,
                SeaValue::String(None),
                Some(self.ctx.id(target)),
            )?,
            StorageRule::InverseForeignKey => {
                let def = self.ctx.resolver.reference_def(key)?;
                self.set_column(
                    key,
                    &def.target,
                    target,
                    SeaValue::String(None),
                    Some(self.ctx.id(owner)),
                )?
            }
            StorageRule::JoinTable => {
                let join = self.ctx.resolver.join_table(key)?;
                let stmt = Query::delete()
                    .from_table(Alias::new(&join.table))
                    .and_where(Expr::col(Alias::new(&join.owner_column)).eq(self.ctx.id(owner)))
                    .and_where(Expr::col(Alias::new(&join.target_column)).eq(self.ctx.id(target)))
                    .to_owned();
                self.ctx.exec(&stmt)?
            }
        };
        expect_rows(ErrorCode::ReferenceRowCountMismatch, affected, 1, || {
            format!("unlink {key} {owner} -> {target}")
        })?;
        debug!("taxis: unlinked {key} {owner} -> {target}");
        Ok(())
    }

    /// `UPDATE <holder table> SET <column> = value WHERE id = holder`, guarded
    /// by the current column value when clearing.
    fn set_column(
        &self,
        key: &ReferenceKey,
        holder_type: &str,
        holder: Id,
        value: SeaValue,
        current: Option<SeaValue>,
    ) -> TaxisResult<u64> {
        let column = self.ctx.resolver.reference_column(key)?;
        let mut stmt = Query::update();
        stmt.table(Alias::new(self.ctx.resolver.table_name(holder_type)?))
            .values([(Alias::new(column), SimpleExpr::from(value))])
            .and_where(Expr::col(Alias::new(&self.ctx.columns.identifier)).eq(self.ctx.id(holder)));
        if let Some(current) = current {
            stmt.and_where(Expr::col(Alias::new(column)).eq(current));
        }
        self.ctx.exec(&stmt)
    }
}
