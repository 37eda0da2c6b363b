//! Multiplicity checks over a whole batch, run before any row is touched.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use sea_query::{Alias, Expr, Query};

use aideon_taxis_core::{
    ErrorCode, Id, ReferenceDef, ReferenceKey, StatementSet, StorageRule, TaxisError, TaxisResult,
};

use crate::StoreContext;

type Slot = (Id, ReferenceKey);

/// Links of one batch, indexed by owner slot and by target slot.
#[derive(Default)]
struct BatchIndex {
    deleted: BTreeSet<Id>,
    inserted: BTreeSet<Id>,
    added_by: BTreeMap<Slot, BTreeSet<Id>>,
    removed_by: BTreeMap<Slot, BTreeSet<Id>>,
    added_into: BTreeMap<Slot, BTreeSet<Id>>,
    removed_into: BTreeMap<Slot, BTreeSet<Id>>,
    /// Owners whose add statements said nothing was referenced before.
    fresh: BTreeSet<Slot>,
}

impl BatchIndex {
    fn new(set: &StatementSet) -> Self {
        let mut index = BatchIndex {
            deleted: set.deleted_ids(),
            inserted: set.inserted_ids(),
            ..BatchIndex::default()
        };
        for insert in &set.inserts {
            if let Some(container) = &insert.container {
                index.add(container.owner, &container.reference, insert.instance.id);
            }
        }
        for add in &set.add_references {
            if !add.already_referencing_instances {
                index.fresh.insert((add.id, add.reference.clone()));
            }
            for target in &add.referenced_ids {
                index.add(add.id, &add.reference, *target);
            }
        }
        for remove in &set.remove_references {
            for target in &remove.referenced_ids {
                index
                    .removed_by
                    .entry((remove.id, remove.reference.clone()))
                    .or_default()
                    .insert(*target);
                index
                    .removed_into
                    .entry((*target, remove.reference.clone()))
                    .or_default()
                    .insert(remove.id);
            }
        }
        index
    }

    fn add(&mut self, owner: Id, key: &ReferenceKey, target: Id) {
        self.added_by
            .entry((owner, key.clone()))
            .or_default()
            .insert(target);
        self.added_into
            .entry((target, key.clone()))
            .or_default()
            .insert(owner);
    }

    fn count(map: &BTreeMap<Slot, BTreeSet<Id>>, id: Id, key: &ReferenceKey) -> usize {
        map.get(&(id, key.clone())).map_or(0, BTreeSet::len)
    }

    /// True when `id` gains a link through `key`, stated from either side.
    fn relinked(&self, id: Id, key: &ReferenceKey, opposite: Option<&ReferenceKey>) -> bool {
        Self::count(&self.added_by, id, key) > 0
            || opposite.is_some_and(|opposite| Self::count(&self.added_into, id, opposite) > 0)
    }
}

/// Rejects batches that would break reference multiplicities.
pub struct ReferenceConsistencyChecker<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> ReferenceConsistencyChecker<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn check(&self, set: &StatementSet) -> TaxisResult<()> {
        let index = BatchIndex::new(set);
        self.check_removals(&index)?;
        self.check_additions(&index)?;
        debug!(
            "taxis: consistency checked {} added and {} removed slots",
            index.added_by.len(),
            index.removed_by.len()
        );
        Ok(())
    }

    fn check_removals(&self, index: &BatchIndex) -> TaxisResult<()> {
        let resolver = self.ctx.resolver;
        for ((owner, key), targets) in &index.removed_by {
            let def = resolver.reference_def(key)?;
            let opposite = resolver.opposite(key)?;

            if is_single_mandatory(def)
                && !index.deleted.contains(owner)
                && !index.relinked(*owner, key, opposite.as_ref())
            {
                return Err(TaxisError::consistency(
                    ErrorCode::MandatoryConstraintViolation,
                    format!("{key} of {owner} is required and would be left empty"),
                    vec![*owner],
                ));
            }

            let Some(opposite) = opposite else {
                continue;
            };
            if !is_single_mandatory(resolver.reference_def(&opposite)?) {
                continue;
            }
            let stranded: Vec<Id> = targets
                .iter()
                .filter(|target| {
                    !index.deleted.contains(*target)
                        && !index.relinked(**target, &opposite, Some(key))
                })
                .copied()
                .collect();
            if !stranded.is_empty() {
                return Err(TaxisError::consistency(
                    ErrorCode::MandatoryConstraintViolation,
                    format!(
                        "{opposite} is required; removing {key} of {owner} strands {} instance(s)",
                        stranded.len()
                    ),
                    stranded,
                ));
            }
        }
        Ok(())
    }

    fn check_additions(&self, index: &BatchIndex) -> TaxisResult<()> {
        let resolver = self.ctx.resolver;
        let mut opposite_slots: BTreeSet<Slot> = BTreeSet::new();
        for (owner, key) in index.added_by.keys() {
            let def = resolver.reference_def(key)?;
            if let Some(upper) = def.upper {
                let existing = if index.inserted.contains(owner)
                    || index.fresh.contains(&(*owner, key.clone()))
                {
                    0
                } else {
                    self.count(key, *owner)?
                };
                let total = existing
                    .saturating_sub(BatchIndex::count(&index.removed_by, *owner, key))
                    + BatchIndex::count(&index.added_by, *owner, key);
                if total > upper as usize {
                    return Err(TaxisError::consistency(
                        ErrorCode::CardinalityViolation,
                        format!("{key} of {owner} would hold {total} instances, at most {upper}"),
                        vec![*owner],
                    ));
                }
            }
            if let Some(opposite) = resolver.opposite(key)? {
                for target in index.added_by.get(&(*owner, key.clone())).into_iter().flatten() {
                    opposite_slots.insert((*target, opposite.clone()));
                }
            }
        }

        for (target, opposite) in opposite_slots {
            let def = resolver.reference_def(&opposite)?;
            let Some(upper) = def.upper else {
                continue;
            };
            let Some(key) = resolver.opposite(&opposite)? else {
                continue;
            };
            let existing = if index.inserted.contains(&target) {
                0
            } else {
                self.count(&opposite, target)?
            };
            let removed = BatchIndex::count(&index.removed_by, target, &opposite)
                + BatchIndex::count(&index.removed_into, target, &key);
            let added = BatchIndex::count(&index.added_by, target, &opposite)
                + BatchIndex::count(&index.added_into, target, &key);
            let total = existing.saturating_sub(removed) + added;
            if total > upper as usize {
                let code = if upper == 1 {
                    ErrorCode::MandatoryConstraintViolation
                } else {
                    ErrorCode::CardinalityViolation
                };
                return Err(TaxisError::consistency(
                    code,
                    format!("{opposite} of {target} would hold {total} instances, at most {upper}"),
                    vec![target],
                ));
            }
        }
        Ok(())
    }

    /// Persisted number of instances `owner` references through `key`.
    fn count(&self, key: &ReferenceKey, owner: Id) -> TaxisResult<usize> {
        let resolver = self.ctx.resolver;
        let def = resolver.reference_def(key)?;
        let mut select = Query::select();
        select.expr_as(Expr::cust("COUNT(*)"), Alias::new("total"));
        match def.storage {
            StorageRule::ForeignKey => {
                let column = resolver.reference_column(key)?;
                select
                    .from(Alias::new(resolver.table_name(&key.owner)?))
                    .and_where(
                        Expr::col(Alias::new(&self.ctx.columns.identifier)).eq(self.ctx.id(owner)),
                    )
                    .and_where(Expr::col(Alias::new(column)).is_not_null());
            }
            StorageRule::InverseForeignKey => {
                select
                    .from(Alias::new(resolver.table_name(&def.target)?))
                    .and_where(
                        Expr::col(Alias::new(resolver.reference_column(key)?)).eq(self.ctx.id(owner)),
                    );
            }
            StorageRule::JoinTable => {
                let join = resolver.join_table(key)?;
                select
                    .from(Alias::new(&join.table))
                    .and_where(Expr::col(Alias::new(&join.owner_column)).eq(self.ctx.id(owner)));
            }
        }
        let rows = self.ctx.query(&select)?;
        let total = match rows.first() {
            Some(row) => row.i64("total")?,
            None => 0,
        };
        Ok(usize::try_from(total).unwrap_or_default())
    }
}

fn is_single_mandatory(def: &ReferenceDef) -> bool {
    def.is_mandatory() && def.upper == Some(1)
}
