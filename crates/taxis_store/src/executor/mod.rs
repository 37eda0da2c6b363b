//! Statement executors. A batch runs in a fixed order: existence checks,
//! consistency checks, insert ordering, removals, deletes, inserts, updates
//! and finally the remaining links.

mod delete;
mod insert;
mod reference;
mod update;

pub use delete::DeleteExecutor;
pub use insert::InsertExecutor;
pub use reference::ReferenceExecutor;
pub use update::UpdateExecutor;

use std::cell::Cell;
use std::collections::BTreeSet;

use log::info;
use sea_query::{Alias, Expr, Query, QueryStatementWriter, Value as SeaValue};
use serde::Serialize;

use aideon_taxis_core::{
    Audit, ErrorCode, Feedback, Id, MetadataResolver, Statement, StatementSet, TaxisError,
    TaxisResult, Value, WriteOptions,
};

use crate::dependency::DependencyResolver;
use crate::sql::{exec, id_value, query_all, to_sea_value};
use crate::{ColumnNames, Dialect, ReferenceConsistencyChecker, Row, SqlExecutor};

/// Connection, model and settings shared by the executors of one batch.
pub struct StoreContext<'a> {
    pub executor: &'a dyn SqlExecutor,
    pub resolver: &'a dyn MetadataResolver,
    pub columns: &'a ColumnNames,
    pub options: WriteOptions,
    pub audit_columns: bool,
    statements: Cell<usize>,
}

impl<'a> StoreContext<'a> {
    pub fn new(
        executor: &'a dyn SqlExecutor,
        resolver: &'a dyn MetadataResolver,
        columns: &'a ColumnNames,
    ) -> Self {
        Self {
            executor,
            resolver,
            columns,
            options: WriteOptions::default(),
            audit_columns: true,
            statements: Cell::new(0),
        }
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_audit_columns(mut self, audit_columns: bool) -> Self {
        self.audit_columns = audit_columns;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.executor.dialect()
    }

    pub fn id(&self, id: Id) -> SeaValue {
        id_value(self.dialect(), id)
    }

    pub fn value(&self, value: &Value) -> SeaValue {
        to_sea_value(self.dialect(), value)
    }

    /// Number of SQL statements issued through this context.
    pub fn statements_run(&self) -> usize {
        self.statements.get()
    }

    pub(crate) fn exec<S: QueryStatementWriter>(&self, stmt: &S) -> TaxisResult<u64> {
        self.statements.set(self.statements.get() + 1);
        exec(self.executor, stmt)
    }

    pub(crate) fn query<S: QueryStatementWriter>(&self, stmt: &S) -> TaxisResult<Vec<Row>> {
        self.statements.set(self.statements.get() + 1);
        query_all(self.executor, stmt)
    }

    pub(crate) fn audit_values(&self, audit: &Audit, created: bool) -> Vec<(Alias, SeaValue)> {
        if !self.audit_columns {
            return Vec::new();
        }
        let (timestamp, by_id, by_name) = if created {
            (
                &self.columns.created_timestamp,
                &self.columns.created_by_id,
                &self.columns.created_by_name,
            )
        } else {
            (
                &self.columns.updated_timestamp,
                &self.columns.updated_by_id,
                &self.columns.updated_by_name,
            )
        };
        vec![
            (
                Alias::new(timestamp),
                SeaValue::BigInt(audit.timestamp.map(|timestamp| timestamp.as_i64())),
            ),
            (Alias::new(by_id), audit.user_id.clone().into()),
            (Alias::new(by_name), audit.user_name.clone().into()),
        ]
    }
}

/// Row counts of one executed batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub references_added: usize,
    pub references_removed: usize,
    pub sql_statements: usize,
}

pub struct StatementExecutor<'a> {
    ctx: &'a StoreContext<'a>,
}

impl<'a> StatementExecutor<'a> {
    pub fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn execute(&self, statements: Vec<Statement>) -> TaxisResult<ExecutionReport> {
        let set = StatementSet::from(statements);
        if set.is_empty() {
            return Ok(ExecutionReport::default());
        }
        let started = self.ctx.statements_run();

        self.check_existence(&set)?;
        ReferenceConsistencyChecker::new(self.ctx).check(&set)?;
        let plan = DependencyResolver::new(self.ctx.resolver)
            .plan(&set.inserts, &set.add_references)?;

        let deleted = set.deleted_ids();
        let references = ReferenceExecutor::new(self.ctx);
        let references_removed =
            references.remove(&set.remove_references, &set.add_references, &deleted)?;
        DeleteExecutor::new(self.ctx).execute(&set.deletes)?;
        InsertExecutor::new(self.ctx).execute(&set.inserts, &plan)?;
        UpdateExecutor::new(self.ctx).execute(&set.updates)?;
        let references_added = references.add(&plan.deferred)?;

        let report = ExecutionReport {
            inserted: set.inserts.len(),
            updated: set.updates.len(),
            deleted: set.deletes.len(),
            references_added,
            references_removed,
            sql_statements: self.ctx.statements_run() - started,
        };
        info!(
            "taxis: batch executed inserted={} updated={} deleted={} links +{} -{} sql={}",
            report.inserted,
            report.updated,
            report.deleted,
            report.references_added,
            report.references_removed,
            report.sql_statements
        );
        Ok(report)
    }

    /// Every referenced or updated instance outside the batch's inserts must
    /// exist with a type assignable to the expected one.
    fn check_existence(&self, set: &StatementSet) -> TaxisResult<()> {
        let inserted = set.inserted_ids();
        let mut checked = BTreeSet::new();
        let mut missing = Vec::new();
        for check in &set.exists_checks {
            if inserted.contains(&check.id)
                || !checked.insert((check.entity_type.clone(), check.id))
            {
                continue;
            }
            let columns = self.ctx.columns;
            let select = Query::select()
                .column(Alias::new(&columns.entity_type))
                .from(Alias::new(self.ctx.resolver.table_name(&check.entity_type)?))
                .and_where(Expr::col(Alias::new(&columns.identifier)).eq(self.ctx.id(check.id)))
                .to_owned();
            let rows = self.ctx.query(&select)?;
            let found = match rows.first() {
                Some(row) => {
                    let actual = row.str(&self.ctx.columns.entity_type)?;
                    self.ctx.resolver.is_assignable(actual, &check.entity_type)
                }
                None => false,
            };
            if !found {
                missing.push(
                    Feedback::new(
                        ErrorCode::EntityNotFound,
                        "",
                        format!("{} {} does not exist", check.entity_type, check.id),
                    )
                    .with_identifier(check.id),
                );
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TaxisError::Validation { feedback: missing })
        }
    }
}

pub(crate) fn expect_rows(
    code: ErrorCode,
    affected: u64,
    expected: u64,
    what: impl FnOnce() -> String,
) -> TaxisResult<()> {
    if affected == expected {
        Ok(())
    } else {
        Err(TaxisError::execution(
            code,
            format!("{}: expected {expected} row(s), got {affected}", what()),
        ))
    }
}
