//! Facade running the full write pipeline: payload processors produce
//! statements, the statement executor applies them on the caller's
//! connection. Transactions stay with the caller.

use log::info;
use serde_json::{Map, Value as JsonValue};

use aideon_taxis_core::{
    Audit, Coercer, DeletePayloadProcessor, Id, IdentifierProvider, InsertPayloadProcessor,
    InstanceGraph, InstanceGraphCollector, MetadataResolver, Payload, ProcessorContext,
    ReferencePayloadProcessor, Statement, TaxisResult, UpdatePayloadProcessor, WriteOptions,
};

use crate::{
    ColumnNames, ExecutionReport, LogicalQuery, QueryBuilder, SqlExecutor,
    SqlInstanceGraphCollector, StatementExecutor, StoreContext, TaxisConfig,
};

pub struct PayloadDao<'a> {
    executor: &'a dyn SqlExecutor,
    resolver: &'a dyn MetadataResolver,
    identifiers: &'a dyn IdentifierProvider,
    coercer: &'a dyn Coercer,
    columns: ColumnNames,
    options: WriteOptions,
    audit_columns: bool,
    audit: Audit,
}

impl<'a> PayloadDao<'a> {
    pub fn new(
        executor: &'a dyn SqlExecutor,
        resolver: &'a dyn MetadataResolver,
        identifiers: &'a dyn IdentifierProvider,
        coercer: &'a dyn Coercer,
    ) -> Self {
        Self {
            executor,
            resolver,
            identifiers,
            coercer,
            columns: ColumnNames::default(),
            options: WriteOptions::default(),
            audit_columns: true,
            audit: Audit::default(),
        }
    }

    pub fn with_config(mut self, config: &TaxisConfig) -> Self {
        self.columns = config.column_names();
        self.options = config.write_options();
        self.audit_columns = config.audit_enabled();
        self
    }

    pub fn with_options(mut self, options: WriteOptions) -> Self {
        self.options = options;
        self
    }

    /// Audit stamp written by subsequent operations.
    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = audit;
        self
    }

    fn store(&self) -> StoreContext<'_> {
        StoreContext::new(self.executor, self.resolver, &self.columns)
            .with_options(self.options)
            .with_audit_columns(self.audit_columns)
    }

    fn processors(&self) -> ProcessorContext<'a> {
        ProcessorContext::new(self.resolver, self.identifiers, self.coercer)
            .with_options(self.options)
            .with_audit(self.audit.clone())
    }

    fn run(
        &self,
        store: &StoreContext<'_>,
        statements: Vec<Statement>,
    ) -> TaxisResult<ExecutionReport> {
        StatementExecutor::new(store).execute(statements)
    }

    /// Creates the payload's instance tree; returns the payload completed
    /// with identifiers, type tags and versions.
    pub fn create(&self, entity_type: &str, payload: &Payload) -> TaxisResult<Payload> {
        let (created, statements) =
            InsertPayloadProcessor::new(self.processors()).insert(entity_type, payload)?;
        let report = self.run(&self.store(), statements)?;
        info!("taxis: created {entity_type} with {} rows", report.inserted);
        Ok(created)
    }

    pub fn update(
        &self,
        entity_type: &str,
        original: &Payload,
        updated: &Payload,
    ) -> TaxisResult<ExecutionReport> {
        let store = self.store();
        let collector = SqlInstanceGraphCollector::new(&store);
        let statements = UpdatePayloadProcessor::new(self.processors(), &collector).diff(
            entity_type,
            original,
            updated,
            self.options.check_mandatory,
        )?;
        self.run(&store, statements)
    }

    /// Deletes the instance with its containment subtree.
    pub fn delete(&self, entity_type: &str, id: Id) -> TaxisResult<ExecutionReport> {
        let store = self.store();
        let collector = SqlInstanceGraphCollector::new(&store);
        let statements =
            DeletePayloadProcessor::new(self.processors(), &collector).delete(entity_type, id)?;
        self.run(&store, statements)
    }

    pub fn add_references(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        targets: &[Id],
    ) -> TaxisResult<ExecutionReport> {
        let store = self.store();
        let collector = SqlInstanceGraphCollector::new(&store);
        let statements = ReferencePayloadProcessor::new(self.processors(), &collector)
            .add_references(entity_type, id, reference, targets)?;
        self.run(&store, statements)
    }

    pub fn remove_references(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        targets: &[Id],
    ) -> TaxisResult<ExecutionReport> {
        let store = self.store();
        let collector = SqlInstanceGraphCollector::new(&store);
        let statements = ReferencePayloadProcessor::new(self.processors(), &collector)
            .remove_references(entity_type, id, reference, targets)?;
        self.run(&store, statements)
    }

    pub fn set_reference(
        &self,
        entity_type: &str,
        id: Id,
        reference: &str,
        target: Option<Id>,
    ) -> TaxisResult<ExecutionReport> {
        let store = self.store();
        let collector = SqlInstanceGraphCollector::new(&store);
        let statements = ReferencePayloadProcessor::new(self.processors(), &collector)
            .set_reference(entity_type, id, reference, target)?;
        self.run(&store, statements)
    }

    pub fn load_graph(&self, entity_type: &str, id: Id) -> TaxisResult<InstanceGraph> {
        let store = self.store();
        SqlInstanceGraphCollector::new(&store).collect_graph(entity_type, id)
    }

    /// Runs a logical query; each row becomes a flat payload keyed by the
    /// select labels.
    pub fn query(
        &self,
        query: &LogicalQuery,
        params: &Map<String, JsonValue>,
    ) -> TaxisResult<Vec<Payload>> {
        let dialect = self.executor.dialect();
        let built = QueryBuilder::new(self.resolver, &self.columns, dialect).build(query, params)?;
        let rows = self.executor.query(&built.to_sql(dialect))?;
        Ok(rows.into_iter().map(|row| row.into_json()).collect())
    }
}
