#![allow(dead_code)]

use std::cell::RefCell;

use aideon_taxis_core::{
    DefaultCoercer, MetadataResolver, Model, Payload, StorageRule, TaxisResult,
    UuidIdentifierProvider, ValueType,
};
use aideon_taxis_store::{
    ColumnNames, Dialect, PayloadDao, Row, SqlExecutor, SqlStatement, SqliteExecutor,
};
use rusqlite::Connection;
use serde_json::Value as JsonValue;

pub const COMMERCE_MODEL: &str = include_str!("../../../../fixtures/commerce_model.json");

pub fn model() -> Model {
    Model::from_json(COMMERCE_MODEL).expect("fixture model")
}

pub fn payload(value: JsonValue) -> Payload {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

fn sql_type(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::Str | ValueType::Ref | ValueType::Json => "TEXT",
        ValueType::I64 | ValueType::Bool | ValueType::Time => "INTEGER",
        ValueType::F64 => "REAL",
        ValueType::Blob => "BLOB",
    }
}

/// Table DDL for every type of the model, with foreign keys declared so
/// SQLite rejects statements issued in the wrong order.
pub fn schema(model: &Model, columns: &ColumnNames) -> Vec<String> {
    let mut ddl = Vec::new();
    for def in model.entity_types() {
        let mut lines = vec![
            match &def.parent {
                Some(parent) => format!(
                    "{} TEXT PRIMARY KEY REFERENCES {}({})",
                    columns.identifier,
                    model.table_name(parent).expect("parent table"),
                    columns.identifier
                ),
                None => format!("{} TEXT PRIMARY KEY", columns.identifier),
            },
            format!("{} TEXT NOT NULL", columns.entity_type),
            format!("{} INTEGER NOT NULL", columns.version),
            format!("{} INTEGER", columns.created_timestamp),
            format!("{} TEXT", columns.created_by_id),
            format!("{} TEXT", columns.created_by_name),
            format!("{} INTEGER", columns.updated_timestamp),
            format!("{} TEXT", columns.updated_by_id),
            format!("{} TEXT", columns.updated_by_name),
        ];
        let mut seen: Vec<String> = Vec::new();
        for attribute in &def.attributes {
            lines.push(format!("{} {}", attribute.column(), sql_type(attribute.value_type)));
        }
        for reference in &def.references {
            if reference.storage != StorageRule::ForeignKey {
                continue;
            }
            let column = reference.column.clone().expect("fk column");
            let target = model.table_name(&reference.target).expect("target table");
            lines.push(format!("{column} TEXT REFERENCES {target}({})", columns.identifier));
            seen.push(column);
        }
        for owner in model.entity_types() {
            for reference in &owner.references {
                if reference.storage != StorageRule::InverseForeignKey
                    || reference.target != def.name
                {
                    continue;
                }
                let column = reference.column.clone().expect("inverse fk column");
                if seen.contains(&column) {
                    continue;
                }
                lines.push(format!(
                    "{column} TEXT REFERENCES {}({})",
                    owner.table, columns.identifier
                ));
                seen.push(column);
            }
        }
        ddl.push(format!("CREATE TABLE {} ({})", def.table, lines.join(", ")));
    }
    for def in model.entity_types() {
        for reference in &def.references {
            let Some(join) = &reference.join_table else {
                continue;
            };
            let target = model.table_name(&reference.target).expect("target table");
            ddl.push(format!(
                "CREATE TABLE {table} ({owner} TEXT NOT NULL REFERENCES {owner_table}({id}), \
                 {target_column} TEXT NOT NULL REFERENCES {target}({id}), \
                 PRIMARY KEY ({owner}, {target_column}))",
                table = join.table,
                owner = join.owner_column,
                owner_table = def.table,
                target_column = join.target_column,
                id = columns.identifier,
            ));
        }
    }
    ddl
}

pub fn open_store(model: &Model) -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    conn.pragma_update(None, "foreign_keys", true)
        .expect("enable foreign keys");
    for statement in schema(model, &ColumnNames::default()) {
        conn.execute(&statement, []).expect("create table");
    }
    conn
}

/// Forwards to SQLite and keeps every statement it saw.
pub struct RecordingExecutor<'c> {
    inner: SqliteExecutor<'c>,
    pub log: RefCell<Vec<SqlStatement>>,
}

impl<'c> RecordingExecutor<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            inner: SqliteExecutor::new(conn),
            log: RefCell::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<String> {
        self.log
            .borrow_mut()
            .drain(..)
            .map(|statement| statement.sql)
            .collect()
    }
}

impl SqlExecutor for RecordingExecutor<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, statement: &SqlStatement) -> TaxisResult<u64> {
        self.log.borrow_mut().push(statement.clone());
        self.inner.execute(statement)
    }

    fn query(&self, statement: &SqlStatement) -> TaxisResult<Vec<Row>> {
        self.log.borrow_mut().push(statement.clone());
        self.inner.query(statement)
    }
}

pub struct Store {
    pub model: Model,
    pub conn: Connection,
    pub identifiers: UuidIdentifierProvider,
    pub coercer: DefaultCoercer,
}

impl Store {
    pub fn new() -> Self {
        Self::with_model(model())
    }

    pub fn with_model(model: Model) -> Self {
        let conn = open_store(&model);
        Self {
            model,
            conn,
            identifiers: UuidIdentifierProvider::default(),
            coercer: DefaultCoercer,
        }
    }

    pub fn dao<'a>(&'a self, executor: &'a dyn SqlExecutor) -> PayloadDao<'a> {
        PayloadDao::new(executor, &self.model, &self.identifiers, &self.coercer)
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.conn
            .query_row(sql, [], |row| row.get(0))
            .expect("count query")
    }

    pub fn text(&self, sql: &str) -> Option<String> {
        self.conn
            .query_row(sql, [], |row| row.get(0))
            .expect("text query")
    }
}
