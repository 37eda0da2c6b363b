//! SQL plumbing shared by executors, the collector and the query builder.

use std::fmt;

use log::debug;
use sea_query::{
    MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter, SqliteQueryBuilder,
    Value as SeaValue,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use aideon_taxis_core::{Id, TaxisError, TaxisResult, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
        }
    }
}

/// Rendered SQL with positional placeholders and bound values in order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SqlStatement {
    pub sql: String,
    pub values: Vec<Value>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }

    pub fn build<S: QueryStatementWriter>(dialect: Dialect, stmt: &S) -> Self {
        let (sql, values) = match dialect {
            Dialect::Sqlite => stmt.build(SqliteQueryBuilder),
            Dialect::Postgres => stmt.build(PostgresQueryBuilder),
            Dialect::Mysql => stmt.build(MysqlQueryBuilder),
        };
        Self {
            sql,
            values: values.0.into_iter().map(from_sea_value).collect(),
        }
    }
}

impl fmt::Display for SqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// One result row; columns keep their select order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn opt_id(&self, name: &str) -> TaxisResult<Option<Id>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_id()
                .map(Some)
                .ok_or_else(|| TaxisError::storage(format!("column {name} is not an id"))),
        }
    }

    pub fn id(&self, name: &str) -> TaxisResult<Id> {
        self.opt_id(name)?
            .ok_or_else(|| TaxisError::storage(format!("column {name} is null")))
    }

    pub fn i64(&self, name: &str) -> TaxisResult<i64> {
        self.get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| TaxisError::storage(format!("column {name} is not an integer")))
    }

    pub fn str(&self, name: &str) -> TaxisResult<&str> {
        self.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| TaxisError::storage(format!("column {name} is not text")))
    }

    pub fn into_json(self) -> Map<String, JsonValue> {
        self.columns
            .into_iter()
            .map(|(column, value)| (column, value.to_json()))
            .collect()
    }
}

/// Runs rendered statements on the caller's connection and transaction.
pub trait SqlExecutor {
    fn dialect(&self) -> Dialect;

    /// Returns the number of affected rows.
    fn execute(&self, statement: &SqlStatement) -> TaxisResult<u64>;

    fn query(&self, statement: &SqlStatement) -> TaxisResult<Vec<Row>>;
}

pub(crate) fn exec<S: QueryStatementWriter>(
    executor: &dyn SqlExecutor,
    stmt: &S,
) -> TaxisResult<u64> {
    let statement = SqlStatement::build(executor.dialect(), stmt);
    debug!("taxis: execute {}", statement.sql);
    executor.execute(&statement)
}

pub(crate) fn query_all<S: QueryStatementWriter>(
    executor: &dyn SqlExecutor,
    stmt: &S,
) -> TaxisResult<Vec<Row>> {
    let statement = SqlStatement::build(executor.dialect(), stmt);
    debug!("taxis: query {}", statement.sql);
    executor.query(&statement)
}

pub fn id_value(dialect: Dialect, id: Id) -> SeaValue {
    match dialect {
        Dialect::Mysql => SeaValue::Bytes(Some(Box::new(id.as_vec()))),
        Dialect::Sqlite | Dialect::Postgres => {
            SeaValue::String(Some(Box::new(id.to_uuid_string())))
        }
    }
}

pub fn to_sea_value(dialect: Dialect, value: &Value) -> SeaValue {
    match value {
        Value::Null => SeaValue::String(None),
        Value::Str(text) => text.clone().into(),
        Value::I64(number) => (*number).into(),
        Value::F64(number) => (*number).into(),
        Value::Bool(flag) => (*flag).into(),
        Value::Time(timestamp) => timestamp.as_i64().into(),
        Value::Ref(id) => id_value(dialect, *id),
        Value::Blob(bytes) => bytes.clone().into(),
        Value::Json(json) => json.to_string().into(),
    }
}

/// Literal payload values used in filters and custom join parameters.
pub fn json_to_sea_value(value: &JsonValue) -> SeaValue {
    match value {
        JsonValue::Null => SeaValue::String(None),
        JsonValue::Bool(flag) => (*flag).into(),
        JsonValue::Number(number) => match number.as_i64() {
            Some(integer) => integer.into(),
            None => number.as_f64().unwrap_or_default().into(),
        },
        JsonValue::String(text) => text.clone().into(),
        other => other.to_string().into(),
    }
}

fn from_sea_value(value: SeaValue) -> Value {
    match value {
        SeaValue::Bool(Some(flag)) => Value::Bool(flag),
        SeaValue::TinyInt(Some(number)) => Value::I64(number.into()),
        SeaValue::SmallInt(Some(number)) => Value::I64(number.into()),
        SeaValue::Int(Some(number)) => Value::I64(number.into()),
        SeaValue::BigInt(Some(number)) => Value::I64(number),
        SeaValue::TinyUnsigned(Some(number)) => Value::I64(number.into()),
        SeaValue::SmallUnsigned(Some(number)) => Value::I64(number.into()),
        SeaValue::Unsigned(Some(number)) => Value::I64(number.into()),
        SeaValue::BigUnsigned(Some(number)) => {
            i64::try_from(number).map(Value::I64).unwrap_or(Value::F64(number as f64))
        }
        SeaValue::Float(Some(number)) => Value::F64(number.into()),
        SeaValue::Double(Some(number)) => Value::F64(number),
        SeaValue::String(Some(text)) => Value::Str(*text),
        SeaValue::Char(Some(ch)) => Value::Str(ch.to_string()),
        SeaValue::Bytes(Some(bytes)) => Value::Blob(*bytes),
        _ => Value::Null,
    }
}
