use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, params_from_iter};

use aideon_taxis_core::{TaxisError, TaxisResult, Value};

use crate::{Dialect, Row, SqlExecutor, SqlStatement};

/// [`SqlExecutor`] over a rusqlite connection. A `Transaction` derefs to a
/// `Connection`, so statements join whatever transaction the caller opened.
pub struct SqliteExecutor<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteExecutor<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl SqlExecutor for SqliteExecutor<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, statement: &SqlStatement) -> TaxisResult<u64> {
        let params = statement.values.iter().map(to_sqlite);
        let changed = self
            .conn
            .execute(&statement.sql, params_from_iter(params))
            .map_err(|err| TaxisError::storage(format!("execute `{}`: {err}", statement.sql)))?;
        Ok(changed as u64)
    }

    fn query(&self, statement: &SqlStatement) -> TaxisResult<Vec<Row>> {
        let mut prepared = self
            .conn
            .prepare(&statement.sql)
            .map_err(|err| TaxisError::storage(format!("prepare `{}`: {err}", statement.sql)))?;
        let names: Vec<String> = prepared
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let params = statement.values.iter().map(to_sqlite);
        let mut rows = prepared
            .query(params_from_iter(params))
            .map_err(|err| TaxisError::storage(format!("query `{}`: {err}", statement.sql)))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| TaxisError::storage(format!("read row: {err}")))?
        {
            let mut columns = Vec::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                let value = row
                    .get_ref(index)
                    .map_err(|err| TaxisError::storage(format!("read column {name}: {err}")))?;
                columns.push((name.clone(), from_sqlite(value)));
            }
            out.push(Row::new(columns));
        }
        Ok(out)
    }
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Str(text) => SqliteValue::Text(text.clone()),
        Value::I64(number) => SqliteValue::Integer(*number),
        Value::F64(number) => SqliteValue::Real(*number),
        Value::Bool(flag) => SqliteValue::Integer(i64::from(*flag)),
        Value::Time(timestamp) => SqliteValue::Integer(timestamp.as_i64()),
        Value::Ref(id) => SqliteValue::Text(id.to_uuid_string()),
        Value::Blob(bytes) => SqliteValue::Blob(bytes.clone()),
        Value::Json(json) => SqliteValue::Text(json.to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::I64(number),
        ValueRef::Real(number) => Value::F64(number),
        ValueRef::Text(text) => Value::Str(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}
