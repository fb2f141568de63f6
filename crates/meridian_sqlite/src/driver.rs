use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use meridian_core::{
    Connection, DecodeError, Driver, EncodeError, LiveColumn, PrimitiveType, RowCursor,
    SqlDialect, SqlExecError, Statement, Value,
};
use rusqlite::types::Value as SqliteValue;
use uuid::Uuid;

/// Where to open the SQLite database: a file on disk or `:memory:`.
pub enum SqliteConfig {
    File(PathBuf),
    Memory,
}

impl SqliteConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SqliteConfig::File(path.into())
    }
}

static DIALECT: SqliteDialect = SqliteDialect;

pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn sql_type_keyword(&self, primitive: PrimitiveType, nullable: bool) -> String {
        let base = match primitive {
            PrimitiveType::I8
            | PrimitiveType::I16
            | PrimitiveType::I32
            | PrimitiveType::I64
            | PrimitiveType::U8
            | PrimitiveType::U16
            | PrimitiveType::U32
            | PrimitiveType::U64 => "INTEGER",
            PrimitiveType::F32 | PrimitiveType::F64 => "REAL",
            PrimitiveType::Bool => "BOOLEAN",
            PrimitiveType::Text | PrimitiveType::Date | PrimitiveType::Uuid => "TEXT",
            PrimitiveType::Bytes => "BLOB",
        };
        if nullable {
            base.to_string()
        } else {
            format!("{base} NOT NULL")
        }
    }

    fn supports_native_uuid(&self) -> bool {
        false
    }

    fn supports_native_date(&self) -> bool {
        false
    }

    fn supports_drop_column(&self) -> bool {
        // rusqlite's bundled feature links SQLite >= 3.35, which supports
        // `ALTER TABLE ... DROP COLUMN` natively.
        true
    }
}

pub struct SqliteDriver;

impl Driver for SqliteDriver {
    type Config = SqliteConfig;
    type Error = SqlExecError;

    fn open(config: Self::Config) -> Result<Box<dyn Connection>, Self::Error> {
        let conn = match config {
            SqliteConfig::File(path) => rusqlite::Connection::open(&path)
                .map_err(|e| SqlExecError::wrap(format!("open {}", path.display()), e))?,
            SqliteConfig::Memory => rusqlite::Connection::open_in_memory()
                .map_err(|e| SqlExecError::wrap("open :memory:", e))?,
        };
        Ok(Box::new(SqliteConnection { conn: Mutex::new(conn) }))
    }
}

pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> &dyn SqlDialect {
        &DIALECT
    }

    fn begin_transaction(&self) -> Result<(), SqlExecError> {
        let conn = mutex_lock(&self.conn);
        conn.execute_batch("BEGIN").map_err(|e| SqlExecError::wrap("BEGIN", e))
    }

    fn commit(&self) -> Result<(), SqlExecError> {
        let conn = mutex_lock(&self.conn);
        conn.execute_batch("COMMIT").map_err(|e| SqlExecError::wrap("COMMIT", e))
    }

    fn rollback(&self) -> Result<(), SqlExecError> {
        let conn = mutex_lock(&self.conn);
        conn.execute_batch("ROLLBACK").map_err(|e| SqlExecError::wrap("ROLLBACK", e))
    }

    fn prepare<'c>(&'c self, sql: &str) -> Result<Box<dyn Statement + 'c>, SqlExecError> {
        Ok(Box::new(SqliteStatement {
            conn: &self.conn,
            sql: sql.to_string(),
            params: Vec::new(),
            rows: Vec::new(),
            affected: 0,
            cursor: None,
            executed: false,
        }))
    }

    fn execute_ddl(&self, sql: &str) -> Result<(), SqlExecError> {
        let conn = mutex_lock(&self.conn);
        conn.execute_batch(sql).map_err(|e| SqlExecError::wrap(sql, e))
    }

    fn list_columns(&self, table: &str) -> Result<Vec<LiveColumn>, SqlExecError> {
        let conn = mutex_lock(&self.conn);
        let sql = format!("PRAGMA table_info({})", DIALECT.quote_identifier(table));
        let mut stmt = conn.prepare(&sql).map_err(|e| SqlExecError::wrap(&sql, e))?;
        let rows = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let type_name: String = row.get(2)?;
                let notnull: i64 = row.get(3)?;
                Ok((name, type_name, notnull == 0))
            })
            .map_err(|e| SqlExecError::wrap(&sql, e))?;

        let mut columns = Vec::new();
        for row in rows {
            let (name, type_name, nullable) = row.map_err(|e| SqlExecError::wrap(&sql, e))?;
            columns.push(LiveColumn { name, primitive: guess_primitive(&type_name), nullable });
        }
        Ok(columns)
    }

    fn close(&self) -> Result<(), SqlExecError> {
        Ok(())
    }
}

/// SQLite's declared column type is advisory (type affinity, not a closed
/// set); reconcile only needs it to decide whether a live column still
/// matches *some* schema column by name, so an approximate mapping is fine.
fn guess_primitive(declared: &str) -> PrimitiveType {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        PrimitiveType::I64
    } else if upper.contains("BOOL") {
        PrimitiveType::Bool
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        PrimitiveType::F64
    } else if upper.contains("BLOB") {
        PrimitiveType::Bytes
    } else {
        PrimitiveType::Text
    }
}

struct SqliteStatement<'c> {
    conn: &'c Mutex<rusqlite::Connection>,
    sql: String,
    params: Vec<SqliteValue>,
    rows: Vec<Vec<SqliteValue>>,
    affected: u64,
    cursor: Option<usize>,
    executed: bool,
}

impl SqliteStatement<'_> {
    fn execute(&mut self) -> Result<(), SqlExecError> {
        let conn = mutex_lock(&self.conn);
        let mut stmt = conn.prepare(&self.sql).map_err(|e| SqlExecError::wrap(&self.sql, e))?;
        let column_count = stmt.column_count();
        let params = rusqlite::params_from_iter(self.params.iter());
        let mut rows = stmt.query(params).map_err(|e| SqlExecError::wrap(&self.sql, e))?;
        while let Some(row) = rows.next().map_err(|e| SqlExecError::wrap(&self.sql, e))? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value_ref = row.get_ref(i).map_err(|e| SqlExecError::wrap(&self.sql, e))?;
                values.push(SqliteValue::from(value_ref));
            }
            self.rows.push(values);
        }
        drop(rows);
        drop(stmt);
        self.affected = conn.changes();
        Ok(())
    }
}

impl Statement for SqliteStatement<'_> {
    fn bind(&mut self, index: usize, value: &Value) -> Result<(), EncodeError> {
        if self.params.len() <= index {
            self.params.resize(index + 1, SqliteValue::Null);
        }
        self.params[index] = encode_value(value);
        Ok(())
    }

    fn step(&mut self) -> Result<bool, SqlExecError> {
        if !self.executed {
            self.execute()?;
            self.executed = true;
        }
        let next = self.cursor.map_or(0, |i| i + 1);
        self.cursor = Some(next);
        Ok(next < self.rows.len())
    }

    fn row(&self) -> &dyn RowCursor {
        self
    }

    fn affected_rows(&self) -> u64 {
        self.affected
    }
}

impl RowCursor for SqliteStatement<'_> {
    fn read_column(&self, index: usize, expected: PrimitiveType) -> Result<Value, DecodeError> {
        let row_idx = self.cursor.expect("read_column called before step positioned a row");
        let row = &self.rows[row_idx];
        let raw = row.get(index).ok_or(DecodeError::MissingColumn { column: "<unnamed>", index })?;
        decode_value(raw, expected)
    }
}

fn encode_value(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::I8(v) => SqliteValue::Integer(*v as i64),
        Value::I16(v) => SqliteValue::Integer(*v as i64),
        Value::I32(v) => SqliteValue::Integer(*v as i64),
        Value::I64(v) => SqliteValue::Integer(*v),
        Value::U8(v) => SqliteValue::Integer(*v as i64),
        Value::U16(v) => SqliteValue::Integer(*v as i64),
        Value::U32(v) => SqliteValue::Integer(*v as i64),
        Value::U64(v) => SqliteValue::Integer(*v as i64),
        Value::F32(v) => SqliteValue::Real(*v as f64),
        Value::F64(v) => SqliteValue::Real(*v),
        Value::Bool(v) => SqliteValue::Integer(if *v { 1 } else { 0 }),
        Value::Text(v) => SqliteValue::Text(v.clone()),
        Value::Bytes(v) => SqliteValue::Blob(v.clone()),
        Value::Date(v) => SqliteValue::Text(v.to_rfc3339()),
        Value::Uuid(v) => SqliteValue::Text(v.to_string()),
    }
}

fn decode_value(raw: &SqliteValue, expected: PrimitiveType) -> Result<Value, DecodeError> {
    if matches!(raw, SqliteValue::Null) {
        return Ok(Value::Null);
    }
    let mismatch = || DecodeError::TypeMismatch {
        column: "<unnamed>",
        expected: expected.name(),
        actual: shape_name(raw),
    };
    match (raw, expected) {
        (SqliteValue::Integer(i), PrimitiveType::I8) => Ok(Value::I8(*i as i8)),
        (SqliteValue::Integer(i), PrimitiveType::I16) => Ok(Value::I16(*i as i16)),
        (SqliteValue::Integer(i), PrimitiveType::I32) => Ok(Value::I32(*i as i32)),
        (SqliteValue::Integer(i), PrimitiveType::I64) => Ok(Value::I64(*i)),
        (SqliteValue::Integer(i), PrimitiveType::U8) => Ok(Value::U8(*i as u8)),
        (SqliteValue::Integer(i), PrimitiveType::U16) => Ok(Value::U16(*i as u16)),
        (SqliteValue::Integer(i), PrimitiveType::U32) => Ok(Value::U32(*i as u32)),
        (SqliteValue::Integer(i), PrimitiveType::U64) => Ok(Value::U64(*i as u64)),
        (SqliteValue::Integer(i), PrimitiveType::Bool) => Ok(Value::Bool(*i != 0)),
        (SqliteValue::Real(f), PrimitiveType::F32) => Ok(Value::F32(*f as f32)),
        (SqliteValue::Real(f), PrimitiveType::F64) => Ok(Value::F64(*f)),
        (SqliteValue::Text(s), PrimitiveType::Text) => Ok(Value::Text(s.clone())),
        (SqliteValue::Text(s), PrimitiveType::Date) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Value::Date(dt.with_timezone(&Utc)))
            .map_err(|_| mismatch()),
        (SqliteValue::Text(s), PrimitiveType::Uuid) => {
            Uuid::parse_str(s).map(Value::Uuid).map_err(|_| mismatch())
        }
        (SqliteValue::Blob(b), PrimitiveType::Bytes) => Ok(Value::Bytes(b.clone())),
        _ => Err(mismatch()),
    }
}

fn shape_name(raw: &SqliteValue) -> &'static str {
    match raw {
        SqliteValue::Null => "null",
        SqliteValue::Integer(_) => "integer",
        SqliteValue::Real(_) => "real",
        SqliteValue::Text(_) => "text",
        SqliteValue::Blob(_) => "blob",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_connection() -> Box<dyn Connection> {
        SqliteDriver::open(SqliteConfig::Memory).expect("open in-memory sqlite")
    }

    #[test]
    fn create_insert_and_select_round_trip() {
        let conn = memory_connection();
        conn.execute_ddl("CREATE TABLE t (id INTEGER NOT NULL, name TEXT NOT NULL)").unwrap();

        {
            let mut stmt = conn.prepare("INSERT INTO t (id, name) VALUES (?, ?)").unwrap();
            stmt.bind(0, &Value::I64(1)).unwrap();
            stmt.bind(1, &Value::Text("alice".to_string())).unwrap();
            stmt.step().unwrap();
            assert_eq!(stmt.affected_rows(), 1);
        }

        let mut stmt = conn.prepare("SELECT id, name FROM t").unwrap();
        assert!(stmt.step().unwrap());
        assert_eq!(stmt.row().read_column(0, PrimitiveType::I64).unwrap(), Value::I64(1));
        assert_eq!(
            stmt.row().read_column(1, PrimitiveType::Text).unwrap(),
            Value::Text("alice".to_string())
        );
        assert!(!stmt.step().unwrap());
    }

    #[test]
    fn list_columns_reports_nullability() {
        let conn = memory_connection();
        conn.execute_ddl("CREATE TABLE t (id INTEGER NOT NULL, legacy TEXT)").unwrap();
        let columns = conn.list_columns("t").unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert!(!columns[0].nullable);
        assert_eq!(columns[1].name, "legacy");
        assert!(columns[1].nullable);
    }

    #[test]
    fn reconcile_drops_surplus_and_adds_missing_columns() {
        let conn = memory_connection();
        conn.execute_ddl("CREATE TABLE t (id INTEGER NOT NULL, legacy TEXT)").unwrap();
        conn.execute_ddl("ALTER TABLE t DROP COLUMN legacy").unwrap();
        conn.execute_ddl("ALTER TABLE t ADD COLUMN fresh TEXT").unwrap();
        let columns = conn.list_columns("t").unwrap();
        assert!(columns.iter().any(|c| c.name == "fresh"));
        assert!(!columns.iter().any(|c| c.name == "legacy"));
    }
}
