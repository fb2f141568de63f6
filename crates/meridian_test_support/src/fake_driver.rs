//! An in-process [`meridian_core::Driver`] backed by a plain `HashMap` store
//! instead of a real database, for unit tests that exercise the query
//! algebra and materialization without paying for a SQLite file.
//!
//! The statements the core ever generates form a small, fixed grammar, so
//! rather than embedding a general SQL engine this module hand-parses
//! exactly that grammar back into store operations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use meridian_core::{
    Connection, DecodeError, Driver, EncodeError, LiveColumn, PrimitiveType, RowCursor, SqlDialect,
    SqlExecError, Statement, Value,
};

#[derive(Clone)]
struct FakeColumn {
    name: String,
    primitive: PrimitiveType,
    nullable: bool,
}

#[derive(Clone, Default)]
struct FakeTable {
    columns: Vec<FakeColumn>,
    rows: Vec<HashMap<String, Value>>,
}

type Store = HashMap<String, FakeTable>;

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

pub struct FakeDialect;

impl SqlDialect for FakeDialect {
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
        if nullable { base.to_string() } else { format!("{base} NOT NULL") }
    }

    fn supports_native_uuid(&self) -> bool {
        false
    }

    fn supports_native_date(&self) -> bool {
        false
    }

    fn supports_drop_column(&self) -> bool {
        true
    }
}

/// A declared column type is advisory; reconcile only needs it to bucket a
/// live column into one of the primitives, the same approximation
/// `meridian_sqlite` makes against SQLite's own type affinity.
fn guess_primitive(declared: &str) -> PrimitiveType {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        PrimitiveType::I64
    } else if upper.contains("BOOL") {
        PrimitiveType::Bool
    } else if upper.contains("REAL") {
        PrimitiveType::F64
    } else if upper.contains("BLOB") {
        PrimitiveType::Bytes
    } else {
        PrimitiveType::Text
    }
}

fn value_primitive(value: &Value) -> Option<PrimitiveType> {
    match value {
        Value::Null => None,
        Value::I8(_) => Some(PrimitiveType::I8),
        Value::I16(_) => Some(PrimitiveType::I16),
        Value::I32(_) => Some(PrimitiveType::I32),
        Value::I64(_) => Some(PrimitiveType::I64),
        Value::U8(_) => Some(PrimitiveType::U8),
        Value::U16(_) => Some(PrimitiveType::U16),
        Value::U32(_) => Some(PrimitiveType::U32),
        Value::U64(_) => Some(PrimitiveType::U64),
        Value::F32(_) => Some(PrimitiveType::F32),
        Value::F64(_) => Some(PrimitiveType::F64),
        Value::Bool(_) => Some(PrimitiveType::Bool),
        Value::Text(_) => Some(PrimitiveType::Text),
        Value::Bytes(_) => Some(PrimitiveType::Bytes),
        Value::Date(_) => Some(PrimitiveType::Date),
        Value::Uuid(_) => Some(PrimitiveType::Uuid),
    }
}

pub struct FakeConfig;

pub struct FakeDriver;

impl Driver for FakeDriver {
    type Config = FakeConfig;
    type Error = SqlExecError;

    fn open(_config: Self::Config) -> Result<Box<dyn Connection>, Self::Error> {
        Ok(Box::new(FakeConnection::new()))
    }
}

pub struct FakeConnection {
    store: Mutex<Store>,
    snapshots: Mutex<Vec<Store>>,
}

impl FakeConnection {
    pub fn new() -> Self {
        FakeConnection { store: Mutex::new(HashMap::new()), snapshots: Mutex::new(Vec::new()) }
    }
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self::new()
    }
}

static DIALECT: FakeDialect = FakeDialect;

impl Connection for FakeConnection {
    fn dialect(&self) -> &dyn SqlDialect {
        &DIALECT
    }

    fn begin_transaction(&self) -> Result<(), SqlExecError> {
        let snapshot = mutex_lock(&self.store).clone();
        mutex_lock(&self.snapshots).push(snapshot);
        Ok(())
    }

    fn commit(&self) -> Result<(), SqlExecError> {
        mutex_lock(&self.snapshots).pop();
        Ok(())
    }

    fn rollback(&self) -> Result<(), SqlExecError> {
        if let Some(snapshot) = mutex_lock(&self.snapshots).pop() {
            *mutex_lock(&self.store) = snapshot;
        }
        Ok(())
    }

    fn prepare<'c>(&'c self, sql: &str) -> Result<Box<dyn Statement + 'c>, SqlExecError> {
        Ok(Box::new(FakeStatement {
            store: &self.store,
            sql: sql.to_string(),
            params: Vec::new(),
            rows: Vec::new(),
            affected: 0,
            cursor: None,
            executed: false,
        }))
    }

    fn execute_ddl(&self, sql: &str) -> Result<(), SqlExecError> {
        let mut store = mutex_lock(&self.store);
        ddl::apply(&mut store, sql).map_err(|message| SqlExecError::new(sql, message))
    }

    fn list_columns(&self, table: &str) -> Result<Vec<LiveColumn>, SqlExecError> {
        let store = mutex_lock(&self.store);
        let columns = store
            .get(table)
            .map(|t| t.columns.iter().map(|c| LiveColumn { name: c.name.clone(), primitive: c.primitive, nullable: c.nullable }).collect())
            .unwrap_or_default();
        Ok(columns)
    }

    fn close(&self) -> Result<(), SqlExecError> {
        Ok(())
    }
}

struct FakeStatement<'c> {
    store: &'c Mutex<Store>,
    sql: String,
    params: Vec<Value>,
    rows: Vec<Vec<Value>>,
    affected: u64,
    cursor: Option<usize>,
    executed: bool,
}

impl FakeStatement<'_> {
    fn execute(&mut self) -> Result<(), SqlExecError> {
        let mut store = mutex_lock(&self.store);
        let outcome =
            dml::run(&mut store, &self.sql, &self.params).map_err(|message| SqlExecError::new(&self.sql, message))?;
        self.rows = outcome.rows;
        self.affected = outcome.affected;
        Ok(())
    }
}

impl Statement for FakeStatement<'_> {
    fn bind(&mut self, index: usize, value: &Value) -> Result<(), EncodeError> {
        if self.params.len() <= index {
            self.params.resize(index + 1, Value::Null);
        }
        self.params[index] = value.clone();
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

impl RowCursor for FakeStatement<'_> {
    fn read_column(&self, index: usize, expected: PrimitiveType) -> Result<Value, DecodeError> {
        let row_idx = self.cursor.expect("read_column called before step positioned a row");
        let row = &self.rows[row_idx];
        let value = row.get(index).ok_or(DecodeError::MissingColumn { column: "<unnamed>", index })?;
        if let Some(actual) = value_primitive(value) {
            if actual.name() != expected.name() {
                return Err(DecodeError::TypeMismatch {
                    column: "<unnamed>",
                    expected: expected.name(),
                    actual: actual.name(),
                });
            }
        }
        Ok(value.clone())
    }
}

/// Reads one `"quoted identifier"` off the front of `s`, un-escaping doubled
/// quotes, and returns it with the unconsumed remainder.
fn read_quoted(s: &str) -> (String, &str) {
    let rest = s.strip_prefix('"').expect("expected a quoted identifier");
    let bytes = rest.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    loop {
        match bytes.get(i) {
            Some(b'"') if bytes.get(i + 1) == Some(&b'"') => {
                out.push('"');
                i += 2;
            }
            Some(b'"') => {
                i += 1;
                break;
            }
            Some(&b) => {
                out.push(b as char);
                i += 1;
            }
            None => panic!("unterminated quoted identifier in {s:?}"),
        }
    }
    (out, &rest[i..])
}

/// Reads a possibly-qualified column reference: `"col"` or `"table"."col"`.
fn read_column_ref(s: &str) -> ((Option<String>, String), &str) {
    let (first, rest) = read_quoted(s);
    if let Some(after_dot) = rest.strip_prefix('.') {
        let (second, rest2) = read_quoted(after_dot);
        ((Some(first), second), rest2)
    } else {
        ((None, first), rest)
    }
}

/// Splits `s` right before whichever of `keywords` (bare, no surrounding
/// spaces) occurs earliest as a `" KEYWORD "`-bounded token, returning the
/// trimmed head and the still-keyword-prefixed, trimmed tail.
fn split_clause<'a>(s: &'a str, keywords: &[&str]) -> (&'a str, &'a str) {
    let mut cut = s.len();
    for kw in keywords {
        let needle = format!(" {kw} ");
        if let Some(i) = s.find(&needle) {
            if i < cut {
                cut = i;
            }
        }
    }
    (s[..cut].trim(), s[cut..].trim())
}

fn split_top_level_commas(s: &str) -> Vec<&str> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(", ").map(str::trim).collect()
}

/// A parsed `WHERE` predicate tree, evaluated against one row at a time.
enum Predicate {
    IsNull(String),
    IsNotNull(String),
    Compare { column: String, op: &'static str, value: Value },
    In(String, Vec<Value>),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    fn eval(&self, row: &HashMap<String, Value>) -> bool {
        match self {
            Predicate::IsNull(col) => row.get(col).map(Value::is_null).unwrap_or(true),
            Predicate::IsNotNull(col) => !row.get(col).map(Value::is_null).unwrap_or(true),
            Predicate::Compare { column, op, value } => {
                let Some(actual) = row.get(column) else { return false };
                compare(actual, *op, value)
            }
            Predicate::In(column, values) => row.get(column).map(|v| values.contains(v)).unwrap_or(false),
            Predicate::Not(inner) => !inner.eval(row),
            Predicate::And(l, r) => l.eval(row) && r.eval(row),
            Predicate::Or(l, r) => l.eval(row) || r.eval(row),
        }
    }
}

fn compare(actual: &Value, op: &str, expected: &Value) -> bool {
    let ord = numeric_cmp(actual, expected).unwrap_or_else(|| format!("{actual}").cmp(&format!("{expected}")));
    match op {
        "=" => actual == expected,
        "!=" => actual != expected,
        "<" => ord.is_lt(),
        "<=" => ord.is_le(),
        ">" => ord.is_gt(),
        ">=" => ord.is_ge(),
        _ => unreachable!("unsupported comparison operator {op}"),
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = as_f64(a)?;
    let b = as_f64(b)?;
    a.partial_cmp(&b)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::I8(n) => Some(*n as f64),
        Value::I16(n) => Some(*n as f64),
        Value::I32(n) => Some(*n as f64),
        Value::I64(n) => Some(*n as f64),
        Value::U8(n) => Some(*n as f64),
        Value::U16(n) => Some(*n as f64),
        Value::U32(n) => Some(*n as f64),
        Value::U64(n) => Some(*n as f64),
        Value::F32(n) => Some(*n as f64),
        Value::F64(n) => Some(*n),
        _ => None,
    }
}

/// Parses a predicate, consuming one value from `params` per `?`
/// encountered in textual order. Compound expressions arrive fully
/// parenthesized, with one exception: the child-load statement's keyed
/// `col IN (...) [AND pred]` clause, which is recognized here directly.
fn parse_predicate(s: &str, params: &mut std::vec::IntoIter<Value>) -> Predicate {
    let s = s.trim();
    if s.starts_with('(') && matching_close(s) == s.len() - 1 {
        let inner = &s[1..s.len() - 1];
        if let Some(rest) = inner.strip_prefix("NOT ") {
            return Predicate::Not(Box::new(parse_predicate(rest, params)));
        }
        if let Some(idx) = find_top_level(inner, " AND ") {
            let left = parse_predicate(&inner[..idx], params);
            let right = parse_predicate(&inner[idx + 5..], params);
            return Predicate::And(Box::new(left), Box::new(right));
        }
        if let Some(idx) = find_top_level(inner, " OR ") {
            let left = parse_predicate(&inner[..idx], params);
            let right = parse_predicate(&inner[idx + 4..], params);
            return Predicate::Or(Box::new(left), Box::new(right));
        }
        return parse_predicate(inner, params);
    }
    if let Some(in_start) = find_top_level(s, " IN (") {
        let ((_, column), _) = read_column_ref(s[..in_start].trim());
        let after = &s[in_start + 5..];
        let close = after.find(')').expect("unterminated IN list");
        let n = after[..close].matches('?').count();
        let values: Vec<Value> = (0..n).map(|_| params.next().expect("IN placeholder without a bound value")).collect();
        let in_pred = Predicate::In(column, values);
        let rest = after[close + 1..].trim();
        if let Some(tail) = rest.strip_prefix("AND ") {
            return Predicate::And(Box::new(in_pred), Box::new(parse_predicate(tail, params)));
        }
        return in_pred;
    }
    parse_comparison(s, params)
}

fn parse_comparison(s: &str, params: &mut std::vec::IntoIter<Value>) -> Predicate {
    let ((_, column), rest) = read_column_ref(s);
    let rest = rest.trim();
    if let Some(r) = rest.strip_prefix("IS NOT NULL") {
        debug_assert!(r.trim().is_empty());
        return Predicate::IsNotNull(column);
    }
    if let Some(r) = rest.strip_prefix("IS NULL") {
        debug_assert!(r.trim().is_empty());
        return Predicate::IsNull(column);
    }
    for op in [">=", "<=", "!=", "=", "<", ">"] {
        if let Some(r) = rest.strip_prefix(op) {
            let r = r.trim();
            debug_assert_eq!(r, "?");
            let value = params.next().expect("predicate placeholder without a bound value");
            return Predicate::Compare { column, op, value };
        }
    }
    panic!("unrecognized comparison in {s:?}");
}

/// Byte index of the matching `)` for the `(` at `s`'s start.
fn matching_close(s: &str) -> usize {
    let mut depth = 0i32;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => {}
        }
    }
    panic!("unbalanced parentheses in {s:?}");
}

/// Finds `needle` outside any parenthesized group.
fn find_top_level(s: &str, needle: &str) -> Option<usize> {
    let mut depth = 0i32;
    let bytes = s.as_bytes();
    let nlen = needle.len();
    let mut i = 0;
    while i + nlen <= bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && &s[i..i + nlen] == needle {
            return Some(i);
        }
        i += 1;
    }
    None
}

struct StatementOutcome {
    rows: Vec<Vec<Value>>,
    affected: u64,
}

mod ddl {
    use super::{read_quoted, split_top_level_commas, FakeColumn, FakeTable, Store};

    pub fn apply(store: &mut Store, sql: &str) -> Result<(), String> {
        if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            create_table(store, rest);
        } else if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            let (name, _) = read_quoted(rest.trim());
            store.remove(&name);
        } else if let Some(rest) = sql.strip_prefix("ALTER TABLE ") {
            alter_table(store, rest);
        } else {
            return Err(format!("unsupported DDL statement: {sql}"));
        }
        Ok(())
    }

    fn create_table(store: &mut Store, rest: &str) {
        let (name, rest) = read_quoted(rest.trim());
        let rest = rest.trim().strip_prefix('(').expect("CREATE TABLE missing column list");
        let body = rest.strip_suffix(')').expect("CREATE TABLE missing closing paren");

        let mut table = FakeTable::default();
        for segment in split_top_level_commas(body) {
            if let Some(pk_rest) = segment.strip_prefix("PRIMARY KEY (") {
                let _ = pk_rest;
                continue;
            }
            table.columns.push(parse_column_def(segment));
        }
        store.entry(name).or_insert(table);
    }

    fn alter_table(store: &mut Store, rest: &str) {
        let (name, rest) = read_quoted(rest.trim());
        let table = store.entry(name).or_default();
        let rest = rest.trim();
        if let Some(col_def) = rest.strip_prefix("ADD COLUMN ") {
            table.columns.push(parse_column_def(col_def));
        } else if let Some(col_ref) = rest.strip_prefix("DROP COLUMN ") {
            let (col_name, _) = read_quoted(col_ref.trim());
            table.columns.retain(|c| c.name != col_name);
            for row in &mut table.rows {
                row.remove(&col_name);
            }
        } else {
            panic!("unsupported ALTER TABLE clause: {rest}");
        }
    }

    fn parse_column_def(segment: &str) -> FakeColumn {
        let (name, rest) = read_quoted(segment.trim());
        let rest = rest.trim();
        let nullable = !rest.ends_with("NOT NULL");
        let type_text = rest.trim_end_matches("NOT NULL").trim();
        FakeColumn { name, primitive: super::guess_primitive(type_text), nullable }
    }
}

mod dml {
    use super::{
        parse_predicate, read_column_ref, read_quoted, split_clause, split_top_level_commas, FakeTable, Predicate,
        Store, StatementOutcome,
    };
    use meridian_core::Value;
    use std::collections::HashMap;

    pub fn run(store: &mut Store, sql: &str, params: &[Value]) -> Result<StatementOutcome, String> {
        if sql.starts_with("SELECT COUNT(*) FROM ") {
            return count(store, sql, params);
        }
        if sql.starts_with("SELECT ") {
            return select(store, sql, params);
        }
        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            return insert(store, rest, params);
        }
        if let Some(rest) = sql.strip_prefix("UPDATE ") {
            return update(store, rest, params);
        }
        if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            return delete(store, rest, params);
        }
        Err(format!("unsupported statement: {sql}"))
    }

    fn count(store: &Store, sql: &str, params: &[Value]) -> Result<StatementOutcome, String> {
        let rest = &sql["SELECT COUNT(*) FROM ".len()..];
        let (table_name, tail) = read_quoted(rest.trim());
        let table = store.get(&table_name).cloned().unwrap_or_default();
        let predicate = parse_optional_where(tail.trim(), params);
        let matched = table.rows.iter().filter(|r| predicate.as_ref().map(|p| p.eval(r)).unwrap_or(true)).count();
        Ok(StatementOutcome { rows: vec![vec![Value::I64(matched as i64)]], affected: 0 })
    }

    fn select(store: &Store, sql: &str, params: &[Value]) -> Result<StatementOutcome, String> {
        let rest = &sql["SELECT ".len()..];
        let from_idx = rest.find(" FROM ").ok_or("SELECT missing FROM")?;
        let select_list = &rest[..from_idx];
        let after_from = rest[from_idx + 6..].trim();

        let (from_clause, tail) = split_clause(after_from, &["WHERE", "ORDER BY", "LIMIT"]);
        let mut tail = tail;
        let mut where_text: Option<&str> = None;
        let mut order_text: Option<&str> = None;
        let mut limit_text: Option<&str> = None;
        if let Some(r) = tail.strip_prefix("WHERE ") {
            let (w, t) = split_clause(r, &["ORDER BY", "LIMIT"]);
            where_text = Some(w);
            tail = t;
        }
        if let Some(r) = tail.strip_prefix("ORDER BY ") {
            let (o, t) = split_clause(r, &["LIMIT"]);
            order_text = Some(o);
            tail = t;
        }
        if let Some(r) = tail.strip_prefix("LIMIT ") {
            limit_text = Some(r);
        }

        if from_clause.contains(" INNER JOIN ") {
            pivot_select(store, from_clause, select_list, where_text, order_text, limit_text, params)
        } else {
            plain_select(store, from_clause, select_list, where_text, order_text, limit_text, params)
        }
    }

    fn plain_select(
        store: &Store,
        from_clause: &str,
        select_list: &str,
        where_text: Option<&str>,
        order_text: Option<&str>,
        limit_text: Option<&str>,
        params: &[Value],
    ) -> Result<StatementOutcome, String> {
        let (table_name, _) = read_quoted(from_clause.trim());
        let table = store.get(&table_name).cloned().unwrap_or_default();
        let columns: Vec<String> = split_top_level_commas(select_list).into_iter().map(|c| read_quoted(c).0).collect();

        let mut params_iter = params.to_vec().into_iter();
        let predicate = where_text.map(|w| parse_predicate(w, &mut params_iter));

        let mut rows: Vec<&HashMap<String, Value>> =
            table.rows.iter().filter(|r| predicate.as_ref().map(|p| p.eval(r)).unwrap_or(true)).collect();

        apply_order(&mut rows, order_text);
        let projected: Vec<Vec<Value>> =
            rows.into_iter().map(|r| columns.iter().map(|c| r.get(c).cloned().unwrap_or(Value::Null)).collect()).collect();
        let limited = apply_limit(projected, limit_text);
        Ok(StatementOutcome { rows: limited, affected: 0 })
    }

    #[allow(clippy::too_many_arguments)]
    fn pivot_select(
        store: &Store,
        from_clause: &str,
        select_list: &str,
        where_text: Option<&str>,
        order_text: Option<&str>,
        limit_text: Option<&str>,
        params: &[Value],
    ) -> Result<StatementOutcome, String> {
        let (child_part, rest) = from_clause.split_once(" INNER JOIN ").ok_or("malformed INNER JOIN clause")?;
        let (child_table_name, _) = read_quoted(child_part.trim());
        let (pivot_table_name, rest) = read_quoted(rest.trim());
        let rest = rest.trim().strip_prefix("ON ").ok_or("malformed ON clause")?;
        let (left_eq, rest) = rest.split_once(" = ").ok_or("malformed join condition")?;
        let ((_, child_key_col), _) = read_column_ref(left_eq.trim());
        let ((_, pivot_child_key_col), _) = read_column_ref(rest.trim());

        let child_table = store.get(&child_table_name).cloned().unwrap_or_default();
        let pivot_table = store.get(&pivot_table_name).cloned().unwrap_or_default();

        let where_text = where_text.ok_or("pivot join requires a keyed WHERE clause")?;
        let in_start = where_text.find(" IN (").ok_or("expected IN (...) in pivot join WHERE clause")?;
        let ((_, pivot_parent_key_col), _) = read_column_ref(where_text[..in_start].trim());
        let after_in = &where_text[in_start + 5..];
        let close = after_in.find(')').ok_or("unterminated IN (...) list")?;
        let n_in = after_in[..close].matches('?').count();
        let and_rest = after_in[close + 1..].trim();

        let mut params_iter = params.to_vec().into_iter();
        let keys: Vec<Value> = (0..n_in).map(|_| params_iter.next().expect("IN list shorter than declared")).collect();

        let extra_predicate = and_rest.strip_prefix("AND ").map(|e| parse_predicate(e.trim(), &mut params_iter));

        if !select_list.contains(" AS __meridian_pivot_parent") {
            return Err("missing pivot parent alias in select list".to_string());
        }
        // Child columns arrive table-qualified here; only the column part
        // matters for projection against the store's row maps.
        let columns: Vec<String> = split_top_level_commas(select_list)
            .into_iter()
            .filter(|segment| !segment.contains(" AS __meridian_pivot_parent"))
            .map(|c| {
                let ((_, name), _) = read_column_ref(c);
                name
            })
            .collect();

        let mut combined: Vec<(HashMap<String, Value>, Value)> = Vec::new();
        for pivot_row in &pivot_table.rows {
            let Some(parent_value) = pivot_row.get(&pivot_parent_key_col) else { continue };
            if !keys.contains(parent_value) {
                continue;
            }
            let Some(pivot_child_value) = pivot_row.get(&pivot_child_key_col) else { continue };
            for child_row in &child_table.rows {
                if child_row.get(&child_key_col) == Some(pivot_child_value) {
                    if extra_predicate.as_ref().map(|p| p.eval(child_row)).unwrap_or(true) {
                        combined.push((child_row.clone(), parent_value.clone()));
                    }
                }
            }
        }

        let mut refs: Vec<&(HashMap<String, Value>, Value)> = combined.iter().collect();
        let mut order_rows: Vec<&HashMap<String, Value>> = refs.iter().map(|r| &r.0).collect();
        apply_order(&mut order_rows, order_text);
        // Re-derive `refs` in the order `apply_order` settled on by matching
        // back on row identity (pointer equality via `std::ptr::eq`).
        refs.sort_by_key(|(r, _)| order_rows.iter().position(|o| std::ptr::eq(*o, r)).unwrap_or(usize::MAX));

        let projected: Vec<Vec<Value>> = refs
            .into_iter()
            .map(|(row, parent_value)| {
                let mut values: Vec<Value> = columns.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect();
                values.push(parent_value.clone());
                values
            })
            .collect();
        let limited = apply_limit(projected, limit_text);
        Ok(StatementOutcome { rows: limited, affected: 0 })
    }

    fn apply_order(rows: &mut [&HashMap<String, Value>], order_text: Option<&str>) {
        let Some(order_text) = order_text else { return };
        let entries: Vec<(String, bool)> = split_top_level_commas(order_text)
            .into_iter()
            .map(|e| {
                let (col, dir) = e.rsplit_once(' ').expect("ORDER BY entry missing direction");
                let ((_, name), _) = read_column_ref(col.trim());
                (name, dir.trim() == "ASC")
            })
            .collect();
        rows.sort_by(|a, b| {
            for (col, ascending) in &entries {
                let av = a.get(col);
                let bv = b.get(col);
                let ord = compare_ord(av, bv);
                let ord = if *ascending { ord } else { ord.reverse() };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    fn compare_ord(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
        match (a, b) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => super::numeric_cmp(x, y).unwrap_or_else(|| format!("{x}").cmp(&format!("{y}"))),
        }
    }

    fn apply_limit(rows: Vec<Vec<Value>>, limit_text: Option<&str>) -> Vec<Vec<Value>> {
        let Some(limit_text) = limit_text else { return rows };
        let (count_text, skip) = match limit_text.split_once(" OFFSET ") {
            Some((c, o)) => (c, o.parse::<usize>().unwrap_or(0)),
            None => (limit_text, 0),
        };
        let count: usize = count_text.trim().parse().unwrap_or(rows.len());
        rows.into_iter().skip(skip).take(count).collect()
    }

    fn parse_optional_where(tail: &str, params: &[Value]) -> Option<Predicate> {
        let where_text = tail.strip_prefix("WHERE ")?;
        let mut params_iter = params.to_vec().into_iter();
        Some(parse_predicate(where_text.trim(), &mut params_iter))
    }

    fn insert(store: &mut Store, rest: &str, params: &[Value]) -> Result<StatementOutcome, String> {
        let (table_name, rest) = read_quoted(rest.trim());
        let rest = rest.trim().strip_prefix('(').ok_or("INSERT missing column list")?;
        let (col_list, rest) = rest.split_once(')').ok_or("INSERT missing closing paren")?;
        let columns: Vec<String> = split_top_level_commas(col_list).into_iter().map(|c| read_quoted(c).0).collect();
        let rest = rest.trim().strip_prefix("VALUES (").ok_or("INSERT missing VALUES")?;
        let n_values = rest.trim_end_matches(')').matches('?').count();
        if n_values != columns.len() || params.len() < columns.len() {
            return Err("INSERT column/value count mismatch".to_string());
        }

        let mut row = HashMap::new();
        for (col, value) in columns.iter().zip(params.iter()) {
            row.insert(col.clone(), value.clone());
        }
        let table = store.entry(table_name).or_insert_with(FakeTable::default);
        table.rows.push(row);
        Ok(StatementOutcome { rows: Vec::new(), affected: 1 })
    }

    fn update(store: &mut Store, rest: &str, params: &[Value]) -> Result<StatementOutcome, String> {
        let (table_name, rest) = read_quoted(rest.trim());
        let rest = rest.trim().strip_prefix("SET ").ok_or("UPDATE missing SET")?;
        let (set_text, tail) = split_clause(rest, &["WHERE"]);
        let assignments: Vec<String> = split_top_level_commas(set_text)
            .into_iter()
            .map(|a| {
                let (col, _) = a.split_once(" = ").expect("SET assignment missing `=`");
                read_quoted(col.trim()).0
            })
            .collect();

        let mut params_iter = params.to_vec().into_iter();
        let set_values: Vec<Value> = (0..assignments.len()).map(|_| params_iter.next().expect("SET value missing")).collect();
        let predicate = tail.strip_prefix("WHERE ").map(|w| parse_predicate(w.trim(), &mut params_iter));

        let table = store.entry(table_name).or_insert_with(FakeTable::default);
        let mut affected = 0u64;
        for row in &mut table.rows {
            if predicate.as_ref().map(|p| p.eval(row)).unwrap_or(true) {
                for (col, value) in assignments.iter().zip(set_values.iter()) {
                    row.insert(col.clone(), value.clone());
                }
                affected += 1;
            }
        }
        Ok(StatementOutcome { rows: Vec::new(), affected })
    }

    fn delete(store: &mut Store, rest: &str, params: &[Value]) -> Result<StatementOutcome, String> {
        let (table_name, tail) = read_quoted(rest.trim());
        let mut params_iter = params.to_vec().into_iter();
        let predicate = tail.trim().strip_prefix("WHERE ").map(|w| parse_predicate(w.trim(), &mut params_iter));

        let table = store.entry(table_name).or_insert_with(FakeTable::default);
        let before = table.rows.len();
        table.rows.retain(|row| !predicate.as_ref().map(|p| p.eval(row)).unwrap_or(true));
        Ok(StatementOutcome { rows: Vec::new(), affected: (before - table.rows.len()) as u64 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_author, sample_post, Author, Post};
    use meridian_core::{col, CreatePolicy, Database, UpdateKeys};

    fn open() -> Database {
        Database::new(FakeDriver::open(FakeConfig).unwrap())
    }

    #[test]
    fn create_insert_select_round_trip() {
        let db = open();
        db.create::<Author>(CreatePolicy::default()).unwrap();

        db.table::<Author>().insert(vec![sample_author(1, "Lin")]).unwrap();
        let found = db.table::<Author>().select().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Lin");
    }

    #[test]
    fn update_and_delete_affect_matching_rows_only() {
        let db = open();
        db.create::<Author>(CreatePolicy::default()).unwrap();
        db.table::<Author>().insert(vec![sample_author(1, "Lin"), sample_author(2, "Noor")]).unwrap();

        let affected = db
            .table::<Author>()
            .r#where(col::<Author>("id").eq(1i64))
            .unwrap()
            .update(sample_author(1, "Lin Park"), UpdateKeys::All)
            .unwrap();
        assert_eq!(affected, 1);

        let remaining = db.table::<Author>().select().unwrap();
        let lin = remaining.iter().find(|a| a.id == 1).unwrap();
        assert_eq!(lin.name, "Lin Park");

        let deleted = db.table::<Author>().r#where(col::<Author>("id").eq(2i64)).unwrap().delete().unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.table::<Author>().count().unwrap(), 1);
    }

    #[test]
    fn standard_join_groups_children_by_parent_key() {
        let db = open();
        db.create::<Author>(CreatePolicy::default()).unwrap();
        db.create::<Post>(CreatePolicy::default()).unwrap();
        db.table::<Author>().insert(vec![sample_author(1, "Lin")]).unwrap();
        db.table::<Post>().insert(vec![sample_post(10, 1, "First"), sample_post(11, 1, "Second")]).unwrap();

        let authors = db.table::<Author>().join::<Post>("posts", "id", "author_id").unwrap().select().unwrap();
        assert_eq!(authors.len(), 1);
        let posts = authors[0].posts.as_ref().unwrap();
        assert_eq!(posts.len(), 2);
    }

    #[test]
    fn connection_ddl_round_trips_through_list_columns() {
        let conn = FakeConnection::new();
        conn.execute_ddl("CREATE TABLE IF NOT EXISTS \"authors\" (\"id\" INTEGER NOT NULL, \"name\" TEXT NOT NULL, PRIMARY KEY (\"id\"))").unwrap();
        conn.execute_ddl("ALTER TABLE \"authors\" ADD COLUMN \"legacy\" TEXT").unwrap();
        let before = conn.list_columns("authors").unwrap();
        assert!(before.iter().any(|c| c.name == "legacy"));
        assert!(before.iter().any(|c| c.name == "name" && !c.nullable));

        conn.execute_ddl("ALTER TABLE \"authors\" DROP COLUMN \"legacy\"").unwrap();
        let after = conn.list_columns("authors").unwrap();
        assert!(!after.iter().any(|c| c.name == "legacy"));
    }
}
