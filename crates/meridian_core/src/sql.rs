//! Lowers the query algebra into SQL text.
//!
//! A chain produces one *principal* statement against the root form's table
//! plus, for each join, one *auxiliary* statement against the joined type's
//! table, keyed by the parent keys the principal statement actually
//! returned. Predicate atoms are routed to whichever statement owns the
//! form they reference; a conjunct spanning more than one form has no
//! single owner and is rejected.

use crate::driver::SqlDialect;
use crate::error::SqlGenError;
use crate::expr::{CompareOp, Expression};
use crate::query::{JoinKind, OrderDirection, Ordering, QueryNode};
use crate::schema::TableSchema;
use crate::value::Value;

/// Allocates placeholder slots in statement order, independent of dialect
/// (works for both `?`-style and `$1`-style placeholders). `start` lets a
/// caller reserve indices already spent on an earlier part of the same
/// statement (e.g. an `UPDATE`'s `SET` clause) before this builder's values
/// are appended.
struct ParamBuilder {
    start: usize,
    values: Vec<Value>,
}

impl ParamBuilder {
    fn new(start: usize) -> Self {
        ParamBuilder { start, values: Vec::new() }
    }

    fn push(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.start + self.values.len() - 1
    }
}

/// Splits a predicate into its top-level AND conjuncts. `Or`/`Not`/`Compare`
/// nodes are treated as atomic — only `And` is flattened.
fn flatten_and(expr: &Expression) -> Vec<&Expression> {
    match expr {
        Expression::And(l, r) => {
            let mut out = flatten_and(l);
            out.extend(flatten_and(r));
            out
        }
        other => vec![other],
    }
}

/// Which statement a conjunct belongs to.
enum AtomTarget {
    Principal,
    Join(usize),
}

fn classify_atom(atom: &Expression, node: &QueryNode) -> Result<AtomTarget, SqlGenError> {
    let forms = atom.referenced_forms();
    match *forms.as_slice() {
        [] => Ok(AtomTarget::Principal),
        [only] if only == node.schema.type_name => Ok(AtomTarget::Principal),
        [only] => node
            .joins
            .iter()
            .position(|j| j.schema.type_name == only)
            .map(AtomTarget::Join)
            .ok_or(SqlGenError::UnresolvedForm { form: only, column: "<chain>" }),
        [_, second, ..] => Err(SqlGenError::UnresolvedForm { form: second, column: "<mixed-form predicate>" }),
    }
}

fn atoms_for<'e>(
    node: &'e QueryNode,
    predicate: &'e Expression,
    want: impl Fn(&AtomTarget) -> bool,
) -> Result<Vec<&'e Expression>, SqlGenError> {
    let mut out = Vec::new();
    for atom in flatten_and(predicate) {
        if want(&classify_atom(atom, node)?) {
            out.push(atom);
        }
    }
    Ok(out)
}

fn conjoin(atoms: &[&Expression]) -> Option<Expression> {
    let mut iter = atoms.iter();
    let first = (*iter.next()?).clone();
    Some(iter.fold(first, |acc, next| acc & (*next).clone()))
}

/// Renders `expr` as SQL text against `schema`, pushing literal values into
/// `params` and consulting `dialect` for quoting/placeholder syntax.
/// `expr` must reference only `schema`'s form — callers are responsible for
/// routing multi-form predicates through [`atoms_for`] first. `qualifier`
/// is the already-quoted table name to prefix column references with, for
/// statements whose FROM clause names more than one table.
fn render_expr(
    expr: &Expression,
    schema: &TableSchema,
    dialect: &dyn SqlDialect,
    qualifier: Option<&str>,
    params: &mut ParamBuilder,
) -> Result<String, SqlGenError> {
    match expr {
        Expression::Literal(value) => {
            let idx = params.push(value.clone());
            Ok(dialect.placeholder(idx))
        }
        Expression::Column { form, field } => {
            let (form, field) = (*form, *field);
            if form != schema.type_name {
                return Err(SqlGenError::UnresolvedForm { form, column: field });
            }
            let column = schema
                .column(field)
                .ok_or(SqlGenError::UnknownColumn { form: schema.type_name, column: field })?;
            let name = dialect.quote_identifier(column.column_name);
            Ok(match qualifier {
                Some(table) => format!("{table}.{name}"),
                None => name,
            })
        }
        Expression::Not(inner) => Ok(format!("(NOT {})", render_expr(inner, schema, dialect, qualifier, params)?)),
        Expression::And(l, r) => Ok(format!(
            "({} AND {})",
            render_expr(l, schema, dialect, qualifier, params)?,
            render_expr(r, schema, dialect, qualifier, params)?
        )),
        Expression::Or(l, r) => Ok(format!(
            "({} OR {})",
            render_expr(l, schema, dialect, qualifier, params)?,
            render_expr(r, schema, dialect, qualifier, params)?
        )),
        Expression::Compare { op, left, right } => render_compare(*op, left, right, schema, dialect, qualifier, params),
    }
}

fn render_compare(
    op: CompareOp,
    left: &Expression,
    right: &Expression,
    schema: &TableSchema,
    dialect: &dyn SqlDialect,
    qualifier: Option<&str>,
    params: &mut ParamBuilder,
) -> Result<String, SqlGenError> {
    if matches!(right, Expression::Literal(Value::Null)) && matches!(op, CompareOp::Eq | CompareOp::Ne) {
        let lhs = render_expr(left, schema, dialect, qualifier, params)?;
        let keyword = if op == CompareOp::Eq { "IS NULL" } else { "IS NOT NULL" };
        return Ok(format!("{lhs} {keyword}"));
    }
    let lhs = render_expr(left, schema, dialect, qualifier, params)?;
    let rhs = render_expr(right, schema, dialect, qualifier, params)?;
    Ok(format!("{lhs} {} {rhs}", op.as_sql()))
}

fn quoted_columns(schema: &TableSchema, dialect: &dyn SqlDialect) -> Vec<String> {
    schema.columns.iter().map(|c| dialect.quote_identifier(c.column_name)).collect()
}

fn render_order(
    schema: &TableSchema,
    ordering: &Ordering,
    dialect: &dyn SqlDialect,
    qualifier: Option<&str>,
) -> Result<String, SqlGenError> {
    let mut parts = Vec::with_capacity(ordering.entries.len());
    for &(field, dir) in &ordering.entries {
        let column = schema
            .column(field)
            .ok_or(SqlGenError::UnknownColumn { form: schema.type_name, column: field })?;
        let keyword = match dir {
            OrderDirection::Ascending => "ASC",
            OrderDirection::Descending => "DESC",
        };
        let name = dialect.quote_identifier(column.column_name);
        let name = match qualifier {
            Some(table) => format!("{table}.{name}"),
            None => name,
        };
        parts.push(format!("{name} {keyword}"));
    }
    Ok(parts.join(", "))
}

fn render_limit(limit: Option<(u64, u64)>) -> String {
    match limit {
        Some((count, skip)) if skip > 0 => format!(" LIMIT {count} OFFSET {skip}"),
        Some((count, _)) => format!(" LIMIT {count}"),
        None => String::new(),
    }
}

/// The principal `SELECT` statement against the root form's own table.
pub fn generate_select(node: &QueryNode, dialect: &dyn SqlDialect) -> Result<(String, Vec<Value>), SqlGenError> {
    let mut params = ParamBuilder::new(0);
    let columns = quoted_columns(&node.schema, dialect).join(", ");
    let table = dialect.quote_identifier(node.schema.table_name);
    let mut sql = format!("SELECT {columns} FROM {table}");

    if let Some(predicate) = &node.predicate {
        let atoms = atoms_for(node, predicate, |t| matches!(t, AtomTarget::Principal))?;
        if let Some(expr) = conjoin(&atoms) {
            sql.push_str(" WHERE ");
            sql.push_str(&render_expr(&expr, &node.schema, dialect, None, &mut params)?);
        }
    }
    let order = render_order(&node.schema, &node.root_order, dialect, None)?;
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }
    sql.push_str(&render_limit(node.root_limit));
    Ok((sql, params.values))
}

/// `SELECT COUNT(*)` over the same principal predicate, ignoring ordering/limit.
pub fn generate_count(node: &QueryNode, dialect: &dyn SqlDialect) -> Result<(String, Vec<Value>), SqlGenError> {
    let mut params = ParamBuilder::new(0);
    let table = dialect.quote_identifier(node.schema.table_name);
    let mut sql = format!("SELECT COUNT(*) FROM {table}");
    if let Some(predicate) = &node.predicate {
        let atoms = atoms_for(node, predicate, |t| matches!(t, AtomTarget::Principal))?;
        if let Some(expr) = conjoin(&atoms) {
            sql.push_str(" WHERE ");
            sql.push_str(&render_expr(&expr, &node.schema, dialect, None, &mut params)?);
        }
    }
    Ok((sql, params.values))
}

/// The auxiliary statement loading join `idx`'s children, keyed by
/// `IN (...)` over the parent-key values the principal statement returned.
///
/// A pivot join's FROM clause names two tables, so every child column
/// reference in its select list, predicate, and ordering is qualified with
/// the child table to keep shared column names (both sides having an `id`)
/// unambiguous.
pub fn generate_child_load(
    node: &QueryNode,
    idx: usize,
    parent_key_values: &[Value],
    dialect: &dyn SqlDialect,
) -> Result<(String, Vec<Value>), SqlGenError> {
    let join = &node.joins[idx];
    let mut params = ParamBuilder::new(0);
    let child_columns = quoted_columns(&join.schema, dialect);

    let (select_list, from_clause, keyed_column, qualifier) = match &join.kind {
        JoinKind::Standard { child_key, .. } => {
            let child_key_col = join
                .schema
                .column(child_key)
                .ok_or(SqlGenError::UnknownColumn { form: join.schema.type_name, column: child_key })?;
            (
                child_columns.join(", "),
                dialect.quote_identifier(join.schema.table_name),
                dialect.quote_identifier(child_key_col.column_name),
                None,
            )
        }
        JoinKind::Pivot { pivot_table, pivot_parent_key, pivot_child_key, child_key, .. } => {
            let child_key_col = join
                .schema
                .column(child_key)
                .ok_or(SqlGenError::UnknownColumn { form: join.schema.type_name, column: child_key })?;
            let child_table = dialect.quote_identifier(join.schema.table_name);
            let pivot_ref = dialect.quote_identifier(pivot_table);
            let pivot_parent_col = dialect.quote_identifier(pivot_parent_key);
            let pivot_child_col = dialect.quote_identifier(pivot_child_key);
            let child_key_ref = dialect.quote_identifier(child_key_col.column_name);
            let mut select_list = child_columns
                .iter()
                .map(|c| format!("{child_table}.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            select_list.push_str(&format!(", {pivot_ref}.{pivot_parent_col} AS __meridian_pivot_parent"));
            let from_clause = format!(
                "{child_table} INNER JOIN {pivot_ref} ON {child_table}.{child_key_ref} = {pivot_ref}.{pivot_child_col}"
            );
            (select_list, from_clause, format!("{pivot_ref}.{pivot_parent_col}"), Some(child_table))
        }
    };
    let qualifier = qualifier.as_deref();

    let placeholders: Vec<String> = parent_key_values
        .iter()
        .map(|v| {
            let i = params.push(v.clone());
            dialect.placeholder(i)
        })
        .collect();

    let mut sql = format!("SELECT {select_list} FROM {from_clause} WHERE {keyed_column} IN ({})", placeholders.join(", "));

    if let Some(predicate) = &node.predicate {
        let atoms = atoms_for(node, predicate, |t| matches!(t, AtomTarget::Join(j) if *j == idx))?;
        if let Some(expr) = conjoin(&atoms) {
            sql.push_str(" AND ");
            sql.push_str(&render_expr(&expr, &join.schema, dialect, qualifier, &mut params)?);
        }
    }

    let order = render_order(&join.schema, &join.order, dialect, qualifier)?;
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }
    sql.push_str(&render_limit(join.limit));
    Ok((sql, params.values))
}

/// `INSERT INTO table (columns...) VALUES (placeholders...)`, one row's
/// worth of placeholders; the materializer binds each row's values in turn.
pub fn generate_insert_sql(schema: &TableSchema, dialect: &dyn SqlDialect) -> String {
    let columns = quoted_columns(schema, dialect).join(", ");
    let placeholders: Vec<String> = (0..schema.columns.len()).map(|i| dialect.placeholder(i)).collect();
    let table = dialect.quote_identifier(schema.table_name);
    format!("INSERT INTO {table} ({columns}) VALUES ({})", placeholders.join(", "))
}

/// `UPDATE table SET col = ?, ... [WHERE ...]`. `set_fields` names the
/// columns being written, in bind order; the returned `Vec<Value>` holds
/// only the predicate's literal parameters — the `SET` placeholders are
/// bound separately from the record's own field values.
pub fn generate_update_sql(
    schema: &TableSchema,
    set_fields: &[&'static str],
    predicate: Option<&Expression>,
    dialect: &dyn SqlDialect,
) -> Result<(String, Vec<Value>), SqlGenError> {
    let mut assignments = Vec::with_capacity(set_fields.len());
    for (i, &field) in set_fields.iter().enumerate() {
        let column = schema
            .column(field)
            .ok_or(SqlGenError::UnknownColumn { form: schema.type_name, column: field })?;
        assignments.push(format!("{} = {}", dialect.quote_identifier(column.column_name), dialect.placeholder(i)));
    }
    let table = dialect.quote_identifier(schema.table_name);
    let mut sql = format!("UPDATE {table} SET {}", assignments.join(", "));

    // Predicate placeholders continue numbering after the SET clause's.
    let mut params = ParamBuilder::new(set_fields.len());
    if let Some(expr) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(&render_expr(expr, schema, dialect, None, &mut params)?);
    }
    Ok((sql, params.values))
}

/// `DELETE FROM table [WHERE ...]`.
pub fn generate_delete_sql(
    schema: &TableSchema,
    predicate: Option<&Expression>,
    dialect: &dyn SqlDialect,
) -> Result<(String, Vec<Value>), SqlGenError> {
    let table = dialect.quote_identifier(schema.table_name);
    let mut sql = format!("DELETE FROM {table}");
    let mut params = ParamBuilder::new(0);
    if let Some(expr) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(&render_expr(expr, schema, dialect, None, &mut params)?);
    }
    Ok((sql, params.values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, PrimitiveType};
    use std::sync::Arc;

    struct TestDialect;
    impl SqlDialect for TestDialect {
        fn quote_identifier(&self, name: &str) -> String {
            format!("\"{name}\"")
        }
        fn placeholder(&self, _index: usize) -> String {
            "?".to_string()
        }
        fn sql_type_keyword(&self, _p: PrimitiveType, _nullable: bool) -> String {
            "TEXT".to_string()
        }
        fn supports_native_uuid(&self) -> bool {
            false
        }
        fn supports_native_date(&self) -> bool {
            false
        }
    }

    fn test_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema {
            type_name: "Parent",
            table_name: "parents",
            columns: vec![
                ColumnSchema { field_name: "id", column_name: "id", primitive: PrimitiveType::I64, nullable: false },
                ColumnSchema { field_name: "last", column_name: "last", primitive: PrimitiveType::Text, nullable: true },
            ],
            primary_key: Some(0),
            child_collections: vec![],
        })
    }

    fn node_with_predicate(predicate: Expression) -> QueryNode {
        QueryNode {
            schema: test_schema(),
            joins: vec![],
            focus: None,
            root_order: Ordering::default(),
            root_limit: None,
            predicate: Some(predicate),
        }
    }

    #[test]
    fn is_null_renders_as_is_null_keyword() {
        let node = node_with_predicate(Expression::Compare {
            op: CompareOp::Eq,
            left: Box::new(Expression::Column { form: "Parent", field: "last" }),
            right: Box::new(Expression::Literal(Value::Null)),
        });
        let (sql, params) = generate_select(&node, &TestDialect).unwrap();
        assert!(sql.contains("\"last\" IS NULL"), "{sql}");
        assert!(params.is_empty());
    }

    #[test]
    fn not_null_renders_as_is_not_null() {
        let node = node_with_predicate(Expression::Compare {
            op: CompareOp::Ne,
            left: Box::new(Expression::Column { form: "Parent", field: "last" }),
            right: Box::new(Expression::Literal(Value::Null)),
        });
        let (sql, _) = generate_select(&node, &TestDialect).unwrap();
        assert!(sql.contains("\"last\" IS NOT NULL"), "{sql}");
    }

    #[test]
    fn equality_predicate_binds_a_placeholder() {
        let node = node_with_predicate(Expression::Compare {
            op: CompareOp::Eq,
            left: Box::new(Expression::Column { form: "Parent", field: "last" }),
            right: Box::new(Expression::Literal(Value::Text("Lars".into()))),
        });
        let (sql, params) = generate_select(&node, &TestDialect).unwrap();
        assert!(sql.contains("\"last\" = ?"), "{sql}");
        assert_eq!(params, vec![Value::Text("Lars".into())]);
    }

    #[test]
    fn unknown_column_in_predicate_is_rejected() {
        let node = node_with_predicate(Expression::Compare {
            op: CompareOp::Eq,
            left: Box::new(Expression::Column { form: "Parent", field: "nope" }),
            right: Box::new(Expression::Literal(Value::I64(1))),
        });
        let err = generate_select(&node, &TestDialect).unwrap_err();
        assert!(matches!(err, SqlGenError::UnknownColumn { column: "nope", .. }));
    }
}
