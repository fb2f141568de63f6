//! Executes a [`QueryNode`] against a [`Database`]: runs the principal
//! statement, decodes rows, then loads and buckets each join's children
//! back onto their parents.

use std::any::Any;

use crate::database::Database;
use crate::query::{ChildLoader, JoinKind, QueryNode, UpdateKeys};
use crate::error::Error;
use crate::record::Record;
use crate::schema::{PrimitiveType, TableSchema};
use crate::sql;
use crate::value::Value;

fn logged<R>(db: &Database, result: Result<R, Error>) -> Result<R, Error> {
    if let Err(err) = &result {
        db.log_error(err);
    }
    result
}

pub(crate) fn run_select<T: Record>(db: &Database, node: &QueryNode) -> Result<Vec<T>, Error> {
    let result: Result<Vec<T>, Error> = (|| {
        let conn = db.connection();
        let (sql_text, params) = sql::generate_select(node, conn.dialect())?;
        db.log_sql(&sql_text);
        let mut rows = Vec::new();
        {
            let mut stmt = conn.prepare(&sql_text)?;
            for (i, v) in params.iter().enumerate() {
                stmt.bind(i, v)?;
            }
            while stmt.step()? {
                rows.push(T::decode_row(stmt.row(), &node.schema)?);
            }
        }
        for idx in 0..node.joins.len() {
            load_join(db, node, idx, &mut rows)?;
        }
        Ok(rows)
    })();
    logged(db, result)
}

pub(crate) fn run_count(db: &Database, node: &QueryNode) -> Result<u64, Error> {
    let result: Result<u64, Error> = (|| {
        let conn = db.connection();
        let (sql_text, params) = sql::generate_count(node, conn.dialect())?;
        db.log_sql(&sql_text);
        let mut stmt = conn.prepare(&sql_text)?;
        for (i, v) in params.iter().enumerate() {
            stmt.bind(i, v)?;
        }
        if !stmt.step()? {
            return Ok(0);
        }
        let count = match stmt.row().read_column(0, PrimitiveType::I64)? {
            Value::I64(n) => n as u64,
            Value::I32(n) => n as u64,
            _ => 0,
        };
        Ok(count)
    })();
    logged(db, result)
}

pub(crate) fn run_insert<T: Record>(db: &Database, node: &QueryNode, rows: Vec<T>) -> Result<u64, Error> {
    let result: Result<u64, Error> = (|| {
        let conn = db.connection();
        let sql_text = sql::generate_insert_sql(&node.schema, conn.dialect());
        db.log_sql(&sql_text);
        let mut affected = 0u64;
        for row in &rows {
            let values = row.column_values(&node.schema);
            let mut stmt = conn.prepare(&sql_text)?;
            for (i, v) in values.iter().enumerate() {
                stmt.bind(i, v)?;
            }
            stmt.step()?;
            affected += stmt.affected_rows();
        }
        Ok(affected)
    })();
    logged(db, result)
}

pub(crate) fn run_update<T: Record>(
    db: &Database,
    node: &QueryNode,
    value: &T,
    keys: &UpdateKeys,
) -> Result<u64, Error> {
    let result: Result<u64, Error> = (|| {
        let set_fields = resolve_set_fields(&node.schema, keys);
        let conn = db.connection();
        let (sql_text, predicate_params) =
            sql::generate_update_sql(&node.schema, &set_fields, node.predicate.as_ref(), conn.dialect())?;
        db.log_sql(&sql_text);

        let all_values = value.column_values(&node.schema);
        let mut stmt = conn.prepare(&sql_text)?;
        for (i, field) in set_fields.iter().enumerate() {
            let idx = node.schema.column_index(field).expect("set field validated by generate_update_sql");
            stmt.bind(i, &all_values[idx])?;
        }
        let base = set_fields.len();
        for (i, v) in predicate_params.iter().enumerate() {
            stmt.bind(base + i, v)?;
        }
        stmt.step()?;
        Ok(stmt.affected_rows())
    })();
    logged(db, result)
}

pub(crate) fn run_delete(db: &Database, node: &QueryNode) -> Result<u64, Error> {
    let result: Result<u64, Error> = (|| {
        let conn = db.connection();
        let (sql_text, params) = sql::generate_delete_sql(&node.schema, node.predicate.as_ref(), conn.dialect())?;
        db.log_sql(&sql_text);
        let mut stmt = conn.prepare(&sql_text)?;
        for (i, v) in params.iter().enumerate() {
            stmt.bind(i, v)?;
        }
        stmt.step()?;
        Ok(stmt.affected_rows())
    })();
    logged(db, result)
}

/// Resolves an [`UpdateKeys`] policy into the concrete field list to write.
/// The primary key column never appears in the result.
fn resolve_set_fields(schema: &TableSchema, keys: &UpdateKeys) -> Vec<&'static str> {
    let pk_field = schema.primary_key_column().map(|c| c.field_name);
    match keys {
        UpdateKeys::All => schema
            .columns
            .iter()
            .filter(|c| Some(c.field_name) != pk_field)
            .map(|c| c.field_name)
            .collect(),
        UpdateKeys::Set(fields) => fields.iter().copied().filter(|f| Some(*f) != pk_field).collect(),
        UpdateKeys::Ignore(ignored) => schema
            .columns
            .iter()
            .filter(|c| Some(c.field_name) != pk_field && !ignored.contains(&c.field_name))
            .map(|c| c.field_name)
            .collect(),
    }
}

/// Loads join `idx`'s children for every row already decoded, buckets them
/// by parent key, and assigns each bucket via [`Record::set_child_collection`].
fn load_join<T: Record>(db: &Database, node: &QueryNode, idx: usize, rows: &mut Vec<T>) -> Result<(), Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let join = &node.joins[idx];
    let parent_key_field = match &join.kind {
        JoinKind::Standard { parent_key, .. } => *parent_key,
        JoinKind::Pivot { parent_key, .. } => *parent_key,
    };
    let parent_key_idx = node
        .schema
        .column_index(parent_key_field)
        .expect("join parent key validated at join() construction");

    // Distinct parent-key values, first-seen order, for the auxiliary
    // IN (...). A NULL key can never match a child row, so it contributes
    // nothing to the set.
    let mut keys = Vec::new();
    for row in rows.iter() {
        let key = row.column_values(&node.schema)[parent_key_idx].clone();
        if !key.is_null() && !keys.contains(&key) {
            keys.push(key);
        }
    }
    if keys.is_empty() {
        for row in rows.iter_mut() {
            row.set_child_collection(join.field, join.loader.collect(Vec::new()));
        }
        return Ok(());
    }

    let conn = db.connection();
    let (sql_text, params) = sql::generate_child_load(node, idx, &keys, conn.dialect())?;
    db.log_sql(&sql_text);

    let (key_index, key_primitive) = match &join.kind {
        JoinKind::Standard { child_key, .. } => {
            let i = join.schema.column_index(child_key).expect("child key validated at join() construction");
            (i, join.schema.columns[i].primitive)
        }
        JoinKind::Pivot { parent_key, .. } => {
            let parent_col = node.schema.column(parent_key).expect("parent key validated at join() construction");
            (join.schema.columns.len(), parent_col.primitive)
        }
    };

    let decoded = {
        let mut stmt = conn.prepare(&sql_text)?;
        for (i, v) in params.iter().enumerate() {
            stmt.bind(i, v)?;
        }
        join.loader.decode_rows(stmt.as_mut(), &join.schema, key_index, key_primitive)?
    };

    // A pivot join can reach the same child through more than one pivot row
    // (e.g. a post tagged twice via two join-table rows); each parent keeps
    // the distinct child set. Standard joins can't produce duplicates in
    // the first place, so only pivot groups pay for the dedup check.
    let dedupe_within_group = matches!(join.kind, JoinKind::Pivot { .. });
    let mut groups = group_children(join.loader.as_ref(), &join.schema, dedupe_within_group, decoded);

    for row in rows.iter_mut() {
        let own_key = row.column_values(&node.schema)[parent_key_idx].clone();
        let items = groups
            .iter_mut()
            .find(|(k, _)| *k == own_key)
            .map(|(_, items)| std::mem::take(items))
            .unwrap_or_default();
        row.set_child_collection(join.field, join.loader.collect(items));
    }

    Ok(())
}

/// Buckets decoded `(correlation key, boxed child)` pairs by key, preserving
/// arrival order within each bucket. When `dedupe` is set, a child whose
/// decoded column values already appear earlier in the same bucket is
/// dropped instead of appended.
fn group_children(
    loader: &dyn ChildLoader,
    schema: &TableSchema,
    dedupe: bool,
    decoded: Vec<(Value, Box<dyn Any>)>,
) -> Vec<(Value, Vec<Box<dyn Any>>)> {
    let mut groups: Vec<(Value, Vec<Box<dyn Any>>)> = Vec::new();
    for (key, item) in decoded {
        let group = match groups.iter_mut().position(|(k, _)| *k == key) {
            Some(i) => &mut groups[i],
            None => {
                groups.push((key, Vec::new()));
                groups.last_mut().expect("just pushed")
            }
        };
        if dedupe {
            let identity = loader.row_identity(item.as_ref(), schema);
            let duplicate =
                group.1.iter().any(|existing| loader.row_identity(existing.as_ref(), schema) == identity);
            if duplicate {
                continue;
            }
        }
        group.1.push(item);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RowCursor;
    use crate::error::DecodeError;
    use crate::query::TypedChildLoader;
    use crate::schema::RawField;
    use std::sync::Arc;

    #[derive(Clone, PartialEq, Debug)]
    struct TestTag {
        id: i64,
        label: String,
    }

    impl Record for TestTag {
        fn schema() -> Arc<TableSchema> {
            Arc::new(
                TableSchema::build(
                    "TestTag",
                    "tags",
                    vec![
                        RawField { field_name: "id", column_name: "id", primitive: PrimitiveType::I64, nullable: false },
                        RawField {
                            field_name: "label",
                            column_name: "label",
                            primitive: PrimitiveType::Text,
                            nullable: false,
                        },
                    ],
                    None,
                    Vec::new(),
                )
                .expect("schema builds"),
            )
        }

        fn decode_row(_cursor: &dyn RowCursor, _schema: &TableSchema) -> Result<Self, DecodeError> {
            unreachable!("not exercised by the dedup unit test")
        }

        fn column_values(&self, _schema: &TableSchema) -> Vec<Value> {
            vec![Value::I64(self.id), Value::Text(self.label.clone())]
        }

        fn set_child_collection(&mut self, _field_name: &'static str, _items: Box<dyn Any>) {
            unreachable!("not exercised by the dedup unit test")
        }
    }

    fn boxed(tag: TestTag) -> Box<dyn Any> {
        Box::new(tag) as Box<dyn Any>
    }

    #[test]
    fn pivot_dedup_keeps_one_copy_of_a_child_reached_through_two_pivot_rows() {
        let loader = TypedChildLoader::<TestTag>::new();
        let schema = TestTag::schema();
        let parent_key = Value::I64(1);
        let decoded = vec![
            (parent_key.clone(), boxed(TestTag { id: 100, label: "rust".to_string() })),
            (parent_key.clone(), boxed(TestTag { id: 101, label: "orm".to_string() })),
            // Same tag reached again via a second pivot row for the same parent.
            (parent_key.clone(), boxed(TestTag { id: 100, label: "rust".to_string() })),
        ];

        let groups = group_children(&loader, &schema, true, decoded);
        assert_eq!(groups.len(), 1);
        let (key, items) = &groups[0];
        assert_eq!(*key, parent_key);
        assert_eq!(items.len(), 2, "the duplicate rust tag must be dropped");
    }

    #[test]
    fn standard_join_groups_are_left_untouched_when_dedup_is_off() {
        let loader = TypedChildLoader::<TestTag>::new();
        let schema = TestTag::schema();
        let parent_key = Value::I64(1);
        let decoded = vec![
            (parent_key.clone(), boxed(TestTag { id: 100, label: "rust".to_string() })),
            (parent_key.clone(), boxed(TestTag { id: 100, label: "rust".to_string() })),
        ];

        let groups = group_children(&loader, &schema, false, decoded);
        assert_eq!(groups[0].1.len(), 2, "non-pivot joins never dedupe");
    }

    #[test]
    fn dedup_groups_by_distinct_parent_key_independently() {
        let loader = TypedChildLoader::<TestTag>::new();
        let schema = TestTag::schema();
        let decoded = vec![
            (Value::I64(1), boxed(TestTag { id: 100, label: "rust".to_string() })),
            (Value::I64(2), boxed(TestTag { id: 100, label: "rust".to_string() })),
        ];

        let groups = group_children(&loader, &schema, true, decoded);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[1].1.len(), 1);
    }
}
