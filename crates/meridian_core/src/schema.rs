use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::SchemaError;

/// One of the primitive SQL-compatible types a column field may hold.
///
/// Closed set: widening this enum is a core change, not a driver change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Text,
    Bytes,
    Date,
    Uuid,
}

impl PrimitiveType {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::I8 => "i8",
            PrimitiveType::I16 => "i16",
            PrimitiveType::I32 => "i32",
            PrimitiveType::I64 => "i64",
            PrimitiveType::U8 => "u8",
            PrimitiveType::U16 => "u16",
            PrimitiveType::U32 => "u32",
            PrimitiveType::U64 => "u64",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
            PrimitiveType::Bool => "bool",
            PrimitiveType::Text => "text",
            PrimitiveType::Bytes => "bytes",
            PrimitiveType::Date => "date",
            PrimitiveType::Uuid => "uuid",
        }
    }
}

/// One column of a [`TableSchema`], in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub field_name: &'static str,
    pub column_name: &'static str,
    pub primitive: PrimitiveType,
    pub nullable: bool,
}

/// A child-collection field: an optional ordered sequence of another record
/// type, populated only once a query explicitly joins it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildCollectionDescriptor {
    pub field_name: &'static str,
    pub element_type: TypeId,
    pub element_type_name: &'static str,
}

/// The derived, cached shape of a record type's backing table.
///
/// Produced at most once per record type and never mutated afterward;
/// column order is the parameter-binding order for inserts and updates.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub type_name: &'static str,
    pub table_name: &'static str,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Option<usize>,
    pub child_collections: Vec<ChildCollectionDescriptor>,
}

impl TableSchema {
    pub fn column_index(&self, field_or_column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.field_name == field_or_column || c.column_name == field_or_column)
    }

    pub fn column(&self, field_or_column: &str) -> Option<&ColumnSchema> {
        self.column_index(field_or_column).map(|i| &self.columns[i])
    }

    pub fn primary_key_column(&self) -> Option<&ColumnSchema> {
        self.primary_key.map(|i| &self.columns[i])
    }

    pub fn child_collection(&self, field_name: &str) -> Option<&ChildCollectionDescriptor> {
        self.child_collections.iter().find(|c| c.field_name == field_name)
    }

    /// Builds a schema from raw field descriptions. An explicit primary key
    /// always wins; otherwise the column literally named `id`, if any, is
    /// inferred as the key.
    pub fn build(
        type_name: &'static str,
        table_name: &'static str,
        fields: Vec<RawField>,
        explicit_primary_key: Option<&'static str>,
        child_collections: Vec<ChildCollectionDescriptor>,
    ) -> Result<TableSchema, SchemaError> {
        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            columns.push(ColumnSchema {
                field_name: field.field_name,
                column_name: field.column_name,
                primitive: field.primitive,
                nullable: field.nullable,
            });
        }

        let primary_key = match explicit_primary_key {
            Some(name) => columns.iter().position(|c| c.field_name == name || c.column_name == name),
            None => {
                let mut found: Option<usize> = None;
                for (idx, col) in columns.iter().enumerate() {
                    if col.column_name == "id" {
                        if let Some(prev) = found {
                            return Err(SchemaError::AmbiguousPrimaryKey {
                                first: columns[prev].column_name,
                                second: col.column_name,
                            });
                        }
                        found = Some(idx);
                    }
                }
                found
            }
        };

        Ok(TableSchema {
            type_name,
            table_name,
            columns,
            primary_key,
            child_collections,
        })
    }
}

/// A column as described before primary-key inference runs.
pub struct RawField {
    pub field_name: &'static str,
    pub column_name: &'static str,
    pub primitive: PrimitiveType,
    pub nullable: bool,
}

/// Process-wide, read-mostly, never-evicted schema cache keyed on the
/// record type's `TypeId`.
struct SchemaRegistry {
    entries: RwLock<HashMap<TypeId, Arc<TableSchema>>>,
}

static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();

fn registry() -> &'static SchemaRegistry {
    REGISTRY.get_or_init(|| SchemaRegistry { entries: RwLock::new(HashMap::new()) })
}

fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

/// Looks up or lazily populates the cached schema for `type_id`, running
/// `build` at most once per type for the lifetime of the process.
pub fn cached_schema<F>(type_id: TypeId, build: F) -> Result<Arc<TableSchema>, SchemaError>
where
    F: FnOnce() -> Result<TableSchema, SchemaError>,
{
    if let Some(schema) = rwlock_read(&registry().entries).get(&type_id) {
        return Ok(Arc::clone(schema));
    }
    let schema = Arc::new(build()?);
    let mut entries = rwlock_write(&registry().entries);
    Ok(Arc::clone(entries.entry(type_id).or_insert(schema)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, primitive: PrimitiveType) -> RawField {
        RawField { field_name: name, column_name: name, primitive, nullable: false }
    }

    #[test]
    fn infers_id_column_as_primary_key_when_no_explicit_key() {
        let schema = TableSchema::build(
            "T",
            "t",
            vec![field("id", PrimitiveType::I64), field("name", PrimitiveType::Text)],
            None,
            vec![],
        )
        .unwrap();
        assert_eq!(schema.primary_key, Some(0));
    }

    #[test]
    fn explicit_primary_key_wins_over_id_column() {
        let schema = TableSchema::build(
            "T",
            "t",
            vec![field("id", PrimitiveType::I64), field("uuid", PrimitiveType::Uuid)],
            Some("uuid"),
            vec![],
        )
        .unwrap();
        assert_eq!(schema.primary_key, Some(1));
        assert_eq!(schema.primary_key_column().unwrap().field_name, "uuid");
    }

    #[test]
    fn no_primary_key_when_absent_and_not_requested() {
        let schema = TableSchema::build(
            "T",
            "t",
            vec![field("name", PrimitiveType::Text)],
            None,
            vec![],
        )
        .unwrap();
        assert_eq!(schema.primary_key, None);
    }

    #[test]
    fn column_order_is_stable() {
        let schema = TableSchema::build(
            "T",
            "t",
            vec![field("b", PrimitiveType::Text), field("a", PrimitiveType::Text)],
            None,
            vec![],
        )
        .unwrap();
        assert_eq!(schema.columns[0].field_name, "b");
        assert_eq!(schema.columns[1].field_name, "a");
    }
}
