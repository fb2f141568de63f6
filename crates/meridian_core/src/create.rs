//! Table lifecycle operations: create, reconcile, and cascading create into
//! child-collection element types.

use std::any::TypeId;
use std::collections::HashSet;

use crate::database::Database;
use crate::error::Error;
use crate::record::Record;
use crate::schema::TableSchema;

/// Options governing `Database::create`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatePolicy {
    pub drop_table: bool,
    pub reconcile_table: bool,
    pub shallow: bool,
}

impl CreatePolicy {
    pub fn drop_table(mut self) -> Self {
        self.drop_table = true;
        self
    }

    pub fn reconcile_table(mut self) -> Self {
        self.reconcile_table = true;
        self
    }

    /// Skip recursing into child-collection element types.
    pub fn shallow(mut self) -> Self {
        self.shallow = true;
        self
    }
}

impl Database {
    /// Creates (and optionally reconciles) `T`'s table, recursing into its
    /// child-collection element types unless `policy.shallow` is set.
    pub fn create<T: Record>(&self, policy: CreatePolicy) -> Result<(), Error> {
        let mut visited = HashSet::new();
        create_recursive::<T>(self, policy, &mut visited)
    }
}

/// Breaks cycles between mutually referencing record types by tracking
/// which types this call tree has already created.
///
/// Public because generated [`Record::create_children`] implementations
/// call back into this from outside the crate.
pub fn create_recursive<T: Record>(
    db: &Database,
    policy: CreatePolicy,
    visited: &mut HashSet<TypeId>,
) -> Result<(), Error> {
    if !visited.insert(TypeId::of::<T>()) {
        return Ok(());
    }
    create_table(db, &T::schema(), policy)?;
    if !policy.shallow {
        T::create_children(db, policy, visited)?;
    }
    Ok(())
}

fn create_table(db: &Database, schema: &TableSchema, policy: CreatePolicy) -> Result<(), Error> {
    let conn = db.connection();
    let dialect = conn.dialect();
    let table = dialect.quote_identifier(schema.table_name);

    if policy.drop_table {
        let sql = format!("DROP TABLE IF EXISTS {table}");
        db.log_sql(&sql);
        conn.execute_ddl(&sql)?;
    }

    let mut column_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", dialect.quote_identifier(c.column_name), dialect.sql_type_keyword(c.primitive, c.nullable)))
        .collect();
    if let Some(pk) = schema.primary_key_column() {
        column_defs.push(format!("PRIMARY KEY ({})", dialect.quote_identifier(pk.column_name)));
    }
    let create_sql = format!("CREATE TABLE IF NOT EXISTS {table} ({})", column_defs.join(", "));
    db.log_sql(&create_sql);
    conn.execute_ddl(&create_sql)?;

    if policy.reconcile_table {
        reconcile_columns(db, schema)?;
    }
    Ok(())
}

/// Issues drops before adds to avoid name collisions. A dialect that cannot
/// drop columns natively (`SqlDialect::supports_drop_column` is `false`)
/// simply leaves surplus live columns in place rather than failing.
fn reconcile_columns(db: &Database, schema: &TableSchema) -> Result<(), Error> {
    let conn = db.connection();
    let dialect = conn.dialect();
    let table = dialect.quote_identifier(schema.table_name);
    let live = conn.list_columns(schema.table_name)?;

    let mut statements = Vec::new();

    if dialect.supports_drop_column() {
        for live_col in &live {
            if schema.column(&live_col.name).is_none() {
                statements.push(format!("ALTER TABLE {table} DROP COLUMN {}", dialect.quote_identifier(&live_col.name)));
            }
        }
    }
    for col in &schema.columns {
        if !live.iter().any(|l| l.name == col.column_name) {
            statements.push(format!(
                "ALTER TABLE {table} ADD COLUMN {} {}",
                dialect.quote_identifier(col.column_name),
                dialect.sql_type_keyword(col.primitive, col.nullable)
            ));
        }
    }

    for sql in statements {
        db.log_sql(&sql);
        conn.execute_ddl(&sql)?;
    }
    Ok(())
}
