//! The driver hook layer: the small, dialect-agnostic contract a concrete
//! SQL database must satisfy for the core to generate and execute
//! statements against it. Concrete drivers (SQLite, PostgreSQL, ...) are
//! external collaborators; this module only names the interface they
//! implement.

use crate::error::{DecodeError, EncodeError, SqlExecError};
use crate::schema::PrimitiveType;
use crate::value::Value;

/// A column as reported by the live database, used by `create::reconcile`
/// to diff against the derived [`TableSchema`](crate::schema::TableSchema).
#[derive(Debug, Clone)]
pub struct LiveColumn {
    pub name: String,
    pub primitive: PrimitiveType,
    pub nullable: bool,
}

/// Dialect-specific bits a driver exposes: quoting, placeholder syntax,
/// type-keyword mapping, and feature flags.
pub trait SqlDialect: Send + Sync {
    fn quote_identifier(&self, name: &str) -> String;

    /// Renders the placeholder for the `index`-th (0-based) bound parameter.
    fn placeholder(&self, index: usize) -> String;

    /// The `CREATE TABLE` column-type keyword for a primitive/nullability pair.
    fn sql_type_keyword(&self, primitive: PrimitiveType, nullable: bool) -> String;

    /// Whether the driver stores UUIDs as a native type rather than text.
    fn supports_native_uuid(&self) -> bool;

    /// Whether the driver stores dates as a native type rather than text.
    fn supports_native_date(&self) -> bool;

    /// Whether `ALTER TABLE ... DROP COLUMN` is available natively.
    fn supports_drop_column(&self) -> bool {
        true
    }
}

/// A positioned view onto the statement's current row. Valid only between a
/// [`Statement::step`] call that returned `true` and the next `step`/`finalize`.
pub trait RowCursor {
    fn read_column(&self, index: usize, expected: PrimitiveType) -> Result<Value, DecodeError>;
}

/// A prepared, bindable, steppable SQL statement.
///
/// There is no explicit `finalize`: statements release their driver
/// resources on `Drop`, and a statement cannot outlive the connection
/// that prepared it.
pub trait Statement {
    fn bind(&mut self, index: usize, value: &Value) -> Result<(), EncodeError>;

    /// Advances to the next row. `Ok(true)` means a row is positioned and
    /// may be read via [`Statement::row`]; `Ok(false)` means the statement
    /// is exhausted.
    fn step(&mut self) -> Result<bool, SqlExecError>;

    /// The row positioned by the most recent `step` that returned `true`.
    fn row(&self) -> &dyn RowCursor;

    /// Rows affected by the most recently executed INSERT/UPDATE/DELETE.
    fn affected_rows(&self) -> u64;
}

/// An open connection to one database.
///
/// A `Connection` is not required to be safe for concurrent use; callers
/// serialize access through [`crate::database::Database`].
pub trait Connection: Send + Sync {
    fn dialect(&self) -> &dyn SqlDialect;

    fn begin_transaction(&self) -> Result<(), SqlExecError>;
    fn commit(&self) -> Result<(), SqlExecError>;
    fn rollback(&self) -> Result<(), SqlExecError>;

    fn prepare<'c>(&'c self, sql: &str) -> Result<Box<dyn Statement + 'c>, SqlExecError>;

    /// Executes a DDL statement (`CREATE TABLE`, `ALTER TABLE`, `DROP TABLE`) directly.
    fn execute_ddl(&self, sql: &str) -> Result<(), SqlExecError>;

    /// Introspects the live columns of `table` for `create::reconcile`.
    fn list_columns(&self, table: &str) -> Result<Vec<LiveColumn>, SqlExecError>;

    fn close(&self) -> Result<(), SqlExecError>;
}

/// Factory for opening a [`Connection`] from a driver-specific configuration.
///
/// Kept generic (not object-safe) because each driver's configuration shape
/// is its own concern; the core only needs the resulting `Connection`.
pub trait Driver {
    type Config;
    type Error: std::error::Error + Send + Sync + 'static;

    fn open(config: Self::Config) -> Result<Box<dyn Connection>, Self::Error>;
}
