use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;

use crate::create::CreatePolicy;
use crate::database::Database;
use crate::driver::RowCursor;
use crate::error::{DecodeError, Error};
use crate::schema::TableSchema;
use crate::value::Value;

/// A structurally-reflective record type that maps 1:1 onto a SQL table.
///
/// Implementations are generated by `#[derive(Record)]`
/// (`meridian_macros`). The trait is hand-writable for
/// types that need behavior the derive macro does not support, but every
/// method must agree with the contract the macro generates: `schema()` is
/// memoized per type, `decode_row` reads columns by index in schema order,
/// and `column_values` emits values in the same order.
pub trait Record: Sized + 'static {
    /// The record's derived, cached [`TableSchema`].
    fn schema() -> Arc<TableSchema>;

    /// Decodes one row into an instance, using `schema` for column order
    /// and expected primitive types. Child-collection fields are left at
    /// their absent default; the materializer fills them in afterward.
    fn decode_row(cursor: &dyn RowCursor, schema: &TableSchema) -> Result<Self, DecodeError>;

    /// The column values of `self`, in `schema.columns` order, for binding
    /// into INSERT/UPDATE statements.
    fn column_values(&self, schema: &TableSchema) -> Vec<Value>;

    /// Assigns a decoded child-collection result to `field_name`.
    ///
    /// `items` is a type-erased `Vec<C>` for the field's element type `C`;
    /// the generated implementation downcasts it back. Passing a field name
    /// that is not a child collection of this record type is a programmer
    /// error caught by the materializer before this is ever called.
    fn set_child_collection(&mut self, field_name: &'static str, items: Box<dyn Any>);

    /// Recurses `create`/`reconcile` into every child-collection element
    /// type. The generated implementation calls
    /// [`crate::create::create_recursive`] for each concrete element type;
    /// hand-written records with no child collections can rely on the
    /// default no-op.
    fn create_children(_db: &Database, _policy: CreatePolicy, _visited: &mut HashSet<TypeId>) -> Result<(), Error> {
        Ok(())
    }
}
