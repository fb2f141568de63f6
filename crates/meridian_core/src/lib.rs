//! The structurally-reflective ORM core: schema derivation, the query
//! algebra, SQL generation, and row materialization over a pluggable
//! driver hook.
//!
//! Concrete database drivers, connection pooling, and the public surface
//! used to bootstrap a [`Database`] from user-facing configuration are
//! external collaborators; this crate only defines the contract they meet.

#![allow(clippy::result_large_err)]

mod create;
mod database;
mod driver;
mod error;
mod expr;
mod logging;
mod materialize;
mod query;
mod record;
mod schema;
mod sql;
mod value;

pub use create::{create_recursive, CreatePolicy};
pub use database::Database;
pub use driver::{Connection, Driver, LiveColumn, RowCursor, SqlDialect, Statement};
pub use error::{DecodeError, EncodeError, Error, QueryError, Result, SchemaError, SqlExecError, SqlGenError};
pub use expr::{col, Column, CompareOp, Expression};
pub use logging::{LogSink, NullLogSink, StandardLogSink};
pub use query::{Join, Limit, OrderDirection, Order, Query, TableState, UpdateKeys, Where};
pub use record::Record;
pub use schema::{cached_schema, ChildCollectionDescriptor, ColumnSchema, PrimitiveType, RawField, TableSchema};
pub use value::Value;

pub use chrono;
pub use uuid;
