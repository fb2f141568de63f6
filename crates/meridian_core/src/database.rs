//! The `Database` façade: one open connection, transaction nesting, and the
//! `table::<T>()` entry point into the query algebra.

use std::cell::Cell;
use std::sync::Arc;

use crate::driver::{Connection, Driver};
use crate::error::Error;
use crate::logging::{LogSink, NullLogSink};
use crate::query::{Query, TableState};
use crate::record::Record;

/// One open connection plus the bookkeeping the query algebra needs:
/// transaction nesting and logging. Not safe to share across threads —
/// callers that need concurrent access serialize externally or open one
/// handle per thread.
pub struct Database {
    connection: Box<dyn Connection>,
    log: Arc<dyn LogSink>,
    log_queries: bool,
    transaction_depth: Cell<u32>,
    transaction_failed: Cell<bool>,
}

impl Database {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Database {
            connection,
            log: Arc::new(NullLogSink),
            log_queries: false,
            transaction_depth: Cell::new(0),
            transaction_failed: Cell::new(false),
        }
    }

    /// Opens a connection via a driver's own configuration type. This is
    /// the one bootstrap seam the core owns: every driver needs *some* way
    /// to hand the core a `Connection`.
    pub fn open<D: Driver>(config: D::Config) -> Result<Self, D::Error> {
        Ok(Database::new(D::open(config)?))
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = sink;
        self
    }

    pub fn with_query_logging(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// The entry point into the query algebra for record type `T`.
    pub fn table<T: Record>(&self) -> Query<'_, T, TableState> {
        Query::new(self)
    }

    /// Runs `f` inside a transaction. Nested calls flatten into the
    /// outermost transaction: inner begins are no-ops, and only the
    /// outermost boundary commits or rolls back. An inner failure marks
    /// the whole transaction for rollback even if an outer closure goes on
    /// to return `Ok`.
    pub fn transaction<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&Database) -> Result<R, Error>,
    {
        let depth = self.transaction_depth.get();
        if depth == 0 {
            self.connection.begin_transaction()?;
            self.transaction_failed.set(false);
        }
        self.transaction_depth.set(depth + 1);

        let result = f(self);
        if result.is_err() {
            self.transaction_failed.set(true);
        }

        let depth = self.transaction_depth.get() - 1;
        self.transaction_depth.set(depth);
        if depth == 0 {
            if self.transaction_failed.get() {
                self.connection.rollback()?;
            } else {
                self.connection.commit()?;
            }
        }

        if let Err(err) = &result {
            self.log.error(err);
        }
        result
    }

    pub(crate) fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub(crate) fn log_sql(&self, sql: &str) {
        if self.log_queries {
            self.log.debug_sql(sql);
        }
    }

    pub(crate) fn log_error(&self, err: &Error) {
        self.log.error(err);
    }
}
