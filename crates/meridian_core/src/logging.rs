//! Structured logging hooks for the ambient error and query-text events
//! every operation produces: every thrown [`Error`] is logged at `error`
//! level, and every principal/auxiliary statement is logged at `debug`
//! level when query logging is enabled on the owning [`Database`](crate::database::Database).

use crate::error::Error;

/// Where core-generated log events go. Swap in a custom sink (structured
/// JSON, a metrics counter, ...) by implementing this trait directly; the
/// default forwards to the `log` crate's global logger, same as the rest of
/// the workspace.
pub trait LogSink: Send + Sync {
    fn error(&self, err: &Error);
    fn debug_sql(&self, sql: &str);
}

/// Forwards to the `log` crate.
pub struct StandardLogSink;

impl LogSink for StandardLogSink {
    fn error(&self, err: &Error) {
        log::error!("{err}");
    }

    fn debug_sql(&self, sql: &str) {
        log::debug!("{sql}");
    }
}

/// Discards every event. The default sink on a freshly constructed `Database`.
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn error(&self, _err: &Error) {}
    fn debug_sql(&self, _sql: &str) {}
}
