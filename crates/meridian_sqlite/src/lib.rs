//! The reference SQLite driver: a `meridian_core::Driver` implementation
//! backed by `rusqlite`.

mod driver;

pub use driver::{SqliteConfig, SqliteConnection, SqliteDialect, SqliteDriver};
