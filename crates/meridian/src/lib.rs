//! Public surface: re-exports the query algebra and derive macro from
//! `meridian_core`/`meridian_macros`, plus one convenience constructor for
//! the reference SQLite driver. Bootstrapping a `Database` from any other
//! driver goes straight through `meridian_core::Database::open` — this
//! crate is a thin convenience, not a plugin registry.

pub use meridian_core::*;
pub use meridian_macros::Record;

#[cfg(feature = "sqlite")]
pub use meridian_sqlite::{SqliteConfig, SqliteConnection, SqliteDialect, SqliteDriver};

/// Opens a `Database` backed by the bundled SQLite driver.
#[cfg(feature = "sqlite")]
pub fn open_sqlite(config: SqliteConfig) -> Result<Database> {
    Ok(Database::open::<SqliteDriver>(config)?)
}
