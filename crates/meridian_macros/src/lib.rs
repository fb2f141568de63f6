//! The `#[derive(Record)]` macro: generates a `meridian_core::Record`
//! implementation from a struct's fields and `#[meridian(...)]` attributes.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod record;

/// Derives `meridian_core::Record` for a struct.
///
/// # Example
///
/// ```ignore
/// use meridian_macros::Record;
///
/// #[derive(Record)]
/// #[meridian(table = "users")]
/// struct User {
///     #[meridian(primary_key)]
///     id: i64,
///     #[meridian(column = "email_address")]
///     email: Option<String>,
///     posts: Option<Vec<Post>>,
/// }
/// ```
///
/// # Attributes
///
/// Struct-level: `#[meridian(table = "name")]` (required).
///
/// Field-level: `#[meridian(primary_key)]`, `#[meridian(column = "name")]`.
/// A field of shape `Option<Vec<C>>` is treated as a child collection rather
/// than a column; every other field becomes a column, and `Option<T>` marks
/// it nullable.
#[proc_macro_derive(Record, attributes(meridian))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    record::expand(input).unwrap_or_else(|e| e.to_compile_error()).into()
}
