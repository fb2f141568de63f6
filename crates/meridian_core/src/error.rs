use thiserror::Error;

/// Failures raised while deriving a [`TableSchema`](crate::schema::TableSchema)
/// from a record type's structural metadata.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("field `{field}` has unsupported type `{type_name}`")]
    UnsupportedFieldType { field: &'static str, type_name: &'static str },

    #[error("record type declares more than one primary key column (`{first}` and `{second}`)")]
    AmbiguousPrimaryKey { first: &'static str, second: &'static str },

    #[error("child collection field `{field}` does not resolve to a record type")]
    InvalidChildCollection { field: &'static str },
}

/// Failures raised while building or advancing a query algebra chain.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("operation `{op}` is not legal after `{after}`")]
    IllegalChain { after: &'static str, op: &'static str },

    #[error("field `{field}` is already joined in this chain")]
    DuplicateJoin { field: &'static str },

    #[error("field `{field}` is not a child-collection field of `{form}`")]
    NotAChildCollection { form: &'static str, field: &'static str },

    #[error("operation requires a primary key, but `{form}` has none")]
    MissingPrimaryKey { form: &'static str },

    #[error("form `{form}` has no column named `{column}`")]
    UnknownColumn { form: &'static str, column: &'static str },
}

/// Failures raised while lowering the query algebra into SQL text.
#[derive(Debug, Error)]
pub enum SqlGenError {
    #[error("column `{column}` referenced on form `{form}`, which is not part of this chain")]
    UnresolvedForm { form: &'static str, column: &'static str },

    #[error("form `{form}` has no column named `{column}`")]
    UnknownColumn { form: &'static str, column: &'static str },
}

/// Failures reported by the driver while preparing, binding, or stepping a statement.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SqlExecError {
    pub message: String,
    pub sql: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SqlExecError {
    pub fn new(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self { message: message.into(), sql: sql.into(), source: None }
    }

    pub fn wrap(
        sql: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: source.to_string(),
            sql: sql.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failures raised while decoding a driver-returned row into a record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("column `{column}` missing from row at index {index}")]
    MissingColumn { column: &'static str, index: usize },

    #[error("column `{column}` expected type `{expected}` but driver returned `{actual}`")]
    TypeMismatch { column: &'static str, expected: &'static str, actual: &'static str },

    #[error("column `{column}` is NULL but field is not nullable")]
    UnexpectedNull { column: &'static str },
}

/// Failures raised while encoding a [`Value`](crate::value::Value) for binding.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("value of shape `{shape}` cannot be bound to a `{expected}` column")]
    UnsupportedShape { shape: &'static str, expected: &'static str },
}

/// The union of every failure mode the core can surface to a caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    SqlGen(#[from] SqlGenError),
    #[error(transparent)]
    SqlExec(#[from] SqlExecError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
