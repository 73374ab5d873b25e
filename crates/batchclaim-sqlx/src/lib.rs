//! PostgreSQL document store.
//!
//! Each collection is a table holding one JSON document per row in a `body
//! jsonb` column. Filters, ordering and guarded updates are evaluated by
//! PostgreSQL on the JSON fields, so several processes can claim from the
//! same table.
pub use batchclaim_core;
pub use sqlx::PgPool;

pub mod client;
pub mod store;

pub use client::Client;
pub use store::PgDocumentStore;

const DEFAULT_COLLECTION_NAME: &str = "batch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures raised by this crate.
pub enum ErrorKind {
    /// Errors originating from database interactions.
    DataBase,
    /// A document could not be encoded for storage.
    Encode,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::DataBase,
            inner: Box::new(value),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Encode,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct NotAnObjectError;

impl std::fmt::Display for NotAnObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("document must serialize to a JSON object")
    }
}

impl std::error::Error for NotAnObjectError {}

/// Quote an SQL identifier (table or index name).
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal, for DDL where parameters are not allowed.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `body -> 'field'`. Field names come from configuration and are inlined so
/// queries match the expression indexes built by [`Client::create_index`].
fn field_expr(field: &str) -> String {
    format!("body -> {}", quote_literal(field))
}
