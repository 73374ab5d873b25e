//! Error types.
//!
//! Setup failures (`SchemaError`, `ConfigError`, wrapped in [`SetupError`])
//! are fatal and surface before any loop starts. Runtime failures are an
//! [`Error`] carrying an [`ErrorKind`]; the producer and lease monitor absorb
//! them and retry, direct callers decide for themselves.
use crate::{config::ConfigError, schema::SchemaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of runtime failures.
pub enum ErrorKind {
    /// The store rejected or failed a read or write. Transient.
    Store,
    /// A stored document could not be decoded into the record type.
    Decode,
    /// A consumer transition matched nothing: the lease expired or another
    /// worker holds the document now.
    LostLease,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    pub(crate) fn new_store<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error {
            kind: ErrorKind::Store,
            inner: Box::new(error),
        }
    }

    pub(crate) fn lost_lease(id: &crate::store::DocumentId) -> Self {
        Error {
            kind: ErrorKind::LostLease,
            inner: Box::new(LostLeaseError(id.to_string())),
        }
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Decode,
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
struct LostLeaseError(String);

impl std::fmt::Display for LostLeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lost lease for document {}", self.0)
    }
}

impl std::error::Error for LostLeaseError {}

/// Anything that prevents a claim session from being set up.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("record type does not match the document schema: {0}")]
    Schema(#[from] SchemaError),
}
