//! Claim bounded batches of documents from a shared store, recover abandoned
//! claims, and stream claimed records to consumers.
pub use batchclaim_core::{
    ClaimStream, Claimed, Claimer, ConfigError, Configuration, Document, DocumentId,
    DocumentStore, Error, ErrorKind, FieldBindings, Filter, InlineSpawner, LeaseMonitor,
    MemoryStore, SetupError, SortKey, StateValues, StreamProducer, TaskSpawner, ValidatedSchema,
};
pub use batchclaim_core::{claimer, config, lease, memory, producer, schema, spawner, store};

#[cfg(feature = "rt-tokio")]
pub use batchclaim_core::TokioSpawner;

#[cfg(feature = "postgres")]
pub use batchclaim_sqlx::{Client, PgDocumentStore, PgPool};
