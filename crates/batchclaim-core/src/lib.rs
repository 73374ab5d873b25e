//! Claim batches of documents from a shared collection.
//!
//! Several workers may read the same pending documents; the store's
//! conditional update decides who owns each one. The crate is layered:
//! - [`ValidatedSchema`] checks once that a record type can carry the id,
//!   state and processing-time fields, then decodes documents into it.
//! - [`DocumentStore`] is the only thing a backend implements: a filtered,
//!   sorted read and a guarded bulk write reporting what it matched.
//! - [`Claimer`] runs one claim cycle and the consumer transitions after it.
//! - [`LeaseMonitor`] returns abandoned claims to pending.
//! - [`StreamProducer`] turns repeated claims into a bounded stream.
pub mod claimer;
pub mod config;
pub mod error;
pub mod lease;
pub mod memory;
pub mod producer;
pub mod schema;
pub mod spawner;
pub mod store;
pub mod utils;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::{TokioSpawner, TokioTaskHandle};

pub use claimer::{Claimed, Claimer};
pub use config::{ConfigError, Configuration, FieldBindings, StateValues};
pub use error::{Error, ErrorKind, SetupError};
pub use lease::{LeaseMonitor, LeaseMonitorWithGracefulShutdown, TickStream};
pub use memory::{MemoryStore, MemoryStoreError};
pub use producer::{ClaimStream, StreamProducer};
pub use schema::{FieldKind, FieldRole, SchemaError, ValidatedSchema};
pub use spawner::{InlineSpawner, TaskSpawner};
pub use store::{
    Comparison, Condition, ConditionalUpdate, Direction, Document, DocumentId, DocumentStore,
    Filter, LocalDocumentStore, SortKey,
};
