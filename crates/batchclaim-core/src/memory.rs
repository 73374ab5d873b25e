//! In-process document store.
//!
//! Every operation runs under one lock, so each read and each conditional
//! write is atomic, which is the same guarantee a real document store gives
//! per statement. Useful for tests, demos and single-process deployments.
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use crate::store::{ConditionalUpdate, Document, DocumentId, DocumentStore, Filter, SortKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    /// Raised by [`MemoryStore::fail_next`].
    Injected,
}

impl std::fmt::Display for MemoryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryStoreError::Injected => f.write_str("injected store failure"),
        }
    }
}

impl std::error::Error for MemoryStoreError {}

/// Shared, cloneable in-memory collection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Mutex<Vec<Document>>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I>(documents: I) -> Self
    where
        I: IntoIterator<Item = Document>,
    {
        let store = Self::new();
        store.lock().extend(documents);
        store
    }

    /// Append a document. Insertion order is the store order.
    pub fn insert(&self, document: Document) {
        self.lock().push(document);
    }

    /// Copy of every stored document, in store order.
    pub fn documents(&self) -> Vec<Document> {
        self.lock().clone()
    }

    /// First document whose `id_field` equals `id`.
    pub fn get(&self, id_field: &str, id: &DocumentId) -> Option<Document> {
        let wanted = id.to_value();
        self.lock()
            .iter()
            .find(|document| document.get(id_field) == Some(&wanted))
            .cloned()
    }

    /// Make the next `count` operations fail with
    /// [`MemoryStoreError::Injected`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Document>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self) -> Result<(), MemoryStoreError> {
        let took = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match took {
            Ok(_) => Err(MemoryStoreError::Injected),
            Err(_) => Ok(()),
        }
    }
}

impl DocumentStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn find(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Self::Error> {
        self.injected_failure()?;

        let mut found = self
            .lock()
            .iter()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect::<Vec<_>>();
        // Stable: ties keep store order.
        found.sort_by(|a, b| {
            sort.iter()
                .map(|key| key.compare(a, b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn conditional_update(
        &self,
        update: &ConditionalUpdate,
    ) -> Result<Vec<DocumentId>, Self::Error> {
        self.injected_failure()?;

        let wanted = update
            .ids
            .iter()
            .map(DocumentId::to_value)
            .collect::<Vec<_>>();
        let mut documents = self.lock();
        let mut matched = Vec::new();
        for document in documents.iter_mut() {
            let Some(id) = document.get(&update.id_field) else {
                continue;
            };
            if !wanted.contains(id) || !update.guard.matches(document) {
                continue;
            }
            if let Some(id) = DocumentId::from_value(id) {
                matched.push(id);
            }
            for (field, value) in &update.set {
                document.insert(field.clone(), value.clone());
            }
        }
        Ok(matched)
    }
}
