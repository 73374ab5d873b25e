//! One claim cycle, plus the transitions a consumer applies afterwards.
//!
//! A claim reads pending candidates, then moves them to processing with a
//! single guarded write. Two claimers may read overlapping candidates; the
//! guard lets only one write win each document, and each claimer returns
//! exactly the documents its own write matched.
//!
//! The processing time written by a claim doubles as the lease token: every
//! later transition on the document is guarded by it, so a worker whose lease
//! expired and was re-claimed elsewhere gets [`ErrorKind::LostLease`] instead
//! of finishing someone else's claim.
//!
//! [`ErrorKind::LostLease`]: crate::ErrorKind::LostLease
use std::{collections::HashSet, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    Error, SetupError,
    config::Configuration,
    lease::LeaseMonitor,
    schema::ValidatedSchema,
    store::{ConditionalUpdate, Document, DocumentId, DocumentStore, Filter},
    utils::now_millis,
};

/// A record this worker moved to processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed<T> {
    id: DocumentId,
    claimed_at: i64,
    record: T,
}

impl<T> Claimed<T> {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Processing time written by the claim (or the last heartbeat), in
    /// milliseconds since the Unix epoch.
    pub fn claimed_at(&self) -> i64 {
        self.claimed_at
    }

    pub fn record(&self) -> &T {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut T {
        &mut self.record
    }

    pub fn into_inner(self) -> T {
        self.record
    }
}

/// Claims batches from one collection for one record type.
#[derive(Debug)]
pub struct Claimer<S, T> {
    store: S,
    config: Arc<Configuration>,
    schema: ValidatedSchema<T>,
}

impl<S, T> Clone for Claimer<S, T>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl<S, T> Claimer<S, T>
where
    T: DeserializeOwned,
{
    /// Check the configuration and validate `T` against its field bindings.
    pub fn new(store: S, config: Configuration) -> Result<Self, SetupError> {
        config.validate()?;
        let schema = ValidatedSchema::<T>::validate(&config.fields)?;
        Ok(Self {
            store,
            config: Arc::new(config),
            schema,
        })
    }
}

impl<S, T> Claimer<S, T> {
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn schema(&self) -> &ValidatedSchema<T> {
        &self.schema
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lease monitor sharing this claimer's store and configuration.
    pub fn lease_monitor(&self) -> LeaseMonitor<S>
    where
        S: Clone,
    {
        LeaseMonitor::from_shared(self.store.clone(), self.config.clone())
    }

    fn state_update(&self, ids: Vec<DocumentId>, guard: Filter, set: Document) -> ConditionalUpdate {
        ConditionalUpdate {
            id_field: self.config.fields.id.clone(),
            ids,
            guard,
            set,
        }
    }

    fn lease_guard(&self, claimed_at: i64) -> Filter {
        let fields = &self.config.fields;
        Filter::new()
            .equals(fields.state.clone(), self.config.states.processing.clone())
            .equals(fields.processing_time.clone(), claimed_at)
    }

    fn set_state(&self, state: &str, processing_time: Option<i64>) -> Document {
        let fields = &self.config.fields;
        let mut set = Document::new();
        set.insert(fields.state.clone(), Value::from(state));
        if let Some(millis) = processing_time {
            set.insert(fields.processing_time.clone(), Value::from(millis));
        }
        set
    }
}

impl<S, T> Claimer<S, T>
where
    S: DocumentStore,
    T: DeserializeOwned,
{
    /// Claim up to `fetch_limit` pending documents.
    ///
    /// An empty result means the queue is exhausted for now. A result shorter
    /// than the read means a concurrent claimer won some documents; only the
    /// documents this call transitioned are returned, in fetch order.
    pub async fn claim_batch(&self) -> Result<Vec<Claimed<T>>, Error> {
        let config = &self.config;
        let fields = &config.fields;
        let states = &config.states;

        let pending = Filter::from(&config.fetch_query)
            .equals(fields.state.clone(), states.pending.clone());
        let documents = self
            .store
            .find(&pending, &config.fetch_order, Some(config.fetch_limit))
            .await
            .map_err(Error::new_store)?;
        if documents.is_empty() {
            tracing::trace!("No pending documents");
            return Ok(Vec::new());
        }

        let now = now_millis();
        let mut seen = HashSet::with_capacity(documents.len());
        let mut candidates = Vec::with_capacity(documents.len());
        let mut poisoned = Vec::new();
        for mut document in documents {
            let Some(id) = self.schema.extract_id(&document) else {
                tracing::warn!(field = %fields.id, "Skipping document without a usable id");
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            // Decode the document as it will look once the claim is written.
            self.schema.set_state(&mut document, &states.processing);
            self.schema.set_processing_time(&mut document, now);
            match self.schema.bind(document) {
                Ok(record) => candidates.push(Claimed {
                    id,
                    claimed_at: now,
                    record,
                }),
                Err(error) => {
                    tracing::error!(error = %error, document_id = %id, "Cannot decode document, marking it failed");
                    poisoned.push(id);
                }
            }
        }

        if !poisoned.is_empty() {
            let update = self.state_update(
                poisoned,
                Filter::new().equals(fields.state.clone(), states.pending.clone()),
                self.set_state(&states.failed, None),
            );
            self.store
                .conditional_update(&update)
                .await
                .map_err(Error::new_store)?;
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let update = self.state_update(
            candidates.iter().map(|claimed| claimed.id.clone()).collect(),
            Filter::new().equals(fields.state.clone(), states.pending.clone()),
            self.set_state(&states.processing, Some(now)),
        );
        let matched = self
            .store
            .conditional_update(&update)
            .await
            .map_err(Error::new_store)?
            .into_iter()
            .collect::<HashSet<_>>();

        if matched.len() < candidates.len() {
            tracing::debug!(
                read = candidates.len(),
                claimed = matched.len(),
                "Concurrent claimer won part of the batch"
            );
        }
        candidates.retain(|claimed| matched.contains(&claimed.id));
        Ok(candidates)
    }

    /// Mark a claimed record processed.
    pub async fn complete(&self, claimed: &Claimed<T>) -> Result<(), Error> {
        let set = self.set_state(&self.config.states.processed, None);
        self.finish_one(claimed, set).await
    }

    /// Mark a claimed record failed. It will not be claimed again.
    pub async fn fail(&self, claimed: &Claimed<T>) -> Result<(), Error> {
        let set = self.set_state(&self.config.states.failed, None);
        self.finish_one(claimed, set).await
    }

    /// Extend the lease on a claimed record by refreshing its processing
    /// time. The handle's token is updated on success.
    pub async fn heartbeat(&self, claimed: &mut Claimed<T>) -> Result<(), Error> {
        let now = now_millis().max(claimed.claimed_at);
        let set = self.set_state(&self.config.states.processing, Some(now));
        self.finish_one(claimed, set).await?;
        claimed.claimed_at = now;
        Ok(())
    }

    /// Hand claimed records back to pending without waiting for their lease
    /// to expire. Returns how many were still held and got released.
    pub async fn release(&self, claimed: &[Claimed<T>]) -> Result<usize, Error> {
        let leases = claimed
            .iter()
            .map(|claimed| (claimed.id.clone(), claimed.claimed_at))
            .collect::<Vec<_>>();
        self.release_leases(&leases).await
    }

    /// Release by `(id, claimed_at)` pairs, for callers that kept only the
    /// lease tokens.
    pub async fn release_leases(&self, leases: &[(DocumentId, i64)]) -> Result<usize, Error> {
        let mut tokens = leases
            .iter()
            .map(|(_, claimed_at)| *claimed_at)
            .collect::<Vec<_>>();
        tokens.sort_unstable();
        tokens.dedup();

        let mut released = 0;
        for claimed_at in tokens {
            let ids = leases
                .iter()
                .filter(|(_, token)| *token == claimed_at)
                .map(|(id, _)| id.clone())
                .collect();
            let update = self.state_update(
                ids,
                self.lease_guard(claimed_at),
                self.set_state(&self.config.states.pending, Some(0)),
            );
            released += self
                .store
                .conditional_update(&update)
                .await
                .map_err(Error::new_store)?
                .len();
        }
        Ok(released)
    }

    async fn finish_one(&self, claimed: &Claimed<T>, set: Document) -> Result<(), Error> {
        let update = self.state_update(
            vec![claimed.id.clone()],
            self.lease_guard(claimed.claimed_at),
            set,
        );
        let matched = self
            .store
            .conditional_update(&update)
            .await
            .map_err(Error::new_store)?;
        if matched.is_empty() {
            return Err(Error::lost_lease(&claimed.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, memory::MemoryStore, schema::SchemaError};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Task {
        #[serde(rename = "_id")]
        id: u64,
        state: String,
        processing_time: Option<i64>,
        payload: String,
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Untyped {
        #[serde(rename = "_id")]
        id: u64,
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("fixture must be an object"),
        }
    }

    fn pending(id: u64) -> Document {
        doc(json!({"_id": id, "state": "pending", "payload": format!("task-{id}")}))
    }

    fn claimer(store: &MemoryStore, limit: usize) -> Claimer<MemoryStore, Task> {
        Claimer::new(store.clone(), Configuration::default().fetch_limit(limit))
            .expect("valid setup")
    }

    #[test]
    fn setup_rejects_unusable_record_types() {
        let error = Claimer::<_, Untyped>::new(MemoryStore::new(), Configuration::default())
            .expect_err("record type lacks the state field");
        assert!(matches!(
            error,
            SetupError::Schema(SchemaError::MissingField { .. })
        ));
    }

    #[tokio::test]
    async fn claimed_records_reflect_the_write() {
        let store = MemoryStore::with_documents((1..=2).map(pending));
        let claimed = claimer(&store, 10).claim_batch().await.expect("claim succeeds");

        assert_eq!(claimed.len(), 2);
        for item in &claimed {
            assert_eq!(item.record().state, "processing");
            assert_eq!(item.record().processing_time, Some(item.claimed_at()));
            assert_eq!(item.record().payload, format!("task-{}", item.record().id));
            let stored = store.get("_id", item.id()).expect("stored");
            assert_eq!(stored["state"], json!("processing"));
            assert_eq!(stored["processing_time"], json!(item.claimed_at()));
        }
    }

    #[tokio::test]
    async fn fetch_query_and_order_select_candidates() {
        let store = MemoryStore::with_documents([
            doc(json!({"_id": 1, "state": "pending", "payload": "a", "kind": "x", "rank": 2})),
            doc(json!({"_id": 2, "state": "pending", "payload": "b", "kind": "y", "rank": 1})),
            doc(json!({"_id": 3, "state": "pending", "payload": "c", "kind": "x", "rank": 1})),
        ]);
        let config = Configuration::default()
            .fetch_query("kind", "x")
            .fetch_order(vec![crate::store::SortKey::ascending("rank")]);
        let claimer = Claimer::<_, Task>::new(store.clone(), config).expect("valid setup");

        let ids = claimer
            .claim_batch()
            .await
            .expect("claim succeeds")
            .iter()
            .map(|claimed| claimed.record().id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn undecodable_documents_are_marked_failed() {
        let store = MemoryStore::with_documents([
            pending(1),
            doc(json!({"_id": 2, "state": "pending", "payload": 42})),
        ]);
        let claimed = claimer(&store, 10).claim_batch().await.expect("claim succeeds");

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), &DocumentId::Unsigned(1));
        let poisoned = store.get("_id", &DocumentId::Unsigned(2)).expect("stored");
        assert_eq!(poisoned["state"], json!("failed"));
    }

    #[tokio::test]
    async fn store_errors_abort_the_cycle() {
        let store = MemoryStore::with_documents((1..=3).map(pending));
        let claimer = claimer(&store, 10);

        store.fail_next(1);
        let error = claimer.claim_batch().await.expect_err("read fails");
        assert_eq!(error.kind(), ErrorKind::Store);
        assert!(
            store
                .documents()
                .iter()
                .all(|document| document["state"] == json!("pending"))
        );
    }

    #[tokio::test]
    async fn consumer_transitions_require_the_lease() {
        let store = MemoryStore::with_documents((1..=3).map(pending));
        let claimer = claimer(&store, 10);
        let mut claimed = claimer.claim_batch().await.expect("claim succeeds");

        claimer.complete(&claimed[0]).await.expect("lease held");
        claimer.fail(&claimed[1]).await.expect("lease held");
        assert_eq!(
            claimer.complete(&claimed[0]).await.map_err(|e| e.kind()),
            Err(ErrorKind::LostLease)
        );

        claimer.heartbeat(&mut claimed[2]).await.expect("lease held");
        let stored = store.get("_id", claimed[2].id()).expect("stored");
        assert_eq!(stored["processing_time"], json!(claimed[2].claimed_at()));

        assert_eq!(store.get("_id", claimed[0].id()).expect("stored")["state"], json!("processed"));
        assert_eq!(store.get("_id", claimed[1].id()).expect("stored")["state"], json!("failed"));
    }

    #[tokio::test]
    async fn released_records_can_be_claimed_again() {
        let store = MemoryStore::with_documents((1..=2).map(pending));
        let claimer = claimer(&store, 10);
        let claimed = claimer.claim_batch().await.expect("claim succeeds");

        assert_eq!(claimer.release(&claimed).await.expect("release succeeds"), 2);
        assert_eq!(claimer.release(&claimed).await.expect("release succeeds"), 0);
        assert_eq!(claimer.claim_batch().await.expect("claim succeeds").len(), 2);
    }
}
