use std::{collections::HashSet, sync::Arc, time::Duration};

use batchclaim_core::{
    Claimer, ConditionalUpdate, Configuration, Document, DocumentId, DocumentStore, ErrorKind,
    Filter, LeaseMonitor, MemoryStore, MemoryStoreError, SortKey, StreamProducer,
};
use futures::{FutureExt as _, StreamExt as _};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Job {
    #[serde(rename = "_id")]
    id: u64,
    state: String,
    processing_time: Option<i64>,
    shard: Option<String>,
}

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => unreachable!("fixture must be an object"),
    }
}

fn pending(id: u64) -> Document {
    doc(json!({"_id": id, "state": "pending", "shard": if id % 2 == 0 { "even" } else { "odd" }}))
}

fn claimer<S>(store: S, config: Configuration) -> Claimer<S, Job> {
    Claimer::new(store, config).expect("valid setup")
}

fn count_state(store: &MemoryStore, state: &str) -> usize {
    store
        .documents()
        .iter()
        .filter(|document| document["state"] == json!(state))
        .count()
}

/// Holds every `find` until all barrier parties have read, so they all see the
/// same candidates before anyone writes.
#[derive(Clone)]
struct LockstepStore {
    inner: MemoryStore,
    barrier: Arc<tokio::sync::Barrier>,
}

impl DocumentStore for LockstepStore {
    type Error = MemoryStoreError;

    async fn find(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Self::Error> {
        let found = self.inner.find(filter, sort, limit).await;
        self.barrier.wait().await;
        found
    }

    async fn conditional_update(
        &self,
        update: &ConditionalUpdate,
    ) -> Result<Vec<DocumentId>, Self::Error> {
        self.inner.conditional_update(update).await
    }
}

/// Another worker claims `stolen` right after every read.
#[derive(Clone)]
struct RacingStore {
    inner: MemoryStore,
    stolen: DocumentId,
}

impl DocumentStore for RacingStore {
    type Error = MemoryStoreError;

    async fn find(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Self::Error> {
        let found = self.inner.find(filter, sort, limit).await?;
        let mut set = Document::new();
        set.insert("state".into(), json!("processing"));
        set.insert("processing_time".into(), json!(1));
        self.inner
            .conditional_update(&ConditionalUpdate {
                id_field: "_id".into(),
                ids: vec![self.stolen.clone()],
                guard: Filter::new().equals("state", "pending"),
                set,
            })
            .await?;
        Ok(found)
    }

    async fn conditional_update(
        &self,
        update: &ConditionalUpdate,
    ) -> Result<Vec<DocumentId>, Self::Error> {
        self.inner.conditional_update(update).await
    }
}

#[tokio::test]
async fn successive_claims_drain_the_queue() {
    let store = MemoryStore::with_documents((1..=5).map(pending));
    let claimer = claimer(store.clone(), Configuration::default().fetch_limit(3));

    assert_eq!(claimer.claim_batch().await.expect("first claim").len(), 3);
    assert_eq!(claimer.claim_batch().await.expect("second claim").len(), 2);
    assert!(claimer.claim_batch().await.expect("third claim").is_empty());
    assert_eq!(count_state(&store, "processing"), 5);
}

#[tokio::test]
async fn claimers_on_disjoint_queries_never_meet() {
    let store = MemoryStore::with_documents((1..=6).map(pending));
    let odd = claimer(store.clone(), Configuration::default().fetch_query("shard", "odd"));
    let even = claimer(store.clone(), Configuration::default().fetch_query("shard", "even"));

    let odd_ids = odd
        .claim_batch()
        .await
        .expect("odd claim")
        .iter()
        .map(|claimed| claimed.record().id)
        .collect::<Vec<_>>();
    let even_ids = even
        .claim_batch()
        .await
        .expect("even claim")
        .iter()
        .map(|claimed| claimed.record().id)
        .collect::<Vec<_>>();

    assert_eq!(odd_ids, vec![1, 3, 5]);
    assert_eq!(even_ids, vec![2, 4, 6]);
}

#[tokio::test]
async fn overlapping_claimers_split_the_documents() {
    let inner = MemoryStore::with_documents((1..=4).map(pending));
    let store = LockstepStore {
        inner: inner.clone(),
        barrier: Arc::new(tokio::sync::Barrier::new(2)),
    };
    let first = claimer(store.clone(), Configuration::default());
    let second = claimer(store, Configuration::default());

    let (a, b) = tokio::join!(first.claim_batch(), second.claim_batch());
    let a = a.expect("first claim");
    let b = b.expect("second claim");

    let a_ids = a.iter().map(|claimed| claimed.id().clone()).collect::<HashSet<_>>();
    let b_ids = b.iter().map(|claimed| claimed.id().clone()).collect::<HashSet<_>>();
    assert!(a_ids.is_disjoint(&b_ids));
    assert_eq!(a_ids.len() + b_ids.len(), 4);
    assert_eq!(count_state(&inner, "processing"), 4);
}

#[tokio::test]
async fn claim_reports_only_what_its_write_matched() {
    let inner = MemoryStore::with_documents((1..=4).map(pending));
    let store = RacingStore {
        inner: inner.clone(),
        stolen: DocumentId::Unsigned(2),
    };
    let claimed = claimer(store, Configuration::default())
        .claim_batch()
        .await
        .expect("claim succeeds");

    let ids = claimed
        .iter()
        .map(|claimed| claimed.record().id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 3, 4]);
    let stolen = inner.get("_id", &DocumentId::Unsigned(2)).expect("stored");
    assert_eq!(stolen["processing_time"], json!(1));
}

#[tokio::test]
async fn expired_leases_are_claimable_again() {
    let store = MemoryStore::with_documents((1..=3).map(pending));
    let config = Configuration::default().lease_timeout(Duration::from_millis(30));
    let first = claimer(store.clone(), config.clone());
    let second = claimer(store.clone(), config.clone());
    let monitor = LeaseMonitor::new(store.clone(), config).expect("valid configuration");

    let stale = first.claim_batch().await.expect("first claim");
    first.complete(&stale[0]).await.expect("lease held");
    assert_eq!(monitor.sweep_expired_leases().await.expect("sweep"), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(monitor.sweep_expired_leases().await.expect("sweep"), 2);
    assert_eq!(count_state(&store, "processed"), 1);

    let fresh = second.claim_batch().await.expect("second claim");
    assert_eq!(fresh.len(), 2);

    // The first worker wakes up late: its token no longer matches.
    let error = first.complete(&stale[1]).await.expect_err("lease lost");
    assert_eq!(error.kind(), ErrorKind::LostLease);
    second.complete(&fresh[0]).await.expect("lease held");
}

#[tokio::test]
async fn heartbeat_keeps_a_lease_alive() {
    let store = MemoryStore::with_documents([pending(1)]);
    let config = Configuration::default().lease_timeout(Duration::from_millis(40));
    let claimer = claimer(store.clone(), config.clone());
    let monitor = LeaseMonitor::new(store.clone(), config).expect("valid configuration");

    let mut claimed = claimer.claim_batch().await.expect("claim").remove(0);
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        claimer.heartbeat(&mut claimed).await.expect("lease held");
        assert_eq!(monitor.sweep_expired_leases().await.expect("sweep"), 0);
    }
    claimer.complete(&claimed).await.expect("lease held");
}

#[tokio::test]
async fn monitor_loop_reverts_abandoned_claims() {
    let store = MemoryStore::with_documents((1..=2).map(pending));
    let config = Configuration::default()
        .lease_timeout(Duration::from_millis(20))
        .sweep_interval(Duration::from_millis(10));
    let claimer = claimer(store.clone(), config);
    assert_eq!(claimer.claim_batch().await.expect("claim").len(), 2);

    let token = CancellationToken::new();
    let monitor = tokio::spawn(
        claimer
            .lease_monitor()
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .run(),
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        while count_state(&store, "pending") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("leases reverted");

    token.cancel();
    monitor.await.expect("monitor exits cleanly");
}

#[tokio::test]
async fn stream_never_holds_more_than_the_buffer() {
    let store = MemoryStore::with_documents((1..=10).map(pending));
    let config = Configuration::default().fetch_limit(10).buffer_size(3);
    let (driver, mut stream) = StreamProducer::new(claimer(store.clone(), config)).into_parts();
    let mut driver = Box::pin(driver);

    assert!(futures::poll!(&mut driver).is_pending());
    let mut delivered = Vec::new();
    while let Some(Some(claimed)) = stream.next().now_or_never() {
        delivered.push(claimed.record().id);
    }
    assert_eq!(delivered, vec![1, 2, 3]);
    assert_eq!(count_state(&store, "processing"), 10);

    // Room again: the producer tops the buffer back up, in order.
    assert!(futures::poll!(&mut driver).is_pending());
    while let Some(Some(claimed)) = stream.next().now_or_never() {
        delivered.push(claimed.record().id);
    }
    assert_eq!(delivered, vec![1, 2, 3, 4, 5, 6]);

    drop(stream);
    driver.await;
    assert_eq!(count_state(&store, "processing"), 6);
    assert_eq!(count_state(&store, "pending"), 4);
    assert!(
        store
            .documents()
            .iter()
            .filter(|document| document["state"] == json!("pending"))
            .all(|document| document["processing_time"] == json!(0))
    );
}

#[tokio::test]
async fn producer_recovers_from_store_errors() {
    let store = MemoryStore::with_documents((1..=3).map(pending));
    store.fail_next(2);
    let config = Configuration::default().error_backoff(Duration::from_millis(5));
    let token = CancellationToken::new();
    let (driver, stream) = StreamProducer::new(claimer(store.clone(), config))
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .into_parts();
    let driver = tokio::spawn(driver);

    let ids = tokio::time::timeout(
        Duration::from_secs(5),
        stream.take(3).map(|claimed| claimed.record().id).collect::<Vec<_>>(),
    )
    .await
    .expect("records arrive after the backoff");
    assert_eq!(ids, vec![1, 2, 3]);

    token.cancel();
    driver.await.expect("producer exits cleanly");
}

#[tokio::test]
async fn shutdown_releases_what_was_not_delivered() {
    let store = MemoryStore::with_documents((1..=5).map(pending));
    let config = Configuration::default().buffer_size(1);
    let token = CancellationToken::new();
    let (driver, mut stream) = StreamProducer::new(claimer(store.clone(), config))
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .into_parts();
    let driver = tokio::spawn(driver);

    let first = stream.next().await.expect("first record");
    token.cancel();
    driver.await.expect("producer exits cleanly");

    // Whatever made it into the buffer before shutdown is still readable.
    let buffered = stream.collect::<Vec<_>>().await;
    let delivered = 1 + buffered.len();
    assert_eq!(first.record().id, 1);
    assert_eq!(count_state(&store, "processing"), delivered);
    assert_eq!(count_state(&store, "pending"), 5 - delivered);
}
