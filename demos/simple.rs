use std::{collections::HashSet, time::Duration};

use batchclaim::{
    Claimer, Configuration, Document, MemoryStore, StreamProducer, TokioSpawner,
};
use futures::StreamExt as _;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Email {
    #[serde(rename = "_id")]
    id: u64,
    state: String,
    processing_time: Option<i64>,
    to: String,
}

fn email(id: u64) -> Document {
    let serde_json::Value::Object(document) = serde_json::json!({
        "_id": id,
        "state": "pending",
        "to": format!("user{id}@example.com"),
    }) else {
        unreachable!()
    };
    document
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let token = tokio_util::sync::CancellationToken::new();

    let store = MemoryStore::with_documents((0..20).map(email));
    let config = Configuration::new("emails")
        .fetch_limit(5)
        .buffer_size(4)
        .lease_timeout(Duration::from_secs(2))
        .sweep_interval(Duration::from_secs(1))
        .empty_backoff(Duration::from_millis(500));
    let claimer = Claimer::<_, Email>::new(store.clone(), config).unwrap();

    let monitor = claimer
        .lease_monitor()
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .run();
    let (producer, mut stream) = StreamProducer::new(claimer.clone())
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .spawn(TokioSpawner);

    let consumer = async move {
        // Walk away from a few emails once; the monitor hands them back.
        let mut abandoned = HashSet::new();
        while let Some(claimed) = stream.next().await {
            let email = claimed.record();
            if email.id % 7 == 3 && abandoned.insert(email.id) {
                tracing::warn!(id = email.id, "Abandon email");
                continue;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            match claimer.complete(&claimed).await {
                Ok(()) => tracing::info!(id = email.id, to = %email.to, "Sent email"),
                Err(error) => tracing::error!(error = %error, "Failed to complete email"),
            }
        }
    };

    let stop = async move {
        let all_sent = async {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                let sent = store
                    .documents()
                    .iter()
                    .filter(|document| document["state"] == "processed")
                    .count();
                if sent == 20 {
                    break;
                }
            }
        };
        tokio::select! {
            _ = all_sent => tracing::info!("All emails sent"),
            _ = tokio::signal::ctrl_c() => {},
        }
        token.cancel();
    };

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(monitor);
    tasks.spawn(producer);
    tasks.spawn(consumer);
    tasks.spawn(stop);

    tasks.join_all().await;
}
