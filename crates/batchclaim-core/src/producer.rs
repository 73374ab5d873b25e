//! Continuous claiming into a bounded stream.
//!
//! The producer loop claims a batch, then pushes its records one at a time
//! into a channel of `buffer_size` slots, waiting for room before each one.
//! A slow consumer therefore slows claiming down instead of piling up leases.
use std::collections::VecDeque;

use futures::{
    FutureExt as _, Stream,
    channel::mpsc,
    future::{FusedFuture, poll_fn},
};
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;

use crate::{
    claimer::{Claimed, Claimer},
    spawner::TaskSpawner,
    store::DocumentStore,
    utils::sleep_or_signal,
};

/// Feeds a [`ClaimStream`] from a [`Claimer`] until shut down.
#[derive(Debug)]
pub struct StreamProducer<S, T, Signal = std::future::Pending<()>> {
    claimer: Claimer<S, T>,
    signal: Signal,
}

impl<S, T> StreamProducer<S, T> {
    /// Buffer size and backoffs come from the claimer's configuration.
    pub fn new(claimer: Claimer<S, T>) -> Self {
        Self {
            claimer,
            signal: std::future::pending(),
        }
    }
}

impl<S, T, Signal> StreamProducer<S, T, Signal> {
    /// Stop claiming once `signal` resolves. Claimed records that were not
    /// handed to the stream yet are released back to pending.
    pub fn with_graceful_shutdown<Signal2>(self, signal: Signal2) -> StreamProducer<S, T, Signal2>
    where
        Signal2: Future<Output = ()> + Send,
    {
        StreamProducer {
            claimer: self.claimer,
            signal,
        }
    }
}

impl<S, T, Signal> StreamProducer<S, T, Signal>
where
    S: DocumentStore + Sync,
    T: DeserializeOwned + Send,
    Signal: Future<Output = ()> + Send,
{
    /// Split into the loop future and the stream it feeds.
    ///
    /// Nothing is claimed until the future is polled. The loop also ends when
    /// the stream is dropped or closed.
    pub fn into_parts(self) -> (impl Future<Output = ()> + Send, ClaimStream<T>) {
        let buffer_size = self.claimer.config().buffer_size;
        // The channel holds `buffer + 1` messages for its single sender.
        let (sender, receiver) = mpsc::channel(buffer_size.saturating_sub(1));
        let driver = run_producer(self.claimer, sender, self.signal);
        (driver, ClaimStream { receiver })
    }

    /// Start the loop on `spawner` and return its handle with the stream.
    pub fn spawn<Sp>(
        self,
        _spawner: Sp,
    ) -> (impl Future<Output = ()> + Send + 'static, ClaimStream<T>)
    where
        Sp: TaskSpawner,
        S: 'static,
        T: 'static,
        Signal: 'static,
    {
        let (driver, stream) = self.into_parts();
        (Sp::spawn(driver), stream)
    }
}

pin_project! {
    /// Claimed records in claim order.
    ///
    /// Ends after the producer stops and every buffered record was read.
    #[derive(Debug)]
    pub struct ClaimStream<T> {
        #[pin]
        receiver: mpsc::Receiver<Claimed<T>>,
    }
}

impl<T> ClaimStream<T> {
    /// Stop the producer without dropping records already buffered; keep
    /// polling the stream to drain them.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl<T> Stream for ClaimStream<T> {
    type Item = Claimed<T>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.project().receiver.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.receiver.size_hint()
    }
}

async fn run_producer<S, T, Signal>(
    claimer: Claimer<S, T>,
    mut sender: mpsc::Sender<Claimed<T>>,
    signal: Signal,
) where
    S: DocumentStore + Sync,
    T: DeserializeOwned + Send,
    Signal: Future<Output = ()> + Send,
{
    let empty_backoff = claimer.config().empty_backoff;
    let error_backoff = claimer.config().error_backoff;
    futures::pin_mut!(signal);
    let mut signal = signal.fuse();

    loop {
        if signal.is_terminated() || sender.is_closed() {
            break;
        }
        let batch = match claimer.claim_batch().await {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(error = %error, "Failed to claim batch");
                if sleep_or_signal(error_backoff, &mut signal).await {
                    break;
                }
                continue;
            }
        };
        if batch.is_empty() {
            tracing::trace!("Queue drained, backing off");
            if sleep_or_signal(empty_backoff, &mut signal).await {
                break;
            }
            continue;
        }
        tracing::debug!(claimed = batch.len(), "Claimed batch");

        let mut undelivered = VecDeque::from(batch);
        let stopped = deliver(&mut sender, &mut undelivered, &mut signal).await;
        if !undelivered.is_empty() {
            // Hold only ids and tokens across the await; `T` may not be `Sync`.
            let leases = undelivered
                .into_iter()
                .map(|claimed| (claimed.id().clone(), claimed.claimed_at()))
                .collect::<Vec<_>>();
            match claimer.release_leases(&leases).await {
                Ok(released) => tracing::debug!(released, "Released undelivered records"),
                Err(error) => {
                    tracing::error!(error = %error, "Failed to release undelivered records")
                }
            }
        }
        if stopped {
            break;
        }
    }
    tracing::trace!("Producer stopped");
}

/// Push records into the channel as room frees up.
///
/// Returns `true` when the producer must stop, leaving whatever was not sent
/// in `queue`.
async fn deliver<T, Signal>(
    sender: &mut mpsc::Sender<Claimed<T>>,
    queue: &mut VecDeque<Claimed<T>>,
    mut signal: &mut Signal,
) -> bool
where
    Signal: FusedFuture<Output = ()> + Unpin,
{
    while !queue.is_empty() {
        if signal.is_terminated() {
            return true;
        }
        let ready = futures::select! {
            ready = poll_fn(|cx| sender.poll_ready(cx)).fuse() => ready.is_ok(),
            _ = signal => false,
        };
        if !ready {
            return true;
        }
        let Some(claimed) = queue.pop_front() else {
            break;
        };
        if let Err(error) = sender.try_send(claimed) {
            let disconnected = error.is_disconnected();
            queue.push_front(error.into_inner());
            if disconnected {
                return true;
            }
        }
    }
    false
}
