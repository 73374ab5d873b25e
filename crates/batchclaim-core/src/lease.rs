//! Lease expiry.
//!
//! A claimed document whose consumer crashed would stay `processing` forever.
//! The monitor periodically moves documents whose processing time is older
//! than the lease timeout back to pending so another claim can pick them up.
use std::{collections::HashSet, sync::Arc};

use futures::{FutureExt as _, Stream, StreamExt as _};
use serde_json::Value;

use crate::{
    Error,
    config::{ConfigError, Configuration},
    store::{ConditionalUpdate, Document, DocumentId, DocumentStore, Filter},
    utils::{Ticker, now_millis},
};

/// Stream that wakes the monitor to sweep.
pub trait TickStream: Stream<Item = ()> + Send {}

impl<St> TickStream for St where St: Stream<Item = ()> + Send {}

/// Reverts expired leases on every tick.
pub struct LeaseMonitor<S, Tick = Ticker> {
    store: S,
    config: Arc<Configuration>,
    tick: Tick,
}

impl<S> LeaseMonitor<S> {
    /// Sweep every `sweep_interval`.
    pub fn new(store: S, config: Configuration) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_shared(store, Arc::new(config)))
    }

    pub(crate) fn from_shared(store: S, config: Arc<Configuration>) -> Self {
        let tick = Ticker::new(config.sweep_interval);
        Self {
            store,
            config,
            tick,
        }
    }
}

impl<S, Tick> LeaseMonitor<S, Tick> {
    /// Replace the tick stream (sweep on demand, throttle, etc.).
    pub fn modify_stream<ModFn, Tick2>(self, func: ModFn) -> LeaseMonitor<S, Tick2>
    where
        ModFn: FnOnce(Tick) -> Tick2,
        Tick2: TickStream,
    {
        let Self {
            store,
            config,
            tick,
        } = self;
        LeaseMonitor {
            store,
            config,
            tick: func(tick),
        }
    }

    /// Stop sweeping once `signal` resolves.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> LeaseMonitorWithGracefulShutdown<S, Tick, Signal>
    where
        Signal: Future<Output = ()> + Send,
    {
        LeaseMonitorWithGracefulShutdown {
            monitor: self,
            signal,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, Tick> LeaseMonitor<S, Tick>
where
    S: DocumentStore,
{
    /// Revert every lease older than `lease_timeout` to pending.
    ///
    /// Returns how many documents were actually reverted. A document that
    /// was completed or re-claimed between the read and the write is left
    /// alone.
    pub async fn sweep_expired_leases(&self) -> Result<usize, Error> {
        sweep(&self.store, &self.config).await
    }
}

impl<S, Tick> LeaseMonitor<S, Tick>
where
    S: DocumentStore + Sync,
    Tick: TickStream,
{
    /// Sweep until the tick stream ends (or forever).
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_monitor(self.store, self.config, self.tick, std::future::pending::<()>())
    }
}

/// Monitor variant that stops on a shutdown signal.
pub struct LeaseMonitorWithGracefulShutdown<S, Tick, Signal> {
    monitor: LeaseMonitor<S, Tick>,
    signal: Signal,
}

impl<S, Tick, Signal> LeaseMonitorWithGracefulShutdown<S, Tick, Signal>
where
    S: DocumentStore + Sync,
    Tick: TickStream,
    Signal: Future<Output = ()> + Send,
{
    /// Sweep until shutdown. A sweep already in progress finishes first.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        let LeaseMonitor {
            store,
            config,
            tick,
        } = self.monitor;
        run_monitor(store, config, tick, self.signal)
    }
}

async fn run_monitor<S, Tick, Signal>(
    store: S,
    config: Arc<Configuration>,
    tick: Tick,
    signal: Signal,
) where
    S: DocumentStore + Sync,
    Tick: TickStream,
    Signal: Future<Output = ()> + Send,
{
    futures::pin_mut!(tick);
    futures::pin_mut!(signal);
    let mut tick = tick.fuse();
    let mut signal = signal.fuse();
    loop {
        futures::select! {
            tick_val = tick.next() => {
                if tick_val.is_none() { break; }

                match sweep(&store, &config).await {
                    Ok(0) => {},
                    Ok(reverted) => tracing::info!(reverted, "Reverted expired leases"),
                    Err(error) => tracing::error!(error = %error, "Failed to sweep expired leases"),
                }
            },
            _ = signal => {
                tracing::trace!("received graceful shutdown signal. stop sweeping");
                break;
            }
        }
    }
}

async fn sweep<S>(store: &S, config: &Configuration) -> Result<usize, Error>
where
    S: DocumentStore,
{
    let fields = &config.fields;
    let timeout = i64::try_from(config.lease_timeout.as_millis()).unwrap_or(i64::MAX);
    let cutoff = now_millis().saturating_sub(timeout);
    let expired = Filter::new()
        .equals(fields.state.clone(), config.states.processing.clone())
        .less_than(fields.processing_time.clone(), cutoff);

    let documents = store
        .find(&expired, &[], None)
        .await
        .map_err(Error::new_store)?;
    let mut seen = HashSet::with_capacity(documents.len());
    let ids = documents
        .iter()
        .filter_map(|document| document.get(&fields.id).and_then(DocumentId::from_value))
        .filter(|id| seen.insert(id.clone()))
        .collect::<Vec<_>>();
    if ids.is_empty() {
        return Ok(0);
    }

    let mut set = Document::new();
    set.insert(fields.state.clone(), Value::from(config.states.pending.as_str()));
    set.insert(fields.processing_time.clone(), Value::from(0_i64));
    let reverted = store
        .conditional_update(&ConditionalUpdate {
            id_field: fields.id.clone(),
            ids,
            guard: expired,
            set,
        })
        .await
        .map_err(Error::new_store)?;
    Ok(reverted.len())
}
