/// Event Batch - Coalescing of Keyed Events
///
/// An `EventBatch` collects a burst of keyed events, holding only the most
/// recent event per key. It becomes ready for delivery when either of two
/// triggers fires:
///
/// - `Full`: the number of accepted events reaches `max_events`
/// - `Timeout`: `max_wait` has elapsed since the first accepted event
///
/// Only the first trigger has any effect. An empty batch never arms its timer
/// and so never becomes ready.

use crate::config::BatchConfig;
use crate::event::{Coalesced, KeyedEvent};
use std::hash::Hash;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a batch became ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReadyReason {
    Full,
    Timeout,
}

/// Resolve-once readiness flag that any number of tasks may await.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<Option<BatchReadyReason>>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        ReadySignal { tx: Arc::new(tx) }
    }

    /// Resolve the signal. Returns false if it was already resolved.
    pub fn resolve(&self, reason: BatchReadyReason) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<BatchReadyReason> {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until the signal is resolved and return the reason.
    pub async fn wait(&self) -> BatchReadyReason {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            // The sender lives in self, so the channel never closes under us
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-use, keyed collection of events
pub struct EventBatch<K: Hash + Eq, V> {
    config: BatchConfig,
    events: Coalesced<K, KeyedEvent<K, V>>,
    event_count: usize,
    ready: ReadySignal,
    runtime: Handle,
    timer: Option<JoinHandle<()>>,
}

impl<K: Hash + Eq + Clone, V> EventBatch<K, V> {
    /// Create an empty batch. Its timeout timer runs on `runtime`.
    pub fn new(config: BatchConfig, runtime: Handle) -> Self {
        EventBatch {
            config,
            events: Coalesced::new(),
            event_count: 0,
            ready: ReadySignal::new(),
            runtime,
            timer: None,
        }
    }

    /// An empty batch with the same thresholds and runtime
    pub fn successor(&self) -> Self {
        EventBatch::new(self.config, self.runtime.clone())
    }

    /// Add an event, replacing any earlier event with the same key.
    ///
    /// The first event arms the timeout; reaching `max_events` accepted
    /// events resolves the batch as `Full`.
    pub fn add(&mut self, event: KeyedEvent<K, V>) {
        if self.event_count == 0 {
            let signal = self.ready.clone();
            let wait = self.config.max_wait();
            self.timer = Some(self.runtime.spawn(async move {
                tokio::time::sleep(wait).await;
                signal.resolve(BatchReadyReason::Timeout);
            }));
        }

        self.event_count += 1;
        self.events.insert(event.key().clone(), event);

        if self.event_count == self.config.max_events {
            self.ready.resolve(BatchReadyReason::Full);
        }
    }
}

impl<K: Hash + Eq, V> EventBatch<K, V> {
    /// Number of distinct keys in the batch
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events accepted, including those since overwritten
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn get(&self, key: &K) -> Option<&KeyedEvent<K, V>> {
        self.events.get(key)
    }

    /// Iterate the events in order of each key's first arrival
    pub fn iter(&self) -> impl Iterator<Item = &KeyedEvent<K, V>> + '_ {
        self.events.values()
    }

    pub fn into_events(mut self) -> Vec<KeyedEvent<K, V>> {
        std::mem::take(&mut self.events).into_values().collect()
    }

    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    pub fn ready_reason(&self) -> Option<BatchReadyReason> {
        self.ready.reason()
    }
}

impl<K: Hash + Eq, V> Drop for EventBatch<K, V> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
