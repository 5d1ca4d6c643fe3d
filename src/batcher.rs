/// Event Batcher - Backpressure-Gated Batch Delivery
///
/// The batcher accepts events at whatever rate the source produces them and
/// hands them to a single receiver as coalesced batches. Producers never
/// block: `submit` only touches the current batch under a short lock.
///
/// # Delivery Contract
///
/// A background task waits for the current batch to become ready, swaps in a
/// fresh batch, and awaits the receiver with the retired one. At most one
/// receiver call is ever in flight. While the receiver is busy, new events
/// keep coalescing, so a slow consumer is answered with larger batches rather
/// than a growing queue.
///
/// A batch that fills inside `submit` is sealed there and then, so the
/// `max_events` boundary is exact even for a burst that never yields. Only
/// one sealed batch waits at a time; if the current batch fills while one is
/// already waiting, it stays current and carries on coalescing until the
/// receiver returns.

use crate::batch::{EventBatch, ReadySignal};
use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::event::KeyedEvent;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Consumer of delivered batches.
///
/// `receive` returns only once the batch is fully processed. Expected
/// per-item failures are the receiver's own business and must not escape.
#[async_trait]
pub trait BatchReceiver<K, V>: Send + Sync
where
    K: Hash + Eq + Send + 'static,
    V: Send + 'static,
{
    async fn receive(&self, batch: EventBatch<K, V>);
}

struct Slots<K: Hash + Eq, V> {
    current: EventBatch<K, V>,
    /// Ready batch waiting for the watch loop
    sealed: Option<EventBatch<K, V>>,
}

impl<K: Hash + Eq + Clone, V> Slots<K, V> {
    fn seal_if_ready(&mut self) {
        if self.sealed.is_none() && self.current.is_ready() {
            let fresh = self.current.successor();
            self.sealed = Some(std::mem::replace(&mut self.current, fresh));
        }
    }
}

/// Coalesces submitted events and delivers them as batches, one at a time
pub struct EventBatcher<K: Hash + Eq, V> {
    slots: Arc<Mutex<Slots<K, V>>>,
    watcher: JoinHandle<()>,
}

impl<K, V> EventBatcher<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Start a batcher delivering to `receiver`.
    ///
    /// Must be called from within a Tokio runtime; the watch loop and batch
    /// timers are spawned onto it.
    pub fn new<R>(receiver: Arc<R>, config: BatchConfig) -> Result<Self>
    where
        R: BatchReceiver<K, V> + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let slots = Arc::new(Mutex::new(Slots {
            current: EventBatch::new(config, runtime.clone()),
            sealed: None,
        }));
        let watcher = runtime.spawn(watch(slots.clone(), receiver));

        Ok(EventBatcher { slots, watcher })
    }

    /// Add an event to the current batch. Any earlier event with the same key
    /// is overwritten.
    pub fn submit(&self, event: KeyedEvent<K, V>) {
        let mut slots = self.slots.lock();
        slots.current.add(event);
        slots.seal_if_ready();
    }

    /// Readiness of the oldest undelivered batch.
    ///
    /// Fails with `NoPendingWork` when nothing has been submitted since the
    /// last delivery, since an empty batch never becomes ready.
    pub fn pending_work(&self) -> Result<ReadySignal> {
        let slots = self.slots.lock();
        if let Some(sealed) = &slots.sealed {
            return Ok(sealed.ready_signal());
        }
        if slots.current.is_empty() {
            return Err(Error::NoPendingWork);
        }
        Ok(slots.current.ready_signal())
    }
}

impl<K: Hash + Eq, V> Drop for EventBatcher<K, V> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch<K, V, R>(slots: Arc<Mutex<Slots<K, V>>>, receiver: Arc<R>)
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
    R: BatchReceiver<K, V> + 'static,
{
    loop {
        let batch = loop {
            let signal = {
                let mut guard = slots.lock();
                guard.seal_if_ready();
                match guard.sealed.take() {
                    Some(batch) => break batch,
                    None => guard.current.ready_signal(),
                }
            };
            signal.wait().await;
        };

        debug!(
            "Delivering batch of {} events ({:?})",
            batch.len(),
            batch.ready_reason()
        );
        receiver.receive(batch).await;
    }
}
