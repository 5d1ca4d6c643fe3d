/// Stream Orchestrator - Topics to Table
///
/// Wires a topic source to a grid table. On build it samples the initial
/// topics to discover the columns, creates the table, and subscribes. Every
/// value and unsubscription is submitted to one shared `EventBatcher`, so a
/// burst of updates reaches the table as a handful of coalesced batches
/// rather than one surface operation per update.
///
/// # Batch Classification
///
/// Each delivered batch is split against what the table currently shows:
///
/// - an update for a key the table does not hold becomes an insert
/// - an update for a held key becomes an in-place update
/// - a removal for a held key becomes a delete; removals of keys the table
///   never held are ignored
///
/// The three groups are applied concurrently. A group that fails is logged
/// and dropped while the others stay applied; the next batch is processed
/// normally.

use crate::address::RangeAddress;
use crate::batch::EventBatch;
use crate::batcher::{BatchReceiver, EventBatcher};
use crate::config::ViewerConfig;
use crate::discovery::build_from_selector;
use crate::error::{Error, Result};
use crate::event::{KeyedEvent, UnsubscribeReason};
use crate::projector::TableProjector;
use crate::schema::{ContentProvider, TableSchema};
use crate::source::{TopicSelector, TopicSource, ValueStream};
use crate::surface::GridSurface;
use crate::value::{lookup, CellValue};
use async_trait::async_trait;
use indexmap::IndexSet;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Arc, Weak};

/// The latest value of one topic; the orchestrator's model row
#[derive(Debug, Clone, PartialEq)]
pub struct TopicValue {
    pub path: String,
    pub value: JsonValue,
}

/// Reads the key field as the topic path and every other field as a JSON
/// pointer into the topic value.
#[derive(Debug, Clone)]
pub struct TopicContentProvider {
    key_field: String,
}

impl TopicContentProvider {
    pub fn new(key_field: impl Into<String>) -> Self {
        TopicContentProvider {
            key_field: key_field.into(),
        }
    }
}

impl ContentProvider<TopicValue> for TopicContentProvider {
    fn field(&self, item: &TopicValue, field_name: &str) -> CellValue {
        if field_name == self.key_field {
            CellValue::Text(item.path.clone())
        } else {
            lookup(&item.value, field_name)
        }
    }
}

pub type TopicEvent = KeyedEvent<String, JsonValue>;

/// Counts of events applied from one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Removals for keys the table never held
    pub ignored: usize,
}

/// The three groups a batch is split into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCategory {
    Insert,
    Update,
    Remove,
}

impl fmt::Display for BatchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchCategory::Insert => "insert",
            BatchCategory::Update => "update",
            BatchCategory::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// A group of a batch that could not be applied
#[derive(Debug)]
pub struct CategoryFailure {
    pub category: BatchCategory,
    /// Events of this group that were dropped
    pub dropped: usize,
    pub error: Error,
}

/// Result of applying one batch. Groups are independent: a failed group
/// does not undo the groups that were applied.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: BatchSummary,
    pub failures: Vec<CategoryFailure>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Events dropped across every failed group
    pub fn dropped(&self) -> usize {
        self.failures.iter().map(|f| f.dropped).sum()
    }

    fn record(&mut self, category: BatchCategory, count: usize, result: Result<()>) {
        match result {
            Ok(()) => match category {
                BatchCategory::Insert => self.applied.inserted = count,
                BatchCategory::Update => self.applied.updated = count,
                BatchCategory::Remove => self.applied.removed = count,
            },
            Err(error) => self.failures.push(CategoryFailure {
                category,
                dropped: count,
                error,
            }),
        }
    }
}

/// Classify `events` against the table and apply them.
pub async fn apply_batch(projector: &TableProjector<TopicValue>, events: Vec<TopicEvent>) -> BatchOutcome {
    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut removals = Vec::new();
    let mut ignored = 0;

    for event in events {
        match event {
            KeyedEvent::Update { key, value } => {
                let item = TopicValue { path: key, value };
                if projector.has(&CellValue::Text(item.path.clone())) {
                    updates.push(item);
                } else {
                    inserts.push(item);
                }
            }
            KeyedEvent::Removed { key, reason } => {
                let key = CellValue::Text(key);
                if projector.has(&key) {
                    removals.push(key);
                } else {
                    debug!("Ignoring removal of {} ({:?}), never displayed", key, reason);
                    ignored += 1;
                }
            }
        }
    }

    let (added, updated, removed) = tokio::join!(
        projector.add_rows(&inserts),
        projector.update_rows(&updates),
        projector.remove_rows(&removals),
    );

    let mut outcome = BatchOutcome::default();
    outcome.applied.ignored = ignored;
    outcome.record(BatchCategory::Insert, inserts.len(), added);
    outcome.record(BatchCategory::Update, updates.len(), updated);
    outcome.record(BatchCategory::Remove, removals.len(), removed);
    outcome
}

struct ProjectionReceiver {
    projector: Arc<TableProjector<TopicValue>>,
}

#[async_trait]
impl BatchReceiver<String, JsonValue> for ProjectionReceiver {
    async fn receive(&self, batch: EventBatch<String, JsonValue>) {
        debug!("Receiving batch of {} events", batch.len());

        let outcome = apply_batch(&self.projector, batch.into_events()).await;
        for failure in &outcome.failures {
            error!(
                "Dropped {} {} events: {}",
                failure.dropped, failure.category, failure.error
            );
        }
        debug!("Applied batch: {:?}", outcome.applied);
    }
}

type TrackedPaths = Arc<Mutex<IndexSet<String>>>;

/// Submits a subscription's callbacks into the shared batcher
struct BatchForwarder {
    batcher: Weak<EventBatcher<String, JsonValue>>,
    tracked: Weak<Mutex<IndexSet<String>>>,
}

impl ValueStream for BatchForwarder {
    fn on_value(&self, path: &str, value: JsonValue) {
        if let Some(batcher) = self.batcher.upgrade() {
            batcher.submit(KeyedEvent::update(path.to_string(), value));
        }
    }

    fn on_unsubscribe(&self, path: &str, reason: UnsubscribeReason) {
        // The path can be added again once its subscription has ended
        if let Some(tracked) = self.tracked.upgrade() {
            tracked.lock().shift_remove(path);
        }
        if let Some(batcher) = self.batcher.upgrade() {
            batcher.submit(KeyedEvent::removed(path.to_string(), reason));
        }
    }

    fn is_closed(&self) -> bool {
        self.batcher.strong_count() == 0
    }
}

/// Streams a set of topics into one grid table
pub struct StreamOrchestrator {
    source: Arc<dyn TopicSource>,
    projector: Arc<TableProjector<TopicValue>>,
    batcher: Arc<EventBatcher<String, JsonValue>>,
    topic_paths: TrackedPaths,
}

impl StreamOrchestrator {
    /// Discover the columns of `topic_paths`, create the table and subscribe.
    ///
    /// Columns are fixed here: fields that only appear in topics added later
    /// are not shown.
    pub async fn build<S: AsRef<str>>(
        source: Arc<dyn TopicSource>,
        surface: Arc<dyn GridSurface>,
        topic_paths: &[S],
        config: ViewerConfig,
    ) -> Result<Self> {
        config.batch.validate()?;
        let address = RangeAddress::parse(&config.table_address)?;

        let selector = TopicSelector::any_of(topic_paths)?;
        let super_schema = build_from_selector(source.as_ref(), &selector).await?;
        let schema = TableSchema::new(super_schema.columns(&config.key_field), config.key_field.clone())?;

        let provider = Arc::new(TopicContentProvider::new(config.key_field.clone()));
        let projector = Arc::new(TableProjector::<TopicValue>::build(surface, &address, schema, provider).await?);

        let receiver = Arc::new(ProjectionReceiver {
            projector: projector.clone(),
        });
        let batcher = Arc::new(EventBatcher::new(receiver, config.batch)?);

        let orchestrator = StreamOrchestrator {
            source,
            projector,
            batcher,
            topic_paths: Arc::new(Mutex::new(IndexSet::new())),
        };
        for path in topic_paths {
            orchestrator.add_topic_path(path.as_ref()).await?;
        }
        Ok(orchestrator)
    }

    /// Start streaming another topic into the table. Paths with a live
    /// subscription are left alone.
    pub async fn add_topic_path(&self, path: &str) -> Result<()> {
        let added = self.topic_paths.lock().insert(path.to_string());
        if !added {
            debug!("Already tracking {}", path);
            return Ok(());
        }

        let stream: Arc<dyn ValueStream> = Arc::new(BatchForwarder {
            batcher: Arc::downgrade(&self.batcher),
            tracked: Arc::downgrade(&self.topic_paths),
        });
        if let Err(e) = self.source.subscribe(path, stream).await {
            warn!("Could not subscribe to {}: {}", path, e);
            self.topic_paths.lock().shift_remove(path);
            return Err(e.into());
        }

        info!("Tracking {}", path);
        Ok(())
    }

    pub fn projector(&self) -> &Arc<TableProjector<TopicValue>> {
        &self.projector
    }

    /// Paths with a live subscription, in the order they were added
    pub fn topic_paths(&self) -> Vec<String> {
        self.topic_paths.lock().iter().cloned().collect()
    }
}
