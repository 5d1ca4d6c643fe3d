/// Topic Sources
///
/// A topic source is the broker side of the pipeline: a tree of topics, each
/// addressed by a slash-separated path and holding a JSON value. Callers can
/// subscribe to a path and receive every new value through a `ValueStream`,
/// or fetch a page of current values for a `TopicSelector`.
///
/// `MemorySource` is a complete in-process source for tests and the demo.

use crate::event::UnsubscribeReason;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Session is closed")]
    Closed,

    #[error("Invalid topic selector: {0}")]
    InvalidSelector(String),
}

/// Callbacks for one subscription
pub trait ValueStream: Send + Sync {
    /// A topic produced a new value
    fn on_value(&self, path: &str, value: JsonValue);

    /// The subscription to a topic ended
    fn on_unsubscribe(&self, path: &str, reason: UnsubscribeReason);

    /// True once nothing will consume further callbacks; a source may then
    /// drop the subscription.
    fn is_closed(&self) -> bool {
        false
    }
}

/// One page of a fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchPage {
    /// Matching topics and their values, in path order
    pub results: Vec<(String, JsonValue)>,
    /// True if topics beyond the last result also match
    pub has_more: bool,
}

#[async_trait]
pub trait TopicSource: Send + Sync {
    /// Deliver the current and every future value of `path` to `stream`.
    async fn subscribe(&self, path: &str, stream: Arc<dyn ValueStream>) -> Result<(), SourceError>;

    /// Fetch the next page of topics matching `selector`, starting strictly
    /// after the path `after` when given.
    async fn fetch(&self, selector: &TopicSelector, after: Option<&str>) -> Result<FetchPage, SourceError>;
}

// ============================================================================
// Selectors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPattern {
    /// `>a/b` selects exactly `a/b`
    Exact(String),
    /// `>a/b//` selects `a/b` and everything beneath it
    Descendants(String),
}

impl PathPattern {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => p == path,
            PathPattern::Descendants(p) => {
                path == p || (path.starts_with(p.as_str()) && path[p.len()..].starts_with('/'))
            }
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(p) => write!(f, ">{}", p),
            PathPattern::Descendants(p) => write!(f, ">{}//", p),
        }
    }
}

/// Selects topics by path; matches if any of its patterns do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSelector {
    patterns: Vec<PathPattern>,
}

impl TopicSelector {
    /// Parse a single path selector such as `>fx/GBPUSD` or `>fx//`.
    pub fn parse(expression: &str) -> Result<Self, SourceError> {
        Ok(TopicSelector {
            patterns: vec![parse_pattern(expression)?],
        })
    }

    /// Selector matching any of `paths` exactly
    pub fn any_of<S: AsRef<str>>(paths: &[S]) -> Result<Self, SourceError> {
        let patterns = paths
            .iter()
            .map(|path| parse_pattern(&format!(">{}", path.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err(SourceError::InvalidSelector("no topic paths".to_string()));
        }
        Ok(TopicSelector { patterns })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

fn parse_pattern(expression: &str) -> Result<PathPattern, SourceError> {
    let invalid = || SourceError::InvalidSelector(expression.to_string());
    let path = expression.strip_prefix('>').ok_or_else(invalid)?;

    let pattern = match path.strip_suffix("//") {
        Some(prefix) => PathPattern::Descendants(prefix.to_string()),
        None => PathPattern::Exact(path.to_string()),
    };
    let body = match &pattern {
        PathPattern::Exact(p) | PathPattern::Descendants(p) => p,
    };
    if body.is_empty() || body.starts_with('/') || body.ends_with('/') || body.contains("//") {
        return Err(invalid());
    }
    Ok(pattern)
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pattern) in self.patterns.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", pattern)?;
        }
        Ok(())
    }
}

// ============================================================================
// In-memory source
// ============================================================================

#[derive(Default)]
struct SourceState {
    topics: BTreeMap<String, JsonValue>,
    subscribers: HashMap<String, Vec<Arc<dyn ValueStream>>>,
    closed: bool,
}

impl SourceState {
    /// Drop the closed subscriptions of `path`
    fn prune(&mut self, path: &str) {
        if let Some(streams) = self.subscribers.get_mut(path) {
            let before = streams.len();
            streams.retain(|stream| !stream.is_closed());
            if streams.len() < before {
                debug!("Dropped {} closed subscriptions to {}", before - streams.len(), path);
            }
            if streams.is_empty() {
                self.subscribers.remove(path);
            }
        }
    }
}

/// A topic tree held in process
pub struct MemorySource {
    state: Mutex<SourceState>,
    page_size: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// A source whose fetches return at most `page_size` results per page
    pub fn with_page_size(page_size: usize) -> Self {
        MemorySource {
            state: Mutex::new(SourceState::default()),
            page_size,
        }
    }

    /// Set the value of a topic, creating it if needed, and notify subscribers.
    pub fn publish(&self, path: &str, value: JsonValue) {
        let subscribers = {
            let mut state = self.state.lock();
            state.topics.insert(path.to_string(), value.clone());
            state.prune(path);
            state.subscribers.get(path).cloned().unwrap_or_default()
        };
        for stream in subscribers {
            stream.on_value(path, value.clone());
        }
    }

    /// Remove a topic; its subscribers are unsubscribed with `reason`.
    ///
    /// Returns false if there was no such topic.
    pub fn remove(&self, path: &str, reason: UnsubscribeReason) -> bool {
        let (existed, subscribers) = {
            let mut state = self.state.lock();
            let existed = state.topics.remove(path).is_some();
            (existed, state.subscribers.remove(path).unwrap_or_default())
        };
        for stream in subscribers {
            stream.on_unsubscribe(path, reason);
        }
        existed
    }

    /// Current value of a topic
    pub fn value(&self, path: &str) -> Option<JsonValue> {
        self.state.lock().topics.get(path).cloned()
    }

    /// Number of live subscriptions to `path`
    pub fn subscriber_count(&self, path: &str) -> usize {
        let mut state = self.state.lock();
        state.prune(path);
        state.subscribers.get(path).map_or(0, Vec::len)
    }

    /// Close the session: every subscription ends and later calls fail.
    pub fn close(&self) {
        let subscribers = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        for (path, streams) in subscribers {
            for stream in streams {
                stream.on_unsubscribe(&path, UnsubscribeReason::Requested);
            }
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicSource for MemorySource {
    async fn subscribe(&self, path: &str, stream: Arc<dyn ValueStream>) -> Result<(), SourceError> {
        let current = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SourceError::Closed);
            }
            state.prune(path);
            state
                .subscribers
                .entry(path.to_string())
                .or_default()
                .push(stream.clone());
            state.topics.get(path).cloned()
        };
        info!("Subscribed to {}", path);

        if let Some(value) = current {
            stream.on_value(path, value);
        }
        Ok(())
    }

    async fn fetch(&self, selector: &TopicSelector, after: Option<&str>) -> Result<FetchPage, SourceError> {
        let state = self.state.lock();
        if state.closed {
            return Err(SourceError::Closed);
        }

        let lower = match after {
            Some(path) => Bound::Excluded(path.to_string()),
            None => Bound::Unbounded,
        };
        let mut matching = state
            .topics
            .range((lower, Bound::Unbounded))
            .filter(|(path, _)| selector.matches(path));

        let results: Vec<(String, JsonValue)> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        let has_more = matching.next().is_some();

        debug!(
            "Fetched {} topics for {} (has_more: {})",
            results.len(),
            selector,
            has_more
        );
        Ok(FetchPage { results, has_more })
    }
}
