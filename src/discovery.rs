/// Schema Discovery
///
/// Before a table can be created its columns must be known, but topic
/// values are free-form JSON and need not share a shape. A `SuperSchema` is
/// the union of leaf JSON pointers seen across a sample of values, counting
/// how many values had each one. If `fx/GBPUSD` holds `{"a": 1, "b": {"c": 2}}`
/// and `fx/EURUSD` holds `{"a": 3, "b": {"d": 4}}`, the super-schema is
/// `{"/a": 2, "/b/c": 1, "/b/d": 1}`.

use crate::error::{Error, Result};
use crate::source::{TopicSelector, TopicSource};
use crate::value::leaf_pointers;
use indexmap::IndexMap;
use log::{debug, info};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperSchema {
    counts: IndexMap<String, usize>,
}

impl SuperSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every leaf pointer of `value`.
    pub fn consume(&mut self, value: &JsonValue) {
        for pointer in leaf_pointers(value).into_keys() {
            *self.counts.entry(pointer).or_insert(0) += 1;
        }
    }

    /// How many consumed values had a leaf at `pointer`
    pub fn count(&self, pointer: &str) -> usize {
        self.counts.get(pointer).copied().unwrap_or(0)
    }

    /// Distinct leaf pointers, in order of first sighting
    pub fn pointers(&self) -> impl Iterator<Item = &str> + '_ {
        self.counts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Display columns: the key field, then every discovered pointer.
    pub fn columns(&self, key_field: &str) -> Vec<String> {
        std::iter::once(key_field)
            .chain(self.pointers().filter(|p| *p != key_field))
            .map(str::to_string)
            .collect()
    }
}

/// Sample every topic matching `selector` and build its super-schema.
///
/// Pages are requested until the source reports no more results. A page
/// that is empty while more results are claimed means the fetch can make no
/// progress and fails with `ExhaustedSampling`.
pub async fn build_from_selector<S>(source: &S, selector: &TopicSelector) -> Result<SuperSchema>
where
    S: TopicSource + ?Sized,
{
    let mut schema = SuperSchema::new();
    let mut after: Option<String> = None;
    let mut sampled = 0;

    loop {
        let page = source.fetch(selector, after.as_deref()).await?;
        debug!("Sampling {} topics for {}", page.results.len(), selector);

        for (_, value) in &page.results {
            schema.consume(value);
        }
        sampled += page.results.len();

        if !page.has_more {
            break;
        }
        match page.results.last() {
            Some((path, _)) => after = Some(path.clone()),
            None => {
                return Err(Error::ExhaustedSampling {
                    selector: selector.to_string(),
                })
            }
        }
    }

    info!(
        "Discovered {} fields across {} topics for {}",
        schema.len(),
        sampled,
        selector
    );
    Ok(schema)
}
