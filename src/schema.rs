/// Table Schema and Content Provision
///
/// A `TableSchema` is the ordered list of column names shown in the display,
/// with one column designated as the row key. Rows are never inspected
/// directly; every cell is read through a `ContentProvider`.
///
/// # Examples
///
/// ```
/// use livegrid::TableSchema;
///
/// let schema = TableSchema::new(
///     vec!["topicPath".to_string(), "/bid".to_string(), "/ask".to_string()],
///     "topicPath",
/// ).unwrap();
///
/// assert_eq!(schema.len(), 3);
/// assert_eq!(schema.key_offset(), 0);
/// assert_eq!(schema.fields()[2], "/ask");
/// ```

use crate::error::{Error, Result};
use crate::value::CellValue;

/// Reads cell values out of a model row
pub trait ContentProvider<T>: Send + Sync {
    fn field(&self, item: &T, field_name: &str) -> CellValue;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    fields: Vec<String>,
    key_field: String,
    key_offset: usize,
}

impl TableSchema {
    /// Creates a schema; the key field must be one of `fields`.
    pub fn new(fields: Vec<String>, key_field: impl Into<String>) -> Result<Self> {
        let key_field = key_field.into();
        let key_offset = fields
            .iter()
            .position(|f| *f == key_field)
            .ok_or_else(|| Error::SchemaViolation {
                table: String::new(),
                reason: format!("Key field {} absent from schema", key_field),
            })?;

        Ok(TableSchema {
            fields,
            key_field,
            key_offset,
        })
    }

    /// Returns the number of columns in the schema.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Column offset of the key field
    pub fn key_offset(&self) -> usize {
        self.key_offset
    }

    /// The key of `item`
    pub fn key_of<T, P>(&self, provider: &P, item: &T) -> CellValue
    where
        P: ContentProvider<T> + ?Sized,
    {
        provider.field(item, &self.key_field)
    }

    /// The row `item` renders as, one cell per field in schema order
    pub fn row_of<T, P>(&self, provider: &P, item: &T) -> Vec<CellValue>
    where
        P: ContentProvider<T> + ?Sized,
    {
        self.fields.iter().map(|name| provider.field(item, name)).collect()
    }
}
