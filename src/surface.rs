/// Grid Surface - the display a projector writes to
///
/// A surface hosts tables made of a header row and a body of rows. Row
/// offsets are zero-based positions within the body. The surface may be
/// edited by someone other than us at any time, so offsets handed out by
/// `append_rows` are only as good as the last external change.

use crate::address::RangeAddress;
use crate::value::CellValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

/// Opaque handle to a table on a surface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub String);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification that a table was deleted from the surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDeleted {
    pub table_id: TableId,
    pub table_name: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurfaceError {
    /// A row outside the current body was requested
    #[error("Row {offset} outside table body of {len} rows")]
    OutOfBounds { offset: usize, len: usize },

    /// Row data does not match the table's current column layout
    #[error("The input array doesn't match the size of the table: expected {expected} columns, got {actual}")]
    StructuralMismatch { expected: usize, actual: usize },

    #[error("Table {0} not found")]
    TableAbsent(TableId),

    #[error("Cannot place table at {address}: {reason}")]
    InvalidPlacement { address: String, reason: String },

    #[error("Surface error: {0}")]
    Other(String),
}

/// The operations a projector needs from a grid display
#[async_trait]
pub trait GridSurface: Send + Sync {
    /// Create an empty table whose header row is `header`, anchored at `address`.
    async fn create_table(&self, address: &RangeAddress, header: &[String]) -> Result<TableId, SurfaceError>;

    /// Append rows to the bottom of the body in one operation, returning
    /// the offsets they were given.
    async fn append_rows(&self, table: &TableId, rows: Vec<Vec<CellValue>>) -> Result<Vec<usize>, SurfaceError>;

    /// Current contents of the rows at `offsets`, in the same order.
    async fn read_rows(&self, table: &TableId, offsets: &[usize]) -> Result<Vec<Vec<CellValue>>, SurfaceError>;

    /// Overwrite whole rows in one operation.
    async fn write_rows(&self, table: &TableId, rows: Vec<(usize, Vec<CellValue>)>) -> Result<(), SurfaceError>;

    /// Delete rows in one operation. Offsets refer to positions before the delete.
    async fn delete_rows(&self, table: &TableId, offsets: Vec<usize>) -> Result<(), SurfaceError>;

    /// Every body value of one column, top to bottom.
    async fn read_column(&self, table: &TableId, column: usize) -> Result<Vec<CellValue>, SurfaceError>;

    /// Notifications of tables deleted from the surface.
    fn subscribe_deleted(&self) -> broadcast::Receiver<TableDeleted>;
}
