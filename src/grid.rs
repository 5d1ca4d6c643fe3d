/// In-Memory Grid Surface
///
/// `MemoryGrid` is a `GridSurface` held entirely in process: a set of tables,
/// each a header row plus a body of rows. It enforces the same rules a real
/// spreadsheet does (rows must match the column layout, offsets must be
/// inside the body) and offers hooks that play the part of a user editing
/// the sheet by hand, so index recovery can be exercised deterministically.
///
/// # Examples
///
/// ```
/// use livegrid::{CellValue, GridSurface, MemoryGrid, RangeAddress};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let grid = MemoryGrid::new();
/// let address = RangeAddress::parse("A1").unwrap();
/// let table = grid.create_table(&address, &["id".to_string()]).await.unwrap();
///
/// let offsets = grid.append_rows(&table, vec![vec![CellValue::Int(7)]]).await.unwrap();
/// assert_eq!(offsets, vec![0]);
/// assert_eq!(grid.rows(&table).unwrap(), vec![vec![CellValue::Int(7)]]);
/// # }
/// ```

use crate::address::RangeAddress;
use crate::surface::{GridSurface, SurfaceError, TableDeleted, TableId};
use crate::value::CellValue;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::broadcast;

const DELETED_CAPACITY: usize = 64;
const ACTIVE_SHEET: &str = "Sheet1";

struct GridTable {
    name: String,
    sheet: String,
    anchor: (usize, usize),
    header: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl GridTable {
    fn check_width(&self, row: &[CellValue]) -> Result<(), SurfaceError> {
        if row.len() != self.header.len() {
            return Err(SurfaceError::StructuralMismatch {
                expected: self.header.len(),
                actual: row.len(),
            });
        }
        Ok(())
    }

    fn check_offset(&self, offset: usize) -> Result<(), SurfaceError> {
        if offset >= self.rows.len() {
            return Err(SurfaceError::OutOfBounds {
                offset,
                len: self.rows.len(),
            });
        }
        Ok(())
    }
}

/// A grid surface living in memory
pub struct MemoryGrid {
    tables: Mutex<HashMap<TableId, GridTable>>,
    next_id: AtomicU64,
    column_reads: AtomicUsize,
    deleted_tx: broadcast::Sender<TableDeleted>,
}

impl MemoryGrid {
    pub fn new() -> Self {
        let (deleted_tx, _) = broadcast::channel(DELETED_CAPACITY);
        MemoryGrid {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            column_reads: AtomicUsize::new(0),
            deleted_tx,
        }
    }

    fn with_table<R>(
        &self,
        table: &TableId,
        f: impl FnOnce(&mut GridTable) -> Result<R, SurfaceError>,
    ) -> Result<R, SurfaceError> {
        let mut tables = self.tables.lock();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| SurfaceError::TableAbsent(table.clone()))?;
        f(entry)
    }

    /// Snapshot of a table's body
    pub fn rows(&self, table: &TableId) -> Result<Vec<Vec<CellValue>>, SurfaceError> {
        self.with_table(table, |t| Ok(t.rows.clone()))
    }

    pub fn header(&self, table: &TableId) -> Result<Vec<String>, SurfaceError> {
        self.with_table(table, |t| Ok(t.header.clone()))
    }

    pub fn table_name(&self, table: &TableId) -> Result<String, SurfaceError> {
        self.with_table(table, |t| Ok(t.name.clone()))
    }

    pub fn len(&self, table: &TableId) -> Result<usize, SurfaceError> {
        self.with_table(table, |t| Ok(t.rows.len()))
    }

    /// How many full-column reads have been served; each index rebuild is one.
    pub fn column_reads(&self) -> usize {
        self.column_reads.load(AtomicOrdering::SeqCst)
    }

    // =========================================================================
    // External edits
    // =========================================================================

    /// Sort the body on one column, as a user clicking the column header would.
    pub fn sort_by_column(&self, table: &TableId, column: usize, descending: bool) -> Result<(), SurfaceError> {
        self.with_table(table, |t| {
            if column >= t.header.len() {
                return Err(SurfaceError::Other(format!("No column {}", column)));
            }
            t.rows.sort_by(|a, b| {
                let ordering = compare_cells(&a[column], &b[column]);
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            Ok(())
        })
    }

    /// Insert a row typed in by hand.
    pub fn insert_row_external(&self, table: &TableId, offset: usize, row: Vec<CellValue>) -> Result<(), SurfaceError> {
        self.with_table(table, |t| {
            t.check_width(&row)?;
            if offset > t.rows.len() {
                return Err(SurfaceError::OutOfBounds {
                    offset,
                    len: t.rows.len(),
                });
            }
            t.rows.insert(offset, row);
            Ok(())
        })
    }

    pub fn delete_row_external(&self, table: &TableId, offset: usize) -> Result<Vec<CellValue>, SurfaceError> {
        self.with_table(table, |t| {
            t.check_offset(offset)?;
            Ok(t.rows.remove(offset))
        })
    }

    /// Insert a blank column, changing the layout every later write must match.
    pub fn insert_column_external(&self, table: &TableId, at: usize, name: &str) -> Result<(), SurfaceError> {
        self.with_table(table, |t| {
            let at = at.min(t.header.len());
            t.header.insert(at, name.to_string());
            for row in t.rows.iter_mut() {
                row.insert(at, CellValue::Empty);
            }
            Ok(())
        })
    }

    /// Delete the whole table and notify subscribers.
    pub fn drop_table(&self, table: &TableId) -> Result<(), SurfaceError> {
        let removed = self
            .tables
            .lock()
            .remove(table)
            .ok_or_else(|| SurfaceError::TableAbsent(table.clone()))?;

        // No subscribers is fine
        let _ = self.deleted_tx.send(TableDeleted {
            table_id: table.clone(),
            table_name: removed.name,
        });
        Ok(())
    }
}

impl Default for MemoryGrid {
    fn default() -> Self {
        Self::new()
    }
}

/// Blank < booleans < numbers < text; numbers compare numerically.
fn compare_cells(a: &CellValue, b: &CellValue) -> Ordering {
    fn rank(cell: &CellValue) -> u8 {
        match cell {
            CellValue::Empty => 0,
            CellValue::Bool(_) => 1,
            CellValue::Int(_) | CellValue::Float(_) => 2,
            CellValue::Text(_) => 3,
        }
    }

    match (a, b) {
        (CellValue::Bool(x), CellValue::Bool(y)) => x.cmp(y),
        (CellValue::Text(x), CellValue::Text(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

#[async_trait]
impl GridSurface for MemoryGrid {
    async fn create_table(&self, address: &RangeAddress, header: &[String]) -> Result<TableId, SurfaceError> {
        if header.is_empty() {
            return Err(SurfaceError::InvalidPlacement {
                address: address.to_string(),
                reason: "a table needs at least one column".to_string(),
            });
        }

        let sheet = address.sheet().unwrap_or(ACTIVE_SHEET).to_string();
        let anchor = address.anchor();
        let mut tables = self.tables.lock();
        if tables.values().any(|t| t.sheet == sheet && t.anchor == anchor) {
            return Err(SurfaceError::InvalidPlacement {
                address: address.to_string(),
                reason: "a table already starts there".to_string(),
            });
        }

        let n = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let id = TableId(format!("{{T{:04}}}", n));
        debug!("Creating table with address: {}!{}", sheet, address.start());
        tables.insert(
            id.clone(),
            GridTable {
                name: format!("Table{}", n),
                sheet,
                anchor,
                header: header.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn append_rows(&self, table: &TableId, rows: Vec<Vec<CellValue>>) -> Result<Vec<usize>, SurfaceError> {
        self.with_table(table, |t| {
            for row in &rows {
                t.check_width(row)?;
            }
            let first = t.rows.len();
            t.rows.extend(rows);
            Ok((first..t.rows.len()).collect())
        })
    }

    async fn read_rows(&self, table: &TableId, offsets: &[usize]) -> Result<Vec<Vec<CellValue>>, SurfaceError> {
        self.with_table(table, |t| {
            offsets
                .iter()
                .map(|&offset| -> Result<Vec<CellValue>, SurfaceError> {
                    t.check_offset(offset)?;
                    Ok(t.rows[offset].clone())
                })
                .collect()
        })
    }

    async fn write_rows(&self, table: &TableId, rows: Vec<(usize, Vec<CellValue>)>) -> Result<(), SurfaceError> {
        self.with_table(table, |t| {
            for (offset, row) in &rows {
                t.check_offset(*offset)?;
                t.check_width(row)?;
            }
            for (offset, row) in rows {
                t.rows[offset] = row;
            }
            Ok(())
        })
    }

    async fn delete_rows(&self, table: &TableId, mut offsets: Vec<usize>) -> Result<(), SurfaceError> {
        self.with_table(table, |t| {
            for &offset in &offsets {
                t.check_offset(offset)?;
            }
            offsets.sort_unstable_by(|a, b| b.cmp(a));
            offsets.dedup();
            for offset in offsets {
                t.rows.remove(offset);
            }
            Ok(())
        })
    }

    async fn read_column(&self, table: &TableId, column: usize) -> Result<Vec<CellValue>, SurfaceError> {
        self.column_reads.fetch_add(1, AtomicOrdering::SeqCst);
        self.with_table(table, |t| {
            if column >= t.header.len() {
                return Err(SurfaceError::Other(format!("No column {}", column)));
            }
            Ok(t.rows.iter().map(|row| row[column].clone()).collect())
        })
    }

    fn subscribe_deleted(&self) -> broadcast::Receiver<TableDeleted> {
        self.deleted_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, value: i64) -> Vec<CellValue> {
        vec![CellValue::from(key), CellValue::Int(value)]
    }

    async fn grid_with_table() -> (MemoryGrid, TableId) {
        let grid = MemoryGrid::new();
        let address = RangeAddress::parse("A1").unwrap();
        let table = grid
            .create_table(&address, &["key".to_string(), "value".to_string()])
            .await
            .unwrap();
        (grid, table)
    }

    #[tokio::test]
    async fn test_append_returns_offsets() {
        let (grid, table) = grid_with_table().await;
        assert_eq!(grid.append_rows(&table, vec![row("a", 1), row("b", 2)]).await.unwrap(), vec![0, 1]);
        assert_eq!(grid.append_rows(&table, vec![row("c", 3)]).await.unwrap(), vec![2]);
        assert_eq!(grid.len(&table).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_width_mismatch_rejected_whole() {
        let (grid, table) = grid_with_table().await;
        let result = grid
            .append_rows(&table, vec![row("a", 1), vec![CellValue::from("short")]])
            .await;
        assert_eq!(result, Err(SurfaceError::StructuralMismatch { expected: 2, actual: 1 }));
        assert_eq!(grid.len(&table).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let (grid, table) = grid_with_table().await;
        grid.append_rows(&table, vec![row("a", 1)]).await.unwrap();
        let result = grid.read_rows(&table, &[0, 1]).await;
        assert_eq!(result, Err(SurfaceError::OutOfBounds { offset: 1, len: 1 }));
    }

    #[tokio::test]
    async fn test_delete_uses_pre_delete_offsets() {
        let (grid, table) = grid_with_table().await;
        grid.append_rows(&table, vec![row("a", 1), row("b", 2), row("c", 3), row("d", 4)])
            .await
            .unwrap();

        grid.delete_rows(&table, vec![0, 2]).await.unwrap();
        assert_eq!(grid.rows(&table).unwrap(), vec![row("b", 2), row("d", 4)]);
    }

    #[tokio::test]
    async fn test_sort_by_column() {
        let (grid, table) = grid_with_table().await;
        grid.append_rows(&table, vec![row("a", 3), row("b", 1), row("c", 2)]).await.unwrap();

        grid.sort_by_column(&table, 1, false).unwrap();
        let keys = grid.read_column(&table, 0).await.unwrap();
        assert_eq!(keys, vec![CellValue::from("b"), CellValue::from("c"), CellValue::from("a")]);
        assert_eq!(grid.column_reads(), 1);
    }

    #[tokio::test]
    async fn test_insert_column_changes_layout() {
        let (grid, table) = grid_with_table().await;
        grid.append_rows(&table, vec![row("a", 1)]).await.unwrap();
        grid.insert_column_external(&table, 1, "note").unwrap();

        assert_eq!(grid.header(&table).unwrap(), vec!["key", "note", "value"]);
        assert!(matches!(
            grid.append_rows(&table, vec![row("b", 2)]).await,
            Err(SurfaceError::StructuralMismatch { expected: 3, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_drop_table_notifies() {
        let (grid, table) = grid_with_table().await;
        let mut deleted = grid.subscribe_deleted();

        grid.drop_table(&table).unwrap();
        let notice = deleted.recv().await.unwrap();
        assert_eq!(notice.table_id, table);
        assert_eq!(notice.table_name, "Table1");
        assert_eq!(grid.rows(&table), Err(SurfaceError::TableAbsent(table.clone())));
    }

    #[tokio::test]
    async fn test_one_table_per_anchor() {
        let (grid, _) = grid_with_table().await;
        let address = RangeAddress::parse("Sheet1!A1").unwrap();
        let result = grid.create_table(&address, &["x".to_string()]).await;
        assert!(matches!(result, Err(SurfaceError::InvalidPlacement { .. })));

        let elsewhere = RangeAddress::parse("Sheet2!A1").unwrap();
        assert!(grid.create_table(&elsewhere, &["x".to_string()]).await.is_ok());
    }
}
