/// Table Projector - Model Rows onto a Grid Table
///
/// A `TableProjector` owns one table on a `GridSurface` and lets callers talk
/// in terms of model rows and keys rather than offsets. Rows are located
/// through an optimistic `RowIndex`.
///
/// # Index Recovery
///
/// Updates and removals must find the current offset of each key. The index
/// is trusted first: the candidate rows are read back and their key cells
/// compared with the expected keys. If anything disagrees (someone sorted
/// the table, inserted or deleted rows, or the offset is now past the end of
/// the body) the index is rebuilt from the table's key column and resolution
/// is attempted exactly once more. A second failure is an `IndexViolation`.
///
/// # Schema Drift
///
/// If the table's columns were changed by hand, writes no longer fit the
/// layout and the surface reports a structural mismatch. That surfaces as a
/// `SchemaViolation` and is never retried.
///
/// Add, update and remove may be called concurrently; their surface
/// operations are serialised per table so that a verified offset cannot be
/// invalidated by our own delete before it is written.

use crate::address::RangeAddress;
use crate::error::{Error, Result};
use crate::event::Coalesced;
use crate::index::RowIndex;
use crate::schema::{ContentProvider, TableSchema};
use crate::surface::{GridSurface, SurfaceError, TableDeleted, TableId};
use crate::value::CellValue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const DELETED_CAPACITY: usize = 16;

pub struct TableProjector<T> {
    table_id: TableId,
    schema: TableSchema,
    surface: Arc<dyn GridSurface>,
    provider: Arc<dyn ContentProvider<T>>,
    index: Mutex<RowIndex>,
    rebuilds: AtomicUsize,
    /// Held across each structural operation on the table
    ops: tokio::sync::Mutex<()>,
    deleted_tx: broadcast::Sender<TableDeleted>,
    forwarder: JoinHandle<()>,
}

impl<T: Send + Sync + 'static> TableProjector<T> {
    /// Create an empty table at `address` whose header row is the schema's
    /// fields, and start relaying its deletion as this projector's own
    /// `deleted` event.
    pub async fn build(
        surface: Arc<dyn GridSurface>,
        address: &RangeAddress,
        schema: TableSchema,
        provider: Arc<dyn ContentProvider<T>>,
    ) -> Result<Self> {
        // Subscribe first so a deletion right after creation is not missed
        let surface_deleted = surface.subscribe_deleted();
        let table_id = surface.create_table(address, schema.fields()).await?;
        info!(
            "Created table {} at {} with {} columns keyed on '{}'",
            table_id,
            address,
            schema.len(),
            schema.key_field()
        );

        let (deleted_tx, _) = broadcast::channel(DELETED_CAPACITY);
        let forwarder = tokio::spawn(relay_deleted(surface_deleted, table_id.clone(), deleted_tx.clone()));

        Ok(TableProjector {
            table_id,
            schema,
            surface,
            provider,
            index: Mutex::new(RowIndex::new()),
            rebuilds: AtomicUsize::new(0),
            ops: tokio::sync::Mutex::new(()),
            deleted_tx,
            forwarder,
        })
    }
}

impl<T: Sync> TableProjector<T> {
    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// True if `key` is believed to be present in the table
    pub fn has(&self, key: &CellValue) -> bool {
        self.index.lock().contains(key)
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times the index has been rebuilt from the table
    pub fn index_rebuilds(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    /// Notified once if the table is deleted from the surface
    pub fn subscribe_deleted(&self) -> broadcast::Receiver<TableDeleted> {
        self.deleted_tx.subscribe()
    }

    /// Append rows for `items` in one operation and index them.
    pub async fn add_rows(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let keyed: Coalesced<CellValue, Vec<CellValue>> = items
            .iter()
            .map(|item| {
                (
                    self.schema.key_of(&*self.provider, item),
                    self.schema.row_of(&*self.provider, item),
                )
            })
            .collect();
        let (keys, rows): (Vec<CellValue>, Vec<Vec<CellValue>>) = keyed.into_entries().unzip();

        let _ops = self.ops.lock().await;

        let offsets = self
            .surface
            .append_rows(&self.table_id, rows)
            .await
            .map_err(|e| self.classify(e))?;

        let mut index = self.index.lock();
        for (key, offset) in keys.into_iter().zip(offsets) {
            index.insert(key, offset);
        }
        Ok(())
    }

    /// Overwrite the rows already showing `items`.
    pub async fn update_rows(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let by_key: Coalesced<CellValue, &T> = items
            .iter()
            .map(|item| (self.schema.key_of(&*self.provider, item), item))
            .collect();
        let keys: Vec<CellValue> = by_key.keys().cloned().collect();

        let _ops = self.ops.lock().await;
        let resolved = self.resolve_rows(&keys).await?;

        let writes = resolved
            .into_iter()
            .filter_map(|(key, offset)| {
                by_key
                    .get(&key)
                    .map(|item| (offset, self.schema.row_of(&*self.provider, *item)))
            })
            .collect();

        self.surface
            .write_rows(&self.table_id, writes)
            .await
            .map_err(|e| self.classify(e))
    }

    /// Delete the rows for `keys` in one operation.
    pub async fn remove_rows(&self, keys: &[CellValue]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let unique: Coalesced<CellValue, ()> = keys.iter().map(|key| (key.clone(), ())).collect();
        let keys: Vec<CellValue> = unique.into_entries().map(|(key, _)| key).collect();

        let _ops = self.ops.lock().await;
        let resolved = self.resolve_rows(&keys).await?;

        let offsets = resolved.iter().map(|(_, offset)| *offset).collect();
        self.surface
            .delete_rows(&self.table_id, offsets)
            .await
            .map_err(|e| self.classify(e))?;

        self.index.lock().remove_deleted(&resolved);
        Ok(())
    }

    /// Resolve keys to verified row offsets, rebuilding the index at most once.
    async fn resolve_rows(&self, keys: &[CellValue]) -> Result<Vec<(CellValue, usize)>> {
        for attempt in 0..2 {
            match self.try_resolve(keys).await {
                Ok(Some(resolved)) => return Ok(resolved),
                Ok(None) => {}
                // Requested a row outside the current table body
                Err(SurfaceError::OutOfBounds { .. }) => {}
                Err(e) => return Err(self.classify(e)),
            }
            if attempt == 0 {
                self.rebuild_index().await?;
            }
        }

        Err(Error::IndexViolation {
            table: self.table_id.clone(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        })
    }

    /// `Ok(None)` when the index is missing a key or points at the wrong row.
    async fn try_resolve(&self, keys: &[CellValue]) -> std::result::Result<Option<Vec<(CellValue, usize)>>, SurfaceError> {
        let offsets: Option<Vec<usize>> = {
            let index = self.index.lock();
            let offsets = keys.iter().map(|key| index.get(key)).collect();
            offsets
        };
        let Some(offsets) = offsets else {
            return Ok(None);
        };

        let rows = self.surface.read_rows(&self.table_id, &offsets).await?;
        let key_offset = self.schema.key_offset();
        let verified = rows.len() == keys.len()
            && keys
                .iter()
                .zip(&rows)
                .all(|(key, row)| row.get(key_offset) == Some(key));

        Ok(verified.then(|| keys.iter().cloned().zip(offsets).collect()))
    }

    async fn rebuild_index(&self) -> Result<()> {
        let previous = self.index.lock().len();
        debug!("Rebuilding index of {} items for table {}", previous, self.table_id);

        let column = self
            .surface
            .read_column(&self.table_id, self.schema.key_offset())
            .await
            .map_err(|e| self.classify(e))?;

        *self.index.lock() = RowIndex::from_key_column(column);
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn classify(&self, error: SurfaceError) -> Error {
        match error {
            SurfaceError::StructuralMismatch { .. } => Error::SchemaViolation {
                table: self.table_id.to_string(),
                reason: format!("Table does not match its schema: {}", error),
            },
            SurfaceError::TableAbsent(table) => Error::TableAbsent { table },
            other => Error::Surface(other),
        }
    }
}

impl<T> Drop for TableProjector<T> {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn relay_deleted(
    mut surface_deleted: broadcast::Receiver<TableDeleted>,
    table_id: TableId,
    deleted_tx: broadcast::Sender<TableDeleted>,
) {
    loop {
        match surface_deleted.recv().await {
            Ok(notice) if notice.table_id == table_id => {
                warn!("Table {} ({}) was deleted", notice.table_id, notice.table_name);
                let _ = deleted_tx.send(notice);
                return;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                warn!("Missed {} table deletion notices while watching {}", n, table_id);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MemoryGrid;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Quote {
        symbol: &'static str,
        bid: f64,
    }

    fn quote(symbol: &'static str, bid: f64) -> Quote {
        Quote { symbol, bid }
    }

    struct QuoteProvider;

    impl ContentProvider<Quote> for QuoteProvider {
        fn field(&self, item: &Quote, field_name: &str) -> CellValue {
            match field_name {
                "symbol" => CellValue::from(item.symbol),
                "bid" => CellValue::Float(item.bid),
                _ => CellValue::Empty,
            }
        }
    }

    fn key(symbol: &str) -> CellValue {
        CellValue::from(symbol)
    }

    fn row(symbol: &str, bid: f64) -> Vec<CellValue> {
        vec![key(symbol), CellValue::Float(bid)]
    }

    async fn projector() -> (Arc<MemoryGrid>, TableProjector<Quote>) {
        let grid = Arc::new(MemoryGrid::new());
        let schema = TableSchema::new(vec!["symbol".to_string(), "bid".to_string()], "symbol").unwrap();
        let projector = TableProjector::<Quote>::build(
            grid.clone(),
            &RangeAddress::parse("A1").unwrap(),
            schema,
            Arc::new(QuoteProvider),
        )
        .await
        .unwrap();
        (grid, projector)
    }

    async fn seeded() -> (Arc<MemoryGrid>, TableProjector<Quote>) {
        let (grid, projector) = projector().await;
        projector
            .add_rows(&[quote("AAA", 1.0), quote("BBB", 2.0), quote("CCC", 3.0), quote("DDD", 4.0)])
            .await
            .unwrap();
        (grid, projector)
    }

    // =========================================================================
    // Add / update / remove
    // =========================================================================

    #[tokio::test]
    async fn test_build_creates_header() {
        let (grid, projector) = projector().await;
        assert_eq!(grid.header(projector.table_id()).unwrap(), vec!["symbol", "bid"]);
        assert!(projector.is_empty());
    }

    #[tokio::test]
    async fn test_add_rows_indexes_keys() {
        let (grid, projector) = seeded().await;

        assert!(projector.has(&key("AAA")));
        assert!(projector.has(&key("DDD")));
        assert!(!projector.has(&key("EEE")));
        assert_eq!(projector.len(), 4);
        assert_eq!(grid.rows(projector.table_id()).unwrap()[2], row("CCC", 3.0));
    }

    #[tokio::test]
    async fn test_add_rows_coalesces_duplicate_keys() {
        let (grid, projector) = projector().await;
        projector.add_rows(&[quote("AAA", 1.0), quote("AAA", 1.5)]).await.unwrap();

        assert_eq!(grid.rows(projector.table_id()).unwrap(), vec![row("AAA", 1.5)]);
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() {
        let (grid, projector) = projector().await;
        projector.add_rows(&[]).await.unwrap();
        projector.update_rows(&[]).await.unwrap();
        projector.remove_rows(&[]).await.unwrap();

        assert_eq!(grid.len(projector.table_id()).unwrap(), 0);
        assert_eq!(grid.column_reads(), 0);
    }

    #[tokio::test]
    async fn test_update_rows_in_place() {
        let (grid, projector) = seeded().await;
        projector.update_rows(&[quote("BBB", 20.0), quote("DDD", 40.0)]).await.unwrap();

        assert_eq!(
            grid.rows(projector.table_id()).unwrap(),
            vec![row("AAA", 1.0), row("BBB", 20.0), row("CCC", 3.0), row("DDD", 40.0)]
        );
        assert_eq!(projector.index_rebuilds(), 0);
    }

    #[tokio::test]
    async fn test_remove_rows_keeps_index_current() {
        let (grid, projector) = seeded().await;
        projector.remove_rows(&[key("AAA"), key("CCC")]).await.unwrap();

        assert!(!projector.has(&key("AAA")));
        assert!(!projector.has(&key("CCC")));
        assert_eq!(grid.rows(projector.table_id()).unwrap(), vec![row("BBB", 2.0), row("DDD", 4.0)]);

        // Shifted offsets were adjusted locally, so no rebuild is needed
        projector.update_rows(&[quote("DDD", 44.0)]).await.unwrap();
        assert_eq!(grid.rows(projector.table_id()).unwrap()[1], row("DDD", 44.0));
        assert_eq!(projector.index_rebuilds(), 0);
    }

    #[tokio::test]
    async fn test_has_tracks_latest_outcome() {
        let (_grid, projector) = projector().await;
        projector.add_rows(&[quote("AAA", 1.0)]).await.unwrap();
        projector.remove_rows(&[key("AAA")]).await.unwrap();
        assert!(!projector.has(&key("AAA")));

        projector.add_rows(&[quote("AAA", 2.0)]).await.unwrap();
        assert!(projector.has(&key("AAA")));
    }

    // =========================================================================
    // Index recovery
    // =========================================================================

    #[tokio::test]
    async fn test_update_after_external_sort_rebuilds_once() {
        let (grid, projector) = seeded().await;
        grid.sort_by_column(projector.table_id(), 1, true).unwrap();

        projector.update_rows(&[quote("AAA", 1.1), quote("CCC", 3.3)]).await.unwrap();

        assert_eq!(projector.index_rebuilds(), 1);
        assert_eq!(grid.column_reads(), 1);
        assert_eq!(
            grid.rows(projector.table_id()).unwrap(),
            vec![row("DDD", 4.0), row("CCC", 3.3), row("BBB", 2.0), row("AAA", 1.1)]
        );
    }

    #[tokio::test]
    async fn test_remove_after_external_insert_rebuilds_once() {
        let (grid, projector) = seeded().await;
        grid.insert_row_external(projector.table_id(), 0, row("MANUAL", 0.0)).unwrap();

        projector.remove_rows(&[key("BBB")]).await.unwrap();

        assert_eq!(projector.index_rebuilds(), 1);
        assert_eq!(
            grid.rows(projector.table_id()).unwrap(),
            vec![row("MANUAL", 0.0), row("AAA", 1.0), row("CCC", 3.0), row("DDD", 4.0)]
        );
        // The manual row is now known too, because the index came from the table
        assert!(projector.has(&key("MANUAL")));
    }

    #[tokio::test]
    async fn test_out_of_bounds_offset_recovers() {
        let (grid, projector) = seeded().await;
        grid.delete_row_external(projector.table_id(), 0).unwrap();

        // DDD's cached offset 3 is now past the end of the body
        projector.update_rows(&[quote("DDD", 5.0)]).await.unwrap();
        assert_eq!(projector.index_rebuilds(), 1);
        assert_eq!(grid.rows(projector.table_id()).unwrap()[2], row("DDD", 5.0));
    }

    #[tokio::test]
    async fn test_vanished_key_is_index_violation() {
        let (grid, projector) = seeded().await;
        grid.delete_row_external(projector.table_id(), 1).unwrap();

        let result = projector.remove_rows(&[key("BBB")]).await;
        match result {
            Err(Error::IndexViolation { keys, .. }) => assert_eq!(keys, vec!["BBB"]),
            other => panic!("expected IndexViolation, got {:?}", other),
        }
        assert_eq!(projector.index_rebuilds(), 1);
        assert_eq!(grid.len(projector.table_id()).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_key_is_index_violation() {
        let (_grid, projector) = seeded().await;
        let result = projector.update_rows(&[quote("ZZZ", 1.0)]).await;
        assert!(matches!(result, Err(Error::IndexViolation { .. })));
    }

    // =========================================================================
    // Schema drift and deletion
    // =========================================================================

    #[tokio::test]
    async fn test_column_inserted_by_hand_is_schema_violation() {
        let (grid, projector) = seeded().await;
        grid.insert_column_external(projector.table_id(), 2, "note").unwrap();

        let added = projector.add_rows(&[quote("EEE", 5.0)]).await;
        assert!(matches!(added, Err(Error::SchemaViolation { .. })));
        assert!(!projector.has(&key("EEE")));

        let updated = projector.update_rows(&[quote("AAA", 9.0)]).await;
        assert!(matches!(updated, Err(Error::SchemaViolation { .. })));
    }

    #[tokio::test]
    async fn test_deleted_table_is_relayed() {
        let (grid, projector) = seeded().await;
        let mut deleted = projector.subscribe_deleted();

        grid.drop_table(projector.table_id()).unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(1), deleted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&notice.table_id, projector.table_id());

        let result = projector.add_rows(&[quote("EEE", 5.0)]).await;
        assert!(matches!(result, Err(Error::TableAbsent { .. })));
    }
}
