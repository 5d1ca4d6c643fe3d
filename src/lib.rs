/// LiveGrid - Streaming Topics onto Grid Tables
///
/// Keeps a slow, single-writer grid display in step with a fast stream of
/// keyed updates. Updates are coalesced into backpressure-gated batches,
/// classified against what the display currently shows, and applied through
/// a projector that tracks row positions with a self-healing index.

pub mod address;
pub mod batch;
pub mod batcher;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod grid;
pub mod index;
pub mod orchestrator;
pub mod projector;
pub mod replay;
pub mod schema;
pub mod source;
pub mod surface;
pub mod value;

pub use address::RangeAddress;
pub use batch::{BatchReadyReason, EventBatch, ReadySignal};
pub use batcher::{BatchReceiver, EventBatcher};
pub use config::{BatchConfig, ViewerConfig};
pub use discovery::{build_from_selector, SuperSchema};
pub use error::{Error, Result};
pub use event::{Coalesced, KeyedEvent, UnsubscribeReason};
pub use grid::MemoryGrid;
pub use index::RowIndex;
pub use orchestrator::{
    apply_batch, BatchCategory, BatchOutcome, BatchSummary, CategoryFailure, StreamOrchestrator, TopicContentProvider,
    TopicEvent, TopicValue,
};
pub use projector::TableProjector;
pub use replay::{load_csv, CatchUp, ReplayFeed, Row, RowSink};
pub use schema::{ContentProvider, TableSchema};
pub use source::{FetchPage, MemorySource, SourceError, TopicSelector, TopicSource, ValueStream};
pub use surface::{GridSurface, SurfaceError, TableDeleted, TableId};
pub use value::CellValue;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn config() -> ViewerConfig {
        ViewerConfig::default().with_batch(BatchConfig::new(1000, Duration::from_millis(10)))
    }

    fn quote(bid: f64, ask: f64) -> serde_json::Value {
        json!({ "bid": bid, "ask": ask })
    }

    /// Poll until `condition` holds, failing after two seconds
    async fn eventually<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn row_for(grid: &MemoryGrid, table: &TableId, path: &str) -> Option<Vec<CellValue>> {
        grid.rows(table)
            .ok()?
            .into_iter()
            .find(|row| row[0] == CellValue::from(path))
    }

    fn bid_of(grid: &MemoryGrid, table: &TableId, path: &str) -> Option<CellValue> {
        let column = grid.header(table).ok()?.iter().position(|h| h == "/bid")?;
        row_for(grid, table, path).map(|row| row[column].clone())
    }

    async fn pipeline(paths: &[&str]) -> (Arc<MemorySource>, Arc<MemoryGrid>, StreamOrchestrator) {
        let source = Arc::new(MemorySource::new());
        for (i, path) in paths.iter().enumerate() {
            source.publish(path, quote(i as f64 + 1.0, i as f64 + 1.1));
        }
        let grid = Arc::new(MemoryGrid::new());

        let orchestrator = StreamOrchestrator::build(source.clone(), grid.clone(), paths, config())
            .await
            .unwrap();
        let table = orchestrator.projector().table_id().clone();
        let expected = paths.len();
        eventually(|| grid.len(&table).unwrap() == expected).await;

        (source, grid, orchestrator)
    }

    #[tokio::test]
    async fn test_complete_workflow() {
        let (source, grid, orchestrator) = pipeline(&["fx/EURUSD", "fx/GBPUSD"]).await;
        let table = orchestrator.projector().table_id().clone();

        assert_eq!(grid.header(&table).unwrap(), vec!["topicPath", "/ask", "/bid"]);
        assert_eq!(bid_of(&grid, &table, "fx/GBPUSD"), Some(CellValue::Float(2.0)));

        // A burst of updates lands as the latest value
        for i in 0..50 {
            source.publish("fx/EURUSD", quote(100.0 + i as f64, 200.0));
        }
        eventually(|| bid_of(&grid, &table, "fx/EURUSD") == Some(CellValue::Float(149.0))).await;

        // Removal deletes the row
        source.remove("fx/GBPUSD", UnsubscribeReason::Removal);
        eventually(|| grid.len(&table).unwrap() == 1).await;
        assert!(!orchestrator.projector().has(&CellValue::from("fx/GBPUSD")));
        assert_eq!(orchestrator.projector().index_rebuilds(), 0);
    }

    #[tokio::test]
    async fn test_recovers_from_external_sort() {
        let (source, grid, orchestrator) = pipeline(&["fx/AUDUSD", "fx/EURUSD", "fx/GBPUSD"]).await;
        let table = orchestrator.projector().table_id().clone();
        let bid_column = grid.header(&table).unwrap().iter().position(|h| h == "/bid").unwrap();

        grid.sort_by_column(&table, bid_column, true).unwrap();
        source.publish("fx/AUDUSD", quote(0.5, 0.6));

        eventually(|| bid_of(&grid, &table, "fx/AUDUSD") == Some(CellValue::Float(0.5))).await;
        assert_eq!(orchestrator.projector().index_rebuilds(), 1);
        assert_eq!(grid.rows(&table).unwrap()[0][0], CellValue::from("fx/GBPUSD"));
        assert_eq!(grid.rows(&table).unwrap()[2][0], CellValue::from("fx/AUDUSD"));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_pipeline() {
        let (source, grid, orchestrator) = pipeline(&["fx/EURUSD", "fx/GBPUSD"]).await;
        let table = orchestrator.projector().table_id().clone();

        // The row vanishes behind our back, so its removal cannot be resolved
        grid.delete_row_external(&table, 0).unwrap();
        source.remove("fx/EURUSD", UnsubscribeReason::Removal);
        eventually(|| orchestrator.projector().index_rebuilds() == 1).await;

        source.publish("fx/GBPUSD", quote(9.0, 9.1));
        eventually(|| bid_of(&grid, &table, "fx/GBPUSD") == Some(CellValue::Float(9.0))).await;
    }

    #[tokio::test]
    async fn test_add_topic_path_after_build() {
        let (source, grid, orchestrator) = pipeline(&["fx/EURUSD"]).await;
        let table = orchestrator.projector().table_id().clone();

        source.publish("fx/USDJPY", json!({ "bid": 150.0, "ask": 150.1, "venue": "TKY" }));
        orchestrator.add_topic_path("fx/USDJPY").await.unwrap();

        eventually(|| grid.len(&table).unwrap() == 2).await;
        assert_eq!(bid_of(&grid, &table, "fx/USDJPY"), Some(CellValue::Float(150.0)));
        // Columns were fixed at build time
        assert_eq!(grid.header(&table).unwrap().len(), 3);
        assert_eq!(orchestrator.topic_paths(), vec!["fx/EURUSD", "fx/USDJPY"]);
    }

    #[tokio::test]
    async fn test_deleted_table_is_reported() {
        let (_source, grid, orchestrator) = pipeline(&["fx/EURUSD"]).await;
        let mut deleted = orchestrator.projector().subscribe_deleted();

        grid.drop_table(orchestrator.projector().table_id()).unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(1), deleted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&notice.table_id, orchestrator.projector().table_id());
    }

    #[tokio::test]
    async fn test_replay_drives_grid() {
        let (source, grid, orchestrator) = pipeline(&["fx/EURUSD"]).await;
        let table = orchestrator.projector().table_id().clone();

        let tape = "tm,bid,ask\n\
                    24.01.2023 09:30:00.000,1.10,1.11\n\
                    24.01.2023 09:30:00.020,1.12,1.13\n\
                    24.01.2023 09:30:00.040,1.14,1.15\n";
        let rows = load_csv(tape).unwrap();
        let feed = ReplayFeed::new("fx/EURUSD", rows, chrono::Utc::now(), CatchUp::Latest).unwrap();
        feed.replay(source.as_ref()).await.unwrap();

        eventually(|| bid_of(&grid, &table, "fx/EURUSD") == Some(CellValue::Float(1.14))).await;
        assert_eq!(grid.len(&table).unwrap(), 1);
    }
}
