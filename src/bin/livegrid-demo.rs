/// LiveGrid Demo
///
/// Streams a handful of synthetic FX topics from an in-memory source into an
/// in-memory grid and logs the table once a second. Stop with Ctrl-C.
///
/// Configuration comes from the `LIVEGRID_*` environment variables. If
/// `LIVEGRID_REPLAY_FILE` names a CSV tape, it is also replayed onto the
/// `replay/tape` topic.

use livegrid::{
    load_csv, CatchUp, CellValue, MemoryGrid, MemorySource, ReplayFeed, StreamOrchestrator, ViewerConfig,
};
use log::{error, info};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const PAIRS: [(&str, f64); 4] = [
    ("fx/EURUSD", 1.0850),
    ("fx/GBPUSD", 1.2700),
    ("fx/USDJPY", 148.50),
    ("fx/AUDUSD", 0.6550),
];
const SPREAD: f64 = 0.0002;
const TICK: Duration = Duration::from_millis(5);
const REPLAY_TOPIC: &str = "replay/tape";

fn quote(mid: f64) -> serde_json::Value {
    json!({ "bid": mid - SPREAD / 2.0, "ask": mid + SPREAD / 2.0, "mid": mid })
}

fn render(row: &[CellValue]) -> String {
    row.iter().map(|cell| format!("{:>14}", cell.to_string())).collect()
}

#[tokio::main]
async fn main() -> livegrid::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = ViewerConfig::from_env()?;
    info!("Starting demo with {:?}", config);

    let source = Arc::new(MemorySource::new());
    for (path, mid) in PAIRS {
        source.publish(path, quote(mid));
    }
    let grid = Arc::new(MemoryGrid::new());

    let mut paths: Vec<&str> = PAIRS.iter().map(|(path, _)| *path).collect();
    let replay = match std::env::var("LIVEGRID_REPLAY_FILE") {
        Ok(file) => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| livegrid::Error::Replay(format!("{}: {}", file, e)))?;
            let rows = load_csv(&text)?;
            if let Some(first) = rows.first() {
                // Seed the topic so discovery sees the tape's fields
                source.publish(REPLAY_TOPIC, first.to_json());
                paths.push(REPLAY_TOPIC);
            }
            Some(rows)
        }
        Err(_) => None,
    };

    let orchestrator = StreamOrchestrator::build(source.clone(), grid.clone(), &paths, config).await?;
    let table = orchestrator.projector().table_id().clone();

    if let Some(rows) = replay.filter(|rows| !rows.is_empty()) {
        let feed = ReplayFeed::new(REPLAY_TOPIC, rows, chrono::Utc::now(), CatchUp::Latest)?;
        let sink = source.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.replay(sink.as_ref()).await {
                error!("Replay stopped: {}", e);
            }
        });
    }

    // Random-walk-ish ticks without pulling in an RNG
    let ticker = {
        let source = source.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                tick += 1;
                for (i, (path, base)) in PAIRS.iter().enumerate() {
                    let phase = tick as f64 / 200.0 + i as f64;
                    source.publish(path, quote(base * (1.0 + 0.001 * phase.sin())));
                }
            }
        })
    };

    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let header = grid.header(&table)?;
                info!("{}", header.iter().map(|h| format!("{:>14}", h)).collect::<String>());
                for row in grid.rows(&table)? {
                    info!("{}", render(&row));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    ticker.abort();
    Ok(())
}
