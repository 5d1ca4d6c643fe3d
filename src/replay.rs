/// Replay Feed - Recorded Ticks Played Back in Real Time
///
/// A `ReplayFeed` holds a tape of timestamped rows and plays them onto a
/// `RowSink` at their original pace, shifted into the present: `dtime` is
/// the offset added to every recorded timestamp.
///
/// The tape can be wound on with `fast_forward`. Rows skipped over are not
/// lost: they are handed to the sink according to the feed's `CatchUp` mode,
/// and a placeholder row marks the new play head so that replay resumes at
/// the right moment.
///
/// # Tape Format
///
/// `load_csv` reads a header line and then one row per line. The first column
/// is a timestamp such as `24.01.2023 09:30:00.125` and is always named
/// `tm`; every other column is a floating point number.

use crate::error::{Error, Result};
use crate::event::Coalesced;
use crate::source::MemorySource;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use futures::future::try_join_all;
use indexmap::IndexMap;
use log::{debug, info};
use serde_json::{json, Map, Value as JsonValue};
use std::time::Duration;

/// Timestamp layout of the first CSV column
pub const TM_FORMAT: &str = "%d.%m.%Y %H:%M:%S%.3f";

/// Rows applied concurrently when catching up with `CatchUp::All`
pub const CATCH_UP_CHUNK: usize = 512;

const PROGRESS_INTERVAL: usize = 100;

/// One recorded tick
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub tm: DateTime<Utc>,
    pub fields: IndexMap<String, f64>,
    placeholder: bool,
}

impl Row {
    pub fn new(tm: DateTime<Utc>, fields: IndexMap<String, f64>) -> Self {
        Row {
            tm,
            fields,
            placeholder: false,
        }
    }

    /// A row that only marks a point in time and is never applied
    pub fn placeholder(tm: DateTime<Utc>) -> Self {
        Row {
            tm,
            fields: IndexMap::new(),
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// The row as a topic value: `tm` as an RFC 3339 string plus every field.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        object.insert(
            "tm".to_string(),
            json!(self.tm.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        for (name, value) in &self.fields {
            object.insert(name.clone(), json!(value));
        }
        JsonValue::Object(object)
    }
}

/// Destination of replayed rows
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn apply(&self, topic: &str, row: &Row) -> Result<()>;
}

#[async_trait]
impl RowSink for MemorySource {
    async fn apply(&self, topic: &str, row: &Row) -> Result<()> {
        self.publish(topic, row.to_json());
        Ok(())
    }
}

/// How rows skipped by a fast forward reach the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUp {
    /// Only the latest skipped row is applied; the topic holds one value
    Latest,
    /// Every skipped row is applied; the topic keeps a history
    All,
}

pub struct ReplayFeed {
    topic: String,
    rows: Vec<Row>,
    /// Added to a recorded timestamp to bring it into the present
    dtime: TimeDelta,
    catch_up: CatchUp,
}

impl ReplayFeed {
    /// Prepare to replay `rows` onto `topic` as if the first row happened `now`.
    pub fn new(topic: impl Into<String>, rows: Vec<Row>, now: DateTime<Utc>, catch_up: CatchUp) -> Result<Self> {
        let t0 = rows
            .first()
            .map(|row| row.tm)
            .ok_or_else(|| Error::Replay("no rows to replay".to_string()))?;
        let dtime = now - t0;
        if dtime < TimeDelta::zero() {
            return Err(Error::Replay(format!("negative dtime: {} should be in the past", t0)));
        }

        Ok(ReplayFeed {
            topic: topic.into(),
            rows,
            dtime,
            catch_up,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn dtime(&self) -> TimeDelta {
        self.dtime
    }

    /// Play every row onto `sink`, each at its shifted time.
    pub async fn replay<S: RowSink + ?Sized>(&self, sink: &S) -> Result<()> {
        debug!("Replaying {} with dtime {}ms", self.topic, self.dtime.num_milliseconds());

        for (count, row) in self.rows.iter().enumerate() {
            let due = row.tm + self.dtime;
            if let Ok(wait) = (due - Utc::now()).to_std() {
                tokio::time::sleep(wait).await;
            }
            if !row.is_placeholder() {
                sink.apply(&self.topic, row).await?;
            }
            if (count + 1) % PROGRESS_INTERVAL == 0 {
                info!("Updated topic {} with {} updates", self.topic, count + 1);
            }
        }
        Ok(())
    }

    /// Wind the tape on by `duration`, catching `sink` up on the rows skipped.
    ///
    /// Returns how many rows were skipped. Fails if no row lies beyond the
    /// new play head.
    pub async fn fast_forward<S: RowSink + ?Sized>(&mut self, duration: Duration, sink: &S) -> Result<usize> {
        info!("Fast forwarding {} by {}ms", self.topic, duration.as_millis());

        let delta = TimeDelta::from_std(duration).map_err(|e| Error::Replay(e.to_string()))?;
        let target = self.rows[0].tm + delta;
        let next = self
            .rows
            .iter()
            .position(|row| row.tm > target)
            .ok_or_else(|| Error::Replay("Too few rows".to_string()))?;

        let forwarded: Vec<Row> = self.rows.drain(..next).collect();
        self.rows.insert(0, Row::placeholder(target));
        self.dtime -= delta;

        self.catch_up(sink, &forwarded).await?;
        Ok(next)
    }

    async fn catch_up<S: RowSink + ?Sized>(&self, sink: &S, forwarded: &[Row]) -> Result<()> {
        let rows = forwarded.iter().filter(|row| !row.is_placeholder());

        match self.catch_up {
            CatchUp::Latest => {
                let latest: Coalesced<&str, &Row> = rows.map(|row| (self.topic.as_str(), row)).collect();
                for row in latest.into_values() {
                    sink.apply(&self.topic, row).await?;
                }
            }
            CatchUp::All => {
                let rows: Vec<&Row> = rows.collect();
                for chunk in rows.chunks(CATCH_UP_CHUNK) {
                    try_join_all(chunk.iter().map(|row| sink.apply(&self.topic, row))).await?;
                }
                info!("Appended {} events to {}", rows.len(), self.topic);
            }
        }
        Ok(())
    }
}

/// Parse a CSV tape.
pub fn load_csv(text: &str) -> Result<Vec<Row>> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| Error::Replay("cannot load header".to_string()))?
        .split(',')
        .collect();

    let mut rows = Vec::new();
    for (number, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').collect();
        if cells.len() != header.len() {
            return Err(Error::Replay(format!(
                "line {}: expected {} fields, found {}",
                number + 2,
                header.len(),
                cells.len()
            )));
        }

        let tm = NaiveDateTime::parse_from_str(cells[0], TM_FORMAT)
            .map_err(|e| Error::Replay(format!("line {}: bad timestamp '{}': {}", number + 2, cells[0], e)))?
            .and_utc();
        let fields = header[1..]
            .iter()
            .zip(&cells[1..])
            .map(|(name, cell)| {
                cell.trim()
                    .parse::<f64>()
                    .map(|value| (name.to_string(), value))
                    .map_err(|e| Error::Replay(format!("line {}: bad value for {}: {}", number + 2, name, e)))
            })
            .collect::<Result<IndexMap<_, _>>>()?;

        rows.push(Row::new(tm, fields));
    }

    info!("Loaded {} rows", rows.len());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<f64>>,
    }

    impl RecordingSink {
        fn values(&self) -> Vec<f64> {
            self.applied.lock().clone()
        }
    }

    #[async_trait]
    impl RowSink for RecordingSink {
        async fn apply(&self, _topic: &str, row: &Row) -> Result<()> {
            self.applied.lock().push(row.fields["value"]);
            Ok(())
        }
    }

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    fn row(ms: i64, value: f64) -> Row {
        Row::new(at_ms(ms), [("value".to_string(), value)].into_iter().collect())
    }

    fn four_rows() -> Vec<Row> {
        vec![row(0, 1000.0), row(25, 1001.0), row(75, 1002.0), row(100, 1003.0)]
    }

    // =========================================================================
    // Placeholders and construction
    // =========================================================================

    #[test]
    fn test_placeholder() {
        let marker = Row::placeholder(at_ms(5));
        assert!(marker.is_placeholder());
        assert_eq!(marker.tm, at_ms(5));
        assert!(!row(5, 1.0).is_placeholder());
    }

    #[test]
    fn test_future_tape_rejected() {
        let result = ReplayFeed::new("some/topic", four_rows(), at_ms(-1), CatchUp::Latest);
        assert!(matches!(result, Err(Error::Replay(_))));
        assert!(ReplayFeed::new("some/topic", Vec::new(), Utc::now(), CatchUp::Latest).is_err());
    }

    #[test]
    fn test_row_to_json() {
        let json = row(25, 1001.0).to_json();
        assert_eq!(json["tm"], "1970-01-01T00:00:00.025Z");
        assert_eq!(json["value"], 1001.0);
    }

    // =========================================================================
    // Replay
    // =========================================================================

    #[tokio::test]
    async fn test_replay_in_order_at_pace() {
        let feed = ReplayFeed::new("some/topic", four_rows(), Utc::now(), CatchUp::Latest).unwrap();
        let sink = RecordingSink::default();

        let started = Instant::now();
        feed.replay(&sink).await.unwrap();

        assert_eq!(sink.values(), vec![1000.0, 1001.0, 1002.0, 1003.0]);
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_fast_forward_latest_then_replay() {
        let mut feed = ReplayFeed::new("some/topic", four_rows(), Utc::now(), CatchUp::Latest).unwrap();
        let sink = RecordingSink::default();

        let forwarded = feed.fast_forward(Duration::from_millis(50), &sink).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(sink.values(), vec![1001.0]);

        assert!(feed.rows()[0].is_placeholder());
        assert_eq!(feed.rows()[0].tm, at_ms(50));
        assert_eq!(feed.rows().len(), 3);

        feed.replay(&sink).await.unwrap();
        assert_eq!(sink.values(), vec![1001.0, 1002.0, 1003.0]);
    }

    #[tokio::test]
    async fn test_fast_forward_all_then_replay() {
        let mut feed = ReplayFeed::new("topic/path", four_rows(), Utc::now(), CatchUp::All).unwrap();
        let sink = RecordingSink::default();

        let forwarded = feed.fast_forward(Duration::from_millis(50), &sink).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(sink.values(), vec![1000.0, 1001.0]);

        feed.replay(&sink).await.unwrap();
        assert_eq!(sink.values(), vec![1000.0, 1001.0, 1002.0, 1003.0]);
    }

    #[tokio::test]
    async fn test_fast_forward_large_tape() {
        // Ticks at 1s, 2s, ... 100s
        let rows: Vec<Row> = (1..=100).map(|i| row(i * 1000, (i * 1000) as f64)).collect();
        let now = at_ms(1000) + TimeDelta::milliseconds(100_000);
        let mut feed = ReplayFeed::new("topic/path", rows, now, CatchUp::All).unwrap();
        let sink = RecordingSink::default();

        let forwarded = feed.fast_forward(Duration::from_millis(99_000 - 50), &sink).await.unwrap();
        assert_eq!(forwarded, 99);
        assert_eq!(sink.values().len(), 99);
        assert_eq!(feed.dtime(), TimeDelta::milliseconds(100_000 - 98_950));
    }

    #[tokio::test]
    async fn test_fast_forward_past_end_fails() {
        let mut feed = ReplayFeed::new("some/topic", four_rows(), Utc::now(), CatchUp::Latest).unwrap();
        let sink = RecordingSink::default();

        let result = feed.fast_forward(Duration::from_millis(100), &sink).await;
        assert!(matches!(result, Err(Error::Replay(_))));
        assert!(sink.values().is_empty());
        assert_eq!(feed.rows().len(), 4);
    }

    #[tokio::test]
    async fn test_replay_publishes_to_source() {
        let source = MemorySource::new();
        let feed = ReplayFeed::new("fx/GBPUSD", vec![row(0, 1.25)], Utc::now(), CatchUp::Latest).unwrap();

        feed.replay(&source).await.unwrap();
        assert_eq!(source.value("fx/GBPUSD").unwrap()["value"], 1.25);
    }

    // =========================================================================
    // CSV loading
    // =========================================================================

    #[test]
    fn test_load_csv() {
        let text = "Gmt time,Bid,Ask\n\
                    24.01.2023 09:30:00.125,1.2345,1.2347\n\
                    24.01.2023 09:30:01.000,1.2346,1.2348\n";
        let rows = load_csv(text).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tm.to_rfc3339_opts(SecondsFormat::Millis, true), "2023-01-24T09:30:00.125Z");
        assert_eq!(rows[0].fields["Bid"], 1.2345);
        assert_eq!(rows[1].fields["Ask"], 1.2348);
        assert!(!rows[0].fields.contains_key("Gmt time"));
    }

    #[test]
    fn test_load_csv_rejects_bad_lines() {
        assert!(load_csv("").is_err());
        assert!(load_csv("tm,v\n2023-01-24,1.0").is_err());
        assert!(load_csv("tm,v\n24.01.2023 09:30:00.000,abc").is_err());
        assert!(load_csv("tm,v\n24.01.2023 09:30:00.000").is_err());
    }
}
