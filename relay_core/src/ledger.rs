//! Durable backlog of records that have not been confirmed by the broker.
//!
//! One append-only CSV file per node, rows `timestamp,v1,…,vN`, no header.
//! File order is append order, and replay keeps it. Rows are read line by
//! line with quoting off, so one corrupt line never swallows its neighbours.
//! Rows of another width (the channel list changed since they were written)
//! are kept as they are and reported, never dropped.
//!
//! Locking: `io` guards every read-modify-write of the file, so an append
//! and a replay rewrite never interleave. Replay does not hold `io` while
//! it uploads: it snapshots the file, uploads without the lock, and then
//! rewrites under the lock, keeping any bytes appended after the snapshot.
//! The tick path therefore never waits on the network to append.

use crate::atomic::write_atomic;
use crate::error::RelayError;
use crate::record::{RecordSchema, SensorRecord, parse_timestamp};
use crate::uploader::Delivery;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Knobs for one replay pass.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Stop uploading after this many failures in a row; the rest is kept.
    pub max_consecutive_failures: u32,
    /// Set at shutdown; unattempted rows are kept.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            cancel: None,
        }
    }
}

impl ReplayOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Confirmed by the broker and removed
    pub delivered: usize,
    /// Attempted, not confirmed, kept
    pub failed: usize,
    /// Not attempted (failure streak or cancellation), kept
    pub deferred: usize,
    /// Unparseable rows, dropped
    pub malformed: usize,
    /// Rows written for a different channel list, kept untouched
    pub other_width: usize,
    /// Rows appended while the pass was uploading, kept after the rest
    pub appended_meanwhile: usize,
    /// Whether the file was rewritten
    pub rewritten: bool,
}

impl ReplaySummary {
    pub fn remaining(&self) -> usize {
        self.failed + self.deferred + self.other_width + self.appended_meanwhile
    }

    pub fn log(&self) {
        if self.malformed > 0 {
            tracing::warn!(malformed = self.malformed, "dropped malformed backlog rows");
        }
        if self.other_width > 0 {
            tracing::warn!(
                rows = self.other_width,
                "backlog rows do not match the configured channels; kept, not uploaded"
            );
        }
        if self.delivered > 0 || self.failed > 0 || self.deferred > 0 {
            tracing::info!(
                delivered = self.delivered,
                failed = self.failed,
                deferred = self.deferred,
                remaining = self.remaining(),
                "backlog replay finished"
            );
        }
    }
}

/// Result of reading the ledger without modifying it.
#[derive(Debug, Default)]
pub struct LedgerScan {
    pub records: Vec<SensorRecord>,
    pub malformed: usize,
    pub other_width: usize,
}

pub struct Ledger {
    path: PathBuf,
    schema: RecordSchema,
    io: Mutex<()>,
    replay_gate: Mutex<()>,
}

fn guard(m: &Mutex<()>) -> MutexGuard<'_, ()> {
    // The guarded data is `()`; a panic elsewhere cannot leave it inconsistent.
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn io_err(path: &Path, what: &str) -> impl FnOnce(std::io::Error) -> RelayError + use<> {
    let ctx = format!("{what} {}", path.display());
    move |e| RelayError::storage(ctx, e)
}

impl Ledger {
    /// `{dir}/node{node}_loss_data.csv`
    pub fn path_in(dir: &Path, node: &str) -> PathBuf {
        dir.join(format!("node{node}_loss_data.csv"))
    }

    pub fn new(path: impl Into<PathBuf>, schema: RecordSchema) -> Self {
        Self {
            path: path.into(),
            schema,
            io: Mutex::new(()),
            replay_gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Missing or zero-length file.
    pub fn is_empty(&self) -> bool {
        fs::metadata(&self.path).map_or(true, |m| m.len() == 0)
    }

    /// Append one row and sync it before returning.
    pub fn append(&self, record: &SensorRecord) -> Result<(), RelayError> {
        let mut w = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::with_capacity(96));
        w.write_record(record.csv_row())
            .map_err(|e| RelayError::storage("encode row", e))?;
        let mut line = w
            .into_inner()
            .map_err(|e| RelayError::storage("encode row", e))?;

        let _io = guard(&self.io);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir, "create"))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err(&self.path, "open"))?;
        // A crash mid-write can leave a partial last row without a newline.
        // Terminate it so this row stays intact; replay drops the fragment.
        if !ends_with_newline(&mut f).map_err(io_err(&self.path, "read"))? {
            line.insert(0, b'\n');
        }
        f.write_all(&line)
            .and_then(|()| f.sync_data())
            .map_err(io_err(&self.path, "write"))?;
        Ok(())
    }

    /// Parse every row without changing the file.
    pub fn scan(&self) -> Result<LedgerScan, RelayError> {
        let bytes = {
            let _io = guard(&self.io);
            self.read_all()?
        };
        let mut scan = LedgerScan::default();
        for row in self.parse(&bytes) {
            match row {
                Row::Valid(r, _) => scan.records.push(r),
                Row::OtherWidth(_) => scan.other_width += 1,
                Row::Malformed => scan.malformed += 1,
            }
        }
        Ok(scan)
    }

    /// Offer every row to `upload` in file order and keep the ones that were
    /// not confirmed. See the module docs for the locking protocol.
    pub fn replay<F>(&self, opts: &ReplayOptions, mut upload: F) -> Result<ReplaySummary, RelayError>
    where
        F: FnMut(&SensorRecord) -> Delivery,
    {
        let _gate = guard(&self.replay_gate);
        let mut summary = ReplaySummary::default();

        let snapshot = {
            let _io = guard(&self.io);
            if self.is_empty() {
                return Ok(summary);
            }
            self.read_all()?
        };

        let mut keep = csv::WriterBuilder::new()
            .has_headers(false)
            .quote_style(csv::QuoteStyle::Never)
            .from_writer(Vec::with_capacity(snapshot.len()));
        let mut streak = 0u32;
        for row in self.parse(&snapshot) {
            let (record, raw) = match row {
                Row::Valid(r, raw) => (r, raw),
                Row::OtherWidth(raw) => {
                    summary.other_width += 1;
                    keep.write_byte_record(&raw)
                        .map_err(|e| RelayError::storage("encode row", e))?;
                    continue;
                }
                Row::Malformed => {
                    summary.malformed += 1;
                    continue;
                }
            };
            if opts.cancelled() || streak >= opts.max_consecutive_failures {
                summary.deferred += 1;
            } else {
                match upload(&record) {
                    Delivery::Confirmed => {
                        summary.delivered += 1;
                        streak = 0;
                        tracing::debug!(timestamp = %record.timestamp_str(), "backlog row delivered");
                        continue;
                    }
                    Delivery::Timeout => {
                        summary.failed += 1;
                        streak += 1;
                    }
                    Delivery::Failed(reason) => {
                        tracing::debug!(%reason, "backlog row not delivered");
                        summary.failed += 1;
                        streak += 1;
                    }
                }
            }
            keep.write_byte_record(&raw)
                .map_err(|e| RelayError::storage("encode row", e))?;
        }
        let mut out = keep
            .into_inner()
            .map_err(|e| RelayError::storage("encode row", e))?;

        if summary.delivered == 0 && summary.malformed == 0 {
            // Nothing to remove; leave the file (and anything appended) alone.
            return Ok(summary);
        }

        let _io = guard(&self.io);
        let current = self.read_all()?;
        if !current.starts_with(&snapshot) {
            return Err(RelayError::Storage(format!(
                "{} changed under replay; keeping it as is",
                self.path.display()
            )));
        }
        let tail = &current[snapshot.len()..];
        let tail = &tail[tail.iter().take_while(|b| **b == b'\n').count()..];
        if !tail.is_empty() {
            summary.appended_meanwhile = tail
                .split(|b| *b == b'\n')
                .filter(|l| !l.is_empty())
                .count();
            out.extend_from_slice(tail);
        }
        write_atomic(&self.path, &out).map_err(io_err(&self.path, "rewrite"))?;
        summary.rewritten = true;
        Ok(summary)
    }

    fn read_all(&self) -> Result<Vec<u8>, RelayError> {
        match fs::read(&self.path) {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_err(&self.path, "read")(e)),
        }
    }

    fn parse<'a>(&'a self, bytes: &'a [u8]) -> impl Iterator<Item = Row> + 'a {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_reader(bytes);
        let mut line = 0usize;
        std::iter::from_fn(move || {
            let mut raw = csv::ByteRecord::new();
            match rdr.read_byte_record(&mut raw) {
                Ok(true) => {
                    line += 1;
                    Some(self.decode(raw, line))
                }
                Ok(false) => None,
                Err(e) => {
                    line += 1;
                    tracing::warn!(line, error = %e, "unreadable backlog row");
                    Some(Row::Malformed)
                }
            }
        })
    }

    fn decode(&self, raw: csv::ByteRecord, line: usize) -> Row {
        let parsed = raw
            .iter()
            .map(std::str::from_utf8)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RelayError::Malformed(e.to_string()))
            .and_then(|cols| self.schema.parse_row(cols));
        match parsed {
            Ok(r) => Row::Valid(r, raw),
            Err(_) if self.is_other_width(&raw) => {
                tracing::debug!(line, columns = raw.len(), "backlog row has another width; keeping it");
                Row::OtherWidth(raw)
            }
            Err(e) => {
                tracing::warn!(line, error = %e, "skipping malformed backlog row");
                Row::Malformed
            }
        }
    }
}

impl Ledger {
    /// A timestamped row whose column count differs from the schema.
    fn is_other_width(&self, raw: &csv::ByteRecord) -> bool {
        raw.len() != self.schema.fields.len() + 1
            && raw
                .get(0)
                .and_then(|ts| std::str::from_utf8(ts).ok())
                .is_some_and(|ts| parse_timestamp(ts).is_ok())
    }
}

enum Row {
    Valid(SensorRecord, csv::ByteRecord),
    /// Kept verbatim; see `ReplaySummary::other_width`.
    OtherWidth(csv::ByteRecord),
    Malformed,
}

fn ends_with_newline(f: &mut fs::File) -> std::io::Result<bool> {
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    f.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ledger(dir: &Path) -> Ledger {
        Ledger::new(
            Ledger::path_in(dir, "3"),
            RecordSchema::new("3", "keelung", vec!["a".into(), "b".into()]),
        )
    }

    fn rec(l: &Ledger, sec: u32) -> SensorRecord {
        let t = Utc.with_ymd_and_hms(2024, 7, 29, 10, 0, sec).unwrap();
        l.schema().record(vec![Some(f64::from(sec)), None], t).unwrap()
    }

    #[test]
    fn append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        assert!(l.is_empty());
        l.append(&rec(&l, 1)).unwrap();
        l.append(&rec(&l, 2)).unwrap();
        assert!(!l.is_empty());
        let text = fs::read_to_string(l.path()).unwrap();
        assert_eq!(text, "2024-07-29T10:00:01Z,1,\n2024-07-29T10:00:02Z,2,\n");
    }

    #[test]
    fn append_after_torn_row_starts_a_fresh_line() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        fs::write(l.path(), "2024-07-29T10:00:01Z,1,\n2024-07-29T1").unwrap();
        l.append(&rec(&l, 3)).unwrap();
        let scan = l.scan().unwrap();
        assert_eq!(scan.records, vec![rec(&l, 1), rec(&l, 3)]);
        assert_eq!(scan.malformed, 1);
    }

    #[test]
    fn replay_without_deliveries_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(&rec(&l, 1)).unwrap();
        let before = fs::read(l.path()).unwrap();
        let s = l
            .replay(&ReplayOptions::default(), |_| Delivery::Timeout)
            .unwrap();
        assert_eq!(s.failed, 1);
        assert!(!s.rewritten);
        assert_eq!(fs::read(l.path()).unwrap(), before);
    }

    #[test]
    fn failure_streak_defers_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        for s in 1..=6 {
            l.append(&rec(&l, s)).unwrap();
        }
        let mut calls = 0;
        let opts = ReplayOptions {
            max_consecutive_failures: 2,
            cancel: None,
        };
        let s = l
            .replay(&opts, |r| {
                calls += 1;
                if r.timestamp_str().ends_with("01Z") {
                    Delivery::Confirmed
                } else {
                    Delivery::Failed("nack".into())
                }
            })
            .unwrap();
        assert_eq!(calls, 3);
        assert_eq!((s.delivered, s.failed, s.deferred), (1, 2, 3));
        let left = l.scan().unwrap().records;
        assert_eq!(left, (2..=6).map(|s| rec(&l, s)).collect::<Vec<_>>());
    }

    #[test]
    fn cancelled_replay_attempts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let l = ledger(dir.path());
        l.append(&rec(&l, 1)).unwrap();
        let opts = ReplayOptions {
            max_consecutive_failures: 3,
            cancel: Some(Arc::new(AtomicBool::new(true))),
        };
        let s = l
            .replay(&opts, |_| panic!("must not upload when cancelled"))
            .unwrap();
        assert_eq!(s.deferred, 1);
        assert!(!l.is_empty());
    }
}
