//! Permanent per-node, per-day CSV log.
//!
//! Every record lands here regardless of network state. A new file starts
//! with two header rows (`node,{id}` and `time,{fields…}`); the day is taken
//! from the record's UTC timestamp.

use crate::error::RelayError;
use crate::record::{RecordSchema, SensorRecord};
use chrono::NaiveDate;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct DailyLog {
    dir: PathBuf,
    schema: RecordSchema,
}

impl DailyLog {
    pub fn new(dir: impl Into<PathBuf>, schema: RecordSchema) -> Self {
        Self {
            dir: dir.into(),
            schema,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/node{node}_{YYYYMMDD}.csv`
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("node{}_{}.csv", self.schema.node, day.format("%Y%m%d")))
    }

    /// Append one row and sync it to disk. Returns the file written.
    pub fn append(&self, record: &SensorRecord) -> Result<PathBuf, RelayError> {
        let path = self.path_for(record.timestamp().date_naive());
        fs::create_dir_all(&self.dir)
            .map_err(|e| RelayError::storage(format!("create {}", self.dir.display()), e))?;
        let fresh = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        let mut w = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(Vec::with_capacity(128));
        let encode = |e: csv::Error| RelayError::storage("encode row", e);
        if fresh {
            w.write_record(["node", self.schema.node.as_str()])
                .map_err(encode)?;
            w.write_record(
                std::iter::once("time").chain(self.schema.fields.iter().map(String::as_str)),
            )
            .map_err(encode)?;
        }
        w.write_record(record.csv_row()).map_err(encode)?;
        let bytes = w
            .into_inner()
            .map_err(|e| RelayError::storage("encode row", e))?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RelayError::storage(format!("open {}", path.display()), e))?;
        f.write_all(&bytes)
            .and_then(|()| f.sync_data())
            .map_err(|e| RelayError::storage(format!("write {}", path.display()), e))?;
        if fresh {
            tracing::info!(path = %path.display(), "started daily log");
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn log(dir: &Path) -> DailyLog {
        DailyLog::new(
            dir,
            RecordSchema::new("3", "keelung", vec!["TGS".into(), "MH_T7042A".into()]),
        )
    }

    #[test]
    fn first_write_of_the_day_adds_headers() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path());
        let s = log.schema.clone();
        let t = Utc.with_ymd_and_hms(2024, 7, 29, 23, 59, 58).unwrap();
        log.append(&s.record(vec![Some(1.5), Some(4.0)], t).unwrap())
            .unwrap();
        let p = log
            .append(
                &s.record(vec![Some(1.6), None], t + chrono::Duration::seconds(1))
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(p, dir.path().join("node3_20240729.csv"));
        let text = fs::read_to_string(&p).unwrap();
        assert_eq!(
            text,
            "node,3\ntime,TGS,MH_T7042A\n2024-07-29T23:59:58Z,1.5,4\n2024-07-29T23:59:59Z,1.6,\n"
        );
    }

    #[test]
    fn day_rollover_opens_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path());
        let s = log.schema.clone();
        let t = Utc.with_ymd_and_hms(2024, 7, 29, 23, 59, 59).unwrap();
        let a = log.append(&s.record(vec![Some(1.0), Some(1.0)], t).unwrap()).unwrap();
        let b = log
            .append(
                &s.record(vec![Some(1.0), Some(1.0)], t + chrono::Duration::seconds(1))
                    .unwrap(),
            )
            .unwrap();
        assert_ne!(a, b);
        assert!(fs::read_to_string(&b).unwrap().starts_with("node,3\n"));
    }

    #[test]
    fn unwritable_directory_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let log = log(&blocker.join("sub"));
        let s = log.schema.clone();
        let t = Utc.with_ymd_and_hms(2024, 7, 29, 0, 0, 0).unwrap();
        let err = log
            .append(&s.record(vec![Some(1.0), Some(1.0)], t).unwrap())
            .unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)));
    }
}
