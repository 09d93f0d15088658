//! Sensor records and their two encodings: the JSON wire payload and the
//! CSV row shared by the daily log and the backlog ledger.

use crate::error::RelayError;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde_json::{Map, Value};

/// ISO-8601 UTC at second precision with a trailing `Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One named channel value. `None` marks a channel that failed to read.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub value: Option<f64>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Identity and column layout shared by every record of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub node: String,
    pub location: String,
    pub fields: Vec<String>,
}

impl RecordSchema {
    pub fn new(node: impl Into<String>, location: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            node: node.into(),
            location: location.into(),
            fields,
        }
    }

    /// Build a record for this node from values in field order.
    pub fn record(
        &self,
        values: Vec<Option<f64>>,
        timestamp: DateTime<Utc>,
    ) -> Result<SensorRecord, RelayError> {
        if values.len() != self.fields.len() {
            return Err(RelayError::Malformed(format!(
                "expected {} values, got {}",
                self.fields.len(),
                values.len()
            )));
        }
        let measurements = self
            .fields
            .iter()
            .zip(values)
            .map(|(name, value)| Measurement::new(name.clone(), value))
            .collect();
        Ok(SensorRecord::new(
            self.node.clone(),
            self.location.clone(),
            measurements,
            timestamp,
        ))
    }

    /// Parse a `timestamp,v1,…,vN` row back into a record.
    pub fn parse_row<'a, I>(&self, row: I) -> Result<SensorRecord, RelayError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut cols = row.into_iter();
        let ts = cols
            .next()
            .ok_or_else(|| RelayError::Malformed("empty row".into()))?;
        let timestamp = parse_timestamp(ts)?;
        let values = cols
            .map(|c| {
                let c = c.trim();
                if c.is_empty() {
                    return Ok(None);
                }
                c.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(Some)
                    .ok_or_else(|| RelayError::Malformed(format!("bad value {c:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.record(values, timestamp)
    }
}

/// One sample of every channel of a node, taken at a single instant.
///
/// Immutable once built; the timestamp is truncated to whole seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    node: String,
    location: String,
    measurements: Vec<Measurement>,
    timestamp: DateTime<Utc>,
}

impl SensorRecord {
    pub fn new(
        node: impl Into<String>,
        location: impl Into<String>,
        measurements: Vec<Measurement>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            node: node.into(),
            location: location.into(),
            measurements,
            timestamp: timestamp.trunc_subsecs(0),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn timestamp_str(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// `{"node": …, <field>: <number|null>…, "timestamp": …}`
    pub fn to_payload(&self) -> Value {
        let mut map = Map::with_capacity(self.measurements.len() + 2);
        map.insert("node".into(), Value::String(self.node.clone()));
        for m in &self.measurements {
            let v = m
                .value
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number);
            map.insert(m.name.clone(), v);
        }
        map.insert("timestamp".into(), Value::String(self.timestamp_str()));
        Value::Object(map)
    }

    /// Row cells `timestamp, v1, …, vN`; absent values are empty cells.
    pub fn csv_row(&self) -> Vec<String> {
        std::iter::once(self.timestamp_str())
            .chain(
                self.measurements
                    .iter()
                    .map(|m| m.value.map(|v| v.to_string()).unwrap_or_default()),
            )
            .collect()
    }
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RelayError> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
        .map(|n| n.and_utc())
        .map_err(|e| RelayError::Malformed(format!("bad timestamp {s:?}: {e}")))
}
