//! Data models for the live telemetry client.
//!
//! Wire payloads arrive loosely typed ([`RawReading`]) from both the REST
//! surface and the push channel; they are validated into the strict
//! [`Reading`] record at the boundary and nothing downstream ever sees a
//! partial object.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::PayloadError;

// ---

/// Raw sensor reading as sent by the backend (REST body or push payload).
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    // ---
    pub id: Option<String>,
    pub sensor_type: Option<String>,
    pub sensor_instance_id: Option<String>,
    pub value: Option<serde_json::Value>,
    pub unit: Option<String>,
    pub timestamp: Option<String>,
    pub location: Option<String>,
}

/// One timestamped sensor measurement. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    // ---
    pub sensor_type: String,
    pub sensor_instance_id: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// Validation of wire payloads into strict readings.
impl RawReading {
    // ---
    pub fn to_reading(&self) -> Result<Reading, PayloadError> {
        // ---
        let sensor_instance_id = non_empty(&self.sensor_instance_id, "sensorInstanceId")?;
        let sensor_type = non_empty(&self.sensor_type, "sensorType")?;

        // A reading without a unit is still meaningful (occupancy counts)
        let unit = self.unit.clone().unwrap_or_default();

        let value = match &self.value {
            None | Some(serde_json::Value::Null) => return Err(PayloadError::MissingField("value")),
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        }
        .filter(|v| v.is_finite())
        .ok_or_else(|| PayloadError::InvalidValue {
            field: "value",
            reason: format!("{:?} is not a finite number", self.value),
        })?;

        let raw_ts = self
            .timestamp
            .as_deref()
            .ok_or(PayloadError::MissingField("timestamp"))?;
        let timestamp = parse_timestamp(raw_ts)?;

        Ok(Reading {
            sensor_type,
            sensor_instance_id,
            value,
            unit,
            timestamp,
        })
    }
}

fn non_empty(field: &Option<String>, name: &'static str) -> Result<String, PayloadError> {
    // ---
    match field.as_deref().map(str::trim) {
        None => Err(PayloadError::MissingField(name)),
        Some("") => Err(PayloadError::InvalidValue {
            field: name,
            reason: "empty string".to_string(),
        }),
        Some(s) => Ok(s.to_string()),
    }
}

/// Parse an RFC 3339 timestamp. Offset-less timestamps are taken as UTC,
/// which is what the backend emits for its own clock.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PayloadError> {
    // ---
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| PayloadError::InvalidTimestamp(raw.to_string()))
}

/// Reconciled, continuously updated per-instance display record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStat {
    // ---
    pub instance_id: String,
    pub latest_value: f64,
    pub average_value: f64,
    pub unit: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub last_updated: DateTime<Utc>,
}

/// Rolling average over the last N readings of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AverageReading {
    // ---
    pub sensor_instance_id: String,
    pub average: f64,
    pub count: u32,
}

/// One page of a paginated REST query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    // ---
    pub data: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_records: u64,
}

/// Filter for windowed reading queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    // ---
    pub sensor_type: Option<String>,
    pub sensor_instance_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub sort_by: Option<String>,
    pub sort_descending: Option<bool>,
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
}

impl ReadingFilter {
    // ---
    /// Query-string pairs in the names the backend expects.
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        // ---
        let mut query = Vec::new();
        if let Some(t) = &self.sensor_type {
            query.push(("sensorType", t.clone()));
        }
        if let Some(id) = &self.sensor_instance_id {
            query.push(("sensorInstanceId", id.clone()));
        }
        if let Some(start) = &self.start_time {
            query.push(("startDate", start.to_rfc3339()));
        }
        if let Some(end) = &self.end_time {
            query.push(("endDate", end.to_rfc3339()));
        }
        if let Some(sort_by) = &self.sort_by {
            query.push(("sortBy", sort_by.clone()));
        }
        if let Some(desc) = self.sort_descending {
            query.push(("sortDescending", desc.to_string()));
        }
        if let Some(page) = self.page_number {
            query.push(("pageNumber", page.to_string()));
        }
        if let Some(size) = self.page_size {
            query.push(("pageSize", size.to_string()));
        }
        query
    }
}

/// JSON key of the bucket label in a serialized [`ChartRow`].
pub const BUCKET_KEY: &str = "bucket";

/// Prefix marking an escaped series id in a serialized [`ChartRow`].
pub const SERIES_ESCAPE: char = '~';

/// One time bucket of aligned series. Sparse: a series with no reading in
/// the bucket has no entry, which is distinct from a zero value.
///
/// Serializes flat, `{"bucket": label, "<seriesId>": value, ...}`. A series
/// id equal to `bucket` or starting with `~` is written with one extra `~`
/// in front (see [`series_key`]), so no cell can shadow the label or another
/// series.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRow {
    // ---
    pub bucket_key: String,
    pub bucket_start: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl ChartRow {
    // ---
    pub fn get(&self, series_id: &str) -> Option<f64> {
        self.values.get(series_id).copied()
    }
}

/// Key a series id is written under in a serialized [`ChartRow`].
pub fn series_key(series_id: &str) -> Cow<'_, str> {
    // ---
    if series_id == BUCKET_KEY || series_id.starts_with(SERIES_ESCAPE) {
        Cow::Owned(format!("{}{}", SERIES_ESCAPE, series_id))
    } else {
        Cow::Borrowed(series_id)
    }
}

impl Serialize for ChartRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // ---
        let mut map = serializer.serialize_map(Some(self.values.len() + 1))?;
        map.serialize_entry(BUCKET_KEY, &self.bucket_key)?;
        for (series_id, value) in &self.values {
            map.serialize_entry(series_key(series_id).as_ref(), value)?;
        }
        map.end()
    }
}

/// Average and sample count of one series over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSummary {
    // ---
    pub series_id: String,
    pub average: f64,
    pub count: usize,
}
