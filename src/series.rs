//! Alignment of independent sensor series onto a shared time axis.
//!
//! Readings from any number of instances are sorted, quantized into time
//! buckets, and folded into one [`ChartRow`] per bucket with one column per
//! instance. Rows stay sparse: a series with nothing in a bucket has no
//! entry there, and nothing here fills or interpolates gaps.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::models::{ChartRow, Reading, SeriesSummary};

// ---

/// Display granularity of the chart's time axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Granularity {
    #[default]
    Second,
    Minute,
    Hour,
}

impl Granularity {
    // ---
    fn step_secs(self) -> i64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        let step = self.step_secs();
        let floor = ts.timestamp().div_euclid(step) * step;
        DateTime::from_timestamp(floor, 0).unwrap_or(ts)
    }

    /// Axis label of a bucket (UTC time of day).
    pub fn label(self, bucket_start: DateTime<Utc>) -> String {
        // ---
        let pattern = match self {
            Granularity::Second => "%H:%M:%S",
            Granularity::Minute => "%H:%M",
            Granularity::Hour => "%H:00",
        };
        bucket_start.format(pattern).to_string()
    }
}

/// Fold `readings` into chronologically ordered, sparse chart rows.
///
/// Sorting is stable, so readings sharing a timestamp keep their input
/// order. Two readings of one series in the same bucket leave the later one
/// in the cell.
pub fn align_series(readings: &[Reading], granularity: Granularity) -> Vec<ChartRow> {
    // ---
    let mut sorted: Vec<&Reading> = readings.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    let mut rows: Vec<ChartRow> = Vec::new();
    for reading in sorted {
        let bucket_start = granularity.truncate(reading.timestamp);

        // Input is sorted, so a bucket can only ever be the newest row
        let same_bucket = rows
            .last()
            .is_some_and(|row| row.bucket_start == bucket_start);
        if !same_bucket {
            rows.push(ChartRow {
                bucket_key: granularity.label(bucket_start),
                bucket_start,
                values: BTreeMap::new(),
            });
        }
        if let Some(row) = rows.last_mut() {
            row.values
                .insert(reading.sensor_instance_id.clone(), reading.value);
        }
    }
    rows
}

/// Distinct series ids in order of first appearance across `rows` (one line
/// per id). Ids first seen in the same row come out sorted.
pub fn series_ids(rows: &[ChartRow]) -> Vec<String> {
    // ---
    let mut ids: Vec<String> = Vec::new();
    for row in rows {
        for id in row.values.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }
    ids
}

/// Per-series average and sample count over the window, in first-seen order.
pub fn summarize_series(readings: &[Reading]) -> Vec<SeriesSummary> {
    // ---
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut totals: Vec<(&str, f64, usize)> = Vec::new();

    for reading in readings {
        let id = reading.sensor_instance_id.as_str();
        let slot = *index.entry(id).or_insert_with(|| {
            totals.push((id, 0.0, 0));
            totals.len() - 1
        });
        totals[slot].1 += reading.value;
        totals[slot].2 += 1;
    }

    totals
        .into_iter()
        .map(|(id, sum, count)| SeriesSummary {
            series_id: id.to_string(),
            average: sum / count as f64,
            count,
        })
        .collect()
}
