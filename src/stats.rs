//! Live per-instance statistics.
//!
//! The table is fed from two independent sources: a one-shot REST baseline
//! (latest reading plus rolling average) and the unbounded stream of pushed
//! readings. Field ownership is partitioned between them:
//! - `latest_value`, `unit`, `sensor_type` and `last_updated` belong to the
//!   streaming path once an entry exists;
//! - `average_value` belongs to baseline and average-fetch completions.
//!
//! A completion that arrives late therefore never rolls back a newer pushed
//! value, whatever order the network delivers it in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::SensorApi;
use crate::channel::{ConnectionManager, Subscription};
use crate::config::DEFAULT_AVERAGE_WINDOW;
use crate::error::{AverageRefreshError, BaselineFetchError, ConnectionError};
use crate::models::{LiveStat, Reading};

// ---

/// What `apply_reading` did with a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// The table was disposed.
    Ignored,
}

/// Result of a baseline load. Failures are counted, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaselineReport {
    pub loaded: usize,
    pub failed: usize,
}

/// Owner of the `LiveStat` table. Clones share the same table.
#[derive(Clone)]
pub struct StatsReconciler {
    shared: Arc<Shared>,
}

struct Shared {
    api: Arc<dyn SensorApi>,
    window: u32,
    table: Mutex<Table>,
}

#[derive(Default)]
struct Table {
    /// First-seen order, for stable card placement.
    order: Vec<String>,
    stats: HashMap<String, LiveStat>,
    disposed: bool,
    /// Last generation handed to an average fetch.
    issued: u64,
    /// Generation of the fetch whose average each instance currently shows.
    applied: HashMap<String, u64>,
}

impl Table {
    // ---
    fn next_generation(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }
}

impl StatsReconciler {
    // ---
    pub fn new(api: Arc<dyn SensorApi>) -> Self {
        Self::with_window(api, DEFAULT_AVERAGE_WINDOW)
    }

    /// `window` is the N of "rolling average over the last N readings".
    pub fn with_window(api: Arc<dyn SensorApi>, window: u32) -> Self {
        // ---
        Self {
            shared: Arc::new(Shared {
                api,
                window: window.max(1),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Seed the table for `instance_ids`, fetching each instance's latest
    /// reading and rolling average concurrently.
    ///
    /// An instance whose fetch fails is left out of the table and counted in
    /// [`BaselineReport::failed`]. An instance already present (because a
    /// pushed reading beat the baseline) only has its average updated.
    pub async fn load_baseline(&self, instance_ids: &[String]) -> BaselineReport {
        // ---
        let mut fetches = JoinSet::new();
        for instance_id in instance_ids {
            let api = Arc::clone(&self.shared.api);
            let window = self.shared.window;
            let generation = self.shared.begin_average();
            let instance_id = instance_id.clone();
            fetches.spawn(async move {
                let fetched = fetch_baseline(api.as_ref(), instance_id, window).await;
                (generation, fetched)
            });
        }

        let mut report = BaselineReport::default();
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok((generation, Ok((instance_id, latest, average)))) => {
                    if self.merge_baseline(&instance_id, latest, average, generation) {
                        report.loaded += 1;
                    }
                }
                Ok((_, Err(e))) => {
                    warn!("{}", e);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Baseline fetch task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            loaded = report.loaded,
            failed = report.failed,
            "Baseline load complete"
        );
        report
    }

    /// Merge one pushed reading.
    ///
    /// Known instance: latest value, unit, type and timestamp are replaced
    /// in arrival order; the average is left alone. Unknown instance: a new
    /// entry is created with the reading as a one-sample average and the
    /// true rolling average is fetched in the background.
    pub fn apply_reading(&self, reading: Reading) -> ApplyOutcome {
        // ---
        let (instance_id, generation) = {
            let mut table = self.shared.lock();
            if table.disposed {
                return ApplyOutcome::Ignored;
            }

            if let Some(stat) = table.stats.get_mut(&reading.sensor_instance_id) {
                if reading.timestamp < stat.last_updated {
                    debug!(
                        instance_id = %reading.sensor_instance_id,
                        held = %stat.last_updated,
                        arriving = %reading.timestamp,
                        "Out-of-order reading, last arrival wins"
                    );
                }
                stat.latest_value = reading.value;
                stat.unit = reading.unit;
                stat.sensor_type = reading.sensor_type;
                stat.last_updated = reading.timestamp;
                return ApplyOutcome::Updated;
            }

            let instance_id = reading.sensor_instance_id.clone();
            table.order.push(instance_id.clone());
            table.stats.insert(
                instance_id.clone(),
                LiveStat {
                    instance_id: instance_id.clone(),
                    latest_value: reading.value,
                    average_value: reading.value,
                    unit: reading.unit,
                    sensor_type: reading.sensor_type,
                    last_updated: reading.timestamp,
                },
            );
            (instance_id, table.next_generation())
        };

        debug!(instance_id = %instance_id, "New instance from push, fetching rolling average");
        self.spawn_average_fetch(instance_id, generation);
        ApplyOutcome::Created
    }

    /// Recompute `average_value` for every instance in the table. Returns
    /// the number of instances whose refresh failed.
    pub async fn refresh_averages(&self) -> usize {
        // ---
        let mut fetches = JoinSet::new();
        for instance_id in self.instance_ids() {
            let api = Arc::clone(&self.shared.api);
            let window = self.shared.window;
            let generation = self.shared.begin_average();
            fetches.spawn(async move {
                fetch_average(api.as_ref(), instance_id, window)
                    .await
                    .map(|(instance_id, average)| (instance_id, average, generation))
            });
        }

        let mut failed = 0;
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(Ok((instance_id, average, generation))) => {
                    self.shared.set_average(&instance_id, average, generation);
                }
                Ok(Err(e)) => {
                    warn!("{}", e);
                    failed += 1;
                }
                Err(e) => {
                    warn!("Average refresh task failed: {}", e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Copy of the table in first-seen order.
    pub fn snapshot(&self) -> Vec<LiveStat> {
        // ---
        let table = self.shared.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.stats.get(id).cloned())
            .collect()
    }

    pub fn get(&self, instance_id: &str) -> Option<LiveStat> {
        self.shared.lock().stats.get(instance_id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.shared.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed every reading the manager emits into this table, in emission
    /// order.
    pub fn attach(&self, manager: &ConnectionManager) -> Result<Subscription, ConnectionError> {
        // ---
        let reconciler = self.clone();
        manager.subscribe(move |reading| {
            reconciler.apply_reading(reading);
        })
    }

    /// Tear the table down. Fetches still in flight complete as no-ops and
    /// later readings are ignored.
    pub fn dispose(&self) {
        // ---
        let mut table = self.shared.lock();
        table.disposed = true;
        table.order.clear();
        table.stats.clear();
        table.applied.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    fn merge_baseline(
        &self,
        instance_id: &str,
        latest: Reading,
        average: f64,
        generation: u64,
    ) -> bool {
        // ---
        let mut table = self.shared.lock();
        if table.disposed {
            return false;
        }

        if table.stats.contains_key(instance_id) {
            // Present already: the baseline only owns the average
            apply_average(&mut table, instance_id, average, generation);
            return true;
        }

        table.applied.insert(instance_id.to_string(), generation);

        table.order.push(instance_id.to_string());
        table.stats.insert(
            instance_id.to_string(),
            LiveStat {
                instance_id: instance_id.to_string(),
                latest_value: latest.value,
                average_value: average,
                unit: latest.unit,
                sensor_type: latest.sensor_type,
                last_updated: latest.timestamp,
            },
        );
        true
    }

    fn spawn_average_fetch(&self, instance_id: String, generation: u64) {
        // ---
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(instance_id = %instance_id, "No runtime to fetch rolling average, keeping single-sample estimate");
            return;
        };

        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            match fetch_average(shared.api.as_ref(), instance_id, shared.window).await {
                Ok((instance_id, average)) => {
                    shared.set_average(&instance_id, average, generation);
                }
                Err(e) => warn!("{}, keeping single-sample estimate", e),
            }
        });
    }
}

impl Shared {
    // ---
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation for an average fetch about to start.
    fn begin_average(&self) -> u64 {
        self.lock().next_generation()
    }

    /// Overwrite only the average of an existing entry, unless a fetch
    /// started later has already landed.
    fn set_average(&self, instance_id: &str, average: f64, generation: u64) -> bool {
        // ---
        let mut table = self.lock();
        if table.disposed {
            return false;
        }
        apply_average(&mut table, instance_id, average, generation)
    }
}

fn apply_average(table: &mut Table, instance_id: &str, average: f64, generation: u64) -> bool {
    // ---
    if table.applied.get(instance_id).is_some_and(|&g| g >= generation) {
        debug!(instance_id, generation, "Discarding average from an older fetch");
        return false;
    }
    let Some(stat) = table.stats.get_mut(instance_id) else {
        return false;
    };
    stat.average_value = average;
    table.applied.insert(instance_id.to_string(), generation);
    true
}

async fn fetch_baseline(
    api: &dyn SensorApi,
    instance_id: String,
    window: u32,
) -> Result<(String, Reading, f64), BaselineFetchError> {
    // ---
    let wrap = |source| BaselineFetchError::Api {
        instance_id: instance_id.clone(),
        source,
    };
    let (latest, average) = tokio::try_join!(
        async { api.latest_readings(&instance_id, 1).await.map_err(wrap) },
        async { api.rolling_average(&instance_id, window).await.map_err(wrap) },
    )?;

    let latest = latest
        .into_iter()
        .next()
        .ok_or_else(|| BaselineFetchError::NoReadings(instance_id.clone()))?;
    Ok((instance_id, latest, average.average))
}

async fn fetch_average(
    api: &dyn SensorApi,
    instance_id: String,
    window: u32,
) -> Result<(String, f64), AverageRefreshError> {
    // ---
    match api.rolling_average(&instance_id, window).await {
        Ok(average) => Ok((instance_id, average.average)),
        Err(source) => Err(AverageRefreshError {
            instance_id,
            source,
        }),
    }
}
