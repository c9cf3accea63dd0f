//! REST collaborator surface.
//!
//! The live client only needs a handful of parameterized fetches from the
//! backend; they sit behind [`SensorApi`] so the reconciler and the runner
//! can be driven by [`HttpSensorApi`] in production and by in-memory fakes
//! in tests.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::models::{AverageReading, PagedResponse, Reading, ReadingFilter};

mod http;

pub use http::HttpSensorApi;

// ---

/// Page size used by [`fetch_window`] when the filter does not set one.
pub const DEFAULT_WINDOW_PAGE_SIZE: u32 = 1000;

#[async_trait]
pub trait SensorApi: Send + Sync {
    /// Latest `count` readings for an instance, most recent first.
    async fn latest_readings(&self, instance_id: &str, count: u32)
        -> Result<Vec<Reading>, ApiError>;

    /// Rolling average over the last `count` readings of an instance.
    async fn rolling_average(&self, instance_id: &str, count: u32)
        -> Result<AverageReading, ApiError>;

    /// Known sensor instances, optionally restricted to one sensor type.
    async fn sensor_instances(&self, sensor_type: Option<&str>) -> Result<Vec<String>, ApiError>;

    /// Known sensor types.
    async fn sensor_types(&self) -> Result<Vec<String>, ApiError>;

    /// One page of readings matching `filter`.
    async fn readings(&self, filter: &ReadingFilter) -> Result<PagedResponse<Reading>, ApiError>;
}

/// Fetch every reading in a window, walking pages until the backend reports
/// no more records or `max_pages` is reached.
pub async fn fetch_window(
    api: &dyn SensorApi,
    filter: &ReadingFilter,
    max_pages: u32,
) -> Result<Vec<Reading>, ApiError> {
    // ---
    let mut all_data = Vec::new();
    let mut page = filter.clone();
    let page_size = page.page_size.unwrap_or(DEFAULT_WINDOW_PAGE_SIZE).max(1);
    page.page_size = Some(page_size);
    let mut page_number = page.page_number.unwrap_or(1).max(1);
    let mut page_count = 0;

    loop {
        if page_count >= max_pages {
            debug!(
                "Hit page limit of {}, stopping pagination. Fetched {} records so far.",
                max_pages,
                all_data.len()
            );
            break;
        }
        page_count += 1;
        page.page_number = Some(page_number);

        let response = api.readings(&page).await?;
        let received = response.data.len();
        debug!(
            "Page {} returned {} of {} records",
            page_number, received, response.total_records
        );
        all_data.extend(response.data);

        if received < page_size as usize || all_data.len() as u64 >= response.total_records {
            break;
        }
        page_number += 1;
    }

    info!(
        "Finished fetching {} total records from {} pages",
        all_data.len(),
        page_count
    );
    Ok(all_data)
}
