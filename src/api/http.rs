use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::SensorApi;
use crate::error::ApiError;
use crate::models::{AverageReading, PagedResponse, RawReading, Reading, ReadingFilter};

// ---

/// `reqwest` implementation of the REST collaborator.
///
/// Every request carries the configured timeout, so a fetch started before
/// the dashboard goes away cannot stay pending forever.
#[derive(Debug, Clone)]
pub struct HttpSensorApi {
    http: Client,
    base_url: Url,
}

impl HttpSensorApi {
    // ---
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        // ---
        let http = Client::builder().timeout(timeout).build()?;
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self, ApiError> {
        // ---
        let invalid = |reason: String| ApiError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("cannot carry path segments".to_string()));
        }
        Ok(Self { http, base_url })
    }

    /// Base URL extended by `segments`, each one percent-encoded as a single
    /// path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        // ---
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "cannot carry path segments".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        // ---
        let url = self.endpoint(segments)?;
        debug!("GET {} {:?}", url, query);

        let resp = self.http.get(url.clone()).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Validate wire readings, skipping (and logging) the ones that do not parse.
fn validate_readings(raw: Vec<RawReading>, source: &str) -> Vec<Reading> {
    // ---
    raw.into_iter()
        .enumerate()
        .filter_map(|(i, item)| match item.to_reading() {
            Ok(reading) => Some(reading),
            Err(e) => {
                debug!("Skipping item {} from {}: {} - Raw item: {:?}", i, source, e, item);
                None
            }
        })
        .collect()
}

#[async_trait]
impl SensorApi for HttpSensorApi {
    // ---
    async fn latest_readings(
        &self,
        instance_id: &str,
        count: u32,
    ) -> Result<Vec<Reading>, ApiError> {
        // ---
        let raw: Vec<RawReading> = self
            .get_json(&["sensors", "last", instance_id], &[("count", count.to_string())])
            .await?;
        Ok(validate_readings(raw, "/sensors/last"))
    }

    async fn rolling_average(
        &self,
        instance_id: &str,
        count: u32,
    ) -> Result<AverageReading, ApiError> {
        // ---
        self.get_json(&["sensors", "average", instance_id], &[("count", count.to_string())])
            .await
    }

    async fn sensor_instances(&self, sensor_type: Option<&str>) -> Result<Vec<String>, ApiError> {
        // ---
        let query: Vec<(&str, String)> = sensor_type
            .map(|t| vec![("sensorType", t.to_string())])
            .unwrap_or_default();
        self.get_json(&["sensors", "sensor-instances"], &query).await
    }

    async fn sensor_types(&self) -> Result<Vec<String>, ApiError> {
        self.get_json(&["sensors", "sensor-types"], &[]).await
    }

    async fn readings(&self, filter: &ReadingFilter) -> Result<PagedResponse<Reading>, ApiError> {
        // ---
        let page: PagedResponse<RawReading> = self.get_json(&["sensors"], &filter.to_query()).await?;
        Ok(PagedResponse {
            data: validate_readings(page.data, "/sensors"),
            page_number: page.page_number,
            page_size: page.page_size,
            total_records: page.total_records,
        })
    }
}
