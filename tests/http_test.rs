//! End-to-end tests against an in-process mock backend.
//!
//! The mock serves the REST routes the client consumes under `/api/v1` and a
//! `text/event-stream` push endpoint under `/sensorHub/stream`.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use sensorflow_live::{
    align_series, fetch_window, ApiError, AverageReading, ConnectionManager, ConnectionState,
    Granularity, HttpSensorApi, PagedResponse, Reading, ReadingFilter, SensorApi, SseTransport,
    StatsReconciler,
};

use common::{reading, wait_until};

// ---

struct Backend {
    readings: Vec<Reading>,
    stream_hits: AtomicUsize,
}

type Shared = Arc<Backend>;

fn backend_readings() -> Vec<Reading> {
    // ---
    let mut occupancy = reading("occ-1", 4.0, 1);
    occupancy.sensor_type = "occupancy".to_string();
    occupancy.unit = "people".to_string();

    vec![
        reading("temp-1", 21.0, 1),
        occupancy,
        reading("temp-1", 22.0, 2),
        reading("temp-2", 18.0, 2),
        reading("temp-1", 23.0, 4),
    ]
}

async fn instances(
    State(backend): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<String>> {
    // ---
    let mut ids: Vec<String> = backend
        .readings
        .iter()
        .filter(|r| q.get("sensorType").map_or(true, |t| &r.sensor_type == t))
        .map(|r| r.sensor_instance_id.clone())
        .collect();
    ids.sort();
    ids.dedup();
    Json(ids)
}

async fn types(State(backend): State<Shared>) -> Json<Vec<String>> {
    // ---
    let mut types: Vec<String> = backend.readings.iter().map(|r| r.sensor_type.clone()).collect();
    types.sort();
    types.dedup();
    Json(types)
}

fn of_instance<'a>(backend: &'a Backend, id: &'a str) -> impl Iterator<Item = &'a Reading> {
    backend.readings.iter().filter(move |r| r.sensor_instance_id == id)
}

async fn last(
    State(backend): State<Shared>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Reading>>, StatusCode> {
    // ---
    let count: usize = q.get("count").and_then(|c| c.parse().ok()).unwrap_or(100);
    let mut found: Vec<Reading> = of_instance(&backend, &id).cloned().collect();
    if found.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    found.reverse();
    found.truncate(count);
    Ok(Json(found))
}

async fn average(
    State(backend): State<Shared>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<AverageReading>, StatusCode> {
    // ---
    let count: usize = q.get("count").and_then(|c| c.parse().ok()).unwrap_or(100);
    let mut found: Vec<f64> = of_instance(&backend, &id).map(|r| r.value).collect();
    if found.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    let skip = found.len().saturating_sub(count);
    found.drain(..skip);

    Ok(Json(AverageReading {
        sensor_instance_id: id,
        average: found.iter().sum::<f64>() / found.len() as f64,
        count: found.len() as u32,
    }))
}

async fn paged(
    State(backend): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<PagedResponse<Reading>> {
    // ---
    let page_number: u32 = q.get("pageNumber").and_then(|p| p.parse().ok()).unwrap_or(1);
    let page_size: u32 = q.get("pageSize").and_then(|p| p.parse().ok()).unwrap_or(10);
    let matching: Vec<&Reading> = backend
        .readings
        .iter()
        .filter(|r| q.get("sensorType").map_or(true, |t| &r.sensor_type == t))
        .collect();

    let data = matching
        .iter()
        .skip(((page_number - 1) * page_size) as usize)
        .take(page_size as usize)
        .map(|r| (*r).clone())
        .collect();

    Json(PagedResponse {
        data,
        page_number,
        page_size,
        total_records: matching.len() as u64,
    })
}

async fn slow() -> Json<Vec<String>> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(Vec::new())
}

/// First connection gets a short burst of events; later ones are refused.
async fn stream(State(backend): State<Shared>) -> impl IntoResponse {
    // ---
    if backend.stream_hits.fetch_add(1, Ordering::SeqCst) > 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, [(header::CONTENT_TYPE, "text/plain")], String::new());
    }

    let mut body = String::from(": welcome\n\n");
    for r in [reading("temp-1", 24.0, 10), reading("temp-1", 25.0, 11)] {
        body.push_str("event: ReceiveSensorReading\n");
        body.push_str(&format!("data: {}\n\n", serde_json::to_string(&r).unwrap()));
    }
    body.push_str("event: ReceiveSensorReading\ndata: {\"value\":\n\n");
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn spawn_backend() -> Result<(SocketAddr, Shared)> {
    // ---
    let backend = Arc::new(Backend {
        readings: backend_readings(),
        stream_hits: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/api/v1/sensors", get(paged))
        .route("/api/v1/sensors/sensor-instances", get(instances))
        .route("/api/v1/sensors/sensor-types", get(types))
        .route("/api/v1/sensors/last/{id}", get(last))
        .route("/api/v1/sensors/average/{id}", get(average))
        .route("/api/v1/slow/sensors/sensor-types", get(slow))
        .route("/sensorHub/stream", get(stream))
        .with_state(Arc::clone(&backend));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, backend))
}

fn client(addr: SocketAddr) -> Result<HttpSensorApi> {
    Ok(HttpSensorApi::new(
        &format!("http://{}/api/v1/", addr),
        Duration::from_secs(5),
    )?)
}

#[tokio::test]
async fn rest_endpoints_decode() -> Result<()> {
    // ---
    let (addr, _backend) = spawn_backend().await?;
    let api = client(addr)?;

    assert_eq!(
        api.sensor_instances(None).await?,
        vec!["occ-1", "temp-1", "temp-2"]
    );
    assert_eq!(api.sensor_instances(Some("occupancy")).await?, vec!["occ-1"]);
    assert_eq!(api.sensor_types().await?, vec!["occupancy", "temperature"]);

    let latest = api.latest_readings("temp-1", 1).await?;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].value, 23.0);

    let average = api.rolling_average("temp-1", 2).await?;
    assert_eq!(average.average, 22.5);
    assert_eq!(average.count, 2);

    let err = api.rolling_average("nope", 100).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));
    Ok(())
}

#[tokio::test]
async fn instance_ids_stay_inside_their_path_segment() -> Result<()> {
    // ---
    let (addr, _backend) = spawn_backend().await?;
    let api = client(addr)?;

    // Unencoded, the fragment would be cut off and temp-1 would answer
    let err = api.latest_readings("temp-1#x", 1).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));

    let err = api.rolling_average("temp-1/../temp-2", 100).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 404, .. }));
    Ok(())
}

#[tokio::test]
async fn request_timeout_is_enforced() -> Result<()> {
    // ---
    let (addr, _backend) = spawn_backend().await?;
    let api = HttpSensorApi::new(
        &format!("http://{}/api/v1/slow", addr),
        Duration::from_millis(200),
    )?;

    let err = api.sensor_types().await.unwrap_err();
    match err {
        ApiError::Http(e) => assert!(e.is_timeout(), "expected a timeout, got {}", e),
        other => panic!("expected a timeout, got {}", other),
    }
    Ok(())
}

#[tokio::test]
async fn window_fetch_feeds_the_aligner() -> Result<()> {
    // ---
    let (addr, _backend) = spawn_backend().await?;
    let api = client(addr)?;

    let filter = ReadingFilter {
        sensor_type: Some("temperature".to_string()),
        page_size: Some(2),
        ..Default::default()
    };
    let window = fetch_window(&api, &filter, 10).await?;
    assert_eq!(window.len(), 4);

    let rows = align_series(&window, Granularity::Second);
    let keys: Vec<&str> = rows.iter().map(|r| r.bucket_key.as_str()).collect();
    assert_eq!(keys, vec!["18:00:01", "18:00:02", "18:00:04"]);
    assert_eq!(rows[1].get("temp-1"), Some(22.0));
    assert_eq!(rows[1].get("temp-2"), Some(18.0));
    assert_eq!(rows[2].get("temp-2"), None);
    Ok(())
}

#[tokio::test]
async fn baseline_over_http() -> Result<()> {
    // ---
    let (addr, _backend) = spawn_backend().await?;
    let api: Arc<dyn SensorApi> = Arc::new(client(addr)?);
    let stats = StatsReconciler::with_window(Arc::clone(&api), 2);

    let mut ids = api.sensor_instances(None).await?;
    ids.push("ghost".to_string());
    let report = stats.load_baseline(&ids).await;

    assert_eq!(report.loaded, 3);
    assert_eq!(report.failed, 1);
    let temp = stats.get("temp-1").unwrap();
    assert_eq!(temp.latest_value, 23.0);
    assert_eq!(temp.average_value, 22.5);
    assert_eq!(stats.get("occ-1").unwrap().unit, "people");
    Ok(())
}

#[tokio::test]
async fn event_stream_drives_the_manager() -> Result<()> {
    // ---
    let (addr, backend) = spawn_backend().await?;
    let transport = SseTransport::new(&format!("http://{}/sensorHub/stream", addr));
    let manager = ConnectionManager::new(Arc::new(transport));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = manager.subscribe(move |r: Reading| sink.lock().unwrap().push(r.value))?;

    manager.start().await?;
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![24.0, 25.0]);

    // The burst ends, the retry is refused, and the manager keeps trying
    wait_until(|| backend.stream_hits.load(Ordering::SeqCst) >= 2).await;
    wait_until(|| manager.malformed_count() == 1).await;
    assert_eq!(manager.current_state(), ConnectionState::Reconnecting);

    manager.stop().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Closed("client-requested".to_string())
    );
    Ok(())
}
