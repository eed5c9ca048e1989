//! End-to-end tests of the REST API.
//!
//! Each test seeds a table in a temporary directory, serves the router on an
//! ephemeral port and talks to it over HTTP.

use chrono::NaiveDate;
use covid_stats::api::{create_router, AppState};
use covid_stats::application::{ReadApi, StatisticsConfig, UpsertEngine};
use covid_stats::domain::{RawField, RawPatch};
use covid_stats::infrastructure::JsonFileStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, d).unwrap()
}

/// Fourteen days of cases `100 + d` and deaths `d`.
async fn seeded_engine(dir: &TempDir) -> Arc<UpsertEngine> {
    let store = Arc::new(JsonFileStore::new(dir.path()));
    let engine = Arc::new(UpsertEngine::new(store, "germany", StatisticsConfig::default()));
    engine.bootstrap().await.unwrap();

    let first = RawPatch::new()
        .with(RawField::CasesCumulative, 10_000.0)
        .with(RawField::DeathsCumulative, 200.0);
    engine
        .upsert_day(
            day(1),
            RawPatch::new().with(RawField::Cases, 101.0).with(RawField::Deaths, 1.0),
            Some(first),
        )
        .await
        .unwrap();
    for d in 2..=14 {
        let deltas = RawPatch::new()
            .with(RawField::Cases, 100.0 + d as f64)
            .with(RawField::Deaths, d as f64)
            .with_published_on(day(d + 1));
        engine.upsert_day(day(d), deltas, None).await.unwrap();
    }
    engine
}

async fn spawn_server(engine: Arc<UpsertEngine>) -> String {
    let state = AppState {
        read_api: ReadApi::new(engine),
        metrics: PrometheusBuilder::new().build_recorder().handle(),
    };
    let app = create_router(state, "*");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn get(base: &str, path: &str) -> reqwest::Response {
    reqwest::get(format!("{}{}", base, path)).await.unwrap()
}

#[tokio::test]
async fn test_health_reports_loaded_table() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(seeded_engine(&dir).await).await;

    let response = get(&base, "/health").await;
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["days"], 14);
    assert_eq!(body["last_date"], "2021-01-14");
}

#[tokio::test]
async fn test_health_is_unavailable_without_data() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()));
    let engine = Arc::new(UpsertEngine::new(store, "germany", StatisticsConfig::default()));
    let base = spawn_server(engine).await;

    let response = get(&base, "/health").await;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "empty");
}

#[tokio::test]
async fn test_latest_and_previous() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(seeded_engine(&dir).await).await;

    let body: Value = get(&base, "/v1/series/cases/latest").await.json().await.unwrap();
    assert_eq!(body["date"], "2021-01-14");
    assert_eq!(body["value"], 114.0);

    // The centered mean is undefined for the last three days.
    let body: Value = get(&base, "/v1/series/cases_moving_mean/latest").await.json().await.unwrap();
    assert_eq!(body["date"], "2021-01-11");
    assert_eq!(body["value"], 111.0);

    let body: Value = get(&base, "/v1/series/cases_cumulative/previous?lag_days=13")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["date"], "2021-01-01");
    assert_eq!(body["value"], 10_000.0);

    let response = get(&base, "/v1/series/cases/previous?lag_days=30").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_range_is_inclusive_and_validated() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(seeded_engine(&dir).await).await;

    let body: Value = get(&base, "/v1/series/deaths/range?start=2021-01-02&end=2021-01-04")
        .await
        .json()
        .await
        .unwrap();
    let points = body.as_array().unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(points[0]["date"], "2021-01-02");
    assert_eq!(points[2]["value"], 4.0);

    let body: Value = get(&base, "/v1/series/reproduction_number/range?start=2021-01-01&end=2021-01-02")
        .await
        .json()
        .await
        .unwrap();
    assert!(body[0]["value"].is_null());

    let response = get(&base, "/v1/series/deaths/range?start=2021-01-10&end=2021-01-05").await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Validation failed");
}

#[tokio::test]
async fn test_unknown_metric_is_not_found() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(seeded_engine(&dir).await).await;

    let response = get(&base, "/v1/series/hospitalised/latest").await;
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Unknown metric");
}

#[tokio::test]
async fn test_daily_figures_and_catalogue() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(seeded_engine(&dir).await).await;

    let body: Value = get(&base, "/v1/daily-figures").await.json().await.unwrap();
    assert_eq!(body["last_date"], "2021-01-14");
    assert_eq!(body["published_on"], "2021-01-15");
    let cases = body["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["metric"] == "cases")
        .unwrap();
    assert_eq!(cases["value"], 114.0);
    assert_eq!(cases["change"], 1.0);

    let body: Value = get(&base, "/v1/metrics").await.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 29);
}

#[tokio::test]
async fn test_openapi_and_metrics_are_served() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(seeded_engine(&dir).await).await;

    let body: Value = get(&base, "/v1/openapi.json").await.json().await.unwrap();
    assert!(body["paths"]["/v1/daily-figures"].is_object());

    let response = get(&base, "/metrics").await;
    assert_eq!(response.status(), 200);
}
