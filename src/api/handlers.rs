use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

use crate::api::state::AppState;
use crate::application::{DailyFigures, Observation, SeriesPoint};
use crate::domain::Field;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest range a single request may ask for.
const MAX_RANGE_DAYS: i64 = 3 * 366;

/// Standard error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, details: Option<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            details,
        }),
    )
}

fn parse_metric(name: &str) -> Result<Field, ApiError> {
    name.parse::<Field>()
        .map_err(|e| api_error(StatusCode::NOT_FOUND, "Unknown metric", Some(e.to_string())))
}

fn validated<T: Validate>(query: &T) -> Result<(), ApiError> {
    query.validate().map_err(|validation_errors| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Validation failed",
            Some(format!("{:?}", validation_errors)),
        )
    })
}

#[derive(Debug, Deserialize, IntoParams, Validate)]
pub struct PreviousQuery {
    /// Days before the latest defined date (0-3660)
    #[param(example = 7)]
    #[validate(range(max = 3660))]
    pub lag_days: u32,
}

#[derive(Debug, Deserialize, IntoParams, Validate)]
#[validate(schema(function = "validate_range"))]
pub struct RangeQuery {
    /// First date, inclusive (YYYY-MM-DD)
    #[param(value_type = String, example = "2020-11-01")]
    pub start: NaiveDate,
    /// Last date, inclusive (YYYY-MM-DD)
    #[param(value_type = String, example = "2020-11-30")]
    pub end: NaiveDate,
}

fn validate_range(query: &RangeQuery) -> Result<(), ValidationError> {
    if query.start > query.end {
        return Err(ValidationError::new("start_after_end"));
    }
    if (query.end - query.start).num_days() > MAX_RANGE_DAYS {
        return Err(ValidationError::new("range_too_long"));
    }
    Ok(())
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Days in the published table
    pub days: usize,
    pub last_date: Option<NaiveDate>,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses(
        (status = 200, description = "Table loaded", body = HealthResponse),
        (status = 503, description = "No data published yet", body = HealthResponse)
    )
)]
pub async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let figures = state.read_api.daily_figures().await;
    let days = state.read_api.days().await;
    let status = if days > 0 { "ok" } else { "empty" };

    let response = HealthResponse {
        status: status.to_string(),
        version: VERSION.to_string(),
        days,
        last_date: figures.last_date,
    };

    if days > 0 {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "system",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    )
)]
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Serialize, ToSchema)]
pub struct MetricInfo {
    pub name: String,
    /// "raw" for source figures, "derived" for computed statistics
    pub kind: String,
}

#[utoipa::path(
    get,
    path = "/v1/metrics",
    tag = "series",
    responses(
        (status = 200, description = "All metrics of the table", body = [MetricInfo])
    )
)]
pub async fn catalogue_handler() -> Json<Vec<MetricInfo>> {
    let metrics = Field::all()
        .map(|field| MetricInfo {
            name: field.name().to_string(),
            kind: match field {
                Field::Raw(_) => "raw",
                Field::Derived(_) => "derived",
            }
            .to_string(),
        })
        .collect();
    Json(metrics)
}

#[utoipa::path(
    get,
    path = "/v1/series/{metric}/latest",
    params(("metric" = String, Path, description = "Metric name, e.g. cases_moving_mean")),
    responses(
        (status = 200, description = "Most recent defined value", body = Observation),
        (status = 404, description = "Unknown metric or no defined value", body = ErrorResponse)
    ),
    tag = "series"
)]
#[instrument(skip(state))]
pub async fn latest_handler(
    State(state): State<AppState>,
    Path(metric): Path<String>,
) -> Result<Json<Observation>, ApiError> {
    let field = parse_metric(&metric)?;
    state
        .read_api
        .latest(field)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No value available", None))
}

#[utoipa::path(
    get,
    path = "/v1/series/{metric}/previous",
    params(
        ("metric" = String, Path, description = "Metric name"),
        PreviousQuery
    ),
    responses(
        (status = 200, description = "Value lag_days before the latest defined date", body = Observation),
        (status = 400, description = "Invalid input parameters", body = ErrorResponse),
        (status = 404, description = "Unknown metric or no defined value", body = ErrorResponse)
    ),
    tag = "series"
)]
#[instrument(skip(state))]
pub async fn previous_handler(
    State(state): State<AppState>,
    Path(metric): Path<String>,
    Query(query): Query<PreviousQuery>,
) -> Result<Json<Observation>, ApiError> {
    validated(&query)?;
    let field = parse_metric(&metric)?;
    state
        .read_api
        .previous(field, query.lag_days)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No value available", None))
}

#[utoipa::path(
    get,
    path = "/v1/series/{metric}/range",
    params(
        ("metric" = String, Path, description = "Metric name"),
        RangeQuery
    ),
    responses(
        (status = 200, description = "One point per table date in the range", body = [SeriesPoint]),
        (status = 400, description = "Invalid input parameters", body = ErrorResponse),
        (status = 404, description = "Unknown metric", body = ErrorResponse)
    ),
    tag = "series"
)]
#[instrument(skip(state))]
pub async fn range_handler(
    State(state): State<AppState>,
    Path(metric): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<SeriesPoint>>, ApiError> {
    validated(&query)?;
    let field = parse_metric(&metric)?;
    Ok(Json(state.read_api.range(field, query.start, query.end).await))
}

#[utoipa::path(
    get,
    path = "/v1/daily-figures",
    responses(
        (status = 200, description = "Headline figures of the latest publication", body = DailyFigures)
    ),
    tag = "series"
)]
pub async fn daily_figures_handler(State(state): State<AppState>) -> Json<DailyFigures> {
    Json(state.read_api.daily_figures().await)
}
