//! HTTP client for the RKI COVID-19 ArcGIS feature service.
//!
//! Every figure is an `outStatistics` query: the sum of a count column plus
//! the maximum `Datenstand` (data status) of the summed rows, which becomes
//! the generation marker of the answer. Grouped queries additionally group
//! by a date column delivered as epoch milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info};

use crate::domain::{AggregateQuery, GenerationMarker, Marked, SeriesQuery, SourceAdapter, SourceError};

/// Feature layer of the RKI case data
const BASE_URL: &str =
    "https://services7.arcgis.com/mOBPykOjAyBO2ZKk/arcgis/rest/services/RKI_COVID19/FeatureServer/0/query";

/// Output field names of the two statistics
const SUM_FIELD: &str = "cases";
const MARKER_FIELD: &str = "date";

/// Settings of the `source` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Transport retries per request
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_base_url() -> String {
    BASE_URL.to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> usize {
    3
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Filter and summed column of one figure.
struct StatisticQuery {
    filter: &'static str,
    sum_field: &'static str,
    group_by: Option<&'static str>,
}

fn aggregate_query(query: AggregateQuery) -> StatisticQuery {
    let (filter, sum_field) = match query {
        AggregateQuery::NewCases => ("NeuerFall IN(1,-1)", "AnzahlFall"),
        AggregateQuery::TotalCases => ("NeuerFall IN(1,0)", "AnzahlFall"),
        AggregateQuery::NewDeaths => ("NeuerTodesfall IN(1,-1)", "AnzahlTodesfall"),
        AggregateQuery::TotalDeaths => ("NeuerTodesfall IN(1,0)", "AnzahlTodesfall"),
    };
    StatisticQuery {
        filter,
        sum_field,
        group_by: None,
    }
}

fn series_query(query: SeriesQuery) -> StatisticQuery {
    let (filter, sum_field, group_by) = match query {
        SeriesQuery::CasesByReportingDate => ("NeuerFall IN(1,0)", "AnzahlFall", "Meldedatum"),
        SeriesQuery::DeathsByReportingDate => ("NeuerTodesfall IN(1,0)", "AnzahlTodesfall", "Meldedatum"),
        SeriesQuery::CasesByReferenceDate => ("NeuerFall IN(1,0)", "AnzahlFall", "Refdatum"),
        SeriesQuery::DeathsByReferenceDate => ("NeuerTodesfall IN(1,0)", "AnzahlTodesfall", "Refdatum"),
    };
    StatisticQuery {
        filter,
        sum_field,
        group_by: Some(group_by),
    }
}

impl StatisticQuery {
    fn params(&self) -> Vec<(&'static str, String)> {
        let statistics = json!([
            {"statisticType": "sum", "onStatisticField": self.sum_field, "outStatisticFieldName": SUM_FIELD},
            {"statisticType": "max", "onStatisticField": "Datenstand", "outStatisticFieldName": MARKER_FIELD},
        ]);
        let mut out_fields = format!("{},Datenstand", self.sum_field);
        if let Some(group_by) = self.group_by {
            out_fields = format!("{},{}", self.sum_field, group_by);
        }
        vec![
            ("where", self.filter.to_string()),
            ("outFields", out_fields),
            ("resultType", "standard".to_string()),
            ("returnGeometry", "false".to_string()),
            ("groupByFieldsForStatistics", self.group_by.unwrap_or_default().to_string()),
            ("outStatistics", statistics.to_string()),
            ("f", "json".to_string()),
        ]
    }
}

/// RKI feature service client
#[derive(Clone)]
pub struct RkiClient {
    client: Client,
    base_url: String,
    max_retries: usize,
}

impl RkiClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("covid-stats/0.1")
            .build()
            .map_err(|e| SourceError::Request(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
        })
    }

    /// Run a statistics query with transport retries
    async fn query(&self, query: &StatisticQuery) -> Result<Value, SourceError> {
        let params = query.params();
        debug!("Querying {} ({} by {:?})", self.base_url, query.sum_field, query.group_by);

        let retry_strategy = ExponentialBackoff::from_millis(100)
            .map(jitter)
            .take(self.max_retries);

        let response = Retry::spawn(retry_strategy, || async {
            self.client
                .get(&self.base_url)
                .header("Accept", "application/json")
                .query(&params)
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|e| SourceError::Request(format!("{}: {}", self.base_url, e)))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Malformed(format!("invalid JSON from {}: {}", self.base_url, e)))
    }
}

#[async_trait]
impl SourceAdapter for RkiClient {
    async fn fetch_aggregate(&self, query: AggregateQuery) -> Result<Marked<f64>, SourceError> {
        let body = self.query(&aggregate_query(query)).await?;
        let marked = parse_aggregate(&body)?;
        info!("Fetched {:?} = {} ({})", query, marked.value, marked.marker);
        Ok(marked)
    }

    async fn fetch_grouped_series(
        &self,
        query: SeriesQuery,
    ) -> Result<Marked<BTreeMap<NaiveDate, f64>>, SourceError> {
        let statistic = series_query(query);
        let body = self.query(&statistic).await?;
        let group_by = statistic.group_by.unwrap_or_default();
        let marked = parse_grouped(&body, group_by)?;
        info!("Fetched {:?}: {} days ({})", query, marked.value.len(), marked.marker);
        Ok(marked)
    }
}

fn features(body: &Value) -> Result<&Vec<Value>, SourceError> {
    if let Some(error) = body.get("error") {
        return Err(SourceError::Request(format!("service error: {}", error)));
    }
    body.get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::Malformed("missing features array".to_string()))
}

fn attribute<'a>(feature: &'a Value, name: &str) -> Option<&'a Value> {
    feature.get("attributes").and_then(|attributes| attributes.get(name))
}

fn marker_of(feature: &Value) -> Result<GenerationMarker, SourceError> {
    let raw = attribute(feature, MARKER_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::Marker("missing data status".to_string()))?;
    GenerationMarker::parse(raw)
}

/// Parse a single-row statistics answer.
pub fn parse_aggregate(body: &Value) -> Result<Marked<f64>, SourceError> {
    let feature = features(body)?
        .first()
        .ok_or_else(|| SourceError::Malformed("empty statistics answer".to_string()))?;
    let value = attribute(feature, SUM_FIELD)
        .and_then(Value::as_f64)
        .ok_or_else(|| SourceError::Malformed(format!("no numeric {} attribute", SUM_FIELD)))?;
    Ok(Marked::new(value, marker_of(feature)?))
}

/// Parse a grouped answer; the marker is the newest data status of all rows.
pub fn parse_grouped(body: &Value, group_by: &str) -> Result<Marked<BTreeMap<NaiveDate, f64>>, SourceError> {
    let mut series = BTreeMap::new();
    let mut marker: Option<GenerationMarker> = None;

    for feature in features(body)? {
        let millis = attribute(feature, group_by)
            .and_then(Value::as_i64)
            .ok_or_else(|| SourceError::Malformed(format!("no epoch {} attribute", group_by)))?;
        let date = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| SourceError::Malformed(format!("{} out of range: {}", group_by, millis)))?
            .date_naive();
        let value = attribute(feature, SUM_FIELD)
            .and_then(Value::as_f64)
            .ok_or_else(|| SourceError::Malformed(format!("no numeric {} on {}", SUM_FIELD, date)))?;
        *series.entry(date).or_insert(0.0) += value;

        let row_marker = marker_of(feature)?;
        marker = Some(marker.map_or(row_marker, |m| m.max(row_marker)));
    }

    let marker = marker.ok_or_else(|| SourceError::Malformed("empty grouped answer".to_string()))?;
    Ok(Marked::new(series, marker))
}
