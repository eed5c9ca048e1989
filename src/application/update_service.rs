//! One scheduled update run: acquire a consistent batch from the source,
//! fold it into the table and publish the result.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::snapshot::{ConsistentSnapshotAcquirer, FetchOp, Snapshot};
use super::upsert::{data_date, DayUpdate, UpsertEngine};
use crate::domain::{AggregateQuery, GenerationMarker, RawField, RunError, SeriesQuery};

/// Aggregates first, in the order `run` reads them back.
const FETCHES: [FetchOp; 8] = [
    FetchOp::Aggregate(AggregateQuery::NewCases),
    FetchOp::Aggregate(AggregateQuery::TotalCases),
    FetchOp::Aggregate(AggregateQuery::NewDeaths),
    FetchOp::Aggregate(AggregateQuery::TotalDeaths),
    FetchOp::Series(SeriesQuery::CasesByReportingDate),
    FetchOp::Series(SeriesQuery::DeathsByReportingDate),
    FetchOp::Series(SeriesQuery::CasesByReferenceDate),
    FetchOp::Series(SeriesQuery::DeathsByReferenceDate),
];

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub date: NaiveDate,
    pub marker: GenerationMarker,
    pub attempts: usize,
    pub stale: bool,
    pub days: usize,
}

pub struct UpdateService {
    acquirer: ConsistentSnapshotAcquirer,
    engine: Arc<UpsertEngine>,
    known_outliers: Vec<(NaiveDate, RawField)>,
}

impl UpdateService {
    pub fn new(
        acquirer: ConsistentSnapshotAcquirer,
        engine: Arc<UpsertEngine>,
        known_outliers: Vec<(NaiveDate, RawField)>,
    ) -> Self {
        Self {
            acquirer,
            engine,
            known_outliers,
        }
    }

    /// Run once. Failures are logged and counted; the table stays as it was.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let result = self.run_inner().await;
        let outcome = match &result {
            Ok(report) if report.stale => "stale",
            Ok(_) => "success",
            Err(RunError::Acquire(_)) => "acquire_failed",
            Err(RunError::Upsert(_)) => "upsert_failed",
            Err(RunError::SnapshotShape(_)) => "shape_mismatch",
        };
        metrics::counter!("update_runs_total", "outcome" => outcome).increment(1);
        metrics::histogram!("update_run_duration_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => info!(
                "Update run for {} finished: marker {}, {} attempt(s), {} days",
                report.date, report.marker, report.attempts, report.days
            ),
            Err(e) => error!("Update run failed: {}", e),
        }
        result
    }

    async fn run_inner(&self) -> Result<RunReport, RunError> {
        let snapshot = self.acquirer.acquire(&FETCHES).await?;
        if snapshot.stale {
            warn!("Applying stale snapshot (marker {})", snapshot.marker);
        }
        let (marker, attempts, stale) = (snapshot.marker, snapshot.attempts, snapshot.stale);
        let update = self.build_update(snapshot)?;
        let date = update.date;
        let table = self.engine.apply(update).await?;

        Ok(RunReport {
            date,
            marker,
            attempts,
            stale,
            days: table.len(),
        })
    }

    fn build_update(&self, snapshot: Snapshot) -> Result<DayUpdate, RunError> {
        if snapshot.values.len() != FETCHES.len() {
            return Err(RunError::SnapshotShape(format!(
                "expected {} values, got {}",
                FETCHES.len(),
                snapshot.values.len()
            )));
        }
        let reporting_date = snapshot.marker.date();
        let mut values = snapshot.values.into_iter();
        let mut scalar = |name: &str| {
            values
                .next()
                .and_then(|v| v.as_scalar())
                .ok_or_else(|| RunError::SnapshotShape(format!("{} is not a scalar", name)))
        };
        let new_cases = scalar("new cases")?;
        let total_cases = scalar("total cases")?;
        let new_deaths = scalar("new deaths")?;
        let total_deaths = scalar("total deaths")?;

        let mut update = DayUpdate::new(data_date(reporting_date)?)
            .delta(RawField::Cases, new_cases)
            .delta(RawField::Deaths, new_deaths)
            .cumulative(RawField::CasesCumulative, total_cases)
            .cumulative(RawField::DeathsCumulative, total_deaths)
            .published_on(reporting_date)
            .outliers(self.known_outliers.clone());

        for (query, fetched) in SeriesQuery::ALL.into_iter().zip(values) {
            let series = fetched
                .into_series()
                .ok_or_else(|| RunError::SnapshotShape(format!("{:?} is not a series", query)))?;
            update = update.grouped(query.target_field(), series);
        }
        Ok(update)
    }
}
