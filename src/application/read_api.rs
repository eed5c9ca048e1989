//! Read accessors for the presentation layer.
//!
//! All reads go through the engine's published snapshot, so a concurrent
//! update is either fully visible or not at all.

use chrono::{Days, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::upsert::UpsertEngine;
use crate::domain::{DerivedField, Field, RawField, TimeSeriesTable};

/// Metrics shown in the dashboard headline, in display order.
pub const HEADLINE_METRICS: [Field; 16] = [
    Field::Raw(RawField::CasesCumulative),
    Field::Raw(RawField::Cases),
    Field::Derived(DerivedField::CasesMovingMean),
    Field::Derived(DerivedField::CasesLast7Days),
    Field::Derived(DerivedField::CasesLast7DaysByReportingDate),
    Field::Derived(DerivedField::Incidence7DayPer100k),
    Field::Derived(DerivedField::Incidence7DayByReportingDatePer100k),
    Field::Raw(RawField::DeathsCumulative),
    Field::Raw(RawField::Deaths),
    Field::Derived(DerivedField::DeathsMovingMean),
    Field::Derived(DerivedField::DeathsLast7Days),
    Field::Derived(DerivedField::Deaths7DayByMovingMeanPer1m),
    Field::Derived(DerivedField::ReproductionNumber),
    Field::Derived(DerivedField::CasesLast365Days),
    Field::Derived(DerivedField::DeathsLast365Days),
    Field::Derived(DerivedField::CaseFatalityRate),
];

/// A defined value on a date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct Observation {
    pub date: NaiveDate,
    pub value: f64,
}

/// A cell of a range read; `value` is null where missing or undefined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MetricSummary {
    pub metric: String,
    pub date: NaiveDate,
    pub value: f64,
    /// Value on the day before `date`
    pub previous_value: Option<f64>,
    /// `value - previous_value`
    pub change: Option<f64>,
}

/// Headline figures of the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DailyFigures {
    pub last_date: Option<NaiveDate>,
    pub published_on: Option<NaiveDate>,
    pub metrics: Vec<MetricSummary>,
}

/// Most recent date on which `metric` is defined.
///
/// Centered means lag the table by their radius, so for them this is three
/// days before the last date.
pub fn latest_in(table: &TimeSeriesTable, metric: Field) -> Option<Observation> {
    table
        .records()
        .rev()
        .find_map(|record| record.value(metric).map(|value| Observation { date: record.date, value }))
}

/// The value `lag_days` before the latest defined date.
pub fn previous_in(table: &TimeSeriesTable, metric: Field, lag_days: u32) -> Option<Observation> {
    let latest = latest_in(table, metric)?;
    let date = latest.date.checked_sub_days(Days::new(lag_days as u64))?;
    let value = table.get(date)?.value(metric)?;
    Some(Observation { date, value })
}

/// Every table date in `[start, end]`, inclusive.
pub fn range_in(table: &TimeSeriesTable, metric: Field, start: NaiveDate, end: NaiveDate) -> Vec<SeriesPoint> {
    if start > end {
        return Vec::new();
    }
    table
        .records()
        .skip_while(|record| record.date < start)
        .take_while(|record| record.date <= end)
        .map(|record| SeriesPoint {
            date: record.date,
            value: record.value(metric),
        })
        .collect()
}

pub fn daily_figures_in(table: &TimeSeriesTable) -> DailyFigures {
    let metrics = HEADLINE_METRICS
        .into_iter()
        .filter_map(|metric| {
            let latest = latest_in(table, metric)?;
            let previous_value = latest
                .date
                .checked_sub_days(Days::new(1))
                .and_then(|date| table.get(date))
                .and_then(|record| record.value(metric));
            Some(MetricSummary {
                metric: metric.name().to_string(),
                date: latest.date,
                value: latest.value,
                previous_value,
                change: previous_value.map(|previous| latest.value - previous),
            })
        })
        .collect();

    let last = table.last_date().and_then(|date| table.get(date));
    DailyFigures {
        last_date: last.map(|record| record.date),
        published_on: last.and_then(|record| record.published_on),
        metrics,
    }
}

/// Read-only view over the engine's published table.
#[derive(Clone)]
pub struct ReadApi {
    engine: Arc<UpsertEngine>,
}

impl ReadApi {
    pub fn new(engine: Arc<UpsertEngine>) -> Self {
        Self { engine }
    }

    pub async fn latest(&self, metric: Field) -> Option<Observation> {
        latest_in(&*self.engine.snapshot().await, metric)
    }

    pub async fn previous(&self, metric: Field, lag_days: u32) -> Option<Observation> {
        previous_in(&*self.engine.snapshot().await, metric, lag_days)
    }

    pub async fn range(&self, metric: Field, start: NaiveDate, end: NaiveDate) -> Vec<SeriesPoint> {
        range_in(&*self.engine.snapshot().await, metric, start, end)
    }

    pub async fn daily_figures(&self) -> DailyFigures {
        daily_figures_in(&*self.engine.snapshot().await)
    }

    /// Number of days in the published table.
    pub async fn days(&self) -> usize {
        self.engine.snapshot().await.len()
    }
}
