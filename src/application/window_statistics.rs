//! Rolling statistics over date-indexed series.
//!
//! Every function is pure and returns a new series over the input's index.
//! A value is only produced when its whole window consists of consecutive
//! calendar days that are all present with a value; there is no partial
//! window averaging. Because each output cell depends only on the input cells
//! in its own window, computing over the full history and computing again
//! after every appended day give identical results.

use chrono::{Days, NaiveDate};
use serde::Deserialize;

use crate::domain::{DateSeries, DerivedField, RawField, TimeSeriesTable};

/// Default radius of the centered moving mean (seven days).
pub const MOVING_MEAN_RADIUS: u32 = 3;
/// Default length of the trailing sum behind incidence figures.
pub const TRAILING_WINDOW_DAYS: usize = 7;
/// Trailing window of the annual totals.
pub const ANNUAL_WINDOW_DAYS: usize = 365;

/// Parameters of the per-population statistics.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatisticsConfig {
    /// Inhabitants of the covered region
    #[serde(default = "default_population")]
    pub population: f64,
    /// Denominator of case incidence (per N inhabitants)
    #[serde(default = "default_incidence_per")]
    pub incidence_per: f64,
    /// Denominator of death incidence (per N inhabitants)
    #[serde(default = "default_deaths_per")]
    pub deaths_per: f64,
}

fn default_population() -> f64 {
    83_166_711.0
}
fn default_incidence_per() -> f64 {
    100_000.0
}
fn default_deaths_per() -> f64 {
    1_000_000.0
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            population: default_population(),
            incidence_per: default_incidence_per(),
            deaths_per: default_deaths_per(),
        }
    }
}

fn days_before(date: NaiveDate, days: u64) -> Option<NaiveDate> {
    date.checked_sub_days(Days::new(days))
}

fn window_sum(column: &DateSeries, start: Option<NaiveDate>, len: usize) -> Option<f64> {
    column.window(start?, len).map(|values| values.iter().sum())
}

/// Mean of `[d - radius, d + radius]`.
pub fn moving_mean(column: &DateSeries, radius: u32) -> DateSeries {
    let len = 2 * radius as usize + 1;
    column.map_dates(|date| {
        let values = column.window(days_before(date, radius as u64)?, len)?;
        Some(values.iter().sum::<f64>() / len as f64)
    })
}

/// Sum of `[d - length + 1, d]`.
pub fn trailing_sum(column: &DateSeries, length: usize) -> DateSeries {
    if length == 0 {
        return column.map_dates(|_| Some(0.0));
    }
    column.map_dates(|date| window_sum(column, days_before(date, length as u64 - 1), length))
}

/// `sum(d-3 ..= d) / sum(d-7 ..= d-4)` over a moving-mean column.
///
/// A zero denominator yields an undefined value rather than infinity.
pub fn reproduction_number(mean_column: &DateSeries) -> DateSeries {
    mean_column.map_dates(|date| {
        let recent = window_sum(mean_column, days_before(date, 3), 4)?;
        let preceding = window_sum(mean_column, days_before(date, 7), 4)?;
        if preceding == 0.0 {
            return None;
        }
        Some(recent / preceding)
    })
}

/// Seven-day trailing sum per `n` inhabitants.
pub fn incidence_per_n(column: &DateSeries, population: f64, n: f64) -> DateSeries {
    let sums = trailing_sum(column, TRAILING_WINDOW_DAYS);
    sums.map_dates(|date| sums.get(date).map(|sum| sum / population * n))
}

/// `value[d] / value[d - 1]`.
pub fn day_over_day_ratio(column: &DateSeries) -> DateSeries {
    column.map_dates(|date| {
        let previous = column.get(days_before(date, 1)?)?;
        Some(column.get(date)? / previous)
    })
}

/// Deaths over cases, rounded to six decimals.
pub fn case_fatality_rate(deaths_cumulative: &DateSeries, cases_cumulative: &DateSeries) -> DateSeries {
    cases_cumulative.map_dates(|date| {
        let cases = cases_cumulative.get(date)?;
        if cases == 0.0 {
            return None;
        }
        let rate = deaths_cumulative.get(date)? / cases;
        Some((rate * 1e6).round() / 1e6)
    })
}

/// Row-wise `minuend - subtrahend`.
pub fn difference(minuend: &DateSeries, subtrahend: &DateSeries) -> DateSeries {
    minuend.map_dates(|date| Some(minuend.get(date)? - subtrahend.get(date)?))
}

/// Recompute every derived column of `table` from its raw columns.
///
/// The input is left untouched; the returned table is clean.
pub fn recompute(table: &TimeSeriesTable, config: &StatisticsConfig) -> TimeSeriesTable {
    let cases = table.column(RawField::Cases);
    let deaths = table.column(RawField::Deaths);
    let cases_by_reporting = table.column(RawField::CasesByReportingDate);

    let cases_mean = moving_mean(&cases, MOVING_MEAN_RADIUS);
    let deaths_mean = moving_mean(&deaths, MOVING_MEAN_RADIUS);
    let cases_by_reporting_mean = moving_mean(&cases_by_reporting, MOVING_MEAN_RADIUS);

    let columns = [
        (DerivedField::CasesMovingMean, cases_mean.clone()),
        (DerivedField::DeathsMovingMean, deaths_mean.clone()),
        (DerivedField::CasesByReportingDateMovingMean, cases_by_reporting_mean.clone()),
        (
            DerivedField::DeathsByReportingDateMovingMean,
            moving_mean(&table.column(RawField::DeathsByReportingDate), MOVING_MEAN_RADIUS),
        ),
        (
            DerivedField::CasesByReferenceDateMovingMean,
            moving_mean(&table.column(RawField::CasesByReferenceDate), MOVING_MEAN_RADIUS),
        ),
        (
            DerivedField::DeathsByReferenceDateMovingMean,
            moving_mean(&table.column(RawField::DeathsByReferenceDate), MOVING_MEAN_RADIUS),
        ),
        (DerivedField::ReproductionNumber, reproduction_number(&cases_mean)),
        (DerivedField::CasesMovingMeanDayOverDay, day_over_day_ratio(&cases_mean)),
        (DerivedField::CasesLast7Days, trailing_sum(&cases, TRAILING_WINDOW_DAYS)),
        (
            DerivedField::CasesLast7DaysByReportingDate,
            trailing_sum(&cases_by_reporting, TRAILING_WINDOW_DAYS),
        ),
        (DerivedField::DeathsLast7Days, trailing_sum(&deaths, TRAILING_WINDOW_DAYS)),
        (DerivedField::CasesLast365Days, trailing_sum(&cases, ANNUAL_WINDOW_DAYS)),
        (DerivedField::DeathsLast365Days, trailing_sum(&deaths, ANNUAL_WINDOW_DAYS)),
        (
            DerivedField::Incidence7DayPer100k,
            incidence_per_n(&cases, config.population, config.incidence_per),
        ),
        (
            DerivedField::Incidence7DayByMovingMeanPer100k,
            incidence_per_n(&cases_mean, config.population, config.incidence_per),
        ),
        (
            DerivedField::Incidence7DayByReportingDatePer100k,
            incidence_per_n(&cases_by_reporting, config.population, config.incidence_per),
        ),
        (
            DerivedField::Incidence7DayByReportingDateMovingMeanPer100k,
            incidence_per_n(&cases_by_reporting_mean, config.population, config.incidence_per),
        ),
        (
            DerivedField::Deaths7DayPer1m,
            incidence_per_n(&deaths, config.population, config.deaths_per),
        ),
        (
            DerivedField::Deaths7DayByMovingMeanPer1m,
            incidence_per_n(&deaths_mean, config.population, config.deaths_per),
        ),
        (
            DerivedField::CaseFatalityRate,
            case_fatality_rate(
                &table.column(RawField::DeathsCumulative),
                &table.column(RawField::CasesCumulative),
            ),
        ),
        (
            DerivedField::NonDeceasedCases,
            difference(
                &table.column(RawField::CasesCumulative),
                &table.column(RawField::DeathsCumulative),
            ),
        ),
    ];

    let mut next = table.clone();
    for (field, series) in &columns {
        next.set_derived_column(*field, series);
    }
    next.mark_clean();
    next
}
