//! Field catalogue of the daily statistics table.
//!
//! Raw fields are written by the update run; derived fields are only ever
//! produced by recomputation. Both namespaces have stable snake_case names
//! that are used by persistence, configuration and the HTTP API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use super::error::InvariantViolation;

/// Raw figures as reported by the upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RawField {
    Cases,
    Deaths,
    CasesCumulative,
    DeathsCumulative,
    CasesByReportingDate,
    DeathsByReportingDate,
    CasesByReferenceDate,
    DeathsByReferenceDate,
}

impl RawField {
    pub const ALL: [RawField; 8] = [
        RawField::Cases,
        RawField::Deaths,
        RawField::CasesCumulative,
        RawField::DeathsCumulative,
        RawField::CasesByReportingDate,
        RawField::DeathsByReportingDate,
        RawField::CasesByReferenceDate,
        RawField::DeathsByReferenceDate,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn name(self) -> &'static str {
        match self {
            RawField::Cases => "cases",
            RawField::Deaths => "deaths",
            RawField::CasesCumulative => "cases_cumulative",
            RawField::DeathsCumulative => "deaths_cumulative",
            RawField::CasesByReportingDate => "cases_by_reporting_date",
            RawField::DeathsByReportingDate => "deaths_by_reporting_date",
            RawField::CasesByReferenceDate => "cases_by_reference_date",
            RawField::DeathsByReferenceDate => "deaths_by_reference_date",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Cumulative-style fields must be non-decreasing along the date axis.
    pub fn is_cumulative(self) -> bool {
        matches!(self, RawField::CasesCumulative | RawField::DeathsCumulative)
    }

    /// The cumulative field a daily delta accumulates into, if any.
    pub fn cumulative_partner(self) -> Option<RawField> {
        match self {
            RawField::Cases => Some(RawField::CasesCumulative),
            RawField::Deaths => Some(RawField::DeathsCumulative),
            _ => None,
        }
    }
}

/// Statistics computed from the raw columns over date windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DerivedField {
    CasesMovingMean,
    DeathsMovingMean,
    CasesByReportingDateMovingMean,
    DeathsByReportingDateMovingMean,
    CasesByReferenceDateMovingMean,
    DeathsByReferenceDateMovingMean,
    ReproductionNumber,
    CasesMovingMeanDayOverDay,
    #[serde(rename = "cases_last_7_days")]
    CasesLast7Days,
    #[serde(rename = "cases_last_7_days_by_reporting_date")]
    CasesLast7DaysByReportingDate,
    #[serde(rename = "deaths_last_7_days")]
    DeathsLast7Days,
    #[serde(rename = "cases_last_365_days")]
    CasesLast365Days,
    #[serde(rename = "deaths_last_365_days")]
    DeathsLast365Days,
    #[serde(rename = "incidence_7_day_per_100k")]
    Incidence7DayPer100k,
    #[serde(rename = "incidence_7_day_by_moving_mean_per_100k")]
    Incidence7DayByMovingMeanPer100k,
    #[serde(rename = "incidence_7_day_by_reporting_date_per_100k")]
    Incidence7DayByReportingDatePer100k,
    #[serde(rename = "incidence_7_day_by_reporting_date_moving_mean_per_100k")]
    Incidence7DayByReportingDateMovingMeanPer100k,
    #[serde(rename = "deaths_7_day_per_1m")]
    Deaths7DayPer1m,
    #[serde(rename = "deaths_7_day_by_moving_mean_per_1m")]
    Deaths7DayByMovingMeanPer1m,
    CaseFatalityRate,
    NonDeceasedCases,
}

impl DerivedField {
    pub const ALL: [DerivedField; 21] = [
        DerivedField::CasesMovingMean,
        DerivedField::DeathsMovingMean,
        DerivedField::CasesByReportingDateMovingMean,
        DerivedField::DeathsByReportingDateMovingMean,
        DerivedField::CasesByReferenceDateMovingMean,
        DerivedField::DeathsByReferenceDateMovingMean,
        DerivedField::ReproductionNumber,
        DerivedField::CasesMovingMeanDayOverDay,
        DerivedField::CasesLast7Days,
        DerivedField::CasesLast7DaysByReportingDate,
        DerivedField::DeathsLast7Days,
        DerivedField::CasesLast365Days,
        DerivedField::DeathsLast365Days,
        DerivedField::Incidence7DayPer100k,
        DerivedField::Incidence7DayByMovingMeanPer100k,
        DerivedField::Incidence7DayByReportingDatePer100k,
        DerivedField::Incidence7DayByReportingDateMovingMeanPer100k,
        DerivedField::Deaths7DayPer1m,
        DerivedField::Deaths7DayByMovingMeanPer1m,
        DerivedField::CaseFatalityRate,
        DerivedField::NonDeceasedCases,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn name(self) -> &'static str {
        match self {
            DerivedField::CasesMovingMean => "cases_moving_mean",
            DerivedField::DeathsMovingMean => "deaths_moving_mean",
            DerivedField::CasesByReportingDateMovingMean => "cases_by_reporting_date_moving_mean",
            DerivedField::DeathsByReportingDateMovingMean => "deaths_by_reporting_date_moving_mean",
            DerivedField::CasesByReferenceDateMovingMean => "cases_by_reference_date_moving_mean",
            DerivedField::DeathsByReferenceDateMovingMean => "deaths_by_reference_date_moving_mean",
            DerivedField::ReproductionNumber => "reproduction_number",
            DerivedField::CasesMovingMeanDayOverDay => "cases_moving_mean_day_over_day",
            DerivedField::CasesLast7Days => "cases_last_7_days",
            DerivedField::CasesLast7DaysByReportingDate => "cases_last_7_days_by_reporting_date",
            DerivedField::DeathsLast7Days => "deaths_last_7_days",
            DerivedField::CasesLast365Days => "cases_last_365_days",
            DerivedField::DeathsLast365Days => "deaths_last_365_days",
            DerivedField::Incidence7DayPer100k => "incidence_7_day_per_100k",
            DerivedField::Incidence7DayByMovingMeanPer100k => "incidence_7_day_by_moving_mean_per_100k",
            DerivedField::Incidence7DayByReportingDatePer100k => "incidence_7_day_by_reporting_date_per_100k",
            DerivedField::Incidence7DayByReportingDateMovingMeanPer100k => {
                "incidence_7_day_by_reporting_date_moving_mean_per_100k"
            }
            DerivedField::Deaths7DayPer1m => "deaths_7_day_per_1m",
            DerivedField::Deaths7DayByMovingMeanPer1m => "deaths_7_day_by_moving_mean_per_1m",
            DerivedField::CaseFatalityRate => "case_fatality_rate",
            DerivedField::NonDeceasedCases => "non_deceased_cases",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Any column of the table, addressed by name at the edges of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Raw(RawField),
    Derived(DerivedField),
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Raw(f) => f.name(),
            Field::Derived(f) => f.name(),
        }
    }

    /// Every field, raw fields first.
    pub fn all() -> impl Iterator<Item = Field> {
        RawField::ALL
            .into_iter()
            .map(Field::Raw)
            .chain(DerivedField::ALL.into_iter().map(Field::Derived))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for RawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DerivedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = InvariantViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Field::all()
            .find(|field| field.name() == wanted)
            .ok_or_else(|| InvariantViolation::UnknownField {
                name: wanted.to_string(),
            })
    }
}

impl FromStr for RawField {
    type Err = InvariantViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Field>()? {
            Field::Raw(field) => Ok(field),
            Field::Derived(field) => Err(InvariantViolation::DerivedFieldWrite { field }),
        }
    }
}
