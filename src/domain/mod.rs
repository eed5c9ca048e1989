//! Domain layer - the statistics table, its field catalogue and the adapter
//! traits through which the engine talks to the outside world.
//!
//! This module contains:
//! - the explicit record schema (`RawField`, `DerivedField`, `DailyRecord`)
//! - the invariant-enforcing `TimeSeriesTable`
//! - publication `GenerationMarker`s
//! - the `SourceAdapter` and `PersistenceAdapter` traits
//! - the error taxonomy shared by all layers

pub mod error;
pub mod fields;
pub mod marker;
pub mod record;
pub mod series;
pub mod table;

pub use error::{AcquireError, InvariantViolation, PersistenceError, RunError, SourceError, UpsertError};
pub use fields::{DerivedField, Field, RawField};
pub use marker::GenerationMarker;
pub use record::{DailyRecord, RawPatch};
pub use series::DateSeries;
pub use table::TimeSeriesTable;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Single aggregate figures published by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateQuery {
    /// Cases newly reported in the latest publication.
    NewCases,
    /// All cases reported so far.
    TotalCases,
    /// Deaths newly reported in the latest publication.
    NewDeaths,
    /// All deaths reported so far.
    TotalDeaths,
}

/// Figures grouped by a date column of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesQuery {
    CasesByReportingDate,
    DeathsByReportingDate,
    CasesByReferenceDate,
    DeathsByReferenceDate,
}

impl SeriesQuery {
    pub const ALL: [SeriesQuery; 4] = [
        SeriesQuery::CasesByReportingDate,
        SeriesQuery::DeathsByReportingDate,
        SeriesQuery::CasesByReferenceDate,
        SeriesQuery::DeathsByReferenceDate,
    ];

    /// Raw column the series is stored in.
    pub fn target_field(self) -> RawField {
        match self {
            SeriesQuery::CasesByReportingDate => RawField::CasesByReportingDate,
            SeriesQuery::DeathsByReportingDate => RawField::DeathsByReportingDate,
            SeriesQuery::CasesByReferenceDate => RawField::CasesByReferenceDate,
            SeriesQuery::DeathsByReferenceDate => RawField::DeathsByReferenceDate,
        }
    }
}

/// A value tagged with the publication it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Marked<T> {
    pub value: T,
    pub marker: GenerationMarker,
}

impl<T> Marked<T> {
    pub fn new(value: T, marker: GenerationMarker) -> Self {
        Self { value, marker }
    }
}

/// Upstream statistics source.
///
/// Implementations must be thread-safe (`Send + Sync`); the snapshot
/// acquirer fans queries out concurrently.
///
/// # Implementations
///
/// See `infrastructure::rki_client::RkiClient` for the HTTP implementation.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch one aggregate figure.
    ///
    /// # Errors
    ///
    /// - Returns error if the source cannot be reached
    /// - Returns error if the response carries no parseable publication marker
    async fn fetch_aggregate(&self, query: AggregateQuery) -> Result<Marked<f64>, SourceError>;

    /// Fetch a figure grouped by calendar date.
    async fn fetch_grouped_series(
        &self,
        query: SeriesQuery,
    ) -> Result<Marked<BTreeMap<NaiveDate, f64>>, SourceError>;
}

/// Storage for whole statistics tables.
///
/// `save` must replace the stored table atomically: a concurrent `load`
/// observes either the previous rows or the new rows, never a mix.
///
/// # Implementations
///
/// - `infrastructure::parquet_store::ParquetStore`
/// - `infrastructure::local_file::JsonFileStore`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Load the rows stored under `key`, or `None` if nothing was stored yet.
    async fn load(&self, key: &str) -> Result<Option<Vec<DailyRecord>>, PersistenceError>;

    /// Atomically replace the rows stored under `key`.
    async fn save(&self, key: &str, rows: &[DailyRecord]) -> Result<(), PersistenceError>;
}
