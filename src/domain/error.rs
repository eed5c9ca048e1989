//! Error taxonomy of the statistics engine.
//!
//! Every error here is local to a single update run. None of them leaves the
//! published table in a partially written state.

use chrono::NaiveDate;
use thiserror::Error;

use super::fields::{DerivedField, RawField};
use super::marker::GenerationMarker;

/// A write the table refuses because it would break one of its invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("derived field {field} cannot be written directly")]
    DerivedFieldWrite { field: DerivedField },
    #[error("unknown field name: {name}")]
    UnknownField { name: String },
    #[error("duplicate date {date} in bulk load")]
    DuplicateDate { date: NaiveDate },
    #[error("date {date} is out of order (follows {previous})")]
    OutOfOrder { date: NaiveDate, previous: NaiveDate },
    #[error(
        "{field} = {value} on {date} breaks monotonicity ({neighbour_value} on {neighbour_date})"
    )]
    NonMonotonicCumulative {
        field: RawField,
        date: NaiveDate,
        value: f64,
        neighbour_date: NaiveDate,
        neighbour_value: f64,
    },
    #[error("no record for {date}")]
    UnknownDate { date: NaiveDate },
    #[error("non-finite value {value} for {field} on {date}")]
    NonFiniteValue {
        field: RawField,
        date: NaiveDate,
        value: f64,
    },
}

/// Failure reported by a [`SourceAdapter`](super::SourceAdapter).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream response malformed: {0}")]
    Malformed(String),
    #[error("unparseable generation marker: {0:?}")]
    Marker(String),
}

/// Failure reported by a [`PersistenceAdapter`](super::PersistenceAdapter).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("corrupt table {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("invalid table key: {0:?}")]
    InvalidKey(String),
}

/// Failure of a consistent snapshot acquisition.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] SourceError),
    #[error("no consistent snapshot after {attempts} attempts (last markers: {last_markers:?})")]
    ConsistencyTimeout {
        attempts: usize,
        last_markers: Vec<GenerationMarker>,
    },
    #[error("empty fetch batch")]
    EmptyBatch,
}

/// Failure of an upsert transaction. The published table is unchanged.
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("missing predecessor for {field} on {date}: no cumulative value on the day before")]
    MissingPredecessor { date: NaiveDate, field: RawField },
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Failure of one scheduled update run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Upsert(#[from] UpsertError),
    #[error("snapshot shape mismatch: {0}")]
    SnapshotShape(String),
}
