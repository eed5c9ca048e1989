pub mod read_api;
pub mod snapshot;
pub mod update_service;
pub mod upsert;
pub mod window_statistics;

pub use read_api::{DailyFigures, MetricSummary, Observation, ReadApi, SeriesPoint};
pub use snapshot::{ConsistentSnapshotAcquirer, ExhaustionPolicy, FetchOp, Fetched, Snapshot, SnapshotConfig};
pub use update_service::{RunReport, UpdateService};
pub use upsert::{apply_update, DayUpdate, UpsertEngine};
pub use window_statistics::{recompute, StatisticsConfig};
