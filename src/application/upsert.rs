//! Transactional upserts into the published statistics table.
//!
//! Every write builds a new table value from the current one, recomputes the
//! derived columns, persists the result and only then swaps the shared
//! pointer. A failure at any step leaves the published table untouched.

use chrono::{Days, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::window_statistics::{recompute, StatisticsConfig};
use crate::domain::{
    DailyRecord, InvariantViolation, PersistenceAdapter, RawField, RawPatch, TimeSeriesTable, UpsertError,
};

/// Everything one run writes into the table.
#[derive(Debug, Clone, PartialEq)]
pub struct DayUpdate {
    pub date: NaiveDate,
    /// Daily counts; `cases`/`deaths` imply their cumulative partner.
    pub deltas: RawPatch,
    /// Explicit cumulative values, preferred over derived ones.
    pub cumulative: RawPatch,
    /// Whole raw columns to replace, republished in full by the source.
    pub grouped: BTreeMap<RawField, BTreeMap<NaiveDate, f64>>,
    /// Cells to null, skipped by the monotonicity check. Pairs on dates
    /// without a record are ignored.
    pub outliers: Vec<(NaiveDate, RawField)>,
}

impl DayUpdate {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            deltas: RawPatch::new(),
            cumulative: RawPatch::new(),
            grouped: BTreeMap::new(),
            outliers: Vec::new(),
        }
    }

    pub fn delta(mut self, field: RawField, value: f64) -> Self {
        self.deltas.set(field, value);
        self
    }

    pub fn cumulative(mut self, field: RawField, value: f64) -> Self {
        self.cumulative.set(field, value);
        self
    }

    pub fn published_on(mut self, date: NaiveDate) -> Self {
        self.deltas = self.deltas.with_published_on(date);
        self
    }

    pub fn grouped(mut self, field: RawField, series: BTreeMap<NaiveDate, f64>) -> Self {
        self.grouped.insert(field, series);
        self
    }

    pub fn outliers(mut self, outliers: Vec<(NaiveDate, RawField)>) -> Self {
        self.outliers = outliers;
        self
    }
}

/// Fold `update` into a copy of `table` and recompute every derived column.
pub fn apply_update(
    table: &TimeSeriesTable,
    update: &DayUpdate,
    statistics: &StatisticsConfig,
) -> Result<TimeSeriesTable, UpsertError> {
    let date = update.date;
    let mut patch = update.deltas.clone();
    for (field, value) in update.cumulative.iter() {
        patch.set(field, value);
    }

    for (field, delta) in update.deltas.iter() {
        let Some(partner) = field.cumulative_partner() else {
            continue;
        };
        if update.cumulative.get(partner).is_some() {
            continue;
        }
        let previous = date
            .checked_sub_days(Days::new(1))
            .and_then(|day_before| table.get(day_before))
            .and_then(|record| record.raw(partner))
            .ok_or(UpsertError::MissingPredecessor { date, field: partner })?;
        patch.set(partner, previous + delta);
    }

    let mut next = table.clone();
    // Outliers are nulled before the writes so the monotonicity check skips
    // them, and again after, since the writes may have restored them.
    null_outliers(&mut next, &update.outliers)?;
    if !patch.is_empty() {
        next.set_raw(date, &patch)?;
    }
    for (field, series) in &update.grouped {
        next.replace_raw_column(*field, series)?;
    }
    null_outliers(&mut next, &update.outliers)?;

    Ok(recompute(&next, statistics))
}

fn null_outliers(table: &mut TimeSeriesTable, outliers: &[(NaiveDate, RawField)]) -> Result<(), UpsertError> {
    for (outlier_date, field) in outliers {
        if table.contains(*outlier_date) {
            table.null_raw(*outlier_date, *field)?;
        } else {
            debug!("Skipping outlier {} on {}: no record", field, outlier_date);
        }
    }
    Ok(())
}

/// Single-writer owner of the published table.
pub struct UpsertEngine {
    store: Arc<dyn PersistenceAdapter>,
    key: String,
    statistics: StatisticsConfig,
    current: RwLock<Arc<TimeSeriesTable>>,
    writer: Mutex<()>,
}

impl UpsertEngine {
    /// Engine over an empty table; call [`bootstrap`](Self::bootstrap) to load history.
    pub fn new(store: Arc<dyn PersistenceAdapter>, key: impl Into<String>, statistics: StatisticsConfig) -> Self {
        Self {
            store,
            key: key.into(),
            statistics,
            current: RwLock::new(Arc::new(TimeSeriesTable::new())),
            writer: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The currently published table.
    pub async fn snapshot(&self) -> Arc<TimeSeriesTable> {
        self.current.read().await.clone()
    }

    /// Load the stored table, validate it and recompute its derived columns.
    ///
    /// Returns the number of loaded days. A missing key yields an empty table.
    pub async fn bootstrap(&self) -> Result<usize, UpsertError> {
        let _writer = self.writer.lock().await;
        let table = match self.store.load(&self.key).await? {
            Some(rows) => TimeSeriesTable::from_records(rows)?,
            None => {
                warn!("No stored table under {}, starting empty", self.key);
                TimeSeriesTable::new()
            }
        };
        let table = recompute(&table, &self.statistics);
        let days = table.len();
        info!(
            "Bootstrapped table {} with {} days (last: {:?})",
            self.key,
            days,
            table.last_date()
        );
        *self.current.write().await = Arc::new(table);
        Ok(days)
    }

    /// Write one day's counts.
    ///
    /// Cumulative values missing from `cumulative` are derived from the
    /// previous day's cumulative plus the delta.
    pub async fn upsert_day(
        &self,
        date: NaiveDate,
        deltas: RawPatch,
        cumulative: Option<RawPatch>,
    ) -> Result<Arc<TimeSeriesTable>, UpsertError> {
        let update = DayUpdate {
            deltas,
            cumulative: cumulative.unwrap_or_default(),
            ..DayUpdate::new(date)
        };
        self.apply(update).await
    }

    /// Figures published on `reporting_date` belong to the day before.
    pub async fn upsert_cases_and_deaths_for_date(
        &self,
        reporting_date: NaiveDate,
        new_cases: f64,
        new_deaths: f64,
        cases_cumulative: Option<f64>,
        deaths_cumulative: Option<f64>,
    ) -> Result<Arc<TimeSeriesTable>, UpsertError> {
        let date = data_date(reporting_date)?;
        let mut cumulative = RawPatch::new();
        if let Some(value) = cases_cumulative {
            cumulative.set(RawField::CasesCumulative, value);
        }
        if let Some(value) = deaths_cumulative {
            cumulative.set(RawField::DeathsCumulative, value);
        }
        let deltas = RawPatch::new()
            .with(RawField::Cases, new_cases)
            .with(RawField::Deaths, new_deaths)
            .with_published_on(reporting_date);
        self.upsert_day(date, deltas, Some(cumulative)).await
    }

    /// Null the given cells as known source anomalies, in one transaction.
    pub async fn correct_outliers(
        &self,
        outliers: &[(NaiveDate, RawField)],
    ) -> Result<Arc<TimeSeriesTable>, UpsertError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await;
        if let Some((date, _)) = outliers.iter().find(|(date, _)| !current.contains(*date)) {
            return Err(InvariantViolation::UnknownDate { date: *date }.into());
        }

        let mut next = (*current).clone();
        for (date, field) in outliers {
            next.null_raw(*date, *field)?;
        }
        let next = recompute(&next, &self.statistics);
        info!("Corrected {} outlier cell(s)", outliers.len());
        self.publish(next).await
    }

    /// Run `update` as one transaction.
    pub async fn apply(&self, update: DayUpdate) -> Result<Arc<TimeSeriesTable>, UpsertError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await;
        let next = apply_update(&current, &update, &self.statistics)?;
        info!(
            "Upserted {} ({} raw fields, {} grouped columns)",
            update.date,
            update.deltas.iter().count() + update.cumulative.iter().count(),
            update.grouped.len()
        );
        self.publish(next).await
    }

    /// Persist, then swap. Callers hold the writer lock.
    async fn publish(&self, next: TimeSeriesTable) -> Result<Arc<TimeSeriesTable>, UpsertError> {
        let rows: Vec<DailyRecord> = next.records().cloned().collect();
        self.store.save(&self.key, &rows).await?;
        debug!("Saved {} rows under {}", rows.len(), self.key);

        let next = Arc::new(next);
        *self.current.write().await = next.clone();
        Ok(next)
    }
}

/// The day a publication's figures are attributed to.
pub fn data_date(reporting_date: NaiveDate) -> Result<NaiveDate, UpsertError> {
    reporting_date.checked_sub_days(Days::new(1)).ok_or_else(|| {
        InvariantViolation::UnknownDate { date: reporting_date }.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DerivedField, MockPersistenceAdapter, PersistenceError};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: StdMutex<Option<Vec<DailyRecord>>>,
        saves: StdMutex<usize>,
    }

    #[async_trait]
    impl PersistenceAdapter for MemoryStore {
        async fn load(&self, _key: &str) -> Result<Option<Vec<DailyRecord>>, PersistenceError> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn save(&self, _key: &str, rows: &[DailyRecord]) -> Result<(), PersistenceError> {
            *self.rows.lock().unwrap() = Some(rows.to_vec());
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 2, d).unwrap()
    }

    fn history(days: u32) -> Vec<DailyRecord> {
        (1..=days)
            .map(|d| {
                DailyRecord::new(day(d))
                    .with_raw(RawField::Cases, 100.0)
                    .with_raw(RawField::Deaths, 2.0)
                    .with_raw(RawField::CasesCumulative, 1_000.0 + 100.0 * d as f64)
                    .with_raw(RawField::DeathsCumulative, 20.0 + 2.0 * d as f64)
            })
            .collect()
    }

    async fn engine_with(rows: Vec<DailyRecord>) -> (UpsertEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore {
            rows: StdMutex::new(Some(rows)),
            ..MemoryStore::default()
        });
        let engine = UpsertEngine::new(store.clone(), "germany", StatisticsConfig::default());
        engine.bootstrap().await.unwrap();
        (engine, store)
    }

    #[tokio::test]
    async fn test_bootstrap_recomputes_derived_fields() {
        let (engine, _) = engine_with(history(10)).await;
        let table = engine.snapshot().await;
        assert_eq!(table.len(), 10);
        assert!(!table.is_dirty());
        assert_eq!(table.get(day(5)).unwrap().derived(DerivedField::CasesMovingMean), Some(100.0));
    }

    #[tokio::test]
    async fn test_bootstrap_without_stored_table_is_empty() {
        let engine = UpsertEngine::new(Arc::new(MemoryStore::default()), "germany", StatisticsConfig::default());
        assert_eq!(engine.bootstrap().await.unwrap(), 0);
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_day_derives_cumulative_from_predecessor() {
        let (engine, store) = engine_with(history(10)).await;
        let table = engine
            .upsert_day(
                day(11),
                RawPatch::new().with(RawField::Cases, 150.0).with(RawField::Deaths, 3.0),
                None,
            )
            .await
            .unwrap();

        let record = table.get(day(11)).unwrap();
        assert_eq!(record.raw(RawField::CasesCumulative), Some(2_000.0 + 150.0));
        assert_eq!(record.raw(RawField::DeathsCumulative), Some(40.0 + 3.0));
        assert_eq!(record.derived(DerivedField::CasesLast7Days), Some(750.0));
        assert_eq!(*store.saves.lock().unwrap(), 1);
        assert_eq!(engine.snapshot().await.len(), 11);
    }

    #[tokio::test]
    async fn test_upsert_day_is_idempotent() {
        let (engine, store) = engine_with(history(10)).await;
        let deltas = RawPatch::new().with(RawField::Cases, 150.0).with(RawField::Deaths, 3.0);

        let first = engine.upsert_day(day(11), deltas.clone(), None).await.unwrap();
        let saved_first = store.rows.lock().unwrap().clone();
        let second = engine.upsert_day(day(11), deltas, None).await.unwrap();
        let saved_second = store.rows.lock().unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(saved_first, saved_second);
    }

    #[tokio::test]
    async fn test_missing_predecessor_leaves_table_unchanged() {
        let (engine, store) = engine_with(history(10)).await;
        let before = engine.snapshot().await;

        let err = engine
            .upsert_day(day(13), RawPatch::new().with(RawField::Cases, 1.0), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpsertError::MissingPredecessor { date, field: RawField::CasesCumulative } if date == day(13)
        ));
        assert_eq!(engine.snapshot().await, before);
        assert_eq!(*store.saves.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_explicit_cumulative_skips_predecessor_lookup() {
        let (engine, _) = engine_with(history(10)).await;
        let table = engine
            .upsert_day(
                day(13),
                RawPatch::new().with(RawField::Cases, 1.0),
                Some(RawPatch::new().with(RawField::CasesCumulative, 5_000.0)),
            )
            .await
            .unwrap();
        assert_eq!(table.get(day(13)).unwrap().raw(RawField::CasesCumulative), Some(5_000.0));
    }

    #[tokio::test]
    async fn test_reporting_date_maps_to_previous_day() {
        let (engine, _) = engine_with(history(10)).await;
        let table = engine
            .upsert_cases_and_deaths_for_date(day(12), 120.0, 1.0, None, Some(60.0))
            .await
            .unwrap();
        let record = table.get(day(11)).unwrap();
        assert_eq!(record.raw(RawField::Cases), Some(120.0));
        assert_eq!(record.raw(RawField::CasesCumulative), Some(2_120.0));
        assert_eq!(record.raw(RawField::DeathsCumulative), Some(60.0));
        assert_eq!(record.published_on, Some(day(12)));
        assert!(table.get(day(12)).is_none());
    }

    #[tokio::test]
    async fn test_outlier_correction_propagates_to_windows_only() {
        let (engine, _) = engine_with(history(20)).await;
        let before = engine.snapshot().await;
        let after = engine.correct_outliers(&[(day(10), RawField::Cases)]).await.unwrap();

        for d in 1..=20u32 {
            let mean = after.get(day(d)).unwrap().derived(DerivedField::CasesMovingMean);
            let sum = after.get(day(d)).unwrap().derived(DerivedField::CasesLast7Days);
            if (7..=13).contains(&d) {
                assert_eq!(mean, None, "mean on day {}", d);
            } else {
                assert_eq!(mean, before.get(day(d)).unwrap().derived(DerivedField::CasesMovingMean));
            }
            if (10..=16).contains(&d) {
                assert_eq!(sum, None, "sum on day {}", d);
            } else {
                assert_eq!(sum, before.get(day(d)).unwrap().derived(DerivedField::CasesLast7Days));
            }
        }
        assert_eq!(after.get(day(10)).unwrap().raw(RawField::Deaths), Some(2.0));
    }

    #[tokio::test]
    async fn test_outlier_on_unknown_date_is_rejected() {
        let (engine, store) = engine_with(history(5)).await;
        let err = engine.correct_outliers(&[(day(20), RawField::Cases)]).await.unwrap_err();
        assert!(matches!(err, UpsertError::Invariant(InvariantViolation::UnknownDate { .. })));
        assert_eq!(*store.saves.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_published_table() {
        let rows = history(10);
        let mut store = MockPersistenceAdapter::new();
        store.expect_load().returning(move |_| Ok(Some(rows.clone())));
        store.expect_save().times(1).returning(|_, _| {
            Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            )))
        });

        let engine = UpsertEngine::new(Arc::new(store), "germany", StatisticsConfig::default());
        engine.bootstrap().await.unwrap();
        let before = engine.snapshot().await;

        let err = engine
            .upsert_day(day(11), RawPatch::new().with(RawField::Cases, 1.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::Persistence(_)));
        assert_eq!(engine.snapshot().await, before);
        assert!(engine.snapshot().await.get(day(11)).is_none());
    }

    #[test]
    fn test_apply_update_replaces_grouped_columns_and_skips_unknown_outliers() {
        let table = recompute(
            &TimeSeriesTable::from_records(history(3)).unwrap(),
            &StatisticsConfig::default(),
        );
        let update = DayUpdate::new(day(4))
            .delta(RawField::Cases, 10.0)
            .cumulative(RawField::CasesCumulative, 1_310.0)
            .published_on(day(5))
            .grouped(
                RawField::CasesByReportingDate,
                BTreeMap::from([(day(1), 90.0), (day(4), 95.0)]),
            )
            .outliers(vec![(day(2), RawField::Deaths), (day(28), RawField::Cases)]);

        let next = apply_update(&table, &update, &StatisticsConfig::default()).unwrap();
        assert_eq!(next.get(day(4)).unwrap().raw(RawField::CasesCumulative), Some(1_310.0));
        assert_eq!(next.get(day(4)).unwrap().published_on, Some(day(5)));
        assert_eq!(next.get(day(4)).unwrap().raw(RawField::CasesByReportingDate), Some(95.0));
        assert_eq!(next.get(day(2)).unwrap().raw(RawField::Deaths), None);
        assert!(!next.contains(day(28)));
        // The input table is a value; it is never modified.
        assert!(!table.contains(day(4)));
    }

    #[test]
    fn test_known_outlier_admits_lowered_cumulative() {
        let rows = vec![
            DailyRecord::new(day(1)).with_raw(RawField::CasesCumulative, 100.0),
            DailyRecord::new(day(2)).with_raw(RawField::CasesCumulative, 150.0),
        ];
        let table = TimeSeriesTable::from_records(rows).unwrap();
        let update = DayUpdate::new(day(3))
            .delta(RawField::Cases, 10.0)
            .cumulative(RawField::CasesCumulative, 110.0)
            .outliers(vec![(day(2), RawField::CasesCumulative)]);

        let next = apply_update(&table, &update, &StatisticsConfig::default()).unwrap();
        assert_eq!(next.get(day(2)).unwrap().raw(RawField::CasesCumulative), None);
        assert_eq!(next.get(day(3)).unwrap().raw(RawField::CasesCumulative), Some(110.0));

        // Without the outlier the same write is rejected.
        let update = DayUpdate {
            outliers: Vec::new(),
            ..update
        };
        assert!(apply_update(&table, &update, &StatisticsConfig::default()).is_err());
    }

    #[test]
    fn test_outlier_on_written_date_stays_null() {
        let table = TimeSeriesTable::from_records(history(3)).unwrap();
        let update = DayUpdate::new(day(4))
            .delta(RawField::Cases, 10.0)
            .cumulative(RawField::CasesCumulative, 1_310.0)
            .grouped(RawField::CasesByReportingDate, BTreeMap::from([(day(3), 7.0)]))
            .outliers(vec![(day(4), RawField::Cases), (day(3), RawField::CasesByReportingDate)]);

        let next = apply_update(&table, &update, &StatisticsConfig::default()).unwrap();
        assert_eq!(next.get(day(4)).unwrap().raw(RawField::Cases), None);
        assert_eq!(next.get(day(3)).unwrap().raw(RawField::CasesByReportingDate), None);
    }

    #[test]
    fn test_apply_update_rejects_decreasing_cumulative() {
        let table = TimeSeriesTable::from_records(history(3)).unwrap();
        let update = DayUpdate::new(day(4))
            .delta(RawField::Cases, 10.0)
            .cumulative(RawField::CasesCumulative, 1.0);
        let err = apply_update(&table, &update, &StatisticsConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            UpsertError::Invariant(InvariantViolation::NonMonotonicCumulative { .. })
        ));
    }
}
