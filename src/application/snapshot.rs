//! Consistent snapshot acquisition.
//!
//! The upstream feature service answers every query independently and may
//! switch to a new publication between two requests. The acquirer fans a
//! batch of queries out concurrently and only accepts the batch when every
//! answer carries the same generation marker; otherwise the whole batch is
//! fetched again.

use chrono::NaiveDate;
use futures::future::try_join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::domain::{AcquireError, AggregateQuery, GenerationMarker, SeriesQuery, SourceAdapter, SourceError};

/// One query of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOp {
    Aggregate(AggregateQuery),
    Series(SeriesQuery),
}

/// The answer to a [`FetchOp`], without its marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Scalar(f64),
    Series(BTreeMap<NaiveDate, f64>),
}

impl Fetched {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Fetched::Scalar(value) => Some(*value),
            Fetched::Series(_) => None,
        }
    }

    pub fn into_series(self) -> Option<BTreeMap<NaiveDate, f64>> {
        match self {
            Fetched::Series(series) => Some(series),
            Fetched::Scalar(_) => None,
        }
    }
}

/// A batch of answers in the order of the requested fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub values: Vec<Fetched>,
    /// Common marker of the batch. For a stale batch, the newest marker seen.
    pub marker: GenerationMarker,
    pub attempts: usize,
    /// True when the batch was returned without agreeing markers.
    pub stale: bool,
}

/// What to do when no attempt produced agreeing markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail the run with `ConsistencyTimeout`.
    #[default]
    Fail,
    /// Return the last batch flagged as stale.
    Stale,
}

/// Retry settings of the acquirer (`snapshot` section of config.yaml).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// First wait between attempts; 0 disables waiting.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
}

fn default_max_attempts() -> usize {
    5
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            exhaustion_policy: ExhaustionPolicy::default(),
        }
    }
}

impl SnapshotConfig {
    /// Waits between attempts: `base`, `2 * base`, `4 * base`, ... capped at
    /// `max_backoff_ms`, each scaled by a random jitter.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        self.delays().map(jitter)
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        // The first delay is `2 * factor`; a base of 1 ms still has to wait.
        let factor = match self.backoff_base_ms {
            0 => 0,
            base => (base / 2).max(1),
        };
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Outcome of a single attempt that did not succeed.
#[derive(Debug)]
enum AttemptError {
    Torn { values: Vec<Fetched>, markers: Vec<GenerationMarker> },
    Source(SourceError),
}

pub struct ConsistentSnapshotAcquirer {
    source: Arc<dyn SourceAdapter>,
    config: SnapshotConfig,
}

impl ConsistentSnapshotAcquirer {
    pub fn new(source: Arc<dyn SourceAdapter>, config: SnapshotConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Fetch `fetches` until all answers report the same publication.
    ///
    /// # Errors
    ///
    /// - `UpstreamUnavailable` as soon as any single fetch fails
    /// - `ConsistencyTimeout` when attempts run out under [`ExhaustionPolicy::Fail`]
    /// - `EmptyBatch` for an empty `fetches`
    pub async fn acquire(&self, fetches: &[FetchOp]) -> Result<Snapshot, AcquireError> {
        if fetches.is_empty() {
            return Err(AcquireError::EmptyBatch);
        }
        if self.config.max_attempts == 0 {
            return Err(AcquireError::ConsistencyTimeout {
                attempts: 0,
                last_markers: Vec::new(),
            });
        }

        let mut attempts = 0usize;
        let result = RetryIf::spawn(
            self.config.backoff(),
            || {
                attempts += 1;
                let attempt = attempts;
                async move { self.attempt(fetches, attempt).await }
            },
            |err: &AttemptError| matches!(err, AttemptError::Torn { .. }),
        )
        .await;

        match result {
            Ok((values, marker)) => {
                info!("Acquired consistent snapshot {} after {} attempt(s)", marker, attempts);
                Ok(Snapshot {
                    values,
                    marker,
                    attempts,
                    stale: false,
                })
            }
            Err(AttemptError::Source(err)) => Err(AcquireError::UpstreamUnavailable(err)),
            Err(AttemptError::Torn { values, markers }) => match self.config.exhaustion_policy {
                ExhaustionPolicy::Fail => Err(AcquireError::ConsistencyTimeout {
                    attempts,
                    last_markers: markers,
                }),
                ExhaustionPolicy::Stale => {
                    let marker = markers.iter().max().copied().ok_or(AcquireError::EmptyBatch)?;
                    warn!(
                        "No consistent snapshot after {} attempts, using stale batch (markers: {:?})",
                        attempts, markers
                    );
                    Ok(Snapshot {
                        values,
                        marker,
                        attempts,
                        stale: true,
                    })
                }
            },
        }
    }

    async fn attempt(
        &self,
        fetches: &[FetchOp],
        attempt: usize,
    ) -> Result<(Vec<Fetched>, GenerationMarker), AttemptError> {
        metrics::counter!("snapshot_attempts_total").increment(1);
        debug!("Snapshot attempt {} with {} fetches", attempt, fetches.len());

        let answers = try_join_all(fetches.iter().map(|op| self.fetch_one(*op)))
            .await
            .map_err(AttemptError::Source)?;
        let (values, markers): (Vec<_>, Vec<_>) = answers.into_iter().unzip();

        // The source publishes once a day; the time of day in the stamp is
        // not part of the generation.
        let day = markers[0].date();
        if markers.iter().all(|marker| marker.date() == day) {
            let newest = markers.iter().max().copied().unwrap_or(markers[0]);
            return Ok((values, newest));
        }

        metrics::counter!("snapshot_torn_reads_total").increment(1);
        debug!("Torn read on attempt {}: markers {:?}", attempt, markers);
        Err(AttemptError::Torn { values, markers })
    }

    async fn fetch_one(&self, op: FetchOp) -> Result<(Fetched, GenerationMarker), SourceError> {
        match op {
            FetchOp::Aggregate(query) => {
                let marked = self.source.fetch_aggregate(query).await?;
                Ok((Fetched::Scalar(marked.value), marked.marker))
            }
            FetchOp::Series(query) => {
                let marked = self.source.fetch_grouped_series(query).await?;
                Ok((Fetched::Series(marked.value), marked.marker))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Marked;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers the k-th call for a query with the k-th scripted entry; the
    /// last entry repeats.
    #[derive(Default)]
    struct ScriptedSource {
        aggregates: HashMap<AggregateQuery, Vec<Result<(f64, &'static str), &'static str>>>,
        series: HashMap<SeriesQuery, Vec<(f64, &'static str)>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedSource {
        fn aggregate(mut self, query: AggregateQuery, script: Vec<(f64, &'static str)>) -> Self {
            self.aggregates.insert(query, script.into_iter().map(Ok).collect());
            self
        }

        fn failing(mut self, query: AggregateQuery) -> Self {
            self.aggregates.insert(query, vec![Err("connection refused")]);
            self
        }

        fn series(mut self, query: SeriesQuery, script: Vec<(f64, &'static str)>) -> Self {
            self.series.insert(query, script);
            self
        }

        fn next_call(&self, key: String) -> usize {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(key).or_insert(0);
            *count += 1;
            *count - 1
        }

        fn calls(&self, key: &str) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    fn pick<T: Clone>(script: &[T], call: usize) -> T {
        script[call.min(script.len() - 1)].clone()
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        async fn fetch_aggregate(&self, query: AggregateQuery) -> Result<Marked<f64>, SourceError> {
            let call = self.next_call(format!("{:?}", query));
            match pick(&self.aggregates[&query], call) {
                Ok((value, marker)) => Ok(Marked::new(value, GenerationMarker::parse(marker)?)),
                Err(reason) => Err(SourceError::Request(reason.to_string())),
            }
        }

        async fn fetch_grouped_series(
            &self,
            query: SeriesQuery,
        ) -> Result<Marked<BTreeMap<NaiveDate, f64>>, SourceError> {
            let call = self.next_call(format!("{:?}", query));
            let (value, marker) = pick(&self.series[&query], call);
            let date = NaiveDate::from_ymd_opt(2020, 11, 1).unwrap();
            Ok(Marked::new(BTreeMap::from([(date, value)]), GenerationMarker::parse(marker)?))
        }
    }

    fn config(policy: ExhaustionPolicy) -> SnapshotConfig {
        SnapshotConfig {
            max_attempts: 3,
            backoff_base_ms: 0,
            max_backoff_ms: 0,
            exhaustion_policy: policy,
        }
    }

    const FETCHES: [FetchOp; 2] = [
        FetchOp::Aggregate(AggregateQuery::NewCases),
        FetchOp::Aggregate(AggregateQuery::TotalCases),
    ];

    #[tokio::test]
    async fn test_torn_read_is_retried_until_markers_agree() {
        let source = ScriptedSource::default()
            .aggregate(
                AggregateQuery::NewCases,
                vec![(1.0, "01.11.2020, 00:00 Uhr"), (3.0, "02.11.2020, 00:00 Uhr")],
            )
            .aggregate(
                AggregateQuery::TotalCases,
                vec![(2.0, "31.10.2020, 00:00 Uhr"), (4.0, "02.11.2020")],
            );
        let source = Arc::new(source);
        let acquirer = ConsistentSnapshotAcquirer::new(source.clone(), config(ExhaustionPolicy::Fail));

        let snapshot = acquirer.acquire(&FETCHES).await.unwrap();
        assert_eq!(snapshot.values, vec![Fetched::Scalar(3.0), Fetched::Scalar(4.0)]);
        assert_eq!(snapshot.attempts, 2);
        assert!(!snapshot.stale);
        assert_eq!(snapshot.marker, GenerationMarker::parse("02.11.2020").unwrap());
        assert_eq!(source.calls("NewCases"), 2);
    }

    #[tokio::test]
    async fn test_consistent_first_attempt() {
        let source = ScriptedSource::default()
            .aggregate(AggregateQuery::NewCases, vec![(5.0, "03.11.2020, 00:00 Uhr")])
            .aggregate(AggregateQuery::TotalCases, vec![(50.0, "03.11.2020, 00:00 Uhr")])
            .series(SeriesQuery::CasesByReportingDate, vec![(7.0, "03.11.2020, 00:00 Uhr")]);
        let acquirer = ConsistentSnapshotAcquirer::new(Arc::new(source), config(ExhaustionPolicy::Fail));

        let mut fetches = FETCHES.to_vec();
        fetches.push(FetchOp::Series(SeriesQuery::CasesByReportingDate));
        let snapshot = acquirer.acquire(&fetches).await.unwrap();
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(snapshot.values[2].clone().into_series().unwrap().len(), 1);
        assert_eq!(snapshot.values[0].as_scalar(), Some(5.0));
    }

    fn never_consistent() -> ScriptedSource {
        ScriptedSource::default()
            .aggregate(
                AggregateQuery::NewCases,
                vec![(1.0, "01.11.2020"), (2.0, "02.11.2020"), (3.0, "03.11.2020")],
            )
            .aggregate(
                AggregateQuery::TotalCases,
                vec![(10.0, "02.11.2020"), (20.0, "03.11.2020"), (30.0, "04.11.2020")],
            )
    }

    #[tokio::test]
    async fn test_exhaustion_fails_by_default() {
        let acquirer = ConsistentSnapshotAcquirer::new(Arc::new(never_consistent()), config(ExhaustionPolicy::Fail));
        match acquirer.acquire(&FETCHES).await {
            Err(AcquireError::ConsistencyTimeout { attempts, last_markers }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_markers.len(), 2);
                assert_ne!(last_markers[0], last_markers[1]);
            }
            other => panic!("expected ConsistencyTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_returns_stale_batch_when_configured() {
        let acquirer = ConsistentSnapshotAcquirer::new(Arc::new(never_consistent()), config(ExhaustionPolicy::Stale));
        let snapshot = acquirer.acquire(&FETCHES).await.unwrap();
        assert!(snapshot.stale);
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.values, vec![Fetched::Scalar(3.0), Fetched::Scalar(30.0)]);
        assert_eq!(snapshot.marker, GenerationMarker::parse("04.11.2020").unwrap());
    }

    #[tokio::test]
    async fn test_source_error_aborts_without_retry() {
        let source = Arc::new(
            ScriptedSource::default()
                .aggregate(AggregateQuery::NewCases, vec![(1.0, "01.11.2020")])
                .failing(AggregateQuery::TotalCases),
        );
        let acquirer = ConsistentSnapshotAcquirer::new(source.clone(), config(ExhaustionPolicy::Stale));
        let err = acquirer.acquire(&FETCHES).await.unwrap_err();
        assert!(matches!(err, AcquireError::UpstreamUnavailable(SourceError::Request(_))));
        assert_eq!(source.calls("TotalCases"), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let acquirer = ConsistentSnapshotAcquirer::new(Arc::new(ScriptedSource::default()), SnapshotConfig::default());
        assert!(matches!(acquirer.acquire(&[]).await, Err(AcquireError::EmptyBatch)));
    }

    #[test]
    fn test_backoff_schedule() {
        let config = SnapshotConfig::default();
        let waits: Vec<Duration> = config.backoff().collect();
        assert_eq!(waits.len(), 4);
        assert!(waits.iter().all(|w| *w <= Duration::from_millis(30_000)));

        let no_wait = SnapshotConfig {
            backoff_base_ms: 0,
            ..SnapshotConfig::default()
        };
        assert!(no_wait.backoff().all(|w| w == Duration::ZERO));
    }

    #[test]
    fn test_delays_before_jitter() {
        let config = SnapshotConfig::default();
        let delays: Vec<Duration> = config.delays().collect();
        assert_eq!(delays[0], Duration::from_millis(1_000));
        assert_eq!(delays[1], Duration::from_millis(2_000));

        let tiny = SnapshotConfig {
            backoff_base_ms: 1,
            ..SnapshotConfig::default()
        };
        let delays: Vec<Duration> = tiny.delays().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d > Duration::ZERO));
        assert_eq!(delays[0], Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_markers_of_the_same_day_agree() {
        let source = ScriptedSource::default()
            .aggregate(AggregateQuery::NewCases, vec![(5.0, "05.11.2020, 00:00 Uhr")])
            .aggregate(AggregateQuery::TotalCases, vec![(50.0, "05.11.2020, 08:30 Uhr")]);
        let acquirer = ConsistentSnapshotAcquirer::new(Arc::new(source), config(ExhaustionPolicy::Fail));

        let snapshot = acquirer.acquire(&FETCHES).await.unwrap();
        assert_eq!(snapshot.attempts, 1);
        assert_eq!(snapshot.marker, GenerationMarker::parse("05.11.2020, 08:30 Uhr").unwrap());
        assert_eq!(snapshot.marker.date(), NaiveDate::from_ymd_opt(2020, 11, 5).unwrap());
    }
}
