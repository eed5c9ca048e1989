//! Date-indexed column view.

use chrono::{Days, NaiveDate};
use std::collections::BTreeMap;

/// A column over a sorted, duplicate-free date index. `None` marks a missing
/// or undefined cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DateSeries {
    dates: Vec<NaiveDate>,
    values: Vec<Option<f64>>,
}

impl DateSeries {
    /// Build a series from arbitrary pairs; later pairs win on duplicate dates.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, Option<f64>)>,
    {
        let sorted: BTreeMap<NaiveDate, Option<f64>> = pairs.into_iter().collect();
        let (dates, values) = sorted.into_iter().unzip();
        Self { dates, values }
    }

    /// Caller guarantees `dates` is strictly increasing and both have equal length.
    pub(crate) fn from_parts(dates: Vec<NaiveDate>, values: Vec<Option<f64>>) -> Self {
        debug_assert_eq!(dates.len(), values.len());
        debug_assert!(dates.windows(2).all(|w| w[0] < w[1]));
        Self { dates, values }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn get(&self, date: NaiveDate) -> Option<f64> {
        self.dates
            .binary_search(&date)
            .ok()
            .and_then(|pos| self.values[pos])
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.dates.binary_search(&date).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, Option<f64>)> + '_ {
        self.dates.iter().copied().zip(self.values.iter().copied())
    }

    /// Values of the `len` consecutive calendar days starting at `start`.
    ///
    /// `None` unless every one of those days is in the index with a value.
    pub fn window(&self, start: NaiveDate, len: usize) -> Option<Vec<f64>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let pos = self.dates.binary_search(&start).ok()?;
        let span = self.dates.get(pos..pos + len)?;
        let end = start.checked_add_days(Days::new((len - 1) as u64))?;
        // Sorted and unique, so matching endpoints mean no day is skipped.
        if span[len - 1] != end {
            return None;
        }
        self.values[pos..pos + len].iter().copied().collect()
    }

    /// New series over the same index, one value per date.
    pub fn map_dates<F>(&self, mut f: F) -> DateSeries
    where
        F: FnMut(NaiveDate) -> Option<f64>,
    {
        let values = self
            .dates
            .iter()
            .map(|date| f(*date).filter(|v| v.is_finite()))
            .collect();
        DateSeries {
            dates: self.dates.clone(),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    #[test]
    fn test_from_pairs_sorts_and_deduplicates() {
        let series = DateSeries::from_pairs(vec![
            (day(3), Some(3.0)),
            (day(1), Some(1.0)),
            (day(3), Some(30.0)),
        ]);
        assert_eq!(series.dates(), &[day(1), day(3)]);
        assert_eq!(series.get(day(3)), Some(30.0));
    }

    #[test]
    fn test_window_requires_contiguous_days() {
        let series = DateSeries::from_pairs((1..=5).filter(|d| *d != 3).map(|d| (day(d), Some(d as f64))));
        assert_eq!(series.window(day(1), 2), Some(vec![1.0, 2.0]));
        assert_eq!(series.window(day(1), 3), None);
        assert_eq!(series.window(day(4), 2), Some(vec![4.0, 5.0]));
        assert_eq!(series.window(day(4), 3), None);
    }

    #[test]
    fn test_window_rejects_null_cells() {
        let series = DateSeries::from_pairs(vec![
            (day(1), Some(1.0)),
            (day(2), None),
            (day(3), Some(3.0)),
        ]);
        assert_eq!(series.window(day(1), 3), None);
        assert_eq!(series.window(day(3), 1), Some(vec![3.0]));
    }

    #[test]
    fn test_map_dates_drops_non_finite() {
        let series = DateSeries::from_pairs(vec![(day(1), Some(0.0)), (day(2), Some(1.0))]);
        let mapped = series.map_dates(|d| series.get(d).map(|v| 1.0 / v));
        assert_eq!(mapped.values(), &[None, Some(1.0)]);
    }
}
