//! The canonical date-indexed statistics table.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use super::error::InvariantViolation;
use super::fields::{DerivedField, Field, RawField};
use super::record::{DailyRecord, RawPatch};
use super::series::DateSeries;

/// Ordered mapping from calendar date to [`DailyRecord`].
///
/// Invariants held by every public mutator:
/// - one record per date;
/// - cumulative raw fields never decrease along the date axis (null cells
///   are skipped);
/// - derived fields are only written by recomputation.
///
/// Raw writes mark the table dirty until the derived columns are recomputed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesTable {
    records: BTreeMap<NaiveDate, DailyRecord>,
    dirty: bool,
}

impl TimeSeriesTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk load from persisted rows, which must be strictly ascending by date.
    pub fn from_records(rows: Vec<DailyRecord>) -> Result<Self, InvariantViolation> {
        let mut records = BTreeMap::new();
        let mut previous: Option<NaiveDate> = None;
        for row in rows {
            if let Some(prev) = previous {
                if row.date == prev {
                    return Err(InvariantViolation::DuplicateDate { date: row.date });
                }
                if row.date < prev {
                    return Err(InvariantViolation::OutOfOrder {
                        date: row.date,
                        previous: prev,
                    });
                }
            }
            previous = Some(row.date);
            records.insert(row.date, row);
        }

        let table = Self {
            records,
            dirty: true,
        };
        for field in RawField::ALL.into_iter().filter(|f| f.is_cumulative()) {
            table.check_column_monotonic(field)?;
        }
        Ok(table)
    }

    pub fn get(&self, date: NaiveDate) -> Option<&DailyRecord> {
        self.records.get(&date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.records.contains_key(&date)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn records(&self) -> impl DoubleEndedIterator<Item = &DailyRecord> + '_ {
        self.records.values()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.records.keys().copied().collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.keys().next_back().copied()
    }

    /// `nth_last_date(0)` is the last date, `nth_last_date(1)` the one before.
    pub fn nth_last_date(&self, n: usize) -> Option<NaiveDate> {
        self.records.keys().rev().nth(n).copied()
    }

    /// Overwrite the raw cells named in `patch` on `date`, creating the record
    /// if necessary. Nothing is written if any cell is rejected.
    pub fn set_raw(&mut self, date: NaiveDate, patch: &RawPatch) -> Result<(), InvariantViolation> {
        for (field, value) in patch.iter() {
            if !value.is_finite() {
                return Err(InvariantViolation::NonFiniteValue { field, date, value });
            }
            if field.is_cumulative() {
                self.check_cumulative_write(field, date, value)?;
            }
        }

        let record = self
            .records
            .entry(date)
            .or_insert_with(|| DailyRecord::new(date));
        for (field, value) in patch.iter() {
            record.set_raw_value(field, Some(value));
        }
        if let Some(published_on) = patch.published_on() {
            record.published_on = Some(published_on);
        }
        self.dirty = true;
        Ok(())
    }

    /// String-keyed variant of [`set_raw`](Self::set_raw) for configuration
    /// driven callers. Derived field names are rejected.
    pub fn set_raw_named(&mut self, date: NaiveDate, fields: &[(&str, f64)]) -> Result<(), InvariantViolation> {
        let mut patch = RawPatch::new();
        for (name, value) in fields {
            patch.set(name.parse::<RawField>()?, *value);
        }
        self.set_raw(date, &patch)
    }

    /// Mark a raw cell as a known source anomaly.
    pub fn null_raw(&mut self, date: NaiveDate, field: RawField) -> Result<(), InvariantViolation> {
        let record = self
            .records
            .get_mut(&date)
            .ok_or(InvariantViolation::UnknownDate { date })?;
        record.set_raw_value(field, None);
        self.dirty = true;
        Ok(())
    }

    /// Replace a whole raw column. Dates absent from `series` lose their value
    /// for `field`; dates without a record get one.
    pub fn replace_raw_column(
        &mut self,
        field: RawField,
        series: &BTreeMap<NaiveDate, f64>,
    ) -> Result<(), InvariantViolation> {
        let mut previous: Option<(NaiveDate, f64)> = None;
        for (date, value) in series {
            if !value.is_finite() {
                return Err(InvariantViolation::NonFiniteValue {
                    field,
                    date: *date,
                    value: *value,
                });
            }
            if field.is_cumulative() {
                if let Some((prev_date, prev_value)) = previous {
                    if *value < prev_value {
                        return Err(InvariantViolation::NonMonotonicCumulative {
                            field,
                            date: *date,
                            value: *value,
                            neighbour_date: prev_date,
                            neighbour_value: prev_value,
                        });
                    }
                }
                previous = Some((*date, *value));
            }
        }

        for record in self.records.values_mut() {
            record.set_raw_value(field, None);
        }
        for (date, value) in series {
            self.records
                .entry(*date)
                .or_insert_with(|| DailyRecord::new(*date))
                .set_raw_value(field, Some(*value));
        }
        self.dirty = true;
        Ok(())
    }

    pub fn column(&self, field: RawField) -> DateSeries {
        self.column_of(Field::Raw(field))
    }

    pub fn derived_column(&self, field: DerivedField) -> DateSeries {
        self.column_of(Field::Derived(field))
    }

    pub fn column_of(&self, field: Field) -> DateSeries {
        let dates = self.records.keys().copied().collect();
        let values = self.records.values().map(|r| r.value(field)).collect();
        DateSeries::from_parts(dates, values)
    }

    /// Write a recomputed column. The series must span this table's index.
    pub(crate) fn set_derived_column(&mut self, field: DerivedField, series: &DateSeries) {
        debug_assert_eq!(series.len(), self.records.len());
        for (record, (date, value)) in self.records.values_mut().zip(series.iter()) {
            debug_assert_eq!(record.date, date);
            record.set_derived_value(field, value);
        }
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn check_cumulative_write(&self, field: RawField, date: NaiveDate, value: f64) -> Result<(), InvariantViolation> {
        let before = self
            .records
            .range(..date)
            .rev()
            .find_map(|(d, r)| r.raw(field).map(|v| (*d, v)));
        if let Some((neighbour_date, neighbour_value)) = before {
            if value < neighbour_value {
                return Err(InvariantViolation::NonMonotonicCumulative {
                    field,
                    date,
                    value,
                    neighbour_date,
                    neighbour_value,
                });
            }
        }

        let after = self
            .records
            .range((Excluded(date), Unbounded))
            .find_map(|(d, r)| r.raw(field).map(|v| (*d, v)));
        if let Some((neighbour_date, neighbour_value)) = after {
            if value > neighbour_value {
                return Err(InvariantViolation::NonMonotonicCumulative {
                    field,
                    date,
                    value,
                    neighbour_date,
                    neighbour_value,
                });
            }
        }
        Ok(())
    }

    fn check_column_monotonic(&self, field: RawField) -> Result<(), InvariantViolation> {
        let mut previous: Option<(NaiveDate, f64)> = None;
        for record in self.records.values() {
            let Some(value) = record.raw(field) else {
                continue;
            };
            if let Some((neighbour_date, neighbour_value)) = previous {
                if value < neighbour_value {
                    return Err(InvariantViolation::NonMonotonicCumulative {
                        field,
                        date: record.date,
                        value,
                        neighbour_date,
                        neighbour_value,
                    });
                }
            }
            previous = Some((record.date, value));
        }
        Ok(())
    }
}
