use chrono::NaiveDate;
use std::collections::BTreeMap;

use super::fields::{DerivedField, Field, RawField};

/// One calendar day of the statistics table.
///
/// Raw cells are set through [`TimeSeriesTable`](super::TimeSeriesTable);
/// derived cells are only written by recomputation. `None` means missing
/// (raw) or undefined (derived).
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRecord {
    pub date: NaiveDate,
    /// Publication date of the upstream figures for this day.
    pub published_on: Option<NaiveDate>,
    raw: [Option<f64>; RawField::COUNT],
    derived: [Option<f64>; DerivedField::COUNT],
}

impl DailyRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            published_on: None,
            raw: [None; RawField::COUNT],
            derived: [None; DerivedField::COUNT],
        }
    }

    /// Builder used by bulk loaders and tests.
    pub fn with_raw(mut self, field: RawField, value: f64) -> Self {
        self.raw[field.index()] = Some(value);
        self
    }

    pub fn raw(&self, field: RawField) -> Option<f64> {
        self.raw[field.index()]
    }

    pub fn derived(&self, field: DerivedField) -> Option<f64> {
        self.derived[field.index()]
    }

    pub fn value(&self, field: Field) -> Option<f64> {
        match field {
            Field::Raw(f) => self.raw(f),
            Field::Derived(f) => self.derived(f),
        }
    }

    pub(crate) fn set_raw_value(&mut self, field: RawField, value: Option<f64>) {
        self.raw[field.index()] = value;
    }

    pub(crate) fn set_derived_value(&mut self, field: DerivedField, value: Option<f64>) {
        self.derived[field.index()] = value;
    }

    pub fn has_raw_data(&self) -> bool {
        self.raw.iter().any(Option::is_some)
    }
}

/// A set of raw cells to overwrite on one date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPatch {
    values: BTreeMap<RawField, f64>,
    published_on: Option<NaiveDate>,
}

impl RawPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: RawField, value: f64) -> Self {
        self.values.insert(field, value);
        self
    }

    pub fn with_published_on(mut self, date: NaiveDate) -> Self {
        self.published_on = Some(date);
        self
    }

    pub fn set(&mut self, field: RawField, value: f64) {
        self.values.insert(field, value);
    }

    pub fn get(&self, field: RawField) -> Option<f64> {
        self.values.get(&field).copied()
    }

    pub fn published_on(&self) -> Option<NaiveDate> {
        self.published_on
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawField, f64)> + '_ {
        self.values.iter().map(|(field, value)| (*field, *value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.published_on.is_none()
    }
}
