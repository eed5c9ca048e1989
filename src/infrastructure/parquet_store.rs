//! Parquet persistence of the statistics table.
//!
//! One file per table with a typed Arrow schema: `date` and `published_on`
//! as Date32, then one nullable Float64 column per raw and derived field in
//! catalogue order. Files are Snappy-compressed and replaced atomically.

use arrow::array::{Array, ArrayRef, Date32Array, Float64Array, RecordBatch};
use arrow::datatypes::{DataType, Field as ArrowField, Schema, SchemaRef};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::local_file::{table_path, temp_path};
use crate::domain::{DailyRecord, Field, PersistenceAdapter, PersistenceError};

const DATE_COLUMN: &str = "date";
const PUBLISHED_ON_COLUMN: &str = "published_on";

fn epoch() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

fn to_days(date: NaiveDate) -> i32 {
    (date - epoch()).num_days() as i32
}

fn from_days(days: i32) -> Option<NaiveDate> {
    epoch().checked_add_signed(Duration::days(days as i64))
}

/// Arrow schema of a stored table.
pub fn table_schema() -> SchemaRef {
    let mut fields = vec![
        ArrowField::new(DATE_COLUMN, DataType::Date32, false),
        ArrowField::new(PUBLISHED_ON_COLUMN, DataType::Date32, true),
    ];
    fields.extend(Field::all().map(|field| ArrowField::new(field.name(), DataType::Float64, true)));
    Arc::new(Schema::new(fields))
}

fn to_batch(rows: &[DailyRecord]) -> Result<RecordBatch, PersistenceError> {
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(Date32Array::from(rows.iter().map(|r| to_days(r.date)).collect::<Vec<_>>())),
        Arc::new(Date32Array::from(
            rows.iter().map(|r| r.published_on.map(to_days)).collect::<Vec<_>>(),
        )),
    ];
    for field in Field::all() {
        let values: Vec<Option<f64>> = rows.iter().map(|r| r.value(field)).collect();
        columns.push(Arc::new(Float64Array::from(values)));
    }
    Ok(RecordBatch::try_new(table_schema(), columns)?)
}

fn date_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a Date32Array> {
    batch.column_by_name(name)?.as_any().downcast_ref::<Date32Array>()
}

fn from_batch(batch: &RecordBatch, key: &str) -> Result<Vec<DailyRecord>, PersistenceError> {
    let corrupt = |reason: String| PersistenceError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let dates = date_column(batch, DATE_COLUMN).ok_or_else(|| corrupt("missing date column".to_string()))?;
    let published_on = date_column(batch, PUBLISHED_ON_COLUMN);

    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if dates.is_null(row) {
            return Err(corrupt(format!("null date in row {}", row)));
        }
        let date = from_days(dates.value(row)).ok_or_else(|| corrupt(format!("date out of range in row {}", row)))?;
        let mut record = DailyRecord::new(date);
        record.published_on = published_on
            .filter(|column| !column.is_null(row))
            .and_then(|column| from_days(column.value(row)));
        records.push(record);
    }

    // Columns unknown to this schema version are skipped, missing ones stay null.
    for field in Field::all() {
        let Some(column) = batch.column_by_name(field.name()) else {
            continue;
        };
        let values = column
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| corrupt(format!("column {} is not Float64", field)))?;
        for (record, value) in records.iter_mut().zip(values.iter()) {
            match field {
                Field::Raw(raw) => record.set_raw_value(raw, value),
                Field::Derived(derived) => record.set_derived_value(derived, value),
            }
        }
    }
    Ok(records)
}

fn write_file(path: &Path, rows: &[DailyRecord]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let batch = to_batch(rows)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let tmp = temp_path(path);
    let file = File::create(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_file(path: &Path, key: &str) -> Result<Option<Vec<DailyRecord>>, PersistenceError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut records = Vec::new();
    for batch in reader {
        records.extend(from_batch(&batch?, key)?);
    }
    Ok(Some(records))
}

/// Table storage as Parquet files in a local directory.
#[derive(Clone)]
pub struct ParquetStore {
    base_path: PathBuf,
}

impl ParquetStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        table_path(&self.base_path, key, "parquet")
    }
}

fn join_error(e: tokio::task::JoinError) -> PersistenceError {
    PersistenceError::Io(std::io::Error::other(e))
}

#[async_trait]
impl PersistenceAdapter for ParquetStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<DailyRecord>>, PersistenceError> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        let rows = tokio::task::spawn_blocking(move || read_file(&path, &owned_key))
            .await
            .map_err(join_error)??;
        if let Some(rows) = &rows {
            debug!("Loaded {} rows from parquet table {}", rows.len(), key);
        }
        Ok(rows)
    }

    async fn save(&self, key: &str, rows: &[DailyRecord]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        let rows = rows.to_vec();
        let count = rows.len();
        tokio::task::spawn_blocking(move || write_file(&path, &rows))
            .await
            .map_err(join_error)??;
        debug!("Saved {} rows to parquet table {}", count, key);
        Ok(())
    }
}
