//! JSON file persistence.
//!
//! Each table is one pretty-printed JSON array under the base directory,
//! replaced atomically by writing a temporary sibling and renaming it over
//! the previous file.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::{DailyRecord, Field, PersistenceAdapter, PersistenceError};

/// Resolve `key` to `<base>/<key>.<extension>`.
///
/// Keys are plain file stems; separators and parent references are rejected.
pub(crate) fn table_path(base_path: &Path, key: &str, extension: &str) -> Result<PathBuf, PersistenceError> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        warn!("Rejected table key: {}", key);
        return Err(PersistenceError::InvalidKey(key.to_string()));
    }
    Ok(base_path.join(format!("{}.{}", key, extension)))
}

/// Temporary sibling written before the rename.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// One row on disk. Only defined cells are written.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published_on: Option<NaiveDate>,
    #[serde(default)]
    values: BTreeMap<String, f64>,
}

impl StoredRow {
    fn from_record(record: &DailyRecord) -> Self {
        let values = Field::all()
            .filter_map(|field| record.value(field).map(|value| (field.name().to_string(), value)))
            .collect();
        Self {
            date: record.date,
            published_on: record.published_on,
            values,
        }
    }

    fn into_record(self, key: &str) -> Result<DailyRecord, PersistenceError> {
        let mut record = DailyRecord::new(self.date);
        record.published_on = self.published_on;
        for (name, value) in self.values {
            let field: Field = name.parse().map_err(|e| PersistenceError::Corrupt {
                key: key.to_string(),
                reason: format!("{} on {}", e, self.date),
            })?;
            match field {
                Field::Raw(raw) => record.set_raw_value(raw, Some(value)),
                Field::Derived(derived) => record.set_derived_value(derived, Some(value)),
            }
        }
        Ok(record)
    }
}

/// Table storage as JSON files in a local directory.
pub struct JsonFileStore {
    base_path: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `base_path` (e.g. "./data"). The directory is
    /// created on first save.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        table_path(&self.base_path, key, "json")
    }
}

#[async_trait]
impl PersistenceAdapter for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<DailyRecord>>, PersistenceError> {
        let path = self.path_for(key)?;
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let rows: Vec<StoredRow> = serde_json::from_slice(&content)?;
        let records = rows
            .into_iter()
            .map(|row| row.into_record(key))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Loaded {} rows from {}", records.len(), path.display());
        Ok(Some(records))
    }

    async fn save(&self, key: &str, rows: &[DailyRecord]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.base_path).await?;

        let stored: Vec<StoredRow> = rows.iter().map(StoredRow::from_record).collect();
        let content = serde_json::to_vec_pretty(&stored)?;

        let tmp = temp_path(&path);
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Saved {} rows to {}", rows.len(), path.display());
        Ok(())
    }
}
