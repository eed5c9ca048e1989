//! Publication generation markers.
//!
//! The source stamps every response with its data status ("Datenstand"), a
//! day-first German timestamp such as `05.11.2020, 00:00 Uhr`. Markers compare
//! by the parsed instant, never by the raw string.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::SourceError;

const DATETIME_FORMATS: [&str; 3] = ["%d.%m.%Y, %H:%M Uhr", "%d.%m.%Y, %H:%M", "%d.%m.%Y %H:%M"];
const DATE_FORMATS: [&str; 3] = ["%d.%m.%Y", "%d/%m/%Y", "%Y-%m-%d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenerationMarker(NaiveDateTime);

impl GenerationMarker {
    pub fn new(instant: NaiveDateTime) -> Self {
        Self(instant)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.and_time(NaiveTime::MIN))
    }

    /// Parse a day-first publication stamp.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let trimmed = raw.trim();
        for format in DATETIME_FORMATS {
            if let Ok(instant) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(Self(instant));
            }
        }
        // Only the date part is meaningful when the time is absent or garbled.
        let date_part = trimmed.split(',').next().unwrap_or(trimmed).trim();
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
                return Ok(Self::from_date(date));
            }
        }
        Err(SourceError::Marker(raw.to_string()))
    }

    pub fn instant(&self) -> NaiveDateTime {
        self.0
    }

    /// Calendar day of the publication.
    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }
}

impl FromStr for GenerationMarker {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for GenerationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%d.%m.%Y, %H:%M"))
    }
}
