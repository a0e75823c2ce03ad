//! Run identifiers: UTC timestamps whose lexicographic order is their
//! chronological order.
//!
//! A run id is the `uuid` carried in every queue item's kwargs and the
//! second half of every result's `(name, uuid)` identity. The textual form
//! is `YYYY-MM-DDTHH:MM:SS.ffffff` (UTC, microseconds, no offset suffix),
//! which is also the file stem of per-run result keys.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::InterchangeError;

const RUN_ID_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]");

/// Last issued microsecond timestamp, used to keep `RunId::now` strictly
/// increasing within the process even when the clock does not advance.
static LAST_ISSUED_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// A validated run identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Issue a run id for the current instant.
    ///
    /// Ids issued by one process are strictly increasing: if the clock has
    /// not moved past the previously issued microsecond, the previous value
    /// plus one microsecond is used instead.
    pub fn now() -> Self {
        let now_micros = unix_micros(OffsetDateTime::now_utc());
        let mut last = LAST_ISSUED_MICROS.load(Ordering::Relaxed);
        loop {
            let next = if now_micros > last { now_micros } else { last + 1 };
            match LAST_ISSUED_MICROS.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self::from_unix_micros(next),
                Err(observed) => last = observed,
            }
        }
    }

    /// Build a run id from a point in time (truncated to microseconds).
    pub fn from_datetime(at: OffsetDateTime) -> Self {
        Self::from_unix_micros(unix_micros(at))
    }

    /// Parse and validate the textual form.
    pub fn parse(text: &str) -> Result<Self, InterchangeError> {
        PrimitiveDateTime::parse(text, RUN_ID_FORMAT).map_err(|e| {
            InterchangeError::InvalidRunId {
                value: text.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(RunId(text.to_string()))
    }

    /// The instant this id denotes.
    pub fn to_datetime(&self) -> OffsetDateTime {
        // Validated at construction, so the parse cannot fail.
        PrimitiveDateTime::parse(&self.0, RUN_ID_FORMAT)
            .map(PrimitiveDateTime::assume_utc)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Absolute distance between two run ids.
    pub fn distance(&self, other: &RunId) -> Duration {
        let delta = self.to_datetime() - other.to_datetime();
        delta.unsigned_abs()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_unix_micros(micros: i64) -> Self {
        let at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let text = at
            .format(RUN_ID_FORMAT)
            .unwrap_or_else(|_| "1970-01-01T00:00:00.000000".to_string());
        RunId(text)
    }
}

fn unix_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = InterchangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RunId::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl std::str::FromStr for RunId {
    type Err = InterchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunId::parse(s)
    }
}
