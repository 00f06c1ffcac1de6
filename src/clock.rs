//! Elapsed-time clock
//!
//! Holds the operator's "mark" instant and converts absolute timestamps to
//! time-since-mark. One instance is shared (via `Arc`) by everything that
//! needs it; the mark itself is private so only `mark` can change it.
//!
//! Re-marking only affects elapsed values computed afterwards. Entries
//! already written to the audit log are never revised.

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::sync::RwLock;
use tracing::info;

/// Elapsed time relative to the mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Elapsed {
    /// No mark has been set
    Unmarked,
    /// `timestamp - mark`; negative for timestamps before the mark
    Since(#[serde(with = "duration_seconds")] Duration),
}

impl Elapsed {
    /// Elapsed hours, or `None` when unmarked.
    pub fn hours(&self) -> Option<f64> {
        match self {
            Self::Unmarked => None,
            Self::Since(d) => Some(d.num_milliseconds() as f64 / 3_600_000.0),
        }
    }

    pub fn is_marked(&self) -> bool {
        matches!(self, Self::Since(_))
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hours() {
            None => f.write_str("NaN"),
            Some(h) => write!(f, "{h:.3}"),
        }
    }
}

/// Process-wide elapsed-time reference.
#[derive(Debug, Default)]
pub struct ElapsedTimeClock {
    mark: RwLock<Option<NaiveDateTime>>,
}

impl ElapsedTimeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or overwrite the mark.
    pub fn mark(&self, now: NaiveDateTime) {
        let mut guard = self.mark.write().unwrap_or_else(|e| e.into_inner());
        let previous = guard.replace(now);
        info!(mark = %now, previous = ?previous, "Elapsed-time mark set");
    }

    /// Elapsed time for `timestamp` against the current mark.
    pub fn elapsed(&self, timestamp: NaiveDateTime) -> Elapsed {
        self.snapshot().elapsed(timestamp)
    }

    /// Freeze the current mark so a whole tick uses one value.
    pub fn snapshot(&self) -> MarkSnapshot {
        let guard = self.mark.read().unwrap_or_else(|e| e.into_inner());
        MarkSnapshot(*guard)
    }
}

/// Copy of the mark taken at a tick boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkSnapshot(Option<NaiveDateTime>);

impl MarkSnapshot {
    pub fn elapsed(&self, timestamp: NaiveDateTime) -> Elapsed {
        match self.0 {
            None => Elapsed::Unmarked,
            Some(mark) => Elapsed::Since(timestamp - mark),
        }
    }

    pub fn mark(&self) -> Option<NaiveDateTime> {
        self.0
    }
}

mod duration_seconds {
    use chrono::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.num_milliseconds() as f64 / 1000.0)
    }
}
