//! Prediction engine output types

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Tracked Value
// ============================================================================

/// Which prediction column the controller regulates.
///
/// In TOML this is either an integer column index (`tracked = 0`) or a
/// header label (`tracked = "Glucose"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackedValue {
    Index(usize),
    Label(String),
}

impl Default for TrackedValue {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl fmt::Display for TrackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Column labels from the first line of the prediction file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionHeader {
    pub labels: Vec<String>,
}

impl PredictionHeader {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Resolve a tracked identifier to a concrete column.
    ///
    /// Labels match exactly first, then case-insensitively.
    pub fn resolve(&self, tracked: &TrackedValue) -> Option<ResolvedTracking> {
        let index = match tracked {
            TrackedValue::Index(i) => (*i < self.labels.len()).then_some(*i)?,
            TrackedValue::Label(label) => self
                .labels
                .iter()
                .position(|l| l == label)
                .or_else(|| {
                    self.labels
                        .iter()
                        .position(|l| l.eq_ignore_ascii_case(label))
                })?,
        };
        Some(ResolvedTracking {
            index,
            label: self.labels[index].clone(),
            requested: tracked.clone(),
        })
    }
}

/// A tracked identifier bound to a header column. Produced at most once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTracking {
    pub index: usize,
    pub label: String,
    /// Identifier as configured when resolution happened
    pub requested: TrackedValue,
}

impl ResolvedTracking {
    /// Pull the tracked scalar out of a record.
    pub fn measure(&self, record: &PredictionRecord) -> Option<f64> {
        record.values.get(self.index).copied()
    }
}

// ============================================================================
// Record
// ============================================================================

/// One body line of the prediction file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    /// Acquisition timestamp reported by the engine (local wall time)
    pub timestamp: NaiveDateTime,
    /// Predicted values, positionally aligned with the header
    pub values: Vec<f64>,
    /// Byte offset just past this line in the source file
    pub offset: u64,
    /// Source spectrum name reported by the engine (informational)
    pub source_name: String,
}
